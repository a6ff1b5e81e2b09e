//! LLM Service Module
//!
//! Provides the chat/stream-chat facade consumed by the VizQL agent graph
//! (query building, summarization) and the multi-agent orchestrator
//! (planning, per-step execution), plus provider administration.
//!
//! # Architecture
//! ```text
//! ┌─────────────────┐
//! │   LLMService    │  ← Trait (generic interface)
//! └────────┬────────┘
//!          │
//!    ┌─────┴─────┐
//!    ▼           ▼
//! ┌──────┐  ┌──────────┐
//! │OpenAI│  │ Future   │
//! │Client│  │ Providers│
//! └──────┘  └──────────┘
//! ```

mod client;
mod models;
mod repository;
mod service;

// Re-exports for external use
pub use models::*;
pub use service::{LLMService, LLMServiceImpl};

// Allow unused for internal modules (used in tests or future features)
#[allow(unused_imports)]
pub(crate) use client::LLMClient;
#[allow(unused_imports)]
pub(crate) use repository::LLMRepository;

#[cfg(test)]
mod tests;
