//! HTTP handlers (spec.md §6). Only the core's touchpoints are exposed
//! here: the chat/message endpoint that drives the VizQL agent graph /
//! multi-agent orchestrator, and LLM provider administration. Everything
//! else in §6 (conversation persistence, user/auth) is an external
//! collaborator this crate does not implement.

pub mod chat;
pub mod llm;
