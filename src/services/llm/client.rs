//! LLM Client - HTTP client for OpenAI-compatible APIs
//!
//! Uses reqwest to call LLM APIs. Compatible with:
//! - OpenAI
//! - Azure OpenAI
//! - DeepSeek
//! - Other OpenAI-compatible APIs

use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

use super::models::*;

/// LLM HTTP Client
pub struct LLMClient {
    http_client: Client,
}

impl Default for LLMClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LLMClient {
    pub fn new() -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self { http_client }
    }

    /// Send a chat completion request, retrying transport failures and 5xx
    /// responses with exponential backoff (capped, 3 attempts total). 4xx
    /// responses surface immediately - they won't succeed on retry.
    pub async fn chat(
        &self,
        provider: &LLMProvider,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, LLMError> {
        let request = self.build_request(provider, messages, options, false);
        let url = format!("{}/chat/completions", provider.api_base.trim_end_matches('/'));
        let api_key = self.require_api_key(provider)?;
        let timeout = Duration::from_secs(provider.timeout_seconds as u64);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.send_once(&url, api_key, &request, timeout).await;
            match outcome {
                Ok(response) => return self.parse_completion(response).await,
                Err(e) if attempt < 3 && e.is_retryable() => {
                    let backoff = backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        error = %e,
                        "LLM chat request failed, retrying in {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                },
                Err(e) => return Err(e.into_llm_error()),
            }
        }
    }

    /// Stream a chat completion as server-sent-event `data:` frames decoded
    /// into `ChatChunk`s. The final chunk carries `finish_reason`.
    pub async fn stream_chat(
        &self,
        provider: &LLMProvider,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ChatChunk, LLMError>> + Send>>, LLMError> {
        let request = self.build_request(provider, messages, options, true);
        let url = format!("{}/chat/completions", provider.api_base.trim_end_matches('/'));
        let api_key = self.require_api_key(provider)?.to_string();
        let timeout = Duration::from_secs(provider.timeout_seconds as u64);

        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            match self.send_once(&url, &api_key, &request, timeout).await {
                Ok(response) => break response,
                Err(e) if attempt < 3 && e.is_retryable() => {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                },
                Err(e) => return Err(e.into_llm_error()),
            }
        };

        let byte_stream = response.bytes_stream();
        let stream = byte_stream.scan(Vec::<u8>::new(), |buffer, chunk| {
            let chunk = match chunk {
                Ok(bytes) => bytes,
                Err(e) => return futures_util::future::ready(Some(vec![Err(LLMError::ApiError(e.to_string()))])),
            };
            buffer.extend_from_slice(&chunk);
            let mut events = Vec::new();
            while let Some(pos) = find_double_newline(buffer) {
                let line: Vec<u8> = buffer.drain(..pos + 2).collect();
                if let Some(event) = parse_sse_line(&line) {
                    events.push(event);
                }
            }
            futures_util::future::ready(Some(events))
        });

        let flattened = stream.flat_map(futures_util::stream::iter);
        Ok(Box::pin(flattened))
    }

    fn build_request(
        &self,
        provider: &LLMProvider,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: options.model.clone().unwrap_or_else(|| provider.model_name.clone()),
            messages: messages.to_vec(),
            max_tokens: Some(options.max_tokens.unwrap_or(provider.max_tokens) as u32),
            temperature: Some(options.temperature.unwrap_or(provider.temperature)),
            response_format: options
                .json_mode
                .then(|| ResponseFormat { r#type: "json_object".to_string() }),
            stream: stream.then_some(true),
        }
    }

    fn require_api_key<'a>(&self, provider: &'a LLMProvider) -> Result<&'a str, LLMError> {
        provider
            .api_key_encrypted
            .as_deref()
            .ok_or_else(|| LLMError::ApiError("API key not configured".to_string()))
    }

    async fn send_once(
        &self,
        url: &str,
        api_key: &str,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .http_client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(timeout.as_secs())
                } else {
                    TransportError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(TransportError::RateLimited(retry_after));
        }
        if status.is_server_error() {
            return Err(TransportError::ServerError(status.as_u16()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(TransportError::ClientError(status.as_u16(), text));
        }

        Ok(response)
    }

    async fn parse_completion(&self, response: reqwest::Response) -> Result<ChatCompletion, LLMError> {
        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| LLMError::ParseError(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::ParseError("empty choices in LLM response".to_string()))?;

        let prompt_tokens = parsed.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
        let completion_tokens = parsed.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0);

        Ok(ChatCompletion {
            content: choice.message.content.unwrap_or_default(),
            tokens_used: prompt_tokens + completion_tokens,
            prompt_tokens,
            completion_tokens,
            finish_reason: choice.finish_reason,
            function_call: choice.message.function_call.map(|fc| FunctionCall {
                name: fc.name,
                arguments: fc.arguments,
            }),
        })
    }

    /// Test connection to provider (simple models list request)
    pub async fn test_connection(&self, provider: &LLMProvider) -> Result<(), LLMError> {
        let api_key = self.require_api_key(provider)?;
        let url = format!("{}/models", provider.api_base.trim_end_matches('/'));

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LLMError::Timeout(10)
                } else if e.is_connect() {
                    LLMError::ApiError(format!("Connection failed: {}", e))
                } else {
                    LLMError::ApiError(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(LLMError::ApiError("Invalid API key".to_string()));
        }

        if !status.is_success() {
            return self.test_with_chat(provider).await;
        }

        Ok(())
    }

    /// Fallback test using minimal chat completion
    async fn test_with_chat(&self, provider: &LLMProvider) -> Result<(), LLMError> {
        let options = ChatOptions { max_tokens: Some(1), temperature: Some(0.0), ..Default::default() };
        self.chat(provider, &[ChatMessage::user("Hi")], &options).await.map(|_| ())
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt).min(10);
    Duration::from_secs(secs)
}

fn find_double_newline(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_sse_line(raw: &[u8]) -> Option<Result<ChatChunk, LLMError>> {
    let text = std::str::from_utf8(raw).ok()?;
    let data = text.lines().find_map(|l| l.strip_prefix("data: ").or_else(|| l.strip_prefix("data:")))?;
    let data = data.trim();
    if data == "[DONE]" {
        return None;
    }
    let parsed: Result<ChatCompletionStreamResponse, _> = serde_json::from_str(data);
    match parsed {
        Ok(resp) => {
            let choice = resp.choices.into_iter().next()?;
            Some(Ok(ChatChunk {
                content_delta: choice.delta.content.unwrap_or_default(),
                finish_reason: choice.finish_reason,
                function_call_delta: choice.delta.function_call.map(|fc| FunctionCallDelta {
                    name: fc.name,
                    arguments_delta: fc.arguments,
                }),
            }))
        },
        Err(e) => Some(Err(LLMError::ParseError(e.to_string()))),
    }
}

/// Transport-level outcome of a single HTTP attempt, distinct from `LLMError`
/// so retry eligibility (transport/5xx only, never 4xx) is decided in one place.
enum TransportError {
    Timeout(u64),
    Transport(String),
    RateLimited(u64),
    ServerError(u16),
    ClientError(u16, String),
}

impl TransportError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_) | Self::ServerError(_))
    }

    fn into_llm_error(self) -> LLMError {
        match self {
            Self::Timeout(s) => LLMError::Timeout(s),
            Self::Transport(e) => LLMError::ApiError(e),
            Self::RateLimited(s) => LLMError::RateLimited(s),
            Self::ServerError(code) => LLMError::ApiError(format!("server error {}", code)),
            Self::ClientError(code, body) => LLMError::ApiError(format!("client error {}: {}", code, body)),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(s) => write!(f, "timeout after {}s", s),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::RateLimited(s) => write!(f, "rate limited, retry after {}s", s),
            Self::ServerError(c) => write!(f, "server error {}", c),
            Self::ClientError(c, b) => write!(f, "client error {}: {}", c, b),
        }
    }
}

// ============================================================================
// OpenAI API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i32,
    completion_tokens: i32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionStreamResponse {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    #[serde(default)]
    function_call: Option<WireFunctionCallDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCallDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_ten_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(10));
    }

    #[test]
    fn parses_done_sentinel_as_end_of_stream() {
        let line = b"data: [DONE]\n\n";
        assert!(parse_sse_line(line).is_none());
    }

    #[test]
    fn parses_content_delta() {
        let line = b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}\n\n";
        let chunk = parse_sse_line(line).unwrap().unwrap();
        assert_eq!(chunk.content_delta, "hi");
        assert!(chunk.finish_reason.is_none());
    }
}
