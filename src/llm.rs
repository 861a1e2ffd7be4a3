//! Streaming LLM chat client. Talks NDJSON (one JSON object per line) to an
//! Ollama-shaped `/api/chat` endpoint, bounds concurrency with a semaphore
//! and retries transient transport failures with exponential backoff. See
//! spec §4.3.

use crate::error::TransportError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Whether to request the model's `think` (reasoning trace) behavior.
/// `Unset` omits the field entirely and lets the model/server default apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkMode {
    #[default]
    Unset,
    ForceOff,
    ForceOn,
}

impl ThinkMode {
    fn as_bool(self) -> Option<bool> {
        match self {
            ThinkMode::Unset => None,
            ThinkMode::ForceOff => Some(false),
            ThinkMode::ForceOn => Some(true),
        }
    }
}

/// Per-call overrides. Anything left `None` falls back to the client's
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub json_format: bool,
    pub num_ctx: Option<u32>,
    pub think: ThinkMode,
    pub num_predict: Option<i32>,
    pub timeout_override: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    options: ChatRequestOptions,
}

#[derive(Debug, Serialize)]
struct ChatRequestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize, Default)]
struct StreamMessage {
    #[serde(default)]
    content: String,
}

pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
    retry_base_delay_ms: u64,
    request_timeout: Duration,
    concurrency: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        max_concurrent: usize,
        max_retries: u32,
        retry_base_delay_ms: u64,
        request_timeout_secs: u64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            max_retries,
            retry_base_delay_ms,
            request_timeout: Duration::from_secs(request_timeout_secs),
            concurrency: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run a single chat call to completion, internally consuming the NDJSON
    /// stream and concatenating the `message.content` deltas. Bounded by the
    /// client's concurrency semaphore and retried on transient failures.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, TransportError> {
        let _permit = self.concurrency.acquire().await.expect("semaphore closed");

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.chat_once(messages, options).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt >= self.max_retries => {
                    return Err(TransportError::RetriesExhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) if !is_retryable(&e) => {
                    return Err(TransportError::RetriesExhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay_ms = self.retry_base_delay_ms * 2u64.pow(attempt - 1);
                    warn!(attempt, delay_ms, error = %e, "LLM call failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<String> {
        let body = ChatRequestBody {
            model: &self.model,
            messages,
            stream: true,
            format: if options.json_format { Some("json") } else { None },
            think: options.think.as_bool(),
            options: ChatRequestOptions {
                temperature: options.temperature,
                num_ctx: options.num_ctx,
                num_predict: options.num_predict,
            },
        };

        let timeout = options.timeout_override.unwrap_or(self.request_timeout);
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::ServerError { status, body: text }.into());
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut full_text = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].trim().to_string();
                buffer.drain(..=newline_pos);
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StreamChunk>(&line) {
                    Ok(parsed) => {
                        if let Some(msg) = parsed.message {
                            full_text.push_str(&msg.content);
                        }
                        if parsed.done {
                            debug!(chars = full_text.len(), "LLM stream completed");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, line = %line, "skipping malformed NDJSON line");
                    }
                }
            }
        }

        Ok(full_text)
    }
}

fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(TransportError::ServerError { status, .. }) = err.downcast_ref::<TransportError>() {
        return *status >= 500 || *status == 429;
    }
    if let Some(req_err) = err.downcast_ref::<reqwest::Error>() {
        return req_err.is_timeout() || req_err.is_connect() || req_err.is_request();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors_set_role() {
        let sys = ChatMessage::system("be terse");
        assert_eq!(sys.role, "system");
        let user = ChatMessage::user("hello");
        assert_eq!(user.role, "user");
    }

    #[test]
    fn stream_chunk_parses_partial_and_done_lines() {
        let partial: StreamChunk =
            serde_json::from_str(r#"{"message":{"role":"assistant","content":"hi"},"done":false}"#)
                .unwrap();
        assert_eq!(partial.message.unwrap().content, "hi");
        assert!(!partial.done);

        let done: StreamChunk = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(done.done);
        assert!(done.message.is_none());
    }
}
