// src/gateway.rs

use crate::config::{LlmBackend, LlmSection};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(parts),
        }
    }
}

/// A chat-completion endpoint. Implemented over HTTP in production and by
/// scripted fakes in tests.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// One non-streaming completion; returns the assistant text.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String>;

    /// Streamed completion. Every delta is handed to `sink` as it arrives;
    /// the concatenated text is returned.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Resolved endpoint configuration ready to make API calls.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

/// Resolve the LLM config section into a concrete endpoint.
pub fn resolve_endpoint(llm: &LlmSection) -> Result<ResolvedEndpoint> {
    match llm.backend {
        LlmBackend::Ollama => {
            info!(
                url = %llm.ollama.base_url,
                model = %llm.ollama.model,
                "Using Ollama (local) backend"
            );
            Ok(ResolvedEndpoint {
                base_url: llm.ollama.base_url.clone(),
                model: llm.ollama.model.clone(),
                api_key: "ollama".to_string(), // required by API but ignored
            })
        }
        LlmBackend::Remote => {
            let api_key = std::env::var("LLM_API_KEY").map_err(|_| {
                AppError::Config("LLM_API_KEY env var required for remote backend".into())
            })?;
            info!(
                url = %llm.remote.base_url,
                model = %llm.remote.model,
                "Using remote AI gateway"
            );
            Ok(ResolvedEndpoint {
                base_url: llm.remote.base_url.clone(),
                model: llm.remote.model.clone(),
                api_key,
            })
        }
        LlmBackend::Heuristics => Err(AppError::Config(
            "heuristics backend selected: no chat gateway available".into(),
        )),
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct HttpGateway {
    client: Client,
    endpoint: ResolvedEndpoint,
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(endpoint: ResolvedEndpoint, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            timeout,
        }
    }

    pub fn from_config(llm: &LlmSection) -> Result<Self> {
        Ok(Self::new(
            resolve_endpoint(llm)?,
            Duration::from_secs(llm.timeout_secs),
        ))
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        )
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<Response> {
        let request = ChatRequest {
            model: &self.endpoint.model,
            messages,
            temperature: 0.0,
            stream,
        };
        let response = self
            .client
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?;
        check_status(response).await
    }
}

/// Map gateway failures: 429 and 402 get their own user-facing errors.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = %status, "AI gateway returned an error");
    Err(error_for_status(status, body))
}

fn error_for_status(status: StatusCode, body: String) -> AppError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimited,
        StatusCode::PAYMENT_REQUIRED => AppError::PaymentRequired,
        other => AppError::Gateway {
            status: other.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl ChatGateway for HttpGateway {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let response = self.send(&messages, false).await?;
        let chat_response: ChatResponse = response.json().await?;
        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Gateway {
                status: 200,
                body: "empty response from model".into(),
            })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<String> {
        let mut response = self.send(&messages, true).await?;
        let mut decoder = SseDecoder::default();
        let mut full = String::new();

        while let Some(chunk) = response.chunk().await? {
            for delta in decoder.feed(&chunk) {
                sink(&delta);
                full.push_str(&delta);
            }
            if decoder.is_done() {
                break;
            }
        }
        for delta in decoder.finish() {
            sink(&delta);
            full.push_str(&delta);
        }
        Ok(full)
    }
}

/// Incremental decoder for `data: {...}` server-sent-event lines.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes; returns the content deltas of every complete line.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(delta) = self.decode_line(&line) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Flush a trailing line without newline.
    pub fn finish(&mut self) -> Vec<String> {
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line).into_iter().collect()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<String> {
        if self.done {
            return None;
        }
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        // Comments (": keep-alive") and blank separators carry no data.
        let payload = line.strip_prefix("data:")?.trim();
        if payload == "[DONE]" {
            self.done = true;
            return None;
        }
        match serde_json::from_str::<StreamChunk>(payload) {
            Ok(chunk) => chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .filter(|s| !s.is_empty()),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable stream line");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned replies in order and records every request.
    #[derive(Default)]
    pub struct ScriptedGateway {
        replies: Mutex<Vec<Result<String>>>,
        pub requests: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedGateway {
        pub fn replying(replies: Vec<Result<String>>) -> Self {
            let mut replies = replies;
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn next_reply(&self, messages: Vec<ChatMessage>) -> Result<String> {
            self.requests.lock().unwrap().push(messages);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    #[async_trait]
    impl ChatGateway for ScriptedGateway {
        async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
            self.next_reply(messages)
        }

        async fn stream(
            &self,
            messages: Vec<ChatMessage>,
            sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
        ) -> Result<String> {
            let reply = self.next_reply(messages)?;
            for word in reply.split_inclusive(' ') {
                sink(word);
            }
            Ok(reply)
        }
    }
}
