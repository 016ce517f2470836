use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum LlmError {
    #[error(transparent)]
    Http(reqwest::Error),
    #[error("LLM backend returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed backend response: {0}")]
    Protocol(String),
    #[error("LLM call timed out")]
    Timeout,
    #[error("LLM pool unavailable: {0}")]
    Unavailable(String),
}

fn from_reqwest(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Http(err)
    }
}

/// Inference parameters forwarded to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: Option<u32>,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: None,
            max_tokens: 2048,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOutput {
    pub text: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
}

/// Rough token estimate when the backend reports no usage.
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// Thin client for an OpenAI-compatible inference backend
/// (`/v1/chat/completions`, `/v1/embeddings`, `/v1/models`, `/api/pull`).
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_CALL_TIMEOUT)
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, model: &str, prompt: &str, params: &GenerationParams, stream: bool) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &params.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt.to_string(),
        });
        ChatRequest {
            model: model.to_string(),
            messages,
            stream,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            max_tokens: params.max_tokens,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        let message = message.chars().take(500).collect();
        Err(LlmError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn chat(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ChatOutput, LlmError> {
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&self.request(model, prompt, params, false))
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = Self::check_status(response).await?;
        let body: ChatResponse = response.json().await.map_err(from_reqwest)?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Protocol("response carried no choices".to_string()))?;
        Ok(ChatOutput {
            text: choice.message.content.unwrap_or_default(),
            tokens_in: body.usage.as_ref().map(|u| u.prompt_tokens),
            tokens_out: body.usage.as_ref().map(|u| u.completion_tokens),
        })
    }

    /// Streams completion deltas. The stream ends at `data: [DONE]`, on
    /// backend close, or on the first error; dropping it cancels the call.
    pub async fn chat_stream(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&self.request(model, prompt, params, true))
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = Self::check_status(response).await?;

        struct SseState {
            body: BoxStream<'static, reqwest::Result<Bytes>>,
            buf: String,
            done: bool,
        }

        let state = SseState {
            body: response.bytes_stream().boxed(),
            buf: String::new(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                if let Some(pos) = state.buf.find('\n') {
                    let line = state.buf[..pos].trim().to_string();
                    state.buf.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let payload = line
                        .strip_prefix("data:")
                        .map(|rest| rest.trim().to_string())
                        .unwrap_or(line);
                    if payload == "[DONE]" {
                        state.done = true;
                        return None;
                    }
                    match serde_json::from_str::<StreamChunk>(&payload) {
                        Ok(chunk) => {
                            let delta = chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|c| c.delta.content);
                            match delta {
                                Some(text) if !text.is_empty() => {
                                    return Some((Ok(text), state));
                                }
                                _ => continue,
                            }
                        }
                        Err(err) => {
                            state.done = true;
                            return Some((Err(LlmError::Protocol(err.to_string())), state));
                        }
                    }
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => state.buf.push_str(&String::from_utf8_lossy(&bytes)),
                    Some(Err(err)) => {
                        state.done = true;
                        return Some((Err(from_reqwest(err)), state));
                    }
                    None => {
                        state.done = true;
                        return None;
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    /// Tag listing, used to reconcile the catalog's `loaded` flags.
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let response = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = Self::check_status(response).await?;
        let body: ModelsResponse = response.json().await.map_err(from_reqwest)?;
        Ok(body.data.into_iter().map(|m| m.id).collect())
    }

    pub async fn pull_model(&self, name: &str) -> Result<(), LlmError> {
        let response = self
            .http
            .post(format!("{}/api/pull", self.base_url))
            .json(&serde_json::json!({ "name": name, "stream": false }))
            .send()
            .await
            .map_err(from_reqwest)?;
        Self::check_status(response).await?;
        Ok(())
    }

    pub async fn embeddings(&self, model: &str, input: &str) -> Result<Vec<f32>, LlmError> {
        let response = self
            .http
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&serde_json::json!({ "model": model, "input": input }))
            .send()
            .await
            .map_err(from_reqwest)?;
        let response = Self::check_status(response).await?;
        let body: EmbeddingsResponse = response.json().await.map_err(from_reqwest)?;
        body.data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| LlmError::Protocol("response carried no embeddings".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn chat_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "cmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        })
    }

    #[tokio::test]
    async fn chat_returns_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("hello")))
            .mount(&server)
            .await;

        let client = LlmClient::new(server.uri()).unwrap();
        let output = client
            .chat("qwen2.5-coder:14b", "say hello", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(output.text, "hello");
        assert_eq!(output.tokens_in, Some(7));
        assert_eq!(output.tokens_out, Some(3));
    }

    #[tokio::test]
    async fn chat_maps_backend_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model exploded"))
            .mount(&server)
            .await;

        let client = LlmClient::new(server.uri()).unwrap();
        let err = client
            .chat("qwen2.5-coder:14b", "hi", &GenerationParams::default())
            .await
            .unwrap_err();
        match err {
            LlmError::Api { status, message } => {
                assert_eq!(status, 500);
                assert!(message.contains("model exploded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_parses_sse_until_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let client = LlmClient::new(server.uri()).unwrap();
        let stream = client
            .chat_stream("qwen2.5-coder:14b", "hi", &GenerationParams::default())
            .await
            .unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn list_models_reads_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "qwen2.5-coder:14b"}, {"id": "glm4:9b"}]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(server.uri()).unwrap();
        let tags = client.list_models().await.unwrap();
        assert_eq!(tags, vec!["qwen2.5-coder:14b", "glm4:9b"]);
    }

    #[tokio::test]
    async fn embeddings_return_first_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.25, -0.5, 1.0]}]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(server.uri()).unwrap();
        let vector = client.embeddings("qwen2.5-coder:7b", "hello").await.unwrap();
        assert_eq!(vector, vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn whitespace_estimate_counts_words() {
        assert_eq!(estimate_tokens("rename greet to hello"), 4);
        assert_eq!(estimate_tokens(""), 0);
    }
}
