//! HTTP client for an Ollama-compatible model service.
//!
//! One blocking client serves both contract endpoints: `/api/embeddings`
//! for vectors and `/api/chat` for the strict-JSON classification prompts.
//! Requests carry a per-call timeout so an elapsed deadline cancels the
//! in-flight call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{MemoryError, Result};
use crate::model::{ChatProvider, EmbeddingProvider};

pub struct OllamaClient {
    http: reqwest::blocking::Client,
    host: String,
    chat_model: String,
    embedding_model: String,
    embedding_dim: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OllamaClient {
    pub fn from_config(config: &ModelConfig, embedding_dim: usize) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| MemoryError::UpstreamModel(format!("http client init failed: {e}")))?;

        Ok(Self {
            http,
            host: config.host.trim_end_matches('/').to_string(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dim,
        })
    }

    fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{path}", self.host);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| MemoryError::UpstreamModel(format!("model request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MemoryError::UpstreamModel(format!(
                "model service returned {status} for {path}"
            )));
        }

        response
            .json()
            .map_err(|e| MemoryError::UpstreamModel(format!("malformed model response: {e}")))
    }
}

impl EmbeddingProvider for OllamaClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response: EmbeddingResponse = self.post(
            "/api/embeddings",
            &EmbeddingRequest {
                model: &self.embedding_model,
                prompt: text,
            },
        )?;
        Ok(response.embedding)
    }

    fn dimensions(&self) -> usize {
        self.embedding_dim
    }
}

impl ChatProvider for OllamaClient {
    fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let response: ChatResponse = self.post(
            "/api/chat",
            &ChatRequest {
                model: &self.chat_model,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: system,
                    },
                    ChatMessage {
                        role: "user",
                        content: prompt,
                    },
                ],
                stream: false,
            },
        )?;
        Ok(response.message.content)
    }
}
