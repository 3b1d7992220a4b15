//! Ollama chat client shared by the planner backend and the workers.

pub mod extract;

pub use extract::parse_lenient;

use crate::config::ModelConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Message in the chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
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

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Thin client over Ollama's `/api/chat`.
#[derive(Clone)]
pub struct OllamaClient {
    http_client: reqwest::Client,
    config: ModelConfig,
}

impl OllamaClient {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.config.name
    }

    /// Send a system + user prompt and return the assistant's text.
    ///
    /// Transport failures (timeouts, refused connections) are retried up to
    /// the configured number of times; API errors are returned immediately.
    pub async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let mut attempt = 0;

        loop {
            match self.send(&messages).await {
                Ok(content) => return Ok(content),
                Err(SendError::Transport(e)) if attempt < self.config.retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Ollama request failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1 << attempt.min(5))).await;
                }
                Err(SendError::Transport(e)) | Err(SendError::Api(e)) => return Err(e),
            }
        }
    }

    async fn send(&self, messages: &[ChatMessage]) -> std::result::Result<String, SendError> {
        let url = format!("{}/api/chat", self.config.ollama_url);
        let request = OllamaChatRequest {
            model: &self.config.name,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };

        debug!(model = %self.config.name, "Sending chat request");

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::Transport(anyhow::anyhow!(
                        "Request timed out after {}s",
                        self.config.timeout_seconds
                    ))
                } else if e.is_connect() {
                    SendError::Transport(anyhow::anyhow!(
                        "Cannot connect to Ollama at {}. Is Ollama running?",
                        self.config.ollama_url
                    ))
                } else {
                    SendError::Api(anyhow::anyhow!("Failed to send request: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Api(anyhow::anyhow!(
                "Ollama API error {}: {}",
                status,
                body
            )));
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")
            .map_err(SendError::Api)?;

        Ok(chat_response.message.content)
    }
}

enum SendError {
    Transport(anyhow::Error),
    Api(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let messages = [ChatMessage::system("sys"), ChatMessage::user("hi")];
        let request = OllamaChatRequest {
            model: "llama3.2:latest",
            messages: &messages,
            stream: false,
            options: OllamaOptions { temperature: 0.1 },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama3.2:latest");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_client_builds_from_default_config() {
        let client = OllamaClient::new(ModelConfig::default()).unwrap();
        assert_eq!(client.model_name(), ModelConfig::default().name);
    }
}
