//! Client for OpenAI-compatible chat completion APIs
//!
//! Used for OpenAI itself and for Ollama, which serves the same API under
//! `/v1/chat/completions`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ContentBlock, LlmClient, LlmResponse, Message, Role, TokenUsage};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

pub struct OpenAiCompatClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: usize,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: usize,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

impl OpenAiCompatClient {
    pub fn new(base_url: String, api_key: Option<String>, model: String, max_tokens: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_tokens,
            client: reqwest::Client::new(),
        }
    }

    /// Flatten internal messages, placing the system prompt first
    fn convert_messages(messages: &[Message], system_prompt: Option<&str>) -> Vec<ChatMessage> {
        let mut result = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt {
            result.push(ChatMessage {
                role: "system".to_string(),
                content: Some(system.to_string()),
            });
        }
        for msg in messages {
            let text = msg
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => text.as_str(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            result.push(ChatMessage {
                role: match msg.role {
                    Role::User => "user".to_string(),
                    Role::Assistant => "assistant".to_string(),
                },
                content: Some(text),
            });
        }
        result
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn send_message_with_system(
        &self,
        messages: &[Message],
        system_prompt: Option<&str>,
    ) -> Result<LlmResponse> {
        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: Self::convert_messages(messages, system_prompt),
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            anyhow::bail!("Chat completion API error ({}): {}", status, text);
        }

        let chat: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        let text = chat
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("Chat completion response contained no choices")?;

        Ok(LlmResponse {
            message: Message::assistant(text),
            usage: chat
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }
}
