//! Reasoning backend
//!
//! The engine only needs "prompt in, free-form text out". Providers speak
//! their own wire formats; [`GuardedLlmClient`] wraps any of them with the
//! timeout, retry and circuit-breaking limits from [`ReasoningConfig`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, LlmProvider, ReasoningConfig};

pub mod anthropic;
pub mod guarded;
pub mod openai_compat;

pub use guarded::{CircuitBreaker, CircuitState, GuardedLlmClient};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

/// Token usage information from LLM response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// Response from LLM including message and token usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub message: Message,
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    /// Concatenated text of every text block
    pub fn text(&self) -> String {
        self.message
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a conversation to the LLM with optional system prompt
    async fn send_message_with_system(
        &self,
        messages: &[Message],
        system_prompt: Option<&str>,
    ) -> Result<LlmResponse>;

    async fn send_message(&self, messages: &[Message]) -> Result<LlmResponse> {
        self.send_message_with_system(messages, None).await
    }

    /// Send one fully rendered prompt and return the raw text answer
    async fn complete(&self, prompt: &str) -> Result<String> {
        let response = self
            .send_message(&[Message::user(prompt.to_string())])
            .await?;
        Ok(response.text())
    }
}

/// Create the configured provider client wrapped with reasoning limits
pub fn create_client(config: &Config) -> Result<Box<dyn LlmClient>> {
    let inner = create_provider_client(config)?;
    Ok(Box::new(GuardedLlmClient::new(inner, &config.reasoning)))
}

/// Wrap an arbitrary client with the given limits
pub fn guard(inner: Box<dyn LlmClient>, limits: &ReasoningConfig) -> Box<dyn LlmClient> {
    Box::new(GuardedLlmClient::new(inner, limits))
}

/// Create the underlying provider-specific LLM client
fn create_provider_client(config: &Config) -> Result<Box<dyn LlmClient>> {
    match config.llm.provider {
        LlmProvider::Anthropic => {
            let api_key = config
                .llm
                .api_key
                .clone()
                .context("Anthropic API key not set. Set ANTHROPIC_API_KEY or configure api_key")?;
            let mut client = anthropic::AnthropicClient::new(
                api_key,
                config.llm.model.clone(),
                config.llm.max_tokens,
            );
            if let Some(base_url) = &config.llm.base_url {
                client = client.with_base_url(base_url.clone());
            }
            Ok(Box::new(client))
        }
        LlmProvider::OpenAI => {
            let api_key = config
                .llm
                .api_key
                .clone()
                .context("OpenAI API key not set. Set OPENAI_API_KEY or configure api_key")?;
            Ok(Box::new(openai_compat::OpenAiCompatClient::new(
                config
                    .llm
                    .base_url
                    .clone()
                    .unwrap_or_else(|| openai_compat::OPENAI_BASE_URL.to_string()),
                Some(api_key),
                config.llm.model.clone(),
                config.llm.max_tokens,
            )))
        }
        LlmProvider::Ollama => {
            tracing::info!("Using Ollama (local LLM)");
            Ok(Box::new(openai_compat::OpenAiCompatClient::new(
                config
                    .llm
                    .base_url
                    .clone()
                    .unwrap_or_else(|| openai_compat::OLLAMA_BASE_URL.to_string()),
                None,
                config.llm.model.clone(),
                config.llm.max_tokens,
            )))
        }
    }
}

impl Message {
    pub fn user(text: String) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text }],
        }
    }

    pub fn assistant(text: String) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text }],
        }
    }
}
