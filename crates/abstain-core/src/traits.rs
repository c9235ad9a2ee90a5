//! The model client boundary.
//!
//! The core treats a model as a black box from prompt text to reply text.
//! Implementations live in `abstain-providers`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Trait for model backends that answer prompts.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable provider name (e.g. "anthropic").
    fn name(&self) -> &str;

    /// Send a prompt and return the model's raw reply.
    ///
    /// Any reply that is not a `ClientError`, however malformed, is handed
    /// to the response parser as-is.
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError>;

    /// List models this client knows about.
    fn available_models(&self) -> Vec<ModelInfo>;
}

/// A single prompt sent to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Model identifier (e.g. "claude-sonnet-4-20250514").
    pub model: String,
    /// The user prompt.
    pub prompt: String,
    /// Optional system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
}

/// A model's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The raw reply text.
    pub content: String,
    /// Model that actually produced the reply.
    pub model: String,
    /// Latency in milliseconds.
    pub latency_ms: u64,
}

/// Information about an available model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier.
    pub id: String,
    /// Human-readable model name.
    pub name: String,
    /// Provider name.
    pub provider: String,
    /// Maximum context window size in tokens.
    pub max_context: u32,
}

/// Default system prompt for quiz trials.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are answering quiz questions. You may reason briefly before answering. Always end your reply with a single line that starts with `Answer:`.";
