//! abstain-providers — model client implementations.
//!
//! Clients for Anthropic, OpenAI-compatible endpoints and Ollama, plus a
//! scripted mock for offline runs and tests.

pub mod anthropic;
pub mod config;
pub mod mock;
pub mod ollama;
pub mod openai;

pub use config::{create_client, load_config, load_config_from, AbstainConfig, ProviderConfig};
pub use mock::MockClient;

use std::time::Duration;

use abstain_core::error::ClientError;

/// Build an HTTP client with a request timeout.
///
/// Falls back to a client without a timeout if the TLS backend cannot be
/// configured; the session layer applies its own per-call timeout anyway.
pub(crate) fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to configure HTTP client, using defaults");
            reqwest::Client::new()
        })
}

/// Map a transport-level failure to a client error.
pub(crate) fn transport_error(e: reqwest::Error, timeout_secs: u64) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout(timeout_secs)
    } else {
        ClientError::NetworkError(e.to_string())
    }
}

/// Read the `retry-after` header in seconds, defaulting to 5.
pub(crate) fn retry_after_ms(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5)
        .saturating_mul(1000)
}

/// Treat whitespace-only replies as missing.
pub(crate) fn non_empty(content: Option<String>) -> Result<String, ClientError> {
    match content {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(ClientError::EmptyResponse),
    }
}
