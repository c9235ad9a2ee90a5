//! Mock model client for offline runs and tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use abstain_core::error::ClientError;
use abstain_core::traits::{ModelClient, ModelInfo, ModelRequest, ModelResponse};

/// A model client that answers from a script instead of an API.
///
/// Replies are chosen in order: the next scripted reply if any remain, then
/// the first route whose key occurs in the prompt, then the fixed reply.
/// With none of those available the call fails with a network error.
#[derive(Default)]
pub struct MockClient {
    script: Mutex<VecDeque<Result<String, ClientError>>>,
    routes: Vec<(String, String)>,
    fixed: Option<String>,
    call_count: AtomicU32,
    requests: Mutex<Vec<ModelRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that always returns the same reply.
    pub fn with_fixed_response(reply: &str) -> Self {
        Self {
            fixed: Some(reply.to_string()),
            ..Self::default()
        }
    }

    /// A mock that plays back replies and errors in order.
    pub fn scripted(script: impl IntoIterator<Item = Result<String, ClientError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// A mock that plays back successful replies in order.
    pub fn replies<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self::scripted(replies.into_iter().map(|r| Ok(r.into())))
    }

    /// Answer `reply` whenever the prompt contains `key`.
    pub fn route(mut self, key: &str, reply: &str) -> Self {
        self.routes.push((key.to_string(), reply.to_string()));
        self
    }

    /// Reply used once the script and routes are exhausted.
    pub fn otherwise(mut self, reply: &str) -> Self {
        self.fixed = Some(reply.to_string());
        self
    }

    /// Number of calls made to this client.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every prompt received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.requests).iter().map(|r| r.prompt.clone()).collect()
    }

    /// The most recent request, if any.
    pub fn last_request(&self) -> Option<ModelRequest> {
        lock(&self.requests).last().cloned()
    }
}

#[async_trait]
impl ModelClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        lock(&self.requests).push(request.clone());

        let scripted = lock(&self.script).pop_front();
        let content = match scripted {
            Some(reply) => reply?,
            None => self
                .routes
                .iter()
                .find(|(key, _)| request.prompt.contains(key.as_str()))
                .map(|(_, reply)| reply.clone())
                .or_else(|| self.fixed.clone())
                .ok_or_else(|| ClientError::NetworkError("mock client has no reply".into()))?,
        };

        Ok(ModelResponse {
            content,
            model: request.model.clone(),
            latency_ms: 1,
        })
    }

    fn available_models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            id: "mock-model".into(),
            name: "Mock Model".into(),
            provider: "mock".into(),
            max_context: 100_000,
        }]
    }
}
