//! OpenAI-compatible chat completions client.
//!
//! Works against any endpoint that speaks `/v1/chat/completions`, including
//! Together and other hosted open-weight model services via `base_url`.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use abstain_core::error::ClientError;
use abstain_core::traits::{ModelClient, ModelInfo, ModelRequest, ModelResponse};

use crate::{http_client, non_empty, retry_after_ms, transport_error};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// OpenAI-compatible API client.
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    org_id: Option<String>,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: Option<String>, org_id: Option<String>) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            org_id,
            client: http_client(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    model: String,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError> {
        let start = Instant::now();

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages,
        };

        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json");

        if let Some(org) = &self.org_id {
            req = req.header("OpenAI-Organization", org);
        }

        let response = req
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, DEFAULT_TIMEOUT_SECS))?;

        let status = response.status().as_u16();
        if status == 429 {
            return Err(ClientError::RateLimited {
                retry_after_ms: retry_after_ms(&response),
            });
        }
        if status == 401 {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::AuthenticationFailed(body));
        }
        if status == 404 {
            return Err(ClientError::ModelNotFound(request.model.clone()));
        }
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::ApiError {
                status,
                message: body,
            });
        }

        let api_response: ChatResponse =
            response.json().await.map_err(|e| ClientError::ApiError {
                status: 0,
                message: format!("failed to parse response: {e}"),
            })?;

        let content = non_empty(
            api_response
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content),
        )?;

        Ok(ModelResponse {
            content,
            model: api_response.model,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn available_models(&self) -> Vec<ModelInfo> {
        [("gpt-4o", "GPT-4o", 128_000), ("gpt-4o-mini", "GPT-4o mini", 128_000)]
            .into_iter()
            .map(|(id, name, max_context)| ModelInfo {
                id: id.into(),
                name: name.into(),
                provider: "openai".into(),
                max_context,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(model: &str) -> ModelRequest {
        ModelRequest {
            model: model.into(),
            prompt: "What is the capital of France?".into(),
            system_prompt: None,
            max_tokens: 128,
            temperature: 0.0,
        }
    }

    fn reply(model: &str, content: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "model": model,
            "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25}
        })
    }

    #[tokio::test]
    async fn successful_reply() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(reply("gpt-4o", serde_json::json!("Answer: Paris"))),
            )
            .mount(&server)
            .await;

        let client = OpenAiClient::new("test-key", Some(server.uri()), None);
        let response = client.send(&request("gpt-4o")).await.unwrap();
        assert_eq!(response.content, "Answer: Paris");
        assert_eq!(response.model, "gpt-4o");
    }

    #[tokio::test]
    async fn compatible_endpoint_with_organization() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("OpenAI-Organization", "org-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply(
                "meta-llama/Llama-3-70b-chat-hf",
                serde_json::json!("Answer: blank"),
            )))
            .mount(&server)
            .await;

        let client = OpenAiClient::new("tok", Some(server.uri()), Some("org-1".into()));
        let response = client
            .send(&request("meta-llama/Llama-3-70b-chat-hf"))
            .await
            .unwrap();
        assert_eq!(response.content, "Answer: blank");
    }

    #[tokio::test]
    async fn server_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&server)
            .await;

        let client = OpenAiClient::new("test-key", Some(server.uri()), None);
        let err = client.send(&request("gpt-4o")).await.unwrap_err();
        assert!(matches!(err, ClientError::ApiError { status: 500, .. }));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn null_content_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(reply("gpt-4o", serde_json::Value::Null)),
            )
            .mount(&server)
            .await;

        let client = OpenAiClient::new("test-key", Some(server.uri()), None);
        let err = client.send(&request("gpt-4o")).await.unwrap_err();
        assert_eq!(err, ClientError::EmptyResponse);
    }

    #[tokio::test]
    async fn unknown_model() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = OpenAiClient::new("test-key", Some(server.uri()), None);
        let err = client.send(&request("gpt-9")).await.unwrap_err();
        assert_eq!(err, ClientError::ModelNotFound("gpt-9".into()));
    }
}
