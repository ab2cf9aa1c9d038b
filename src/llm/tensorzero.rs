use super::{CompletionBackend, CompletionError, LlmMessage};
use crate::config::env_opt;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

const DEFAULT_FUNCTION: &str = "listing_price_classification";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: Option<String>,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: env_opt("TENSORZERO_GATEWAY_URL")
                .unwrap_or_else(|| "http://localhost:3000".into()),
            api_key: env_opt("TENSORZERO_API_KEY"),
            function_name: env_opt("TENSORZERO_FUNCTION"),
            model: env_opt("TENSORZERO_MODEL"),
        }
    }
}

/// TensorZero gateway client (`POST {gateway}/inference`).
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    fn request_body(&self, messages: &[LlmMessage]) -> ChatRequest {
        ChatRequest {
            function_name: self
                .config
                .function_name
                .clone()
                .unwrap_or_else(|| DEFAULT_FUNCTION.to_string()),
            model_name: self.config.model.clone(),
            input: ChatInput {
                messages: messages.to_vec(),
            },
        }
    }
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String, CompletionError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(CompletionError::MissingGateway);
        }

        let mut request = self
            .http
            .post(format!("{gateway}/inference"))
            .json(&self.request_body(messages));

        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                CompletionError::Timeout
            } else {
                CompletionError::Http(err.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::RateLimited(format!("HTTP {status}: {body}")));
        }
        if !status.is_success() {
            return Err(CompletionError::Http(format!("HTTP {status}")));
        }

        let payload: TensorZeroResponse = response
            .json()
            .await
            .map_err(|err| CompletionError::InvalidResponse(err.to_string()))?;

        first_text(payload)
    }
}

fn first_text(payload: TensorZeroResponse) -> Result<String, CompletionError> {
    payload
        .content
        .into_iter()
        .find(|item| item.r#type == "text")
        .and_then(|item| item.text)
        .ok_or_else(|| CompletionError::InvalidResponse("missing text".into()))
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: ChatInput,
}

#[derive(Debug, Serialize)]
struct ChatInput {
    messages: Vec<LlmMessage>,
}

#[derive(Debug, Deserialize)]
struct TensorZeroResponse {
    content: Vec<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig {
            gateway_url: "http://gateway".into(),
            api_key: None,
            function_name: None,
            model: Some("gpt-4o".into()),
        }
    }

    #[test]
    fn request_defaults_to_classification_function() {
        let client = LlmClient::new(config());
        let body = serde_json::to_value(client.request_body(&[LlmMessage::user("hi")])).unwrap();
        assert_eq!(body["function_name"], "listing_price_classification");
        assert_eq!(body["model_name"], "gpt-4o");
        assert_eq!(body["input"]["messages"][0]["role"], "user");
    }

    #[test]
    fn picks_first_text_block() {
        let payload: TensorZeroResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "tool_call", "name": "noop"},
                {"type": "text", "text": "{\"status\":\"explicit\"}"}
            ]
        }))
        .unwrap();
        assert_eq!(first_text(payload).unwrap(), "{\"status\":\"explicit\"}");
    }

    #[test]
    fn reply_without_text_is_invalid() {
        let payload: TensorZeroResponse =
            serde_json::from_value(serde_json::json!({ "content": [] })).unwrap();
        assert!(matches!(
            first_text(payload),
            Err(CompletionError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn blank_gateway_is_rejected_before_sending() {
        let client = LlmClient::new(LlmConfig {
            gateway_url: "  ".into(),
            ..config()
        });
        assert!(matches!(
            client.complete(&[LlmMessage::user("hi")]).await,
            Err(CompletionError::MissingGateway)
        ));
    }
}
