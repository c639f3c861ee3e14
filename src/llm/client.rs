//! LLM 对话客户端

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AzureDeployment, LlmConfig};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// 要求模型只输出 JSON 对象
    pub json_mode: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String>;
    fn model_name(&self) -> String;
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Azure OpenAI chat/completions 客户端
pub struct AzureOpenAiChat {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl AzureOpenAiChat {
    pub fn new(
        model: &str,
        deployment: &AzureDeployment,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(deployment.timeout_secs))
            .build()?;

        let api_key = deployment.resolve_api_key();
        if api_key.is_none() {
            warn!(
                "LLM API key not found (env {}), requests will be unauthenticated",
                deployment.api_key_env
            );
        }

        Ok(Self {
            client,
            url: deployment.url("chat/completions"),
            model: model.to_string(),
            api_key,
            temperature,
            max_tokens,
        })
    }
}

#[async_trait]
impl ChatModel for AzureOpenAiChat {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let body = CompletionBody {
            messages: &request.messages,
            temperature: request.temperature.unwrap_or(self.temperature),
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            response_format: request
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
        };

        let mut http_req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.header("api-key", key);
        }

        debug!(model = %self.model, messages = request.messages.len(), "Sending chat completion");
        let response = http_req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "LLM 请求失败 ({}): {}",
                status, body_text
            )));
        }

        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Upstream("LLM 响应中没有内容".to_string()))
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

/// 按配置创建对话模型；未配置时返回 None
pub fn create_chat_model(config: &LlmConfig) -> Result<Option<Arc<dyn ChatModel>>> {
    match config {
        LlmConfig::AzureOpenai {
            model,
            azure_kwargs,
            temperature,
            max_tokens,
        } => Ok(Some(Arc::new(AzureOpenAiChat::new(
            model,
            azure_kwargs,
            *temperature,
            *max_tokens,
        )?))),
        LlmConfig::Disabled => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat(server: &MockServer) -> AzureOpenAiChat {
        let deployment = AzureDeployment {
            azure_endpoint: server.uri(),
            api_key: Some("test-key".into()),
            ..AzureDeployment::default()
        };
        AzureOpenAiChat::new("gpt-4.1-nano", &deployment, 0.1, 800).unwrap()
    }

    #[tokio::test]
    async fn test_chat_completion_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/gpt-4.1-nano/chat/completions"))
            .and(query_param("api-version", "2025-01-01-preview"))
            .and(header("api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "messages": [{"role": "user", "content": "你是谁"}],
                "max_tokens": 800,
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"facts\":[]}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let answer = chat(&server)
            .complete(ChatRequest::new(vec![ChatMessage::user("你是谁")]).json())
            .await
            .unwrap();
        assert_eq!(answer, "{\"facts\":[]}");
    }

    #[tokio::test]
    async fn test_chat_completion_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = chat(&server)
            .complete(ChatRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        match err {
            AppError::Upstream(msg) => assert!(msg.contains("rate limited")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chat_completion_without_choices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let err = chat(&server)
            .complete(ChatRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)));
    }

    #[test]
    fn test_disabled_config_has_no_model() {
        assert!(create_chat_model(&LlmConfig::Disabled).unwrap().is_none());
    }
}
