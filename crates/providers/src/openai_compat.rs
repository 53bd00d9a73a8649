//! OpenAI-compatible inference implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, Groq and any
//! endpoint exposing `/chat/completions` with function calling.
//!
//! Tools are advertised under their qualified `server__tool` names. When
//! the model calls one, the name is split back apart and the call is
//! forwarded through the [`ToolInvoker`]; the result (or error text) is fed
//! back to the model until it answers in plain text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use switchboard_core::error::InferenceError;
use switchboard_core::inference::{
    Inference, InferenceRequest, InferenceResponse, ToolInvocation, Usage,
};
use switchboard_core::message::{Role, Turn};
use switchboard_core::tool::{ToolDescriptor, ToolInvoker, split_qualified_name};

/// An OpenAI-compatible chat completions client.
pub struct OpenAiCompatInference {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    max_tool_rounds: u32,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatInference {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| InferenceError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            max_tool_rounds: 10,
            system_prompt: None,
            client,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Cap model/tool round trips per inference.
    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn initial_messages(&self, history: &[Turn], message: &str) -> Vec<ApiMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ApiMessage::text("system", prompt));
        }
        messages.extend(history.iter().map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            ApiMessage::text(role, &turn.content)
        }));
        messages.push(ApiMessage::text("user", message));
        messages
    }

    fn to_api_tools(tools: &[ToolDescriptor]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.qualified_name(),
                    description: t.description.clone(),
                    parameters: t.schema.clone(),
                },
            })
            .collect()
    }

    async fn complete(
        &self,
        messages: &[ApiMessage],
        tools: &[ApiToolDefinition],
    ) -> Result<ApiResponse, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(tools);
        }

        debug!(provider = %self.name, model = %self.model, messages = messages.len(), "Sending completion request");

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout(e.to_string())
            } else {
                InferenceError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(InferenceError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(InferenceError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if !(200..300).contains(&status) {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider returned error");
            return Err(InferenceError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        response.json().await.map_err(|e| InferenceError::ApiError {
            status_code: status,
            message: format!("Failed to parse response: {e}"),
        })
    }
}

#[async_trait]
impl Inference for OpenAiCompatInference {
    fn name(&self) -> &str {
        &self.name
    }

    async fn infer(
        &self,
        request: InferenceRequest,
        tools: Arc<dyn ToolInvoker>,
    ) -> Result<InferenceResponse, InferenceError> {
        let api_tools = Self::to_api_tools(&request.tools);
        let mut messages = self.initial_messages(&request.history, &request.message);
        let mut usage: Option<Usage> = None;
        let mut invocations = Vec::new();

        for round in 0..=self.max_tool_rounds {
            let api_response = self.complete(&messages, &api_tools).await?;

            if let Some(u) = &api_response.usage {
                let total = usage.get_or_insert_with(Usage::default);
                total.prompt_tokens += u.prompt_tokens;
                total.completion_tokens += u.completion_tokens;
                total.total_tokens += u.total_tokens;
            }

            let choice = api_response.choices.into_iter().next().ok_or_else(|| {
                InferenceError::ApiError {
                    status_code: 200,
                    message: "No choices in response".into(),
                }
            })?;

            let tool_calls = choice.message.tool_calls.clone().unwrap_or_default();
            if tool_calls.is_empty() {
                return Ok(InferenceResponse {
                    content: choice.message.content.unwrap_or_default(),
                    model: api_response.model,
                    usage,
                    tool_invocations: invocations,
                });
            }

            if round == self.max_tool_rounds {
                warn!(rounds = self.max_tool_rounds, "Model kept calling tools; giving up");
                return Err(InferenceError::ToolRoundsExceeded(self.max_tool_rounds));
            }

            debug!(round, tool_count = tool_calls.len(), "Executing tool calls");
            messages.push(choice.message);

            for tc in &tool_calls {
                let output = run_tool_call(tools.as_ref(), tc, &mut invocations).await;
                messages.push(ApiMessage::tool_result(&tc.id, output));
            }
        }

        Err(InferenceError::ToolRoundsExceeded(self.max_tool_rounds))
    }

    async fn health_check(&self) -> Result<bool, InferenceError> {
        let url = format!("{}/models", self.base_url);
        let mut request = self.client.get(&url);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = request
            .send()
            .await
            .map_err(|e| InferenceError::Network(e.to_string()))?;
        Ok(response.status().is_success())
    }
}

/// Execute one model-requested tool call and return the text fed back to
/// the model. Failures become `Error: ...` text rather than aborting.
async fn run_tool_call(
    tools: &dyn ToolInvoker,
    tc: &ApiToolCall,
    invocations: &mut Vec<ToolInvocation>,
) -> String {
    let Some((server_id, tool_name)) = split_qualified_name(&tc.function.name) else {
        return format!("Error: unknown tool '{}'", tc.function.name);
    };
    let arguments = match parse_arguments(&tc.function.arguments) {
        Ok(arguments) => arguments,
        Err(e) => {
            warn!(tool = %tc.function.name, error = %e, "Model sent malformed tool arguments");
            return format!("Error: invalid arguments: {e}");
        }
    };

    let (success, output) = match tools.invoke(server_id, tool_name, arguments).await {
        Ok(result) if result.success => (true, result.output),
        Ok(result) => (false, format!("Error: {}", result.output)),
        Err(e) => {
            warn!(tool = %tc.function.name, error = %e, "Tool call failed");
            (false, format!("Error: {e}"))
        }
    };
    invocations.push(ToolInvocation {
        server_id: server_id.to_string(),
        tool_name: tool_name.to_string(),
        success,
    });
    output
}

/// Tool-call arguments as sent by the model. An empty string means no
/// arguments.
fn parse_arguments(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw)
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool_result(call_id: &str, output: String) -> Self {
        Self {
            role: "tool".into(),
            content: Some(output),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex;
    use switchboard_core::error::ToolServerError;
    use switchboard_core::tool::ToolResult;

    /// Replays canned completion bodies and records every request.
    #[derive(Default)]
    struct MockApi {
        replies: Mutex<Vec<(StatusCode, serde_json::Value)>>,
        requests: Mutex<Vec<serde_json::Value>>,
    }

    async fn completions(
        State(api): State<Arc<MockApi>>,
        Json(body): Json<serde_json::Value>,
    ) -> Response {
        api.requests.lock().unwrap().push(body);
        let mut replies = api.replies.lock().unwrap();
        if replies.is_empty() {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        let (status, reply) = replies.remove(0);
        (status, Json(reply)).into_response()
    }

    async fn spawn_api(replies: Vec<(StatusCode, serde_json::Value)>) -> (String, Arc<MockApi>) {
        let api = Arc::new(MockApi {
            replies: Mutex::new(replies),
            requests: Mutex::default(),
        });
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(api.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/v1"), api)
    }

    fn text_reply(content: &str) -> serde_json::Value {
        serde_json::json!({
            "model": "mock-model",
            "choices": [{ "message": { "role": "assistant", "content": content } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        })
    }

    fn tool_reply(name: &str, arguments: &str) -> serde_json::Value {
        serde_json::json!({
            "model": "mock-model",
            "choices": [{ "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": name, "arguments": arguments }
                }]
            } }],
            "usage": { "prompt_tokens": 8, "completion_tokens": 4, "total_tokens": 12 }
        })
    }

    /// Records calls and answers with a fixed result.
    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<(String, String, serde_json::Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl ToolInvoker for RecordingInvoker {
        async fn invoke(
            &self,
            server_id: &str,
            tool_name: &str,
            arguments: serde_json::Value,
        ) -> Result<ToolResult, ToolServerError> {
            self.calls.lock().unwrap().push((
                server_id.to_string(),
                tool_name.to_string(),
                arguments,
            ));
            if self.fail {
                return Err(ToolServerError::ServerUnreachable {
                    server_id: server_id.to_string(),
                    reason: "down".into(),
                });
            }
            Ok(ToolResult {
                success: true,
                output: "Sunny, 21C".into(),
                data: None,
            })
        }
    }

    fn forecast_tool() -> ToolDescriptor {
        ToolDescriptor {
            server_id: "weather".into(),
            name: "forecast".into(),
            description: "Forecast for a city".into(),
            schema: serde_json::json!({ "type": "object" }),
        }
    }

    fn request(message: &str) -> InferenceRequest {
        InferenceRequest {
            history: vec![
                Turn::user("Hi", 0),
                Turn::assistant("Hello! How can I help?", 1),
            ],
            tools: vec![forecast_tool()],
            message: message.into(),
        }
    }

    #[tokio::test]
    async fn plain_answer_without_tools() {
        let (url, api) = spawn_api(vec![(StatusCode::OK, text_reply("Hello there"))]).await;
        let inference = OpenAiCompatInference::new("mock", url, "sk-test", "mock-model")
            .unwrap()
            .with_system_prompt("Be brief.");

        let response = inference
            .infer(request("Hello"), Arc::new(RecordingInvoker::default()))
            .await
            .unwrap();
        assert_eq!(response.content, "Hello there");
        assert_eq!(response.usage.unwrap().total_tokens, 15);

        let sent = api.requests.lock().unwrap()[0].clone();
        let roles: Vec<_> = sent["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(sent["tools"][0]["function"]["name"], "weather__forecast");
    }

    #[tokio::test]
    async fn tool_call_is_routed_to_owning_server() {
        let (url, api) = spawn_api(vec![
            (StatusCode::OK, tool_reply("weather__forecast", r#"{"city":"Oslo"}"#)),
            (StatusCode::OK, text_reply("It's sunny in Oslo.")),
        ])
        .await;
        let inference = OpenAiCompatInference::new("mock", url, "", "mock-model").unwrap();
        let invoker = Arc::new(RecordingInvoker::default());

        let response = inference
            .infer(request("Weather in Oslo?"), invoker.clone())
            .await
            .unwrap();

        assert_eq!(response.content, "It's sunny in Oslo.");
        assert_eq!(response.tool_invocations.len(), 1);
        assert_eq!(response.usage.unwrap().total_tokens, 27);

        let calls = invoker.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "weather");
        assert_eq!(calls[0].1, "forecast");
        assert_eq!(calls[0].2["city"], "Oslo");

        let second = api.requests.lock().unwrap()[1].clone();
        let last = second["messages"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["role"], "tool");
        assert_eq!(last["tool_call_id"], "call_1");
        assert_eq!(last["content"], "Sunny, 21C");
    }

    #[tokio::test]
    async fn tool_failure_is_reported_to_the_model() {
        let (url, api) = spawn_api(vec![
            (StatusCode::OK, tool_reply("weather__forecast", "{}")),
            (StatusCode::OK, text_reply("The weather service is down.")),
        ])
        .await;
        let inference = OpenAiCompatInference::new("mock", url, "", "mock-model").unwrap();
        let invoker = Arc::new(RecordingInvoker {
            fail: true,
            ..Default::default()
        });

        let response = inference.infer(request("Weather?"), invoker).await.unwrap();
        assert!(!response.tool_invocations[0].success);

        let second = api.requests.lock().unwrap()[1].clone();
        let last = second["messages"].as_array().unwrap().last().unwrap().clone();
        assert!(last["content"].as_str().unwrap().starts_with("Error:"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_reported_without_calling_the_tool() {
        let (url, api) = spawn_api(vec![
            (StatusCode::OK, tool_reply("weather__forecast", r#"{"city": "Os"#)),
            (StatusCode::OK, text_reply("Sorry, let me retry.")),
        ])
        .await;
        let inference = OpenAiCompatInference::new("mock", url, "", "mock-model").unwrap();
        let invoker = Arc::new(RecordingInvoker::default());

        let response = inference
            .infer(request("Weather in Oslo?"), invoker.clone())
            .await
            .unwrap();
        assert_eq!(response.content, "Sorry, let me retry.");
        assert!(response.tool_invocations.is_empty());
        assert!(invoker.calls.lock().unwrap().is_empty());

        let second = api.requests.lock().unwrap()[1].clone();
        let last = second["messages"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["tool_call_id"], "call_1");
        assert!(
            last["content"]
                .as_str()
                .unwrap()
                .starts_with("Error: invalid arguments:")
        );
    }

    #[tokio::test]
    async fn empty_arguments_mean_no_arguments() {
        let (url, _api) = spawn_api(vec![
            (StatusCode::OK, tool_reply("weather__forecast", "")),
            (StatusCode::OK, text_reply("Sunny.")),
        ])
        .await;
        let inference = OpenAiCompatInference::new("mock", url, "", "mock-model").unwrap();
        let invoker = Arc::new(RecordingInvoker::default());

        inference.infer(request("Weather?"), invoker.clone()).await.unwrap();
        let calls = invoker.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, serde_json::json!({}));
    }

    #[tokio::test]
    async fn endless_tool_calls_hit_round_limit() {
        let (url, _api) = spawn_api(vec![
            (StatusCode::OK, tool_reply("weather__forecast", "{}")),
            (StatusCode::OK, tool_reply("weather__forecast", "{}")),
            (StatusCode::OK, tool_reply("weather__forecast", "{}")),
        ])
        .await;
        let inference = OpenAiCompatInference::new("mock", url, "", "mock-model")
            .unwrap()
            .with_max_tool_rounds(2);

        let err = inference
            .infer(request("loop"), Arc::new(RecordingInvoker::default()))
            .await
            .unwrap_err();
        assert_eq!(err, InferenceError::ToolRoundsExceeded(2));
    }

    #[tokio::test]
    async fn http_errors_map_to_inference_errors() {
        let (url, _api) = spawn_api(vec![
            (StatusCode::UNAUTHORIZED, serde_json::json!({})),
            (StatusCode::TOO_MANY_REQUESTS, serde_json::json!({})),
            (StatusCode::BAD_GATEWAY, serde_json::json!({"error": "upstream"})),
        ])
        .await;
        let inference = OpenAiCompatInference::new("mock", url, "bad", "mock-model").unwrap();
        let invoker: Arc<dyn ToolInvoker> = Arc::new(RecordingInvoker::default());

        assert!(matches!(
            inference.infer(request("a"), invoker.clone()).await,
            Err(InferenceError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            inference.infer(request("b"), invoker.clone()).await,
            Err(InferenceError::RateLimited { .. })
        ));
        assert!(matches!(
            inference.infer(request("c"), invoker).await,
            Err(InferenceError::ApiError { status_code: 502, .. })
        ));
    }
}
