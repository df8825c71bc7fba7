use crate::error::{HttpError, SdkError, SdkResult};
use crate::http_client::{HttpClient, HttpRequest};
use crate::signer::{self, SignedRequestParams};
use crate::types::DeviceIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const STREAM_DONE: &str = "[DONE]";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    /// Result of executing a tool call, fed back to the model.
    pub fn tool(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.to_string()),
            tool_call_id: Some(tool_call_id.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    /// JSON text, accumulated verbatim across stream deltas.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

impl ChatTool {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: &str, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.to_string(),
            messages,
            stream: false,
            tools: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

impl ChatResponse {
    /// Content of the first choice, the common case.
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

// Stream chunk shapes (`choices[].delta`).

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Reassembles a streamed completion from its SSE chunks.
#[derive(Default)]
struct StreamAssembler {
    id: String,
    role: String,
    content: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<String>,
    usage: Option<ChatUsage>,
    done: bool,
}

impl StreamAssembler {
    /// Feed one SSE `data` payload. Returns the content delta, if any.
    fn push(&mut self, data: &str) -> SdkResult<Option<String>> {
        if data.trim() == STREAM_DONE {
            self.done = true;
            return Ok(None);
        }
        let chunk: ChatChunk = serde_json::from_str(data)?;
        if !chunk.id.is_empty() {
            self.id = chunk.id;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }
        if let Some(role) = choice.delta.role {
            self.role = role;
        }
        for tc in choice.delta.tool_calls.unwrap_or_default() {
            while self.tool_calls.len() <= tc.index {
                self.tool_calls.push(ToolCall {
                    kind: "function".to_string(),
                    ..Default::default()
                });
            }
            let slot = &mut self.tool_calls[tc.index];
            if let Some(id) = tc.id {
                slot.id = id;
            }
            if let Some(function) = tc.function {
                if let Some(name) = function.name {
                    slot.function.name = name;
                }
                if let Some(arguments) = function.arguments {
                    slot.function.arguments.push_str(&arguments);
                }
            }
        }
        match choice.delta.content {
            Some(delta) if !delta.is_empty() => {
                self.content.push_str(&delta);
                Ok(Some(delta))
            }
            _ => Ok(None),
        }
    }

    fn finish(self) -> ChatResponse {
        let message = ChatMessage {
            role: if self.role.is_empty() {
                "assistant".to_string()
            } else {
                self.role
            },
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls: if self.tool_calls.is_empty() {
                None
            } else {
                Some(self.tool_calls)
            },
            tool_call_id: None,
        };
        ChatResponse {
            id: self.id,
            choices: vec![ChatChoice {
                index: 0,
                message,
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        }
    }
}

/// Chat-completion client against the AI gateway.
pub struct ChatClient {
    http: HttpClient,
    endpoint: String,
    api_key: String,
    identity: Arc<DeviceIdentity>,
}

impl ChatClient {
    pub fn new(endpoint: &str, api_key: &str, identity: Arc<DeviceIdentity>) -> Self {
        Self {
            http: HttpClient::with_max_body(256 * 1024),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            identity,
        }
    }

    fn build_request(&self, request: &ChatRequest) -> SdkResult<HttpRequest> {
        let body = serde_json::to_string(request)?;
        let url = format!("{}{CHAT_COMPLETIONS_PATH}", self.endpoint);
        let mut req = HttpRequest::post(&url)
            .json_body(&body)
            .bearer_token(&self.api_key);
        if let Some(secret) = self.identity.device_secret() {
            let params = SignedRequestParams::generate();
            for (key, value) in signer::aigw_auth_headers(&self.identity, &params, secret) {
                req = req.header(key, &value);
            }
        }
        Ok(req)
    }

    /// Blocking completion: the full response body is buffered.
    pub async fn send(&self, request: &ChatRequest) -> SdkResult<ChatResponse> {
        let mut request = request.clone();
        request.stream = false;
        let req = self.build_request(&request)?;
        let response = self.http.send(&req).await.map_err(SdkError::Http)?;
        if !response.is_success() {
            return Err(SdkError::Http(HttpError::Status(
                response.status,
                response.body_string(),
            )));
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// Streamed completion: `on_delta` sees each content fragment as it
    /// arrives; the assembled response is returned at end of stream.
    pub async fn send_stream<F>(
        &self,
        request: &ChatRequest,
        mut on_delta: F,
    ) -> SdkResult<ChatResponse>
    where
        F: FnMut(&str),
    {
        let mut request = request.clone();
        request.stream = true;
        let mut req = self.build_request(&request)?;
        req = req.header("Accept", "text/event-stream");

        let mut assembler = StreamAssembler::default();
        let mut stream_error: Option<SdkError> = None;
        self.http
            .send_sse(&req, |frame| {
                if assembler.done || stream_error.is_some() {
                    return;
                }
                match assembler.push(&frame.data) {
                    Ok(Some(delta)) => on_delta(&delta),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("bad chat stream chunk: {e}");
                        stream_error = Some(e);
                    }
                }
            })
            .await
            .map_err(SdkError::Http)?;
        if let Some(e) = stream_error {
            return Err(e);
        }
        debug!(done = assembler.done, "chat stream finished");
        Ok(assembler.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthMode;
    use serde_json::json;

    fn identity() -> Arc<DeviceIdentity> {
        Arc::new(DeviceIdentity {
            instance_id: "i".to_string(),
            product_key: "pk".to_string(),
            product_secret: None,
            device_name: "dn".to_string(),
            device_secret: Some("ds".to_string()),
            auth_mode: AuthMode::DeviceSecret,
        })
    }

    #[test]
    fn test_request_serialisation_omits_unset_fields() {
        let request = ChatRequest::new("doubao-pro", vec![ChatMessage::user("hi")]);
        let body: Value = serde_json::to_value(&request).unwrap();
        assert_eq!(body["model"], "doubao-pro");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert!(body.get("tools").is_none());
        assert!(body.get("temperature").is_none());
        assert!(body["messages"][0].get("tool_calls").is_none());
    }

    #[test]
    fn test_tool_spec_serialisation() {
        let tool = ChatTool::function(
            "get_weather",
            "Look up current weather",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        );
        let body: Value = serde_json::to_value(&tool).unwrap();
        assert_eq!(body["type"], "function");
        assert_eq!(body["function"]["name"], "get_weather");
        assert_eq!(body["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_build_request_carries_auth_headers() {
        let client = ChatClient::new("https://gw.example.com/", "sk-key", identity());
        let req = client
            .build_request(&ChatRequest::new("m", vec![ChatMessage::user("x")]))
            .unwrap();
        assert_eq!(req.url, "https://gw.example.com/v1/chat/completions");
        assert_eq!(req.bearer_token.as_deref(), Some("sk-key"));
        assert!(req.headers.iter().any(|(k, _)| k == "X-Signature"));
        assert!(req.headers.iter().any(|(k, _)| k == "X-Hardware-Id"));
        assert_eq!(req.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn test_stream_assembly_content_deltas() {
        let mut assembler = StreamAssembler::default();
        let mut deltas = Vec::new();
        for data in [
            r#"{"id":"c1","choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#,
            r#"{"id":"c1","choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"id":"c1","choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ] {
            if let Some(delta) = assembler.push(data).unwrap() {
                deltas.push(delta);
            }
        }
        assert!(assembler.done);
        let response = assembler.finish();
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(response.id, "c1");
        assert_eq!(response.content(), Some("Hello"));
        assert_eq!(
            response.choices[0].finish_reason.as_deref(),
            Some("stop")
        );
    }

    #[test]
    fn test_stream_assembly_tool_call_arguments() {
        let mut assembler = StreamAssembler::default();
        for data in [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_weather","arguments":"{\"ci"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ty\":\"sh\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ] {
            assembler.push(data).unwrap();
        }
        let response = assembler.finish();
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, r#"{"city":"sh"}"#);
    }

    #[test]
    fn test_stream_rejects_garbage_chunk() {
        let mut assembler = StreamAssembler::default();
        assert!(assembler.push("not json").is_err());
    }

    #[test]
    fn test_response_parse_with_usage() {
        let body = r#"{
            "id": "cmpl-1",
            "choices": [{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        }"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.content(), Some("hi"));
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }
}
