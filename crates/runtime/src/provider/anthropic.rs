//! Anthropic Messages API provider.

use super::{EventStream, Provider, ProviderEvent, ProviderRequest, ToolCallChunk};
use crate::model::{Message, ModelError, Role, StopReason, ToolChoice, ToolSpec, Usage};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ApiToolChoice>,
}

#[derive(Debug, Serialize)]
struct ApiToolChoice {
    #[serde(rename = "type")]
    choice_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ApiContentBlock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Anthropic provider.
#[derive(Debug, Clone)]
pub struct AnthropicProviderBuilder {
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
}

impl AnthropicProviderBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Override the endpoint (proxies, tests).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn build(self) -> AnthropicProvider {
        AnthropicProvider {
            client: reqwest::Client::new(),
            api_key: self.api_key,
            model: self.model,
            max_tokens: self.max_tokens,
            base_url: self.base_url,
        }
    }
}

/// Anthropic Messages API provider with native tool calling.
///
/// Requests are sent without server-side streaming; the response is
/// re-emitted as provider events.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
}

impl AnthropicProvider {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> AnthropicProviderBuilder {
        AnthropicProviderBuilder::new(api_key, model)
    }

    fn build_request(&self, request: &ProviderRequest<'_>) -> ApiRequest {
        let mut system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if let Some(instructions) = request.tool_instructions {
            system.push(instructions);
        }
        let system = (!system.is_empty()).then(|| system.join("\n\n"));

        let tools: Vec<ApiTool> = request.tools.iter().map(tool_to_api).collect();
        let tool_choice = match request.tool_choice {
            ToolChoice::None if !tools.is_empty() => Some(ApiToolChoice { choice_type: "none" }),
            _ => None,
        };

        ApiRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: messages_to_api(request.messages),
            system,
            tools,
            tool_choice,
        }
    }
}

impl std::fmt::Display for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anthropic({})", self.model)
    }
}

fn role_to_api(role: Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        Role::User | Role::System | Role::Tool => "user",
    }
}

fn message_to_blocks(msg: &Message) -> Vec<ApiContentBlock> {
    let mut blocks = Vec::new();
    if let Some(result) = &msg.tool_result {
        blocks.push(ApiContentBlock::ToolResult {
            tool_use_id: result.call_id.clone(),
            content: result.content.clone(),
            is_error: result.is_error(),
        });
        return blocks;
    }
    if !msg.content.is_empty() {
        blocks.push(ApiContentBlock::Text {
            text: msg.content.clone(),
        });
    }
    for call in &msg.tool_calls {
        blocks.push(ApiContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input(),
        });
    }
    blocks
}

// The API requires alternating roles, so consecutive user-side messages
// (tool results, summaries, notices) are merged.
fn messages_to_api(messages: &[Message]) -> Vec<ApiMessage> {
    let mut out: Vec<ApiMessage> = Vec::new();
    for msg in messages.iter().filter(|m| m.role != Role::System) {
        let blocks = message_to_blocks(msg);
        if blocks.is_empty() {
            continue;
        }
        let role = role_to_api(msg.role);
        match out.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => out.push(ApiMessage {
                role,
                content: blocks,
            }),
        }
    }
    out
}

fn tool_to_api(spec: &ToolSpec) -> ApiTool {
    ApiTool {
        name: spec.name.clone(),
        description: spec.description.clone(),
        input_schema: spec.schema.clone(),
    }
}

fn stop_from_api(reason: Option<&str>) -> StopReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => StopReason::Other(other.to_string()),
    }
}

fn response_to_events(response: ApiResponse) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    let mut index = 0;
    for block in response.content {
        match block {
            ApiResponseBlock::Text { text } => events.push(ProviderEvent::Text(text)),
            ApiResponseBlock::ToolUse { id, name, input } => {
                events.push(ProviderEvent::ToolCall(ToolCallChunk {
                    index,
                    id: Some(id),
                    name: Some(name),
                    arguments: input.to_string(),
                }));
                index += 1;
            }
            ApiResponseBlock::Unknown => {}
        }
    }
    events.push(ProviderEvent::Complete {
        stop: stop_from_api(response.stop_reason.as_deref()),
        usage: Usage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        },
    });
    events
}

fn error_from_status(status: u16, body: &str) -> ModelError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string());
    if status == 429 {
        ModelError::RateLimited(message)
    } else {
        ModelError::Api { status, message }
    }
}

impl Provider for AnthropicProvider {
    fn supports_native_tool_calls(&self) -> bool {
        true
    }

    async fn send(&self, request: ProviderRequest<'_>) -> Result<EventStream, ModelError> {
        let api_request = self.build_request(&request);
        debug!(
            model = %self.model,
            messages = api_request.messages.len(),
            tools = api_request.tools.len(),
            "sending anthropic request"
        );

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_status(status.as_u16(), &body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        let events = response_to_events(api_response).into_iter().map(Ok);
        Ok(futures_util::stream::iter(events).boxed())
    }
}
