//! Scripted provider and recording registry for tests.

use crate::model::{Message, ModelError, StopReason, ToolCall, ToolChoice, ToolSpec, Usage};
use crate::provider::{EventStream, Provider, ProviderEvent, ProviderRequest, ToolCallChunk};
use crate::tools::{ToolError, ToolRegistry};
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// How a registered test tool responds.
#[derive(Debug, Clone)]
pub(crate) enum Behaviour {
    Reply(Value),
    /// Returns the `text` argument, or the arguments as JSON.
    Echo,
    Delayed(Duration, Value),
    Fail(String),
}

pub(crate) struct RecordingRegistry {
    specs: Vec<ToolSpec>,
    behaviour: HashMap<String, Behaviour>,
    calls: Mutex<Vec<ToolCall>>,
}

impl RecordingRegistry {
    pub(crate) fn new() -> Self {
        Self {
            specs: Vec::new(),
            behaviour: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_tool(mut self, name: &str, schema: Value, behaviour: Behaviour) -> Self {
        self.specs
            .push(ToolSpec::new(name, format!("The {name} tool."), schema));
        self.behaviour.insert(name.to_string(), behaviour);
        self
    }

    pub(crate) fn invocations(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ToolRegistry for RecordingRegistry {
    fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    async fn invoke(&self, call: &ToolCall) -> Result<Value, ToolError> {
        self.calls.lock().unwrap().push(call.clone());
        let behaviour = self.behaviour.get(&call.name).cloned();
        match behaviour {
            Some(Behaviour::Reply(value)) => Ok(value),
            Some(Behaviour::Echo) => Ok(call
                .arguments
                .get("text")
                .cloned()
                .unwrap_or_else(|| call.input())),
            Some(Behaviour::Delayed(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Some(Behaviour::Fail(message)) => Err(ToolError::execution(message)),
            None => Err(ToolError::UnknownTool {
                tool: call.name.clone(),
            }),
        }
    }
}

/// What the scripted provider saw.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tool_choice: ToolChoice,
    pub tool_count: usize,
    pub stream: bool,
    pub tool_instructions: Option<String>,
}

/// Provider that replays scripted responses.
///
/// Requests with tool choice `none` get `final_text` when set. Once the
/// script is exhausted, `repeat` (if any) is replayed forever.
pub(crate) struct ScriptedProvider {
    native: bool,
    script: Mutex<VecDeque<Result<Vec<ProviderEvent>, ModelError>>>,
    repeat: Option<Vec<ProviderEvent>>,
    final_text: Option<String>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new(native: bool) -> Self {
        Self {
            native,
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            final_text: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn then(self, events: Vec<ProviderEvent>) -> Self {
        self.script.lock().unwrap().push_back(Ok(events));
        self
    }

    pub(crate) fn then_fail(self, err: ModelError) -> Self {
        self.script.lock().unwrap().push_back(Err(err));
        self
    }

    pub(crate) fn repeating(mut self, events: Vec<ProviderEvent>) -> Self {
        self.repeat = Some(events);
        self
    }

    pub(crate) fn final_text(mut self, text: &str) -> Self {
        self.final_text = Some(text.to_string());
        self
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Provider for ScriptedProvider {
    fn supports_native_tool_calls(&self) -> bool {
        self.native
    }

    async fn send(&self, request: ProviderRequest<'_>) -> Result<EventStream, ModelError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: request.messages.to_vec(),
            tool_choice: request.tool_choice,
            tool_count: request.tools.len(),
            stream: request.stream,
            tool_instructions: request.tool_instructions.map(String::from),
        });

        let events = match (&self.final_text, request.tool_choice) {
            (Some(text), ToolChoice::None) => text_turn(text),
            _ => {
                let next = self.script.lock().unwrap().pop_front();
                match next {
                    Some(Ok(events)) => events,
                    Some(Err(err)) => return Err(err),
                    None => self
                        .repeat
                        .clone()
                        .unwrap_or_else(|| text_turn("done")),
                }
            }
        };
        Ok(futures_util::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

pub(crate) fn complete(stop: StopReason) -> ProviderEvent {
    ProviderEvent::Complete {
        stop,
        usage: Usage::default(),
    }
}

/// A plain text answer.
pub(crate) fn text_turn(text: &str) -> Vec<ProviderEvent> {
    vec![ProviderEvent::Text(text.to_string()), complete(StopReason::EndTurn)]
}

/// A native tool call, arguments split over two fragments.
pub(crate) fn tool_turn(id: &str, name: &str, arguments: Value) -> Vec<ProviderEvent> {
    let args = arguments.to_string();
    let (first, second) = args.split_at(args.len() / 2);
    vec![
        ProviderEvent::ToolCall(ToolCallChunk {
            index: 0,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            arguments: first.to_string(),
        }),
        ProviderEvent::ToolCall(ToolCallChunk {
            index: 0,
            id: None,
            name: None,
            arguments: second.to_string(),
        }),
        complete(StopReason::ToolUse),
    ]
}
