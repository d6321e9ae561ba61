//! Shared test helpers for loop tests.

use reagent_core::error::{ProviderError, ToolError};
use reagent_core::message::{Message, MessageToolCall};
use reagent_core::provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
use reagent_core::tool::{Tool, ToolExecution, ToolRegistry};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next response in the queue.
/// Panics if more calls are made than responses provided, unless built
/// with [`SequentialMockProvider::looping`].
pub(crate) struct SequentialMockProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    looping: bool,
    call_count: Mutex<usize>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            looping: false,
            call_count: Mutex::new(0),
        }
    }

    /// Create a provider that returns a single text response (no tool calls).
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    /// Create a provider that first returns tool calls, then a final answer.
    pub fn tool_then_answer(
        tool_calls: Vec<MessageToolCall>,
        thought: &str,
        answer: &str,
    ) -> Self {
        Self::new(vec![
            make_tool_call_response(tool_calls, thought),
            make_text_response(answer),
        ])
    }

    /// Create a provider that returns the same response forever.
    pub fn looping(response: ProviderResponse) -> Self {
        Self {
            responses: Mutex::new(vec![response]),
            looping: true,
            call_count: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut count = self.call_count.lock().unwrap();
        let responses = self.responses.lock().unwrap();

        let index = if self.looping {
            0
        } else if *count >= responses.len() {
            panic!(
                "SequentialMockProvider: no more responses (call #{}, have {})",
                *count,
                responses.len()
            );
        } else {
            *count
        };

        let response = responses[index].clone();
        *count += 1;
        Ok(response)
    }
}

/// A mock provider that streams scripted chunk sequences.
///
/// Each call to `stream` consumes the next script in the queue.
pub(crate) struct ChunkedMockProvider {
    scripts: Mutex<Vec<Vec<StreamChunk>>>,
}

impl ChunkedMockProvider {
    pub fn new(scripts: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
        }
    }
}

#[async_trait::async_trait]
impl Provider for ChunkedMockProvider {
    fn name(&self) -> &str {
        "chunked_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured(
            "chunked_mock only streams".into(),
        ))
    }

    async fn stream(
        &self,
        _request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError>
    {
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                panic!("ChunkedMockProvider: no more scripts");
            }
            scripts.remove(0)
        };

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in script {
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// A mock provider whose every call fails with the given error.
pub(crate) struct FailingProvider {
    pub error: ProviderError,
}

#[async_trait::async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "failing_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(self.error.clone())
    }
}

/// A mock provider that blocks until released, for observing in-flight
/// state (key pool loads) and driving timeouts.
pub(crate) struct GatedProvider {
    pub started: Arc<Notify>,
    pub gate: Arc<Notify>,
    pub response: ProviderResponse,
}

impl GatedProvider {
    pub fn new(text: &str) -> Self {
        Self {
            started: Arc::new(Notify::new()),
            gate: Arc::new(Notify::new()),
            response: make_text_response(text),
        }
    }
}

#[async_trait::async_trait]
impl Provider for GatedProvider {
    fn name(&self) -> &str {
        "gated_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(self.response.clone())
    }
}

/// Echoes its `text` argument back.
pub(crate) struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes back the input"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolExecution, ToolError> {
        Ok(ToolExecution {
            call_id: String::new(),
            success: true,
            output: arguments["text"].as_str().unwrap_or("").to_string(),
        })
    }
}

/// Always fails with an execution error.
pub(crate) struct FailingTool;

#[async_trait::async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolExecution, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "fail".into(),
            reason: "scripted failure".into(),
        })
    }
}

/// Build a registry from the given tools.
pub(crate) fn registry_with(tools: Vec<Box<dyn Tool>>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    Arc::new(registry)
}

/// Create a simple text response (no tool calls).
pub(crate) fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

/// Create a response with tool calls and optional thought content.
pub(crate) fn make_tool_call_response(
    tool_calls: Vec<MessageToolCall>,
    thought: &str,
) -> ProviderResponse {
    let mut msg = Message::assistant(thought);
    msg.tool_calls = tool_calls;
    ProviderResponse {
        message: msg,
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

/// Helper to create a tool call.
pub(crate) fn make_tool_call(name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: format!("call_{}", name),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}
