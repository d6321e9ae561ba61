//! ReAct loop events.
//!
//! Every phase transition of one agent invocation is recorded as a
//! [`ReActEvent`]: a common envelope (timestamp, trace id, task name,
//! iteration, open `extra` map) around a closed [`ReActEventKind`] union.
//! External observers — UIs, metrics, loggers — can reconstruct exact
//! timing and content from the stream without re-deriving it from side
//! effects.
//!
//! Ordering: events from one trace id are emitted in true chronological
//! order. Within a tool-call batch, start events follow request order but
//! end/error events follow completion order — correlate by `tool_call_id`,
//! not position.

use chrono::{DateTime, Utc};
use reagent_core::error::{ProviderError, ToolError};
use reagent_core::message::{Message, MessageToolCall};
use reagent_core::provider::{CallOptions, ProviderResponse, StreamChunk, ToolDefinition, Usage};
use serde::{Deserialize, Serialize};

/// Tag identifying each event variant, usable as a filter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReActEventType {
    ReactStart,
    ReactIterationStart,
    LlmCallStart,
    LlmChunkArrive,
    LlmCallEnd,
    LlmCallError,
    ToolCallsBatchStart,
    ToolCallStart,
    ToolCallEnd,
    ToolCallError,
    ToolCallsBatchEnd,
    ReactIterationEnd,
    ReactEnd,
    ReactError,
}

impl ReActEventType {
    /// Wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReactStart => "react_start",
            Self::ReactIterationStart => "react_iteration_start",
            Self::LlmCallStart => "llm_call_start",
            Self::LlmChunkArrive => "llm_chunk_arrive",
            Self::LlmCallEnd => "llm_call_end",
            Self::LlmCallError => "llm_call_error",
            Self::ToolCallsBatchStart => "tool_calls_batch_start",
            Self::ToolCallStart => "tool_call_start",
            Self::ToolCallEnd => "tool_call_end",
            Self::ToolCallError => "tool_call_error",
            Self::ToolCallsBatchEnd => "tool_calls_batch_end",
            Self::ReactIterationEnd => "react_iteration_end",
            Self::ReactEnd => "react_end",
            Self::ReactError => "react_error",
        }
    }
}

/// Why a loop reached its `ReactEnd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced a response with no tool calls.
    Completed,
    /// The configured iteration budget ran out while the model was still
    /// requesting tools.
    IterationBudgetExhausted,
}

/// One resolved tool call, as summarized on `tool_calls_batch_end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub tool_call_id: String,

    /// The tool's output; absent when the invocation itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Wall-clock seconds spent in the tool.
    pub execution_time: f64,

    pub success: bool,
}

/// An immutable record of one phase transition in one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReActEvent {
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,

    /// Unique id of the top-level invocation that produced this event.
    pub trace_id: String,

    /// The task name the invocation runs under.
    pub func_name: String,

    /// 0-based index of the loop pass that produced this event.
    pub iteration: usize,

    /// Open key-value bag for forward-compatible metadata.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,

    /// The variant-specific payload.
    #[serde(flatten)]
    pub kind: ReActEventKind,
}

impl ReActEvent {
    /// Stamp a new event with the invocation envelope and the current time.
    pub fn new(
        trace_id: impl Into<String>,
        func_name: impl Into<String>,
        iteration: usize,
        kind: ReActEventKind,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            trace_id: trace_id.into(),
            func_name: func_name.into(),
            iteration,
            extra: serde_json::Map::new(),
            kind,
        }
    }

    /// The variant tag of this event.
    pub fn event_type(&self) -> ReActEventType {
        self.kind.event_type()
    }
}

/// The closed set of event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ReActEventKind {
    /// The invocation began. Always the first event of a trace.
    ReactStart {
        user_task_prompt: String,
        initial_messages: Vec<Message>,
        available_tools: Option<Vec<ToolDefinition>>,
    },

    /// A loop pass began.
    ReactIterationStart { current_messages: Vec<Message> },

    /// A model call is about to be dispatched.
    LlmCallStart {
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
        options: CallOptions,
        stream: bool,
    },

    /// One partial chunk of a streamed model call arrived.
    ///
    /// `chunk_index` increases by exactly 1 from 0 within one call;
    /// `accumulated_content` is the concatenation of every content delta
    /// received so far, this chunk included.
    LlmChunkArrive {
        chunk: StreamChunk,
        accumulated_content: String,
        chunk_index: usize,
    },

    /// A model call completed.
    LlmCallEnd {
        response: ProviderResponse,
        messages: Vec<Message>,
        tool_calls: Vec<MessageToolCall>,
        usage: Option<Usage>,
        /// Wall-clock seconds for the whole call.
        execution_time: f64,
    },

    /// A model call failed; the invocation terminates after this.
    LlmCallError {
        /// The typed provider error. In-memory only; the wire carries
        /// `error_message` and `error_kind`.
        #[serde(skip)]
        error: Option<ProviderError>,
        error_message: String,
        error_kind: String,
        messages: Vec<Message>,
        options: CallOptions,
    },

    /// A batch of requested tool calls is about to execute.
    ToolCallsBatchStart {
        tool_calls: Vec<MessageToolCall>,
        batch_size: usize,
    },

    /// One tool call is about to be dispatched. Emitted in request order.
    ToolCallStart {
        tool_name: String,
        tool_call_id: String,
        arguments: serde_json::Value,
        tool_call: MessageToolCall,
    },

    /// One tool call completed. Emitted in completion order.
    ToolCallEnd {
        tool_name: String,
        tool_call_id: String,
        arguments: serde_json::Value,
        result: String,
        execution_time: f64,
        success: bool,
    },

    /// One tool call failed. The batch continues; siblings are unaffected.
    ToolCallError {
        tool_name: String,
        tool_call_id: String,
        arguments: serde_json::Value,
        #[serde(skip)]
        error: Option<ToolError>,
        error_message: String,
        error_kind: String,
        execution_time: f64,
    },

    /// Every call in the batch has resolved.
    /// `success_count + error_count == batch_size` always.
    ToolCallsBatchEnd {
        tool_results: Vec<ToolCallResult>,
        batch_size: usize,
        total_execution_time: f64,
        success_count: usize,
        error_count: usize,
    },

    /// A loop pass finished.
    ReactIterationEnd {
        messages: Vec<Message>,
        iteration_time: f64,
        tool_calls_count: usize,
    },

    /// The invocation finished. Terminal on the success path.
    ReactEnd {
        final_response: Option<String>,
        final_messages: Vec<Message>,
        total_iterations: usize,
        total_execution_time: f64,
        /// Sum of every batch's size across all iterations.
        total_tool_calls: usize,
        /// Number of model calls that reached an end or error event.
        total_llm_calls: usize,
        total_token_usage: Option<Usage>,
        stop_reason: StopReason,
    },

    /// The invocation failed. Terminal on the failure path; a stream ends
    /// with exactly one of `ReactEnd` | `ReactError`.
    ReactError {
        error_message: String,
        error_kind: String,
    },
}

impl ReActEventKind {
    /// The tag of this payload.
    pub fn event_type(&self) -> ReActEventType {
        match self {
            Self::ReactStart { .. } => ReActEventType::ReactStart,
            Self::ReactIterationStart { .. } => ReActEventType::ReactIterationStart,
            Self::LlmCallStart { .. } => ReActEventType::LlmCallStart,
            Self::LlmChunkArrive { .. } => ReActEventType::LlmChunkArrive,
            Self::LlmCallEnd { .. } => ReActEventType::LlmCallEnd,
            Self::LlmCallError { .. } => ReActEventType::LlmCallError,
            Self::ToolCallsBatchStart { .. } => ReActEventType::ToolCallsBatchStart,
            Self::ToolCallStart { .. } => ReActEventType::ToolCallStart,
            Self::ToolCallEnd { .. } => ReActEventType::ToolCallEnd,
            Self::ToolCallError { .. } => ReActEventType::ToolCallError,
            Self::ToolCallsBatchEnd { .. } => ReActEventType::ToolCallsBatchEnd,
            Self::ReactIterationEnd { .. } => ReActEventType::ReactIterationEnd,
            Self::ReactEnd { .. } => ReActEventType::ReactEnd,
            Self::ReactError { .. } => ReActEventType::ReactError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(kind: ReActEventKind) -> ReActEvent {
        ReActEvent::new("trace-123", "test_task", 0, kind)
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(ReActEventType::ReactStart.as_str(), "react_start");
        assert_eq!(ReActEventType::LlmChunkArrive.as_str(), "llm_chunk_arrive");
        assert_eq!(
            ReActEventType::ToolCallsBatchEnd.as_str(),
            "tool_calls_batch_end"
        );
        assert_eq!(ReActEventType::ReactError.as_str(), "react_error");
    }

    #[test]
    fn envelope_fields_stamped() {
        let event = envelope(ReActEventKind::ReactIterationStart {
            current_messages: vec![Message::user("Hello")],
        });
        assert_eq!(event.trace_id, "trace-123");
        assert_eq!(event.func_name, "test_task");
        assert_eq!(event.iteration, 0);
        assert!(event.extra.is_empty());
        assert_eq!(event.event_type(), ReActEventType::ReactIterationStart);
    }

    #[test]
    fn react_start_serialization() {
        let event = envelope(ReActEventKind::ReactStart {
            user_task_prompt: "Hello".into(),
            initial_messages: vec![Message::user("Hello")],
            available_tools: None,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event_type":"react_start""#));
        assert!(json.contains(r#""trace_id":"trace-123""#));
        assert!(json.contains(r#""user_task_prompt":"Hello""#));
    }

    #[test]
    fn llm_call_error_skips_typed_error_on_wire() {
        let event = envelope(ReActEventKind::LlmCallError {
            error: Some(ProviderError::Network("connection reset".into())),
            error_message: "Network error: connection reset".into(),
            error_kind: "network".into(),
            messages: vec![],
            options: CallOptions {
                model: "gpt-4o".into(),
                temperature: 0.7,
                max_tokens: None,
            },
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""error_kind":"network""#));
        assert!(!json.contains("Network(")); // typed error stays in memory

        let parsed: ReActEvent = serde_json::from_str(&json).unwrap();
        match parsed.kind {
            ReActEventKind::LlmCallError { error, error_kind, .. } => {
                assert!(error.is_none());
                assert_eq!(error_kind, "network");
            }
            other => panic!("wrong variant: {:?}", other.event_type()),
        }
    }

    #[test]
    fn batch_end_counts() {
        let results = vec![
            ToolCallResult {
                tool_name: "echo".into(),
                tool_call_id: "call_1".into(),
                result: Some("ok".into()),
                execution_time: 0.5,
                success: true,
            },
            ToolCallResult {
                tool_name: "fail".into(),
                tool_call_id: "call_2".into(),
                result: None,
                execution_time: 0.2,
                success: false,
            },
        ];
        let event = envelope(ReActEventKind::ToolCallsBatchEnd {
            batch_size: results.len(),
            success_count: results.iter().filter(|r| r.success).count(),
            error_count: results.iter().filter(|r| !r.success).count(),
            total_execution_time: 0.7,
            tool_results: results,
        });
        match &event.kind {
            ReActEventKind::ToolCallsBatchEnd {
                batch_size,
                success_count,
                error_count,
                ..
            } => {
                assert_eq!(success_count + error_count, *batch_size);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn react_end_roundtrip() {
        let event = envelope(ReActEventKind::ReactEnd {
            final_response: Some("Done".into()),
            final_messages: vec![Message::assistant("Done")],
            total_iterations: 2,
            total_execution_time: 5.0,
            total_tool_calls: 3,
            total_llm_calls: 2,
            total_token_usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            }),
            stop_reason: StopReason::Completed,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""stop_reason":"completed""#));

        let parsed: ReActEvent = serde_json::from_str(&json).unwrap();
        match parsed.kind {
            ReActEventKind::ReactEnd {
                total_iterations,
                total_token_usage,
                stop_reason,
                ..
            } => {
                assert_eq!(total_iterations, 2);
                assert_eq!(total_token_usage.unwrap().total_tokens, 30);
                assert_eq!(stop_reason, StopReason::Completed);
            }
            other => panic!("wrong variant: {:?}", other.event_type()),
        }
    }

    #[test]
    fn extra_bag_survives_roundtrip() {
        let mut event = envelope(ReActEventKind::ReactIterationStart {
            current_messages: vec![],
        });
        event
            .extra
            .insert("custom_field".into(), serde_json::json!("custom_value"));

        let json = serde_json::to_string(&event).unwrap();
        let parsed: ReActEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.extra["custom_field"], "custom_value");
    }
}
