//! The event-sourced agent loop — the heart of Reagent.
//!
//! The agent follows the **ReAct** cycle:
//!
//! 1. **Receive** a user prompt and prior history
//! 2. **Send to LLM** via the model-call collaborator, under a key lease
//! 3. **If tool calls**: execute them concurrently as one batch, append
//!    results to history, loop back to step 2
//! 4. **If text response**: finish
//!
//! Every phase transition is emitted as a typed [`ReActEvent`] on the
//! invocation's output stream, interleaved with response items; the
//! [`stream`] combinators let consumers take only final responses, only
//! events, or a filtered view, or tap the stream with an observer.
//!
//! The loop continues until the LLM responds with no tool calls, the
//! iteration limit is reached, or the loop times out.

pub mod events;
pub mod loop_runner;
pub mod stream;

pub use events::{ReActEvent, ReActEventKind, ReActEventType, StopReason, ToolCallResult};
pub use loop_runner::{AgentLoop, InvocationContext};
pub use stream::{
    ReactStream, ResponsePayload, StreamItem, events_only, filter_events, responses_only,
    with_observer,
};

#[cfg(test)]
pub(crate) mod test_helpers;
