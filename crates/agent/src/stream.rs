//! The loop's output stream and its combinators.
//!
//! An agent invocation produces a single lazily-consumed sequence of
//! [`StreamItem`]s — a tagged union of model responses (complete or
//! partial) and [`ReActEvent`]s. The combinators here let a consumer
//! select a slice of that sequence without re-implementing the tagging
//! logic, and without altering emission order.
//!
//! Everything is pull-based: the producing loop writes into a bounded
//! channel, so a consumer that stops polling suspends the loop at its
//! next send instead of letting it run ahead unbounded.

use crate::events::{ReActEvent, ReActEventType};
use futures::future::ready;
use futures::{Stream, StreamExt};
use reagent_core::message::Message;
use reagent_core::provider::{ProviderResponse, StreamChunk};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

/// A model output carried on a response item: either a complete response
/// or one partial chunk of a streamed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePayload {
    Complete(ProviderResponse),
    Chunk(StreamChunk),
}

impl ResponsePayload {
    /// The text carried by this payload, if any.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Complete(response) => Some(response.message.content.as_str()),
            Self::Chunk(chunk) => chunk.content.as_deref(),
        }
    }
}

/// The sole output vocabulary of the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamItem {
    /// A model output plus a snapshot of the conversation history at
    /// emission time. Snapshots are never mutated after being handed out.
    Response {
        response: ResponsePayload,
        messages: Vec<Message>,
    },

    /// A phase-transition event.
    Event { event: ReActEvent },
}

impl StreamItem {
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    pub fn is_event(&self) -> bool {
        matches!(self, Self::Event { .. })
    }

    /// The event carried by this item, if it is one.
    pub fn as_event(&self) -> Option<&ReActEvent> {
        match self {
            Self::Event { event } => Some(event),
            Self::Response { .. } => None,
        }
    }
}

/// The live output stream of one agent invocation.
///
/// Backed by a bounded channel: the loop suspends when the consumer is
/// this many items behind, and stops at its next send once the stream is
/// dropped.
#[derive(Debug)]
pub struct ReactStream {
    inner: ReceiverStream<StreamItem>,
}

impl ReactStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamItem>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }
}

impl Stream for ReactStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Only the `(response, messages)` pairs, in emission order.
///
/// Single pass over the live stream; finite iff the source is finite.
pub fn responses_only<S>(stream: S) -> impl Stream<Item = (ResponsePayload, Vec<Message>)>
where
    S: Stream<Item = StreamItem>,
{
    stream.filter_map(|item| {
        ready(match item {
            StreamItem::Response { response, messages } => Some((response, messages)),
            StreamItem::Event { .. } => None,
        })
    })
}

/// Only the events, in emission order.
pub fn events_only<S>(stream: S) -> impl Stream<Item = ReActEvent>
where
    S: Stream<Item = StreamItem>,
{
    stream.filter_map(|item| {
        ready(match item {
            StreamItem::Event { event } => Some(event),
            StreamItem::Response { .. } => None,
        })
    })
}

/// Only the events whose tag is in `kinds`.
pub fn filter_events<S>(
    stream: S,
    kinds: HashSet<ReActEventType>,
) -> impl Stream<Item = ReActEvent>
where
    S: Stream<Item = StreamItem>,
{
    events_only(stream).filter(move |event| ready(kinds.contains(&event.event_type())))
}

/// The same items in the same order, invoking `observer` once per event
/// item before yielding it.
///
/// An observer failure is logged and never suppresses, reorders, or
/// duplicates an item.
pub fn with_observer<S, F>(stream: S, mut observer: F) -> impl Stream<Item = StreamItem>
where
    S: Stream<Item = StreamItem>,
    F: FnMut(&ReActEvent) -> reagent_core::Result<()>,
{
    stream.map(move |item| {
        if let StreamItem::Event { event } = &item
            && let Err(e) = observer(event)
        {
            warn!(event_type = event.event_type().as_str(), error = %e, "event observer failed");
        }
        item
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ReActEventKind;
    use futures::stream;

    fn event_item(kind: ReActEventKind) -> StreamItem {
        StreamItem::Event {
            event: ReActEvent::new("trace", "test", 0, kind),
        }
    }

    fn response_item(text: &str) -> StreamItem {
        StreamItem::Response {
            response: ResponsePayload::Chunk(StreamChunk {
                content: Some(text.into()),
                tool_calls: vec![],
                done: false,
                usage: None,
            }),
            messages: vec![],
        }
    }

    fn mixed_stream() -> Vec<StreamItem> {
        vec![
            event_item(ReActEventKind::ReactStart {
                user_task_prompt: "hi".into(),
                initial_messages: vec![],
                available_tools: None,
            }),
            response_item("one"),
            event_item(ReActEventKind::ReactIterationStart {
                current_messages: vec![],
            }),
            response_item("two"),
            event_item(ReActEventKind::ReactError {
                error_message: "boom".into(),
                error_kind: "network".into(),
            }),
        ]
    }

    #[tokio::test]
    async fn responses_only_drops_events_preserving_order() {
        let items = mixed_stream();
        let responses: Vec<_> = responses_only(stream::iter(items)).collect().await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].0.content(), Some("one"));
        assert_eq!(responses[1].0.content(), Some("two"));
    }

    #[tokio::test]
    async fn events_only_drops_responses() {
        let events: Vec<_> = events_only(stream::iter(mixed_stream())).collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type(), ReActEventType::ReactStart);
        assert_eq!(events[2].event_type(), ReActEventType::ReactError);
    }

    #[tokio::test]
    async fn filter_events_restricts_to_kinds() {
        let kinds = HashSet::from([ReActEventType::ReactError]);
        let events: Vec<_> = filter_events(stream::iter(mixed_stream()), kinds)
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), ReActEventType::ReactError);
    }

    #[tokio::test]
    async fn observer_sees_each_event_once_without_altering_items() {
        let mut seen = Vec::new();
        let items: Vec<_> = with_observer(stream::iter(mixed_stream()), |event| {
            seen.push(event.event_type());
            Ok(())
        })
        .collect()
        .await;

        assert_eq!(items.len(), 5);
        assert!(items[1].is_response());
        assert_eq!(
            seen,
            vec![
                ReActEventType::ReactStart,
                ReActEventType::ReactIterationStart,
                ReActEventType::ReactError,
            ]
        );
    }

    #[tokio::test]
    async fn observer_failure_does_not_suppress_items() {
        let items: Vec<_> = with_observer(stream::iter(mixed_stream()), |_| {
            Err(reagent_core::Error::Internal("observer broke".into()))
        })
        .collect()
        .await;
        assert_eq!(items.len(), 5);
    }

    #[tokio::test]
    async fn react_stream_yields_until_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let stream = ReactStream::new(rx);

        tx.send(response_item("a")).await.unwrap();
        drop(tx);

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
    }
}
