//! The event-sourced ReAct loop engine.
//!
//! One invocation drives a linear state machine with a single back-edge:
//!
//! `START → ITERATION_START → LLM_CALL → (TOOL_BATCH)? → ITERATION_END →`
//! back to `ITERATION_START`, or `→ END`.
//!
//! Every transition is emitted as a [`ReActEvent`] on the invocation's
//! output stream, interleaved with response items. The loop owns its
//! conversation exclusively; each outbound model call reserves the
//! least-loaded credential of the configured provider group for its
//! duration.
//!
//! Failure policy: a model-call failure terminates the invocation
//! (`LlmCallError` then the terminal `ReactError`); a single tool-call
//! failure is contained — recorded, reported to the model as a tool
//! message, and the batch continues.

use crate::events::{ReActEvent, ReActEventKind, StopReason, ToolCallResult};
use crate::stream::{ReactStream, ResponsePayload, StreamItem};
use chrono::{DateTime, Utc};
use reagent_core::error::{PoolError, ProviderError};
use reagent_core::message::{Conversation, Message, MessageToolCall};
use reagent_core::provider::{
    CallOptions, Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage,
};
use reagent_core::tool::{ToolCall, ToolRegistry};
use reagent_keypool::{KeyLease, KeyPool, KeyPoolRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backpressure window between the loop and its consumer.
const STREAM_BUFFER: usize = 128;

/// Identity of one top-level invocation, stamped on every event.
#[derive(Debug)]
pub struct InvocationContext {
    /// Unique per invocation.
    pub trace_id: String,

    /// The task name the invocation runs under.
    pub func_name: String,

    /// Wall-clock start of the invocation.
    pub started_at: DateTime<Utc>,

    /// 0-based loop pass, monotonically increasing within the invocation.
    iteration: AtomicUsize,
}

impl InvocationContext {
    fn new(func_name: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            func_name: func_name.into(),
            started_at: Utc::now(),
            iteration: AtomicUsize::new(0),
        }
    }

    /// The current iteration number.
    pub fn iteration(&self) -> usize {
        self.iteration.load(Ordering::Relaxed)
    }

    fn advance_iteration(&self) {
        self.iteration.fetch_add(1, Ordering::Relaxed);
    }
}

/// A provider group whose credentials serve this loop's model calls.
#[derive(Debug, Clone)]
struct ProviderGroup {
    id: String,
    keys: Vec<String>,
}

/// The agent loop engine.
///
/// Construct with the two collaborators and a key-pool registry, adjust
/// via the `with_*` builders, then [`run`](AgentLoop::run) as many
/// invocations as needed — each runs independently; the registry's pools
/// are the only state they share.
pub struct AgentLoop {
    /// The model-call collaborator.
    provider: Arc<dyn Provider>,

    /// The model to use.
    model: String,

    /// Temperature setting.
    temperature: f32,

    /// Default max tokens per response.
    max_tokens: Option<u32>,

    /// The tool-invocation collaborator.
    tools: Arc<ToolRegistry>,

    /// Key pools, shared with the host application.
    pools: Arc<KeyPoolRegistry>,

    /// Credential group serving this loop's calls, if configured.
    provider_group: Option<ProviderGroup>,

    /// Task name stamped on events as `func_name`.
    task_name: String,

    /// Maximum loop passes per invocation.
    max_iterations: u32,

    /// Whole-loop wall-clock budget.
    timeout: Option<Duration>,

    /// Whether model calls stream.
    stream_llm: bool,
}

impl AgentLoop {
    /// Create a new agent loop.
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        pools: Arc<KeyPoolRegistry>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            tools,
            pools,
            provider_group: None,
            task_name: "react".into(),
            max_iterations: 10,
            timeout: None,
            stream_llm: false,
        }
    }

    /// Build a loop from host configuration, wiring the default provider
    /// group's credentials into the key pool registry.
    pub fn from_config(
        config: &reagent_config::AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        pools: Arc<KeyPoolRegistry>,
    ) -> Self {
        let mut agent = Self::new(provider, config.default_model.clone(), tools, pools)
            .with_temperature(config.default_temperature)
            .with_max_tokens(config.default_max_tokens)
            .with_max_iterations(config.loop_settings.max_iterations)
            .with_streaming(config.loop_settings.stream);
        if let Some(secs) = config.loop_settings.timeout_secs {
            agent = agent.with_timeout(Duration::from_secs(secs));
        }
        if let Some(keys) = config.keys_for(&config.default_provider) {
            agent = agent.with_provider_group(config.default_provider.clone(), keys.to_vec());
        }
        agent
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the default max tokens per LLM response.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the maximum number of loop passes (minimum 1).
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set a whole-loop wall-clock budget. On expiry, outstanding tool
    /// calls are cancelled and the stream ends with a `ReactError`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stream model calls, emitting one chunk event and response item per
    /// partial received.
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream_llm = stream;
        self
    }

    /// Serve model calls from the given credential group. The pool is
    /// created in the registry on the first run and reused thereafter.
    pub fn with_provider_group(
        mut self,
        group_id: impl Into<String>,
        keys: Vec<String>,
    ) -> Self {
        self.provider_group = Some(ProviderGroup {
            id: group_id.into(),
            keys,
        });
        self
    }

    /// Set the task name stamped on events as `func_name`.
    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = name.into();
        self
    }

    /// Start one invocation: `user_prompt` is appended to `history` and
    /// the loop runs until the model stops requesting tools or a budget
    /// is hit.
    ///
    /// Returns the invocation's output stream immediately. Dropping the
    /// stream stops the loop at its next suspension point; tool calls
    /// already dispatched run to completion.
    pub fn run(
        &self,
        user_prompt: impl Into<String>,
        history: Vec<Message>,
    ) -> reagent_core::Result<ReactStream> {
        let user_prompt = user_prompt.into();

        let pool = match &self.provider_group {
            Some(group) => Some(self.pools.acquire(&group.id, &group.keys)?),
            None => None,
        };

        let mut conversation = Conversation::from_messages(history);
        conversation.push(Message::user(user_prompt.clone()));

        let ctx = Arc::new(InvocationContext::new(&self.task_name));
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let run = LoopRun {
            provider: self.provider.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: self.tools.clone(),
            pool,
            stream_llm: self.stream_llm,
            max_iterations: self.max_iterations,
            ctx: ctx.clone(),
            conversation,
            user_prompt,
            tx: tx.clone(),
            totals: Totals::default(),
            last_content: None,
        };

        let timeout = self.timeout;
        tokio::spawn(async move {
            match timeout {
                Some(limit) => {
                    if tokio::time::timeout(limit, run.drive()).await.is_err() {
                        warn!(
                            trace_id = %ctx.trace_id,
                            limit_secs = limit.as_secs_f64(),
                            "agent loop timed out; cancelling outstanding calls"
                        );
                        let error = reagent_core::Error::LoopBudgetExceeded {
                            detail: format!(
                                "loop timed out after {:.1}s",
                                limit.as_secs_f64()
                            ),
                        };
                        let event = ReActEvent::new(
                            &ctx.trace_id,
                            &ctx.func_name,
                            ctx.iteration(),
                            ReActEventKind::ReactError {
                                error_message: error.to_string(),
                                error_kind: "loop_budget_exceeded".into(),
                            },
                        );
                        let _ = tx.send(StreamItem::Event { event }).await;
                    }
                }
                None => {
                    let _ = run.drive().await;
                }
            }
        });

        Ok(ReactStream::new(rx))
    }
}

/// Running totals for the final `ReactEnd` aggregation.
#[derive(Debug, Default)]
struct Totals {
    llm_calls: usize,
    tool_calls: usize,
    usage: Option<Usage>,
}

/// The consumer dropped the stream; stop issuing calls.
struct StreamClosed;

type EmitResult<T> = Result<T, StreamClosed>;

/// The assembled outcome of one successful model call.
type ModelTurn = (ProviderResponse, Message, Vec<MessageToolCall>, Option<Usage>);

/// One invocation's owned state, driven on a spawned task.
struct LoopRun {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    tools: Arc<ToolRegistry>,
    pool: Option<Arc<KeyPool>>,
    stream_llm: bool,
    max_iterations: u32,
    ctx: Arc<InvocationContext>,
    conversation: Conversation,
    user_prompt: String,
    tx: mpsc::Sender<StreamItem>,
    totals: Totals,
    last_content: Option<String>,
}

impl LoopRun {
    async fn drive(mut self) -> EmitResult<()> {
        let run_started = Instant::now();
        info!(
            trace_id = %self.ctx.trace_id,
            model = %self.model,
            max_iterations = self.max_iterations,
            "ReAct loop starting"
        );

        let tool_defs = self.tools.definitions();
        self.emit(ReActEventKind::ReactStart {
            user_task_prompt: self.user_prompt.clone(),
            initial_messages: self.conversation.snapshot(),
            available_tools: if tool_defs.is_empty() {
                None
            } else {
                Some(tool_defs.clone())
            },
        })
        .await?;

        loop {
            let iteration_started = Instant::now();
            debug!(
                trace_id = %self.ctx.trace_id,
                iteration = self.ctx.iteration(),
                "ReAct iteration"
            );
            self.emit(ReActEventKind::ReactIterationStart {
                current_messages: self.conversation.snapshot(),
            })
            .await?;

            let Some(tool_calls) = self.call_model(&tool_defs).await? else {
                // Model call failed; the failure events are already out.
                return Ok(());
            };

            let batch_size = tool_calls.len();
            if batch_size > 0 {
                self.run_tool_batch(tool_calls).await?;
            }

            self.emit(ReActEventKind::ReactIterationEnd {
                messages: self.conversation.snapshot(),
                iteration_time: iteration_started.elapsed().as_secs_f64(),
                tool_calls_count: batch_size,
            })
            .await?;
            self.ctx.advance_iteration();

            if batch_size == 0 {
                return self.finish(StopReason::Completed, run_started).await;
            }
            if self.ctx.iteration() >= self.max_iterations as usize {
                warn!(
                    trace_id = %self.ctx.trace_id,
                    iterations = self.ctx.iteration(),
                    "max iterations reached"
                );
                return self
                    .finish(StopReason::IterationBudgetExhausted, run_started)
                    .await;
            }
        }
    }

    /// Invoke the model once, under a key lease when a pool is configured.
    ///
    /// Returns the tool calls the model requested, or `None` when the call
    /// failed and the invocation is over.
    async fn call_model(
        &mut self,
        tool_defs: &[ToolDefinition],
    ) -> EmitResult<Option<Vec<MessageToolCall>>> {
        let request = ProviderRequest {
            model: self.model.clone(),
            messages: self.conversation.snapshot(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tool_defs.to_vec(),
            stream: self.stream_llm,
        };
        let options = request.options();
        let sent_messages = request.messages.clone();

        self.emit(ReActEventKind::LlmCallStart {
            messages: sent_messages.clone(),
            tools: if tool_defs.is_empty() {
                None
            } else {
                Some(tool_defs.to_vec())
            },
            options: options.clone(),
            stream: self.stream_llm,
        })
        .await?;

        // The lease is the reservation: increment on acquire, decrement on
        // drop, which covers success, failure, and cancellation alike.
        let lease = match &self.pool {
            Some(pool) => match KeyLease::acquire(pool.clone()) {
                Ok(lease) => Some(lease),
                Err(e) => {
                    self.fail_llm_call(pool_failure(&e), &sent_messages, &options)
                        .await?;
                    return Ok(None);
                }
            },
            None => None,
        };

        let started = Instant::now();
        let outcome = if self.stream_llm {
            self.stream_model(request).await?
        } else {
            match self.provider.complete(request).await {
                Ok(response) => {
                    let tool_calls = response.message.tool_calls.clone();
                    let usage = response.usage.clone();
                    let message = response.message.clone();
                    Some((response, message, tool_calls, usage))
                }
                Err(e) => {
                    self.fail_llm_call(e, &sent_messages, &options).await?;
                    None
                }
            }
        };
        drop(lease);

        let Some((response, message, tool_calls, usage)) = outcome else {
            return Ok(None);
        };
        let execution_time = started.elapsed().as_secs_f64();

        self.conversation.push(message.clone());
        self.last_content = Some(message.content.clone());
        self.totals.llm_calls += 1;
        if let Some(u) = &usage {
            self.totals.usage.get_or_insert_default().add(u);
        }

        let after_call = self.conversation.snapshot();
        self.emit(ReActEventKind::LlmCallEnd {
            response: response.clone(),
            messages: after_call.clone(),
            tool_calls: tool_calls.clone(),
            usage,
            execution_time,
        })
        .await?;

        if !self.stream_llm {
            self.emit_response(ResponsePayload::Complete(response), after_call)
                .await?;
        }

        Ok(Some(tool_calls))
    }

    /// Consume a streamed model call, emitting one chunk event and one
    /// response item per partial, and assembling the final message.
    async fn stream_model(&mut self, request: ProviderRequest) -> EmitResult<Option<ModelTurn>> {
        let options = request.options();
        let sent_messages = request.messages.clone();

        let mut chunk_rx = match self.provider.stream(request).await {
            Ok(rx) => rx,
            Err(e) => {
                self.fail_llm_call(e, &sent_messages, &options).await?;
                return Ok(None);
            }
        };

        let mut accumulated = String::new();
        let mut merged_tool_calls: Vec<MessageToolCall> = Vec::new();
        let mut usage: Option<Usage> = None;
        let mut chunk_index = 0usize;

        while let Some(chunk_result) = chunk_rx.recv().await {
            match chunk_result {
                Ok(chunk) => {
                    if let Some(text) = &chunk.content {
                        accumulated.push_str(text);
                    }

                    // Merge tool-call argument deltas by id.
                    for tc in &chunk.tool_calls {
                        if let Some(existing) =
                            merged_tool_calls.iter_mut().find(|t| t.id == tc.id)
                        {
                            existing.arguments.push_str(&tc.arguments);
                        } else {
                            merged_tool_calls.push(tc.clone());
                        }
                    }

                    if let Some(u) = &chunk.usage {
                        usage = Some(u.clone());
                    }

                    self.emit(ReActEventKind::LlmChunkArrive {
                        chunk: chunk.clone(),
                        accumulated_content: accumulated.clone(),
                        chunk_index,
                    })
                    .await?;
                    self.emit_response(
                        ResponsePayload::Chunk(chunk),
                        self.conversation.snapshot(),
                    )
                    .await?;
                    chunk_index += 1;
                }
                Err(e) => {
                    self.fail_llm_call(e, &sent_messages, &options).await?;
                    return Ok(None);
                }
            }
        }

        let mut message = Message::assistant(&accumulated);
        message.tool_calls = merged_tool_calls.clone();
        let response = ProviderResponse {
            message: message.clone(),
            usage: usage.clone(),
            model: self.model.clone(),
        };
        Ok(Some((response, message, merged_tool_calls, usage)))
    }

    /// Record a model-call failure and terminate the invocation.
    async fn fail_llm_call(
        &mut self,
        error: ProviderError,
        sent_messages: &[Message],
        options: &CallOptions,
    ) -> EmitResult<()> {
        warn!(
            trace_id = %self.ctx.trace_id,
            error = %error,
            "LLM call failed; terminating invocation"
        );
        let error_message = error.to_string();
        self.emit(ReActEventKind::LlmCallError {
            error_kind: error.kind().into(),
            error_message: error_message.clone(),
            error: Some(error),
            messages: sent_messages.to_vec(),
            options: options.clone(),
        })
        .await?;
        self.emit(ReActEventKind::ReactError {
            error_message,
            error_kind: "model_call_error".into(),
        })
        .await
    }

    /// Execute one batch of requested tool calls concurrently.
    ///
    /// Start events go out in request order before dispatch; end/error
    /// events are sent by each task at its own completion time. History is
    /// appended in request order regardless of completion order, so
    /// replaying it is reproducible.
    async fn run_tool_batch(&mut self, calls: Vec<MessageToolCall>) -> EmitResult<()> {
        let batch_size = calls.len();
        let batch_started = Instant::now();

        self.emit(ReActEventKind::ToolCallsBatchStart {
            tool_calls: calls.clone(),
            batch_size,
        })
        .await?;

        let mut join = JoinSet::new();
        for (index, tc) in calls.iter().enumerate() {
            let arguments: serde_json::Value =
                serde_json::from_str(&tc.arguments).unwrap_or_default();

            self.emit(ReActEventKind::ToolCallStart {
                tool_name: tc.name.clone(),
                tool_call_id: tc.id.clone(),
                arguments: arguments.clone(),
                tool_call: tc.clone(),
            })
            .await?;

            join.spawn(execute_tool_call(
                index,
                tc.clone(),
                arguments,
                self.tools.clone(),
                self.tx.clone(),
                self.ctx.clone(),
            ));
        }

        let mut slots: Vec<Option<(ToolCallResult, Message)>> =
            (0..batch_size).map(|_| None).collect();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((index, result, message)) => slots[index] = Some((result, message)),
                Err(e) => warn!(error = %e, "tool task failed to complete"),
            }
        }

        // A task that panicked still accounts for its slot.
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let tc = &calls[index];
                *slot = Some((
                    ToolCallResult {
                        tool_name: tc.name.clone(),
                        tool_call_id: tc.id.clone(),
                        result: None,
                        execution_time: 0.0,
                        success: false,
                    },
                    Message::tool_result(&tc.id, "Error: tool task aborted"),
                ));
            }
        }

        let mut tool_results = Vec::with_capacity(batch_size);
        let mut success_count = 0usize;
        for (result, message) in slots.into_iter().flatten() {
            if result.success {
                success_count += 1;
            }
            self.conversation.push(message);
            tool_results.push(result);
        }
        let error_count = batch_size - success_count;
        self.totals.tool_calls += batch_size;

        self.emit(ReActEventKind::ToolCallsBatchEnd {
            tool_results,
            batch_size,
            total_execution_time: batch_started.elapsed().as_secs_f64(),
            success_count,
            error_count,
        })
        .await
    }

    async fn finish(&mut self, stop_reason: StopReason, run_started: Instant) -> EmitResult<()> {
        info!(
            trace_id = %self.ctx.trace_id,
            iterations = self.ctx.iteration(),
            tool_calls = self.totals.tool_calls,
            llm_calls = self.totals.llm_calls,
            ?stop_reason,
            "ReAct loop completed"
        );
        self.emit(ReActEventKind::ReactEnd {
            final_response: self.last_content.clone(),
            final_messages: self.conversation.snapshot(),
            total_iterations: self.ctx.iteration(),
            total_execution_time: run_started.elapsed().as_secs_f64(),
            total_tool_calls: self.totals.tool_calls,
            total_llm_calls: self.totals.llm_calls,
            total_token_usage: self.totals.usage.clone(),
            stop_reason,
        })
        .await
    }

    async fn emit(&self, kind: ReActEventKind) -> EmitResult<()> {
        let event = ReActEvent::new(
            &self.ctx.trace_id,
            &self.ctx.func_name,
            self.ctx.iteration(),
            kind,
        );
        self.tx
            .send(StreamItem::Event { event })
            .await
            .map_err(|_| StreamClosed)
    }

    async fn emit_response(
        &self,
        response: ResponsePayload,
        messages: Vec<Message>,
    ) -> EmitResult<()> {
        self.tx
            .send(StreamItem::Response { response, messages })
            .await
            .map_err(|_| StreamClosed)
    }
}

/// A key-pool failure on the call path, surfaced as a provider error.
fn pool_failure(error: &PoolError) -> ProviderError {
    ProviderError::NotConfigured(error.to_string())
}

/// Run one tool call and report its end event at its own completion time.
async fn execute_tool_call(
    index: usize,
    tool_call: MessageToolCall,
    arguments: serde_json::Value,
    tools: Arc<ToolRegistry>,
    tx: mpsc::Sender<StreamItem>,
    ctx: Arc<InvocationContext>,
) -> (usize, ToolCallResult, Message) {
    let call = ToolCall {
        id: tool_call.id.clone(),
        name: tool_call.name.clone(),
        arguments: arguments.clone(),
    };

    let started = Instant::now();
    let outcome = tools.execute(&call).await;
    let execution_time = started.elapsed().as_secs_f64();

    match outcome {
        Ok(execution) => {
            let event = ReActEvent::new(
                &ctx.trace_id,
                &ctx.func_name,
                ctx.iteration(),
                ReActEventKind::ToolCallEnd {
                    tool_name: tool_call.name.clone(),
                    tool_call_id: tool_call.id.clone(),
                    arguments,
                    result: execution.output.clone(),
                    execution_time,
                    success: execution.success,
                },
            );
            let _ = tx.send(StreamItem::Event { event }).await;

            (
                index,
                ToolCallResult {
                    tool_name: tool_call.name.clone(),
                    tool_call_id: tool_call.id.clone(),
                    result: Some(execution.output.clone()),
                    execution_time,
                    success: execution.success,
                },
                Message::tool_result(&tool_call.id, &execution.output),
            )
        }
        Err(error) => {
            warn!(tool = %tool_call.name, error = %error, "Tool execution failed");
            let error_message = error.to_string();
            let event = ReActEvent::new(
                &ctx.trace_id,
                &ctx.func_name,
                ctx.iteration(),
                ReActEventKind::ToolCallError {
                    tool_name: tool_call.name.clone(),
                    tool_call_id: tool_call.id.clone(),
                    arguments,
                    error_kind: error.kind().into(),
                    error_message: error_message.clone(),
                    error: Some(error),
                    execution_time,
                },
            );
            let _ = tx.send(StreamItem::Event { event }).await;

            (
                index,
                ToolCallResult {
                    tool_name: tool_call.name.clone(),
                    tool_call_id: tool_call.id.clone(),
                    result: None,
                    execution_time,
                    success: false,
                },
                Message::tool_result(&tool_call.id, format!("Error: {error_message}")),
            )
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
