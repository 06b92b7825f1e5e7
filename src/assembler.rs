//! Streaming response assembly.
//!
//! The relay's streaming path pipes [`StreamEvent`]s through a
//! [`ResponseAssembler`], which accumulates content parts, tracks the byte
//! position of the stream, and records faults. The caller-facing surface is
//! [`StreamingResponse`]: a chunk stream plus a finalizer — iterate chunks as
//! they arrive, then read the terminal fields from the [`StreamOutcome`]
//! once the stream ends.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::catalog::access::AccessMethod;
use crate::response::{AttemptRecord, RpcMetrics, TokenUsage};
use crate::transport::RpcFailure;
use crate::types::{FeatureTag, Role};

/// The kinds of error events a converse stream can carry. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    /// Request was throttled mid-stream.
    Throttling,
    /// The provider rejected something about the request.
    Validation,
    /// The model errored while generating.
    ModelStreamError,
    /// The service became unavailable.
    ServiceUnavailable,
    /// Internal provider failure.
    InternalServer,
}

impl StreamErrorKind {
    /// The provider error code this kind corresponds to.
    pub fn code(&self) -> &'static str {
        match self {
            StreamErrorKind::Throttling => "ThrottlingException",
            StreamErrorKind::Validation => "ValidationException",
            StreamErrorKind::ModelStreamError => "ModelStreamErrorException",
            StreamErrorKind::ServiceUnavailable => "ServiceUnavailableException",
            StreamErrorKind::InternalServer => "InternalServerException",
        }
    }
}

/// Incremental content carried by a `contentBlockDelta` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    /// Incremental response text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Incremental reasoning text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_text: Option<String>,
    /// Incremental tool-input JSON fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    /// Citation payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<Value>,
}

/// One event of a converse stream. Closed set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamEvent {
    /// The response message has started.
    #[serde(rename_all = "camelCase")]
    MessageStart {
        /// Role of the message (always assistant in practice).
        role: Role,
    },
    /// A content block has started.
    #[serde(rename_all = "camelCase")]
    ContentBlockStart {
        /// Index of the block within the message.
        content_block_index: usize,
    },
    /// Incremental content for a block.
    #[serde(rename_all = "camelCase")]
    ContentBlockDelta {
        /// Index of the block within the message.
        content_block_index: usize,
        /// The incremental content.
        delta: Delta,
    },
    /// A content block has finished.
    #[serde(rename_all = "camelCase")]
    ContentBlockStop {
        /// Index of the block within the message.
        content_block_index: usize,
    },
    /// The response message has finished.
    #[serde(rename_all = "camelCase")]
    MessageStop {
        /// Why generation stopped.
        stop_reason: String,
    },
    /// Trailing usage and timing metadata.
    #[serde(rename_all = "camelCase")]
    Metadata {
        /// Token accounting.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        /// Provider-side timing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<RpcMetrics>,
    },
    /// Mid-stream throttling fault.
    #[serde(rename = "throttlingException", rename_all = "camelCase")]
    Throttling {
        /// Provider message.
        message: String,
    },
    /// Mid-stream validation fault.
    #[serde(rename = "validationException", rename_all = "camelCase")]
    Validation {
        /// Provider message.
        message: String,
    },
    /// Mid-stream model fault.
    #[serde(rename = "modelStreamErrorException", rename_all = "camelCase")]
    ModelStreamError {
        /// Provider message.
        message: String,
    },
    /// Mid-stream service unavailability.
    #[serde(rename = "serviceUnavailableException", rename_all = "camelCase")]
    ServiceUnavailable {
        /// Provider message.
        message: String,
    },
    /// Mid-stream internal provider failure.
    #[serde(rename = "internalServerException", rename_all = "camelCase")]
    InternalServer {
        /// Provider message.
        message: String,
    },
}

impl StreamEvent {
    /// Convenience: a text delta event.
    pub fn text_delta(index: usize, text: impl Into<String>) -> Self {
        StreamEvent::ContentBlockDelta {
            content_block_index: index,
            delta: Delta {
                text: Some(text.into()),
                ..Delta::default()
            },
        }
    }

    /// If this is an error event, its kind and message.
    pub fn as_error(&self) -> Option<(StreamErrorKind, &str)> {
        match self {
            StreamEvent::Throttling { message } => Some((StreamErrorKind::Throttling, message)),
            StreamEvent::Validation { message } => Some((StreamErrorKind::Validation, message)),
            StreamEvent::ModelStreamError { message } => {
                Some((StreamErrorKind::ModelStreamError, message))
            }
            StreamEvent::ServiceUnavailable { message } => {
                Some((StreamErrorKind::ServiceUnavailable, message))
            }
            StreamEvent::InternalServer { message } => {
                Some((StreamErrorKind::InternalServer, message))
            }
            _ => None,
        }
    }
}

/// A fault observed mid-stream, after content had already been emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidStreamException {
    /// Byte position in the assembled content when the fault arrived.
    pub position: usize,
    /// Model streaming at the time.
    pub model: String,
    /// Region streaming at the time.
    pub region: String,
    /// Error kind or code.
    pub error_type: String,
    /// Provider message.
    pub message: String,
    /// Whether a replacement target continued the stream.
    pub recovered: bool,
}

/// What the assembler made of one event.
#[derive(Debug, Clone, PartialEq)]
pub enum AssembledEvent {
    /// A text chunk to hand to the caller.
    Chunk(String),
    /// An error event, converted to a structured failure.
    Fault(RpcFailure),
    /// The message finished normally.
    Completed,
    /// Bookkeeping only; nothing to surface.
    Ignored,
}

/// Accumulates a streaming response across events and, when recovery kicks
/// in, across targets.
#[derive(Debug)]
pub struct ResponseAssembler {
    /// Ordered text chunks as produced (preserved across target switches).
    pub content_parts: Vec<String>,
    /// Byte position: total UTF-8 length of content produced so far.
    pub stream_position: usize,
    /// Stringified error events, in arrival order.
    pub stream_errors: Vec<String>,
    /// Faults that arrived after content had been emitted.
    pub mid_stream_exceptions: Vec<MidStreamException>,
    /// Number of target switches performed by recovery.
    pub target_switches: u32,
    /// Usage from the metadata event.
    pub usage: Option<TokenUsage>,
    /// Latency from the metadata event.
    pub api_latency_ms: Option<u64>,
    /// Stop reason from the message-stop event.
    pub stop_reason: Option<String>,
    started_at: Instant,
    first_token_at: Option<Instant>,
    last_token_at: Option<Instant>,
}

impl ResponseAssembler {
    /// A fresh assembler.
    pub fn new() -> Self {
        Self {
            content_parts: Vec::new(),
            stream_position: 0,
            stream_errors: Vec::new(),
            mid_stream_exceptions: Vec::new(),
            target_switches: 0,
            usage: None,
            api_latency_ms: None,
            stop_reason: None,
            started_at: Instant::now(),
            first_token_at: None,
            last_token_at: None,
        }
    }

    /// Whether any content has been emitted to the caller yet. Reasoning
    /// deltas advance the position but do not count as emitted content.
    pub fn has_content(&self) -> bool {
        !self.content_parts.is_empty()
    }

    /// The full content assembled so far.
    pub fn full_content(&self) -> String {
        self.content_parts.concat()
    }

    /// Process one event. Returns what, if anything, to surface.
    pub fn handle_event(&mut self, event: StreamEvent) -> AssembledEvent {
        if let Some((kind, message)) = event.as_error() {
            let failure = RpcFailure::new(message).with_code(kind.code());
            self.stream_errors.push(failure.to_string());
            return AssembledEvent::Fault(failure);
        }
        match event {
            StreamEvent::ContentBlockDelta { delta, .. } => {
                if let Some(text) = delta.text {
                    if text.is_empty() {
                        return AssembledEvent::Ignored;
                    }
                    let now = Instant::now();
                    self.first_token_at.get_or_insert(now);
                    self.last_token_at = Some(now);
                    self.stream_position += text.len();
                    self.content_parts.push(text.clone());
                    return AssembledEvent::Chunk(text);
                }
                // Reasoning text, tool input, and citations are tracked for
                // position but not surfaced as chunks.
                if let Some(reasoning) = delta.reasoning_text {
                    self.stream_position += reasoning.len();
                }
                AssembledEvent::Ignored
            }
            StreamEvent::MessageStop { stop_reason } => {
                self.stop_reason = Some(stop_reason);
                AssembledEvent::Completed
            }
            StreamEvent::Metadata { usage, metrics } => {
                if usage.is_some() {
                    self.usage = usage;
                }
                if let Some(metrics) = metrics {
                    self.api_latency_ms = Some(metrics.latency_ms);
                }
                AssembledEvent::Ignored
            }
            _ => AssembledEvent::Ignored,
        }
    }

    /// Record a fault that arrived after content had been emitted.
    pub fn record_mid_stream_exception(
        &mut self,
        model: impl Into<String>,
        region: impl Into<String>,
        failure: &RpcFailure,
    ) {
        self.mid_stream_exceptions.push(MidStreamException {
            position: self.stream_position,
            model: model.into(),
            region: region.into(),
            error_type: failure.code.clone().unwrap_or_else(|| "unknown".into()),
            message: failure.message.clone(),
            recovered: false,
        });
    }

    /// Mark the latest mid-stream exception as recovered and count the
    /// target switch.
    pub fn mark_recovered(&mut self) {
        if let Some(last) = self.mid_stream_exceptions.last_mut() {
            last.recovered = true;
        }
        self.target_switches += 1;
    }

    /// Milliseconds from stream start to the first emitted token.
    pub fn time_to_first_token_ms(&self) -> Option<f64> {
        self.first_token_at
            .map(|t| t.duration_since(self.started_at).as_secs_f64() * 1000.0)
    }

    /// Milliseconds from stream start to the last emitted token.
    pub fn time_to_last_token_ms(&self) -> Option<f64> {
        self.last_token_at
            .map(|t| t.duration_since(self.started_at).as_secs_f64() * 1000.0)
    }

    /// Milliseconds between the first and last emitted tokens.
    pub fn token_generation_duration_ms(&self) -> Option<f64> {
        match (self.first_token_at, self.last_token_at) {
            (Some(first), Some(last)) => Some(last.duration_since(first).as_secs_f64() * 1000.0),
            _ => None,
        }
    }
}

impl Default for ResponseAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal fields of a finished stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOutcome {
    /// Whether the stream completed successfully.
    pub success: bool,
    /// Model that produced the (final segment of the) stream.
    pub model_used: Option<String>,
    /// Region that produced the (final segment of the) stream.
    pub region_used: Option<String>,
    /// Access method of the final streaming attempt.
    pub access_method_used: Option<AccessMethod>,
    /// Every attempt, streaming and recovery alike, in order.
    pub attempts: Vec<AttemptRecord>,
    /// Ordered content chunks as delivered.
    pub content_parts: Vec<String>,
    /// Final byte position of the stream.
    pub stream_position: usize,
    /// Stringified error events.
    pub stream_errors: Vec<String>,
    /// Faults observed after content had been emitted.
    pub mid_stream_exceptions: Vec<MidStreamException>,
    /// Number of mid-stream target switches.
    pub target_switches: u32,
    /// Wall-clock duration of the whole streaming call.
    pub total_duration_ms: f64,
    /// Provider-reported latency, when the metadata event carried one.
    pub api_latency_ms: Option<u64>,
    /// Token usage, when reported.
    pub usage: Option<TokenUsage>,
    /// Stop reason, when the stream finished normally.
    pub stop_reason: Option<String>,
    /// Non-fatal diagnostics.
    pub warnings: Vec<String>,
    /// Features disabled by compatibility fallback.
    pub features_disabled: Vec<FeatureTag>,
    /// Milliseconds to the first token.
    pub time_to_first_token_ms: Option<f64>,
    /// Milliseconds to the last token.
    pub time_to_last_token_ms: Option<f64>,
    /// Milliseconds between first and last token.
    pub token_generation_duration_ms: Option<f64>,
}

impl StreamOutcome {
    /// The full content: concatenation of all chunks.
    pub fn full_content(&self) -> String {
        self.content_parts.concat()
    }
}

/// Cooperative cancellation for an in-flight call.
///
/// Cloning shares the flag; `cancel()` stops further attempts and aborts the
/// current one at the next suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// A fresh, uncancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A live streaming response: iterate chunks, then read the outcome.
///
/// # Example
///
/// ```no_run
/// # async fn demo(mut response: llm_relay::assembler::StreamingResponse) {
/// while let Some(chunk) = response.next_chunk().await {
///     print!("{chunk}");
/// }
/// let outcome = response.outcome().expect("stream ended");
/// println!("\nmodel: {:?}", outcome.model_used);
/// # }
/// ```
#[derive(Debug)]
pub struct StreamingResponse {
    rx: UnboundedReceiver<String>,
    handle: Option<JoinHandle<StreamOutcome>>,
    cancel: CancelHandle,
    outcome: Option<StreamOutcome>,
}

impl StreamingResponse {
    pub(crate) fn new(
        rx: UnboundedReceiver<String>,
        handle: JoinHandle<StreamOutcome>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            rx,
            handle: Some(handle),
            cancel,
            outcome: None,
        }
    }

    /// Next text chunk, or `None` once the stream has ended. After `None`,
    /// [`outcome`](Self::outcome) is populated.
    pub async fn next_chunk(&mut self) -> Option<String> {
        match self.rx.recv().await {
            Some(chunk) => Some(chunk),
            None => {
                self.join().await;
                None
            }
        }
    }

    /// Drain any remaining chunks and return the terminal outcome.
    pub async fn finish(mut self) -> StreamOutcome {
        while self.next_chunk().await.is_some() {}
        self.outcome.take().unwrap_or_else(|| StreamOutcome {
            success: false,
            warnings: vec!["stream task produced no outcome".into()],
            ..StreamOutcome::default()
        })
    }

    /// Stop iteration; the orchestration task finalizes with the partial
    /// content collected so far.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The terminal outcome, available after the stream has ended.
    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.outcome = Some(match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => StreamOutcome {
                    success: false,
                    warnings: vec![format!("stream task failed: {join_error}")],
                    ..StreamOutcome::default()
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = StreamEvent::text_delta(0, "Hello");
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "contentBlockDelta": {"contentBlockIndex": 0, "delta": {"text": "Hello"}}
            })
        );

        let error = StreamEvent::Throttling {
            message: "slow down".into(),
        };
        let v = serde_json::to_value(&error).unwrap();
        assert_eq!(v, serde_json::json!({"throttlingException": {"message": "slow down"}}));
    }

    #[test]
    fn test_assembly_concatenation_matches_deltas() {
        let mut assembler = ResponseAssembler::new();
        let deltas = ["Hello", ", ", "world", "!"];
        for (i, text) in deltas.iter().enumerate() {
            match assembler.handle_event(StreamEvent::text_delta(i, *text)) {
                AssembledEvent::Chunk(chunk) => assert_eq!(chunk, *text),
                other => panic!("expected chunk, got {other:?}"),
            }
        }
        assert_eq!(assembler.full_content(), "Hello, world!");
        assert_eq!(assembler.stream_position, "Hello, world!".len());
    }

    #[test]
    fn test_message_stop_and_metadata() {
        let mut assembler = ResponseAssembler::new();
        assert_eq!(
            assembler.handle_event(StreamEvent::MessageStop {
                stop_reason: "end_turn".into()
            }),
            AssembledEvent::Completed
        );
        assembler.handle_event(StreamEvent::Metadata {
            usage: Some(TokenUsage {
                input_tokens: 5,
                output_tokens: 9,
                total_tokens: 14,
                ..Default::default()
            }),
            metrics: Some(RpcMetrics { latency_ms: 88 }),
        });
        assert_eq!(assembler.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(assembler.api_latency_ms, Some(88));
        assert_eq!(assembler.usage.unwrap().total_tokens, 14);
    }

    #[test]
    fn test_error_event_becomes_fault() {
        let mut assembler = ResponseAssembler::new();
        let result = assembler.handle_event(StreamEvent::ServiceUnavailable {
            message: "try later".into(),
        });
        match result {
            AssembledEvent::Fault(failure) => {
                assert_eq!(failure.code.as_deref(), Some("ServiceUnavailableException"));
            }
            other => panic!("expected fault, got {other:?}"),
        }
        assert_eq!(assembler.stream_errors.len(), 1);
    }

    #[test]
    fn test_mid_stream_exception_position_and_recovery() {
        let mut assembler = ResponseAssembler::new();
        assembler.handle_event(StreamEvent::text_delta(0, "Hello"));
        let failure = RpcFailure::new("throttled").with_code("ThrottlingException");
        assembler.record_mid_stream_exception("model-a", "us-east-1", &failure);
        assembler.mark_recovered();
        // Prefix is preserved across the switch
        assembler.handle_event(StreamEvent::text_delta(0, " world"));

        assert_eq!(assembler.content_parts, vec!["Hello", " world"]);
        assert_eq!(assembler.target_switches, 1);
        let exception = &assembler.mid_stream_exceptions[0];
        assert_eq!(exception.position, 5);
        assert!(exception.recovered);
        assert_eq!(exception.error_type, "ThrottlingException");
    }

    #[test]
    fn test_reasoning_deltas_advance_position_without_chunks() {
        let mut assembler = ResponseAssembler::new();
        let event = StreamEvent::ContentBlockDelta {
            content_block_index: 0,
            delta: Delta {
                reasoning_text: Some("thinking...".into()),
                ..Delta::default()
            },
        };
        assert_eq!(assembler.handle_event(event), AssembledEvent::Ignored);
        assert!(assembler.stream_position > 0);
        assert!(assembler.content_parts.is_empty());
    }

    #[tokio::test]
    async fn test_streaming_response_chunks_then_outcome() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            tx.send("a".to_string()).unwrap();
            tx.send("b".to_string()).unwrap();
            StreamOutcome {
                success: true,
                content_parts: vec!["a".into(), "b".into()],
                stream_position: 2,
                ..StreamOutcome::default()
            }
        });
        let mut response = StreamingResponse::new(rx, handle, CancelHandle::new());

        assert_eq!(response.next_chunk().await.as_deref(), Some("a"));
        assert_eq!(response.next_chunk().await.as_deref(), Some("b"));
        assert!(response.outcome().is_none());
        assert!(response.next_chunk().await.is_none());
        let outcome = response.outcome().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.full_content(), "ab");
    }

    #[test]
    fn test_cancel_handle() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_cancelled());
        handle.cancel();
        assert!(clone.is_cancelled());
    }
}
