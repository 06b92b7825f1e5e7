//! Scripted transport for testing without a live provider.
//!
//! [`MockAuthenticator`] hands out region-bound clients that consume
//! per-(region, model) outcome scripts in order, allowing deterministic
//! tests of the retry state machine, streaming recovery, and the parallel
//! executor.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::{
    Authenticator, ConverseArgs, ConverseOutputMessage, EventStream, RawConverseOutput, RpcClient,
    RpcFailure,
};
use crate::assembler::StreamEvent;
use crate::error::Result;
use crate::response::{RpcMetrics, TokenUsage};
use crate::types::{ContentBlock, Message, Role};

/// One scripted result for a converse or converse-stream call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Blocking success with the given text.
    Reply(String),
    /// Blocking success with the given text after a delay, for timeout
    /// tests.
    ReplyAfter(std::time::Duration, String),
    /// Blocking success with a fully specified payload.
    ReplyWith(RawConverseOutput),
    /// The call fails.
    Fail(RpcFailure),
    /// Streaming success: the given events are replayed in order.
    Stream(Vec<StreamEvent>),
    /// Opening the stream itself fails.
    StreamFail(RpcFailure),
}

/// A recorded dispatch, for asserting what the relay actually called.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Region the call went to.
    pub region: String,
    /// Concrete model or profile id invoked.
    pub model_id: String,
    /// Whether the streaming endpoint was used.
    pub streaming: bool,
    /// The full arguments.
    pub args: ConverseArgs,
}

#[derive(Debug, Default)]
struct MockCore {
    scripts: Mutex<HashMap<(String, String), VecDeque<MockOutcome>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockCore {
    fn next_outcome(&self, region: &str, model_id: &str) -> MockOutcome {
        let mut scripts = self.scripts.lock().expect("mock script lock poisoned");
        scripts
            .get_mut(&(region.to_string(), model_id.to_string()))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                MockOutcome::Fail(
                    RpcFailure::new(format!(
                        "no scripted outcome for {model_id} in {region}"
                    ))
                    .with_code("AccessDeniedException")
                    .with_status(403),
                )
            })
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().expect("mock call lock poisoned").push(call);
    }
}

/// Scripted authenticator. Clone-cheap via `Arc`.
///
/// # Example
///
/// ```
/// use llm_relay::transport::{MockAuthenticator, MockOutcome};
///
/// let mock = MockAuthenticator::new();
/// mock.script("us-east-1", "provider.model-a", vec![
///     MockOutcome::Fail(MockAuthenticator::throttling()),
///     MockOutcome::Reply("recovered".into()),
/// ]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockAuthenticator {
    core: Arc<MockCore>,
}

impl MockAuthenticator {
    /// A mock with no scripts; unscripted calls fail with access-denied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for calls to `model_id` in `region`. Outcomes are
    /// consumed in order; when the queue runs dry the call fails.
    pub fn script(
        &self,
        region: impl Into<String>,
        model_id: impl Into<String>,
        outcomes: Vec<MockOutcome>,
    ) {
        let mut scripts = self.core.scripts.lock().expect("mock script lock poisoned");
        scripts
            .entry((region.into(), model_id.into()))
            .or_default()
            .extend(outcomes);
    }

    /// All dispatches recorded so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.core.calls.lock().expect("mock call lock poisoned").clone()
    }

    /// Number of dispatches to `region`.
    pub fn calls_to_region(&self, region: &str) -> usize {
        self.calls().iter().filter(|c| c.region == region).count()
    }

    /// A throttling failure, as the provider reports it.
    pub fn throttling() -> RpcFailure {
        RpcFailure::new("Too many requests, please wait before trying again.")
            .with_code("ThrottlingException")
            .with_status(429)
    }

    /// An access-denied failure.
    pub fn access_denied() -> RpcFailure {
        RpcFailure::new("You don't have access to the model with the specified model ID.")
            .with_code("AccessDeniedException")
            .with_status(403)
    }

    /// A service-unavailable failure.
    pub fn service_unavailable() -> RpcFailure {
        RpcFailure::new("Service is temporarily unavailable.")
            .with_code("ServiceUnavailableException")
            .with_status(503)
    }

    /// A validation failure with the given provider message.
    pub fn validation(message: impl Into<String>) -> RpcFailure {
        RpcFailure::new(message)
            .with_code("ValidationException")
            .with_status(400)
    }

    /// A well-formed blocking payload wrapping the given text.
    pub fn text_output(text: impl Into<String>) -> RawConverseOutput {
        RawConverseOutput {
            output: ConverseOutputMessage {
                message: Message {
                    role: Role::Assistant,
                    content: vec![ContentBlock::text(text)],
                },
            },
            stop_reason: Some("end_turn".into()),
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
                total_tokens: 30,
                ..Default::default()
            }),
            metrics: Some(RpcMetrics { latency_ms: 42 }),
            additional_model_response_fields: None,
            trace: None,
        }
    }

    /// A complete event sequence streaming the given texts as deltas.
    pub fn stream_of(texts: &[&str]) -> Vec<StreamEvent> {
        let mut events = vec![
            StreamEvent::MessageStart {
                role: Role::Assistant,
            },
            StreamEvent::ContentBlockStart {
                content_block_index: 0,
            },
        ];
        for text in texts {
            events.push(StreamEvent::text_delta(0, *text));
        }
        events.push(StreamEvent::ContentBlockStop {
            content_block_index: 0,
        });
        events.push(StreamEvent::MessageStop {
            stop_reason: "end_turn".into(),
        });
        events.push(StreamEvent::Metadata {
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
                total_tokens: 30,
                ..Default::default()
            }),
            metrics: Some(RpcMetrics { latency_ms: 42 }),
        });
        events
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn client_for(&self, region: &str) -> Result<Arc<dyn RpcClient>> {
        Ok(Arc::new(MockRegionClient {
            core: self.core.clone(),
            region: region.to_string(),
        }))
    }
}

struct MockRegionClient {
    core: Arc<MockCore>,
    region: String,
}

#[async_trait]
impl RpcClient for MockRegionClient {
    async fn converse(
        &self,
        args: &ConverseArgs,
    ) -> std::result::Result<RawConverseOutput, RpcFailure> {
        self.core.record(RecordedCall {
            region: self.region.clone(),
            model_id: args.model_id.clone(),
            streaming: false,
            args: args.clone(),
        });
        match self.core.next_outcome(&self.region, &args.model_id) {
            MockOutcome::Reply(text) => Ok(MockAuthenticator::text_output(text)),
            MockOutcome::ReplyAfter(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(MockAuthenticator::text_output(text))
            }
            MockOutcome::ReplyWith(output) => Ok(output),
            MockOutcome::Fail(failure) => Err(failure),
            MockOutcome::Stream(_) | MockOutcome::StreamFail(_) => Err(RpcFailure::new(
                "scripted a streaming outcome for a blocking call",
            )),
        }
    }

    async fn converse_stream(
        &self,
        args: &ConverseArgs,
    ) -> std::result::Result<EventStream, RpcFailure> {
        self.core.record(RecordedCall {
            region: self.region.clone(),
            model_id: args.model_id.clone(),
            streaming: true,
            args: args.clone(),
        });
        match self.core.next_outcome(&self.region, &args.model_id) {
            MockOutcome::Stream(events) => {
                Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
            }
            MockOutcome::StreamFail(failure) | MockOutcome::Fail(failure) => Err(failure),
            MockOutcome::Reply(text) => {
                // Convenience: a blocking reply scripted on the streaming
                // endpoint is replayed as a single-delta stream.
                Ok(Box::pin(futures::stream::iter(
                    MockAuthenticator::stream_of(&[&text]).into_iter().map(Ok),
                )))
            }
            MockOutcome::ReplyAfter(..) | MockOutcome::ReplyWith(_) => Err(RpcFailure::new(
                "scripted a blocking payload for a streaming call",
            )),
        }
    }

    fn region(&self) -> &str {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(model_id: &str) -> ConverseArgs {
        ConverseArgs {
            model_id: model_id.into(),
            messages: vec![Message::user("hi")],
            ..ConverseArgs::default()
        }
    }

    #[tokio::test]
    async fn test_outcomes_consumed_in_order() {
        let mock = MockAuthenticator::new();
        mock.script(
            "us-east-1",
            "m1",
            vec![
                MockOutcome::Fail(MockAuthenticator::throttling()),
                MockOutcome::Reply("second try".into()),
            ],
        );
        let client = mock.client_for("us-east-1").await.unwrap();

        let first = client.converse(&args("m1")).await;
        assert_eq!(
            first.unwrap_err().code.as_deref(),
            Some("ThrottlingException")
        );

        let second = client.converse(&args("m1")).await.unwrap();
        assert_eq!(
            second.output.message.content,
            vec![ContentBlock::text("second try")]
        );
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unscripted_call_fails_access_denied() {
        let mock = MockAuthenticator::new();
        let client = mock.client_for("eu-west-1").await.unwrap();
        let error = client.converse(&args("mystery")).await.unwrap_err();
        assert_eq!(error.code.as_deref(), Some("AccessDeniedException"));
    }

    #[tokio::test]
    async fn test_streaming_script_replays_events() {
        use futures::StreamExt;

        let mock = MockAuthenticator::new();
        mock.script(
            "us-east-1",
            "m1",
            vec![MockOutcome::Stream(MockAuthenticator::stream_of(&[
                "Hello", " world",
            ]))],
        );
        let client = mock.client_for("us-east-1").await.unwrap();
        let stream = client.converse_stream(&args("m1")).await.unwrap();
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 7);
        assert!(events.iter().all(|e| e.is_ok()));
        assert_eq!(mock.calls_to_region("us-east-1"), 1);
    }
}
