//! Transport abstraction: the converse RPC and the authenticator that
//! produces per-region clients.
//!
//! The relay consumes only the [`RpcClient`] and [`Authenticator`] traits.
//! [`HttpRpcClient`](http::HttpRpcClient) is the default implementation;
//! [`MockAuthenticator`](mock::MockAuthenticator) scripts outcomes for
//! deterministic tests.

pub mod http;
pub mod mock;

pub use http::{HttpAuthenticator, HttpRpcClient};
pub use mock::{MockAuthenticator, MockOutcome};

use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use crate::assembler::StreamEvent;
use crate::error::Result;
use crate::response::{RpcMetrics, TokenUsage};
use crate::types::{
    ConverseRequest, GuardrailConfig, InferenceConfig, Message, PerformanceConfig, SystemPrompt,
    ToolConfig,
};

/// A provider-side RPC failure: structured error code when the provider
/// supplied one, HTTP status when the transport saw one, and the raw
/// message. Error classification works on this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    /// Provider error code (e.g. `"ThrottlingException"`).
    pub code: Option<String>,
    /// Raw error message.
    pub message: String,
    /// HTTP status, when the failure came from the transport layer.
    pub status: Option<u16>,
}

impl RpcFailure {
    /// A failure carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            status: None,
        }
    }

    /// Attach a provider error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach an HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RpcFailure {}

/// The arguments of one converse RPC, resolved to a concrete invocation id
/// (base model id or inference-profile id).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseArgs {
    /// Concrete model or inference-profile id.
    pub model_id: String,
    /// Conversation turns.
    pub messages: Vec<Message>,
    /// System prompts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<SystemPrompt>,
    /// Sampling configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_config: Option<InferenceConfig>,
    /// Tool configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    /// Guardrail configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail_config: Option<GuardrailConfig>,
    /// Model-specific request fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_model_request_fields: Option<Map<String, Value>>,
    /// Performance tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_config: Option<PerformanceConfig>,
}

impl ConverseArgs {
    /// Build RPC arguments from a (possibly filtered) request and the
    /// invocation id the catalog resolved.
    pub fn from_request(request: &ConverseRequest, model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            messages: request.messages.clone(),
            system: request.system.clone(),
            inference_config: request.inference_config.clone(),
            tool_config: request.tool_config.clone(),
            guardrail_config: request.guardrail_config.clone(),
            additional_model_request_fields: request.additional_model_request_fields.clone(),
            performance_config: request.performance_config.clone(),
        }
    }
}

/// The output message wrapper of a blocking converse response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverseOutputMessage {
    /// The assistant message produced by the model.
    pub message: Message,
}

impl Default for ConverseOutputMessage {
    fn default() -> Self {
        Self {
            message: Message {
                role: crate::types::Role::Assistant,
                content: Vec::new(),
            },
        }
    }
}

/// The raw payload of a successful blocking converse RPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConverseOutput {
    /// Output message.
    pub output: ConverseOutputMessage,
    /// Why generation stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Token accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Provider-side timing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RpcMetrics>,
    /// Model-specific response fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_model_response_fields: Option<Value>,
    /// Guardrail trace, when tracing was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,
}

/// A lazy sequence of streaming events from one converse-stream RPC.
pub type EventStream = Pin<Box<dyn Stream<Item = std::result::Result<StreamEvent, RpcFailure>> + Send>>;

/// One authenticated, region-bound RPC client.
///
/// # Object Safety
///
/// Designed to be used as `Arc<dyn RpcClient>`.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Execute a blocking converse call.
    async fn converse(&self, args: &ConverseArgs) -> std::result::Result<RawConverseOutput, RpcFailure>;

    /// Open a streaming converse call.
    async fn converse_stream(&self, args: &ConverseArgs) -> std::result::Result<EventStream, RpcFailure>;

    /// The region this client is bound to.
    fn region(&self) -> &str;
}

/// Produces authenticated per-region RPC clients.
///
/// Credential resolution (named profiles, environment, instance roles) is the
/// implementor's concern; the relay only asks for a client per region.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Return a client bound to `region`, building one if necessary.
    async fn client_for(&self, region: &str) -> Result<Arc<dyn RpcClient>>;
}

/// Per-region client cache with single-flight initialization.
///
/// Concurrent first requests for the same region share one construction;
/// the lock around the map is held only to fetch the region's cell, never
/// across client construction.
pub struct ClientCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<dyn RpcClient>>>>>,
}

impl ClientCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Get the cached client for `region`, or initialize it with `init`.
    pub async fn get_or_init<F, Fut>(&self, region: &str, init: F) -> Result<Arc<dyn RpcClient>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Arc<dyn RpcClient>>>,
    {
        let cell = {
            let mut cells = self.cells.lock().expect("client cache lock poisoned");
            cells
                .entry(region.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let client = cell.get_or_try_init(init).await?;
        Ok(client.clone())
    }

    /// Number of initialized regions (for diagnostics).
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .expect("client cache lock poisoned")
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Whether no region has been initialized yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCache")
            .field("initialized_regions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullClient {
        region: String,
    }

    #[async_trait]
    impl RpcClient for NullClient {
        async fn converse(
            &self,
            _args: &ConverseArgs,
        ) -> std::result::Result<RawConverseOutput, RpcFailure> {
            Ok(RawConverseOutput::default())
        }

        async fn converse_stream(
            &self,
            _args: &ConverseArgs,
        ) -> std::result::Result<EventStream, RpcFailure> {
            Ok(Box::pin(futures::stream::empty()))
        }

        fn region(&self) -> &str {
            &self.region
        }
    }

    #[test]
    fn test_rpc_failure_display() {
        let failure = RpcFailure::new("too many requests").with_code("ThrottlingException");
        assert_eq!(failure.to_string(), "ThrottlingException: too many requests");
        let plain = RpcFailure::new("connection reset");
        assert_eq!(plain.to_string(), "connection reset");
    }

    #[test]
    fn test_converse_args_from_request() {
        let request = ConverseRequest::new(vec![Message::user("hi")]).with_system("be brief");
        let args = ConverseArgs::from_request(&request, "provider.model-v1");
        assert_eq!(args.model_id, "provider.model-v1");
        assert_eq!(args.messages.len(), 1);
        assert_eq!(args.system.len(), 1);
    }

    #[tokio::test]
    async fn test_client_cache_initializes_once_per_region() {
        let cache = ClientCache::new();
        let builds = AtomicUsize::new(0);

        for _ in 0..3 {
            let client = cache
                .get_or_init("us-east-1", || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(NullClient {
                        region: "us-east-1".into(),
                    }) as Arc<dyn RpcClient>)
                })
                .await
                .unwrap();
            assert_eq!(client.region(), "us-east-1");
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_client_cache_failed_init_retries() {
        let cache = ClientCache::new();
        let result = cache
            .get_or_init("eu-west-1", || async {
                Err(crate::error::RelayError::Authentication {
                    region: "eu-west-1".into(),
                    message: "no credentials".into(),
                })
            })
            .await;
        assert!(result.is_err());

        // A failed initialization leaves the cell empty for the next caller.
        let ok = cache
            .get_or_init("eu-west-1", || async {
                Ok(Arc::new(NullClient {
                    region: "eu-west-1".into(),
                }) as Arc<dyn RpcClient>)
            })
            .await;
        assert!(ok.is_ok());
    }
}
