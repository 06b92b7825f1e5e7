//! # llm-relay
//!
//! A resilient client library for cloud-hosted multi-model LLM inference
//! services that expose a "converse" RPC (blocking and streaming). The
//! provider offers many models, each available in a region-specific subset
//! of regions, plus cross-region inference profiles that front a model over
//! several regions; the set of workable (model, region) pairings drifts over
//! time and is discovered dynamically.
//!
//! The relay answers three questions under failure:
//!
//! - **Catalog** — given a friendly model name and a region, which concrete
//!   identifier (model id vs. inference-profile id) should be used, and is
//!   the pair reachable at all? See [`catalog::Catalog`].
//! - **Retry** — in what order should (model, region) targets be attempted,
//!   how are transient faults backed off, and when should a failure rewrite
//!   the request (disable a feature, strip a parameter) versus move to a
//!   different target? See [`retry::RetryManager`] and
//!   [`filter::ContentFilter`].
//! - **Parallel dispatch** — how should a batch of independent requests be
//!   spread across regions under a concurrency cap, with per-request
//!   timeouts and a failure-handling policy? See
//!   [`parallel::ParallelResponse`].
//!
//! ## Quick start
//!
//! ```no_run
//! use llm_relay::{Relay, Result};
//! use llm_relay::config::AuthConfig;
//! use llm_relay::types::{ConverseRequest, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let relay = Relay::builder()
//!         .models(["claude-3-haiku", "llama-3-70b-instruct"])
//!         .regions(["us-east-1", "us-west-2"])
//!         .auth_config(
//!             AuthConfig::new("https://runtime.{region}.provider.example/v1")
//!                 .with_api_key(std::env::var("PROVIDER_API_KEY").unwrap_or_default()),
//!         )
//!         .build()
//!         .await?;
//!
//!     // Blocking: retries, feature fallback, and region failover happen
//!     // behind this one call. The response carries the full attempt trail.
//!     let response = relay
//!         .converse(ConverseRequest::new(vec![Message::user("Hello!")]))
//!         .await?;
//!     println!("{}", response.content().unwrap_or_default());
//!
//!     // Streaming: iterate chunks, then read terminal metadata.
//!     let mut stream = relay
//!         .converse_stream(ConverseRequest::new(vec![Message::user("Tell a story")]))
//!         .await?;
//!     while let Some(chunk) = stream.next_chunk().await {
//!         print!("{chunk}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Testing without a provider
//!
//! [`transport::MockAuthenticator`] scripts per-(region, model) outcomes and
//! [`catalog::StaticDiscovery`] serves fixed listings, so the full retry and
//! streaming machinery runs deterministically in tests.

pub mod assembler;
pub mod catalog;
pub mod config;
pub mod error;
pub mod filter;
pub mod parallel;
pub mod relay;
pub mod response;
pub mod retry;
pub mod transport;
pub mod types;
pub mod validation;

pub use assembler::{CancelHandle, StreamOutcome, StreamingResponse};
pub use catalog::{AccessInfo, AccessMethod, AccessRecommendation, Catalog};
pub use config::{
    AuthConfig, CacheMode, CatalogOptions, FailureHandling, LoadBalancing, ParallelConfig,
    RetryConfig, RetryStrategy,
};
pub use error::{RelayError, Result};
pub use filter::ContentFilter;
pub use parallel::{ExecutionStats, ParallelOptions, ParallelResponse};
pub use relay::{ConverseOptions, Relay, RelayBuilder};
pub use response::{AttemptRecord, ConverseResponse, TokenUsage};
pub use retry::RetryManager;
pub use types::{ContentBlock, ConverseRequest, FeatureTag, Message, Role};
