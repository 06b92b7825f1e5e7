use thiserror::Error;

use crate::transport::RpcFailure;

/// Errors produced by the relay and its components.
///
/// The retry layer recovers transient and compatibility errors internally;
/// what surfaces here is configuration faults, validation faults, and
/// terminal failures. A failed `converse` call normally reports through
/// `ConverseResponse { success: false, .. }` — these variants are raised by
/// the strict entry points and by preflight checks.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid relay, catalog, or retry configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credential resolution or client construction failed for a region.
    #[error("authentication failed for region {region}: {message}")]
    Authentication {
        /// Region whose client could not be built.
        region: String,
        /// Underlying failure description.
        message: String,
    },

    /// A (model, region) pair could not be accessed at all.
    #[error("model access failed: {message}")]
    ModelAccess {
        /// Failure description.
        message: String,
        /// Model name, when known.
        model: Option<String>,
        /// Region, when known.
        region: Option<String>,
    },

    /// Every planned (model, region) target was tried and failed.
    #[error("all retry targets exhausted after {attempts_made} attempts")]
    RetryExhausted {
        /// Total attempts made.
        attempts_made: usize,
        /// Stringified errors from the failed attempts, in order.
        last_errors: Vec<String>,
        /// Distinct models tried.
        models_tried: Vec<String>,
        /// Distinct regions tried.
        regions_tried: Vec<String>,
    },

    /// The request failed shape or range validation.
    #[error("request validation failed: {validation_errors:?}")]
    RequestValidation {
        /// Human-readable validation messages.
        validation_errors: Vec<String>,
        /// Paths of the offending fields.
        invalid_fields: Vec<String>,
    },

    /// A streaming operation failed terminally.
    #[error("streaming failed at position {stream_position}: {message}")]
    Streaming {
        /// Failure description.
        message: String,
        /// Byte position in the assembled content at failure time.
        stream_position: usize,
        /// Content collected before the failure.
        partial_content: String,
    },

    /// Content processing failed (oversize payload, unsupported encoding).
    #[error("content error: {0}")]
    Content(String),

    /// Invalid parallel-executor configuration.
    #[error("parallel configuration error: {0}")]
    ParallelConfiguration(String),

    /// A parallel batch failed as a whole.
    #[error("parallel execution failed: {failed_requests} of {total_requests} requests failed")]
    ParallelExecution {
        /// Number of failed requests.
        failed_requests: usize,
        /// Batch size.
        total_requests: usize,
    },

    /// Region assignment could not be computed.
    #[error("region distribution error: {0}")]
    RegionDistribution(String),

    /// A request exceeded its per-request timeout.
    #[error("request timed out after {timeout_ms} ms")]
    RequestTimeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Two or more requests in a batch share a request id.
    #[error("duplicate request ids in batch: {ids:?}")]
    RequestIdCollision {
        /// The colliding ids.
        ids: Vec<String>,
    },

    /// A provider RPC failed and was not recovered.
    #[error("provider call failed: {0}")]
    Rpc(#[from] RpcFailure),

    /// Low-level HTTP transport failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failed.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled via its cancellation handle.
    #[error("operation was cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
