//! Response objects: per-attempt records and the consolidated result of a
//! converse call.
//!
//! [`ConverseResponse`] always carries the full attempt trail — callers never
//! need to inspect an error to learn what was tried. Derived accessors pull
//! text, usage, and metrics out of the raw provider payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::access::AccessMethod;
use crate::transport::RawConverseOutput;
use crate::types::{ContentBlock, FeatureTag};

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Tokens consumed by the input.
    #[serde(default)]
    pub input_tokens: u64,
    /// Tokens generated.
    #[serde(default)]
    pub output_tokens: u64,
    /// Input plus output.
    #[serde(default)]
    pub total_tokens: u64,
    /// Tokens served from the prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    /// Tokens written to the prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_input_tokens: Option<u64>,
}

/// Provider-side timing for one RPC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMetrics {
    /// Provider-reported latency in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
}

/// One invocation of the RPC against one (model, region) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Model name attempted.
    pub model_name: String,
    /// Region attempted.
    pub region: String,
    /// Access method exercised (`Both` resolves to the route actually used).
    pub access_method: AccessMethod,
    /// 1-based position in the chronological attempt list.
    pub attempt_number: u32,
    /// When the attempt started.
    pub start_time: DateTime<Utc>,
    /// When the attempt completed. `None` while in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Stringified error for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttemptRecord {
    /// Start a new attempt record.
    pub fn start(
        model_name: impl Into<String>,
        region: impl Into<String>,
        access_method: AccessMethod,
        attempt_number: u32,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            region: region.into(),
            access_method,
            attempt_number,
            start_time: Utc::now(),
            end_time: None,
            success: false,
            error: None,
        }
    }

    /// Close the record as successful.
    pub fn succeed(&mut self) {
        self.end_time = Some(Utc::now());
        self.success = true;
    }

    /// Close the record as failed with an error description.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.end_time = Some(Utc::now());
        self.success = false;
        self.error = Some(error.into());
    }

    /// Duration in milliseconds, when complete.
    pub fn duration_ms(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1000.0)
    }
}

/// Aggregated timing and counting metrics derived from a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetrics {
    /// Provider-reported latency of the successful RPC.
    pub api_latency_ms: Option<u64>,
    /// Wall-clock time across all attempts.
    pub total_duration_ms: f64,
    /// Number of attempts made.
    pub attempts_made: usize,
    /// 1-based attempt number that succeeded, if any.
    pub successful_attempt_number: Option<u32>,
}

/// The consolidated result of a converse call.
///
/// # Example
///
/// ```no_run
/// # use llm_relay::response::ConverseResponse;
/// # fn show(response: ConverseResponse) {
/// if response.success {
///     println!("{}", response.content().unwrap_or_default());
/// } else {
///     eprintln!("failed after {} attempts", response.attempts.len());
/// }
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConverseResponse {
    /// Whether any attempt succeeded.
    pub success: bool,
    /// Raw provider payload from the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawConverseOutput>,
    /// Model name that succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    /// Region that succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_used: Option<String>,
    /// Access method of the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_method_used: Option<AccessMethod>,
    /// Every attempt, in chronological order.
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Wall-clock time across all attempts, in milliseconds.
    #[serde(default)]
    pub total_duration_ms: f64,
    /// Provider-reported latency of the successful RPC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_latency_ms: Option<u64>,
    /// Non-fatal diagnostics collected along the way.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Features disabled by compatibility fallback, in effect at completion.
    #[serde(default)]
    pub features_disabled: Vec<FeatureTag>,
}

impl ConverseResponse {
    /// Concatenated text of all text blocks in the output message, joined
    /// with newlines. `None` when unsuccessful or empty.
    pub fn content(&self) -> Option<String> {
        let raw = self.raw.as_ref()?;
        let parts: Vec<&str> = raw
            .output
            .message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// The output message's content blocks, in order.
    pub fn content_blocks(&self) -> &[ContentBlock] {
        self.raw
            .as_ref()
            .map(|raw| raw.output.message.content.as_slice())
            .unwrap_or(&[])
    }

    /// Token usage, when reported.
    pub fn usage(&self) -> Option<TokenUsage> {
        self.raw.as_ref().and_then(|raw| raw.usage)
    }

    /// The model's stop reason, when reported.
    pub fn stop_reason(&self) -> Option<&str> {
        self.raw.as_ref().and_then(|raw| raw.stop_reason.as_deref())
    }

    /// Model-specific response fields, when present.
    pub fn additional_response_fields(&self) -> Option<&Value> {
        self.raw
            .as_ref()
            .and_then(|raw| raw.additional_model_response_fields.as_ref())
    }

    /// Aggregated metrics across the attempt trail.
    pub fn metrics(&self) -> ResponseMetrics {
        ResponseMetrics {
            api_latency_ms: self.api_latency_ms,
            total_duration_ms: self.total_duration_ms,
            attempts_made: self.attempts.len(),
            successful_attempt_number: self
                .attempts
                .iter()
                .find(|a| a.success)
                .map(|a| a.attempt_number),
        }
    }

    /// The error from the most recent failed attempt.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.error.as_deref())
    }

    /// All attempt errors, in chronological order.
    pub fn all_errors(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .filter_map(|a| a.error.as_deref())
            .collect()
    }

    /// Serialize the response (attempt trail included) to JSON.
    pub fn to_json(&self, pretty: bool) -> crate::error::Result<String> {
        let text = if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        };
        Ok(text)
    }

    /// Deserialize a response previously produced by [`to_json`].
    ///
    /// [`to_json`]: Self::to_json
    pub fn from_json(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
