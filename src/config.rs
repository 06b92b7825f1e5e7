//! Relay configuration: retry policy, parallel execution, transport, and
//! catalog caching.
//!
//! Every config type validates itself via `validate()`; the
//! [`RelayBuilder`](crate::relay::RelayBuilder) calls these at build time so
//! misconfiguration fails before any RPC is made.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Order in which (model, region) targets are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// For each model in order, iterate regions in order. Default.
    RegionFirst,
    /// For each region in order, iterate models in order.
    ModelFirst,
}

/// Configuration for retry behavior.
///
/// Backoff is jitter-free multiplicative growth: the delay before attempt
/// `n` against the *same* target (`n >= 2`) is
/// `min(base_delay * multiplier^(n-2), max_delay)`. Attempts against
/// different targets do not sleep.
///
/// # Example
///
/// ```
/// use llm_relay::config::{RetryConfig, RetryStrategy};
/// use std::time::Duration;
///
/// let config = RetryConfig::default()
///     .with_strategy(RetryStrategy::ModelFirst)
///     .with_max_retries(6);
/// assert_eq!(config.base_delay, Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts against one target (initial call included). Default: 4.
    pub max_retries: u32,
    /// Delay before the second attempt on a target. Default: 500ms.
    pub base_delay: Duration,
    /// Cap on any single backoff delay. Default: 8s.
    pub max_delay: Duration,
    /// Multiplier applied per additional attempt. Default: 2.0.
    pub multiplier: f64,
    /// Target ordering strategy. Default: region-first.
    pub strategy: RetryStrategy,
    /// Whether compatibility errors may disable features and retry.
    /// Default: `true`.
    pub enable_feature_fallback: bool,
    /// Whether a mid-stream fault may continue on another target with the
    /// partial content as an assistant prefix. Default: `true`.
    pub enable_mid_stream_recovery: bool,
    /// Additional provider error codes treated as transient.
    pub extra_retryable_error_codes: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            strategy: RetryStrategy::RegionFirst,
            enable_feature_fallback: true,
            enable_mid_stream_recovery: true,
            extra_retryable_error_codes: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Set the per-target attempt cap.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the initial backoff delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the target ordering strategy.
    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enable or disable feature fallback.
    pub fn with_feature_fallback(mut self, enabled: bool) -> Self {
        self.enable_feature_fallback = enabled;
        self
    }

    /// Enable or disable mid-stream recovery.
    pub fn with_mid_stream_recovery(mut self, enabled: bool) -> Self {
        self.enable_mid_stream_recovery = enabled;
        self
    }

    /// Treat additional provider error codes as transient.
    pub fn with_extra_retryable_codes(mut self, codes: Vec<String>) -> Self {
        self.extra_retryable_error_codes = codes;
        self
    }

    /// Delay before attempt `n` (1-based) against the same target.
    ///
    /// Returns zero for the first attempt. Grows multiplicatively and is
    /// capped at `max_delay`. No jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 2);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(RelayError::Configuration(
                "retry max_retries must be positive".into(),
            ));
        }
        if self.multiplier <= 0.0 {
            return Err(RelayError::Configuration(
                "retry multiplier must be positive".into(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(RelayError::Configuration(
                "retry max_delay must be >= base_delay".into(),
            ));
        }
        Ok(())
    }
}

/// What the parallel executor does when requests start failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureHandling {
    /// Run every request regardless of failures. Default.
    ContinueOnFailure,
    /// Once `failed/total > failure_threshold`, cancel not-yet-started
    /// requests. In-flight requests run to completion.
    StopOnThreshold,
}

/// How the parallel executor assigns regions to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Deterministic cycle through configured regions, offset advancing per
    /// request. Default.
    RoundRobin,
    /// Uniform-random permutation per request.
    Random,
    /// Pick the regions with the fewest dispatches so far (best-effort,
    /// process-local).
    LeastLoaded,
}

/// Configuration for parallel batch execution.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Bounded concurrency for in-flight requests. Default: 5.
    pub max_concurrent_requests: usize,
    /// Per-request wall-clock budget. Default: 300s.
    pub per_request_timeout: Duration,
    /// Failure policy. Default: continue-on-failure.
    pub failure_handling: FailureHandling,
    /// Failure-rate trigger for [`FailureHandling::StopOnThreshold`], in
    /// `[0, 1]`. Default: 0.5.
    pub failure_threshold: f64,
    /// Region assignment strategy. Default: round-robin.
    pub load_balancing: LoadBalancing,
    /// Dispatch higher-priority requests first. Default: `true`.
    pub enable_request_prioritization: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            per_request_timeout: Duration::from_secs(300),
            failure_handling: FailureHandling::ContinueOnFailure,
            failure_threshold: 0.5,
            load_balancing: LoadBalancing::RoundRobin,
            enable_request_prioritization: true,
        }
    }
}

impl ParallelConfig {
    /// Set the concurrency cap.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_request_timeout = timeout;
        self
    }

    /// Set the failure policy.
    pub fn with_failure_handling(mut self, handling: FailureHandling) -> Self {
        self.failure_handling = handling;
        self
    }

    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the load-balancing strategy.
    pub fn with_load_balancing(mut self, strategy: LoadBalancing) -> Self {
        self.load_balancing = strategy;
        self
    }

    /// Enable or disable request prioritization.
    pub fn with_prioritization(mut self, enabled: bool) -> Self {
        self.enable_request_prioritization = enabled;
        self
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(RelayError::ParallelConfiguration(
                "max_concurrent_requests must be positive".into(),
            ));
        }
        if self.per_request_timeout.is_zero() {
            return Err(RelayError::ParallelConfiguration(
                "per_request_timeout must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(RelayError::ParallelConfiguration(
                "failure_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Where the model catalog persists its discovery data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Durable JSON blob on disk, shared across processes.
    File,
    /// Process-lifetime cache; survives catalog reconstruction, not restarts.
    Memory,
    /// No cache. Each construction refetches or uses the bundled snapshot.
    None,
}

/// Transport configuration for the default HTTP authenticator.
///
/// `endpoint_template` and `discovery_endpoint_template` must contain a
/// `{region}` placeholder; actual credential resolution beyond a bearer key
/// is the caller's concern (supply a custom
/// [`Authenticator`](crate::transport::Authenticator) for anything richer).
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Converse RPC endpoint template, e.g.
    /// `https://runtime.{region}.provider.example/v1`.
    pub endpoint_template: String,
    /// Discovery endpoint template. Defaults to `endpoint_template`.
    pub discovery_endpoint_template: Option<String>,
    /// Bearer token sent as `Authorization: Bearer {key}` when set.
    pub api_key: Option<String>,
    /// Per-request HTTP timeout. Default: 120s.
    pub request_timeout: Duration,
}

impl AuthConfig {
    /// Build a transport config from an endpoint template.
    pub fn new(endpoint_template: impl Into<String>) -> Self {
        Self {
            endpoint_template: endpoint_template.into(),
            discovery_endpoint_template: None,
            api_key: None,
            request_timeout: Duration::from_secs(120),
        }
    }

    /// Set the bearer API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set a separate discovery endpoint template.
    pub fn with_discovery_endpoint(mut self, template: impl Into<String>) -> Self {
        self.discovery_endpoint_template = Some(template.into());
        self
    }

    /// Set the HTTP request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Endpoint for a concrete region.
    pub fn endpoint_for(&self, region: &str) -> String {
        self.endpoint_template.replace("{region}", region)
    }

    /// Discovery endpoint for a concrete region.
    pub fn discovery_endpoint_for(&self, region: &str) -> String {
        self.discovery_endpoint_template
            .as_deref()
            .unwrap_or(&self.endpoint_template)
            .replace("{region}", region)
    }

    /// Validate the templates.
    pub fn validate(&self) -> Result<()> {
        if !self.endpoint_template.contains("{region}") {
            return Err(RelayError::Configuration(
                "endpoint_template must contain a {region} placeholder".into(),
            ));
        }
        if let Some(t) = &self.discovery_endpoint_template {
            if !t.contains("{region}") {
                return Err(RelayError::Configuration(
                    "discovery_endpoint_template must contain a {region} placeholder".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Catalog construction options.
#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// Cache mode. Default: memory.
    pub cache_mode: CacheMode,
    /// Directory for the cache blob in [`CacheMode::File`].
    pub cache_directory: Option<PathBuf>,
    /// Age past which a cached catalog is refetched. Default: 24h.
    pub max_cache_age: Duration,
    /// Fuzzy model-name correlation across discovery sources. Off by
    /// default; every fuzzy link is logged with both name strings.
    pub enable_fuzzy_matching: bool,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Memory,
            cache_directory: None,
            max_cache_age: Duration::from_secs(24 * 60 * 60),
            enable_fuzzy_matching: false,
        }
    }
}

impl CatalogOptions {
    /// Set the cache mode.
    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Set the cache directory.
    pub fn with_cache_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_directory = Some(dir.into());
        self
    }

    /// Set the cache expiry age.
    pub fn with_max_cache_age(mut self, age: Duration) -> Self {
        self.max_cache_age = age;
        self
    }

    /// Enable fuzzy name correlation.
    pub fn with_fuzzy_matching(mut self, enabled: bool) -> Self {
        self.enable_fuzzy_matching = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.base_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(8));
        assert_eq!(config.multiplier, 2.0);
        assert_eq!(config.strategy, RetryStrategy::RegionFirst);
        assert!(config.enable_feature_fallback);
        config.validate().unwrap();
    }

    #[test]
    fn test_backoff_delay_growth_and_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(8));
        // Capped from here on
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_monotonic() {
        let config = RetryConfig::default();
        let mut prev = Duration::ZERO;
        for attempt in 1..12 {
            let d = config.delay_for_attempt(attempt);
            assert!(d >= prev, "delay shrank at attempt {}", attempt);
            assert!(d <= config.max_delay);
            prev = d;
        }
    }

    #[test]
    fn test_retry_validation() {
        assert!(RetryConfig::default().with_max_retries(0).validate().is_err());
        assert!(RetryConfig::default().with_multiplier(0.0).validate().is_err());
        assert!(RetryConfig::default()
            .with_max_delay(Duration::from_millis(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_parallel_defaults() {
        let config = ParallelConfig::default();
        assert_eq!(config.max_concurrent_requests, 5);
        assert_eq!(config.per_request_timeout, Duration::from_secs(300));
        assert_eq!(config.failure_handling, FailureHandling::ContinueOnFailure);
        assert_eq!(config.load_balancing, LoadBalancing::RoundRobin);
        assert_eq!(config.failure_threshold, 0.5);
        assert!(config.enable_request_prioritization);
        config.validate().unwrap();
    }

    #[test]
    fn test_parallel_validation() {
        assert!(ParallelConfig::default()
            .with_max_concurrent(0)
            .validate()
            .is_err());
        assert!(ParallelConfig::default()
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ParallelConfig::default()
            .with_failure_threshold(1.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_auth_config_templates() {
        let auth = AuthConfig::new("https://runtime.{region}.example.com/v1");
        auth.validate().unwrap();
        assert_eq!(
            auth.endpoint_for("us-east-1"),
            "https://runtime.us-east-1.example.com/v1"
        );
        assert!(AuthConfig::new("https://fixed.example.com").validate().is_err());
    }
}
