//! Parallel batch execution.
//!
//! `converse_parallel` spreads independent requests across regions under a
//! bounded concurrency pool, runs each through the single-request
//! orchestrator, and aggregates per-request outcomes under a
//! failure-handling policy. Results are keyed by `request_id`; there is no
//! cross-request ordering guarantee.

pub mod distributor;

pub use distributor::{RegionAssignment, RegionDistributor};

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::assembler::CancelHandle;
use crate::config::FailureHandling;
use crate::error::{RelayError, Result};
use crate::relay::Relay;
use crate::response::ConverseResponse;
use crate::types::ConverseRequest;
use crate::validation::{check_id_collisions, validate_request};

/// Aggregate timing and distribution statistics for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionStats {
    /// Batch size.
    pub total: usize,
    /// Requests that succeeded.
    pub successful: usize,
    /// Requests that failed (cancelled and timed-out included).
    pub failed: usize,
    /// Mean per-request duration in milliseconds.
    pub avg_duration_ms: f64,
    /// Longest per-request duration.
    pub max_duration_ms: f64,
    /// Shortest per-request duration.
    pub min_duration_ms: f64,
    /// High-water mark of concurrently running requests.
    pub max_observed_concurrency: usize,
    /// Successful attempts per region.
    pub region_distribution: BTreeMap<String, usize>,
}

impl ExecutionStats {
    /// Fraction of requests that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }
}

/// The result of one batch.
#[derive(Debug, Default)]
pub struct ParallelResponse {
    /// Whether the batch met its failure policy.
    pub overall_success: bool,
    /// Per-request responses, keyed by request id.
    pub per_request: BTreeMap<String, ConverseResponse>,
    /// Wall-clock duration of the whole batch in milliseconds.
    pub total_duration_ms: f64,
    /// Aggregate statistics.
    pub stats: ExecutionStats,
    /// Batch-level diagnostics (auto-adjusted K, join faults).
    pub warnings: Vec<String>,
}

impl ParallelResponse {
    /// Ids of successful requests.
    pub fn successful_ids(&self) -> Vec<&str> {
        self.per_request
            .iter()
            .filter(|(_, r)| r.success)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Ids of failed requests.
    pub fn failed_ids(&self) -> Vec<&str> {
        self.per_request
            .iter()
            .filter(|(_, r)| !r.success)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// The response for one request id.
    pub fn response_for(&self, request_id: &str) -> Option<&ConverseResponse> {
        self.per_request.get(request_id)
    }

    /// Fraction of requests that succeeded.
    pub fn success_rate(&self) -> f64 {
        self.stats.success_rate()
    }
}

/// Per-batch options for `converse_parallel_with`.
#[derive(Debug, Clone, Default)]
pub struct ParallelOptions {
    /// Regions to assign per request. Defaults to
    /// `min(max_concurrent_requests, |regions|)` with a warning.
    pub target_regions_per_request: Option<usize>,
    /// External cancellation handle for the whole batch.
    pub cancel: Option<CancelHandle>,
}

impl ParallelOptions {
    /// Set the regions-per-request count.
    pub fn with_target_regions(mut self, k: usize) -> Self {
        self.target_regions_per_request = Some(k);
        self
    }

    /// Attach a cancellation handle.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

fn cancelled_response(reason: &str) -> ConverseResponse {
    ConverseResponse {
        success: false,
        warnings: vec![reason.to_string()],
        ..ConverseResponse::default()
    }
}

impl Relay {
    /// Execute a batch of independent requests with default options.
    pub async fn converse_parallel(
        &self,
        requests: Vec<ConverseRequest>,
    ) -> Result<ParallelResponse> {
        self.converse_parallel_with(requests, ParallelOptions::default())
            .await
    }

    /// Execute a batch of independent requests.
    ///
    /// Preflight validates id uniqueness and request shape before any RPC.
    /// Requests without an id are assigned `request-{n}` ids.
    pub async fn converse_parallel_with(
        &self,
        mut requests: Vec<ConverseRequest>,
        options: ParallelOptions,
    ) -> Result<ParallelResponse> {
        let config = self.core.parallel_config.clone();
        let started = Instant::now();
        let mut warnings = Vec::new();

        if requests.is_empty() {
            return Err(RelayError::ParallelConfiguration(
                "batch must contain at least one request".into(),
            ));
        }

        // Preflight: id uniqueness, then shape, before any RPC.
        check_id_collisions(&requests)?;
        let mut per_request_warnings = Vec::with_capacity(requests.len());
        for request in &requests {
            per_request_warnings.push(validate_request(request)?);
        }

        // Assign ids to requests that lack one, avoiding caller-chosen ids.
        let mut used: HashSet<String> = requests
            .iter()
            .filter_map(|r| r.request_id.clone())
            .collect();
        let mut counter = 0usize;
        for request in &mut requests {
            if request.request_id.is_none() {
                let id = loop {
                    let candidate = format!("request-{counter}");
                    counter += 1;
                    if used.insert(candidate.clone()) {
                        break candidate;
                    }
                };
                request.request_id = Some(id);
            }
        }

        let k = match options.target_regions_per_request {
            Some(k) => k,
            None => {
                let derived = config
                    .max_concurrent_requests
                    .min(self.core.regions.len())
                    .max(1);
                warnings.push(format!(
                    "auto-adjusted target_regions_per_request to {derived} \
                     (min of max_concurrent_requests={} and available_regions={})",
                    config.max_concurrent_requests,
                    self.core.regions.len()
                ));
                derived
            }
        };

        // Dispatch order: priority first when enabled, submission order
        // otherwise (the sort is stable).
        let mut items: Vec<(ConverseRequest, Vec<String>)> =
            requests.into_iter().zip(per_request_warnings).collect();
        if config.enable_request_prioritization {
            items.sort_by_key(|(request, _)| std::cmp::Reverse(request.priority));
        }

        let mut distributor =
            RegionDistributor::new(config.load_balancing, self.core.regions.to_vec())?;
        let mut assignments = Vec::with_capacity(items.len());
        for (request, _) in &items {
            let id = request.request_id.clone().unwrap_or_default();
            let assignment = distributor.assign(&id, k, request.priority)?;
            assignments.push(assignment);
        }

        let total = items.len();
        info!(
            total,
            k,
            max_concurrent = config.max_concurrent_requests,
            "dispatching parallel batch"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let failed_count = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak_concurrency = Arc::new(AtomicUsize::new(0));
        let cancel = options.cancel.unwrap_or_default();

        let mut join_set: JoinSet<(String, ConverseResponse)> = JoinSet::new();
        for ((request, request_warnings), assignment) in items.into_iter().zip(assignments) {
            let core = self.core.clone();
            let semaphore = semaphore.clone();
            let stop_flag = stop_flag.clone();
            let failed_count = failed_count.clone();
            let in_flight = in_flight.clone();
            let peak_concurrency = peak_concurrency.clone();
            let cancel = cancel.clone();
            let config = config.clone();

            join_set.spawn(async move {
                let id = assignment.request_id.clone();
                if stop_flag.load(Ordering::Relaxed) || cancel.is_cancelled() {
                    return (id, cancelled_response("cancelled before dispatch"));
                }
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (id, cancelled_response("cancelled before dispatch"));
                };
                if stop_flag.load(Ordering::Relaxed) || cancel.is_cancelled() {
                    return (id, cancelled_response("cancelled before dispatch"));
                }

                let depth = in_flight.fetch_add(1, Ordering::Relaxed) + 1;
                peak_concurrency.fetch_max(depth, Ordering::Relaxed);

                let outcome = tokio::time::timeout(
                    config.per_request_timeout,
                    core.run_blocking(
                        request,
                        &core.models,
                        &assignment.assigned_regions,
                        request_warnings,
                        &cancel,
                    ),
                )
                .await;
                in_flight.fetch_sub(1, Ordering::Relaxed);

                let response = match outcome {
                    Ok(Ok(response)) => response,
                    Ok(Err(error)) => cancelled_response(&error.to_string()),
                    Err(_) => {
                        let timeout_ms = config.per_request_timeout.as_millis() as u64;
                        cancelled_response(
                            &RelayError::RequestTimeout { timeout_ms }.to_string(),
                        )
                    }
                };

                if !response.success {
                    let failed = failed_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if config.failure_handling == FailureHandling::StopOnThreshold
                        && failed as f64 / total as f64 > config.failure_threshold
                    {
                        warn!(
                            failed,
                            total, "failure threshold exceeded; cancelling queued requests"
                        );
                        stop_flag.store(true, Ordering::Relaxed);
                    }
                }
                (id, response)
            });
        }

        let mut per_request = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, response)) => {
                    per_request.insert(id, response);
                }
                Err(join_error) => {
                    warnings.push(format!("batch worker failed: {join_error}"));
                }
            }
        }

        let stats = compute_stats(
            &per_request,
            peak_concurrency.load(Ordering::Relaxed),
        );
        let failure_rate = if stats.total == 0 {
            1.0
        } else {
            stats.failed as f64 / stats.total as f64
        };
        let overall_success = match config.failure_handling {
            FailureHandling::StopOnThreshold => failure_rate <= 1.0 - config.failure_threshold,
            FailureHandling::ContinueOnFailure => stats.failed == 0,
        };

        Ok(ParallelResponse {
            overall_success,
            per_request,
            total_duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            stats,
            warnings,
        })
    }
}

fn compute_stats(
    per_request: &BTreeMap<String, ConverseResponse>,
    max_observed_concurrency: usize,
) -> ExecutionStats {
    let total = per_request.len();
    let successful = per_request.values().filter(|r| r.success).count();
    let durations: Vec<f64> = per_request
        .values()
        .map(|r| r.total_duration_ms)
        .collect();
    let mut region_distribution: BTreeMap<String, usize> = BTreeMap::new();
    for response in per_request.values() {
        for attempt in response.attempts.iter().filter(|a| a.success) {
            *region_distribution.entry(attempt.region.clone()).or_insert(0) += 1;
        }
    }
    let sum: f64 = durations.iter().sum();
    let min_duration_ms = if durations.is_empty() {
        0.0
    } else {
        durations.iter().copied().fold(f64::INFINITY, f64::min)
    };
    ExecutionStats {
        total,
        successful,
        failed: total - successful,
        avg_duration_ms: if total == 0 { 0.0 } else { sum / total as f64 },
        max_duration_ms: durations.iter().copied().fold(0.0, f64::max),
        min_duration_ms,
        max_observed_concurrency,
        region_distribution,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BaseModelListing, ProfileListing, StaticDiscovery};
    use crate::config::{CacheMode, CatalogOptions, LoadBalancing, ParallelConfig, RetryConfig};
    use crate::transport::{MockAuthenticator, MockOutcome};
    use crate::types::Message;
    use std::time::Duration;

    fn discovery() -> StaticDiscovery {
        StaticDiscovery::new(
            vec![
                BaseModelListing {
                    model_name: "model-a".into(),
                    model_id: "id.a".into(),
                    provider: "acme".into(),
                    regions: vec![],
                    input_modalities: vec!["text".into()],
                    output_modalities: vec!["text".into()],
                    streaming_supported: true,
                },
                BaseModelListing {
                    model_name: "model-b".into(),
                    model_id: "id.b".into(),
                    provider: "acme".into(),
                    regions: vec!["r1".into(), "r2".into()],
                    input_modalities: vec!["text".into()],
                    output_modalities: vec!["text".into()],
                    streaming_supported: true,
                },
            ],
            vec![ProfileListing {
                inference_profile_id: "profile.a".into(),
                model_name: "model-a".into(),
                regions: vec!["r1".into()],
            }],
        )
    }

    async fn relay(mock: &MockAuthenticator, parallel: ParallelConfig) -> Relay {
        Relay::builder()
            .models(["model-a", "model-b"])
            .regions(["r1", "r2"])
            .discovery(std::sync::Arc::new(discovery()))
            .authenticator(std::sync::Arc::new(mock.clone()))
            .retry_config(RetryConfig::default().with_base_delay(Duration::from_millis(5)))
            .parallel_config(parallel)
            .catalog_options(CatalogOptions::default().with_cache_mode(CacheMode::None))
            .build()
            .await
            .unwrap()
    }

    fn request(id: &str) -> ConverseRequest {
        ConverseRequest::new(vec![Message::user("hi")]).with_request_id(id)
    }

    #[tokio::test]
    async fn test_s5_id_collision_fails_before_dispatch() {
        let mock = MockAuthenticator::new();
        let relay = relay(&mock, ParallelConfig::default()).await;
        let batch = vec![request("r1"), request("r2"), request("r1")];

        match relay.converse_parallel(batch).await {
            Err(RelayError::RequestIdCollision { ids }) => assert_eq!(ids, vec!["r1"]),
            other => panic!("expected id collision, got {other:?}"),
        }
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_auto_k_emits_exactly_one_warning() {
        let mock = MockAuthenticator::new();
        mock.script(
            "r1",
            "profile.a",
            vec![
                MockOutcome::Reply("one".into()),
                MockOutcome::Reply("two".into()),
            ],
        );
        let relay = relay(
            &mock,
            ParallelConfig::default().with_max_concurrent(2),
        )
        .await;

        let response = relay
            .converse_parallel(vec![request("a"), request("b")])
            .await
            .unwrap();

        let auto_warnings: Vec<&String> = response
            .warnings
            .iter()
            .filter(|w| w.contains("auto-adjusted target_regions_per_request to 2"))
            .collect();
        assert_eq!(auto_warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_success_and_stats() {
        let mock = MockAuthenticator::new();
        mock.script(
            "r1",
            "profile.a",
            vec![
                MockOutcome::Reply("one".into()),
                MockOutcome::Reply("two".into()),
                MockOutcome::Reply("three".into()),
            ],
        );
        let relay = relay(&mock, ParallelConfig::default().with_max_concurrent(2)).await;

        let response = relay
            .converse_parallel_with(
                vec![request("a"), request("b"), request("c")],
                ParallelOptions::default().with_target_regions(2),
            )
            .await
            .unwrap();

        assert!(response.overall_success);
        assert_eq!(response.per_request.len(), 3);
        assert_eq!(response.stats.total, 3);
        assert_eq!(response.stats.successful, 3);
        assert_eq!(response.stats.failed, 0);
        assert_eq!(response.stats.region_distribution.get("r1"), Some(&3));
        assert!(response.stats.max_observed_concurrency <= 2);
        assert!(response.stats.max_observed_concurrency >= 1);
        assert_eq!(response.success_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_continue_on_failure_reports_partial_success() {
        let mock = MockAuthenticator::new();
        // K=1, round-robin over [r1, r2]: a -> r1, b -> r2, c -> r1.
        // Requests confined to r2 can only reach model-b, which is
        // unscripted there and fails; r1 requests succeed via the profile.
        mock.script(
            "r1",
            "profile.a",
            vec![
                MockOutcome::Reply("one".into()),
                MockOutcome::Reply("three".into()),
            ],
        );
        let relay = relay(&mock, ParallelConfig::default().with_max_concurrent(1)).await;

        let response = relay
            .converse_parallel_with(
                vec![request("a"), request("b"), request("c")],
                ParallelOptions::default().with_target_regions(1),
            )
            .await
            .unwrap();

        assert!(!response.overall_success);
        assert_eq!(response.stats.successful, 2);
        assert_eq!(response.stats.failed, 1);
        assert_eq!(response.failed_ids(), vec!["b"]);
        assert!(!response.response_for("b").unwrap().success);
        assert_eq!(response.success_rate(), 2.0 / 3.0);
    }

    #[tokio::test]
    async fn test_stop_on_threshold_cancels_queued_requests() {
        let mock = MockAuthenticator::new();
        // Nothing scripted in r1: the first dispatched request fails after
        // walking its targets, tripping the 0.2 threshold immediately.
        let relay = relay(
            &mock,
            ParallelConfig::default()
                .with_max_concurrent(1)
                .with_failure_handling(FailureHandling::StopOnThreshold)
                .with_failure_threshold(0.2),
        )
        .await;

        let response = relay
            .converse_parallel_with(
                vec![request("a"), request("b"), request("c"), request("d")],
                ParallelOptions::default().with_target_regions(1),
            )
            .await
            .unwrap();

        assert!(!response.overall_success);
        assert_eq!(response.stats.failed, 4);
        let cancelled = response
            .per_request
            .values()
            .filter(|r| r.warnings.iter().any(|w| w.contains("cancelled before dispatch")))
            .count();
        assert!(cancelled >= 1, "queued requests should be cancelled");
    }

    #[tokio::test]
    async fn test_per_request_timeout() {
        let mock = MockAuthenticator::new();
        mock.script(
            "r1",
            "profile.a",
            vec![MockOutcome::ReplyAfter(
                Duration::from_millis(500),
                "too slow".into(),
            )],
        );
        let relay = relay(
            &mock,
            ParallelConfig::default()
                .with_max_concurrent(1)
                .with_timeout(Duration::from_millis(40)),
        )
        .await;

        let response = relay
            .converse_parallel_with(
                vec![request("slow")],
                ParallelOptions::default().with_target_regions(1),
            )
            .await
            .unwrap();

        let slow = response.response_for("slow").unwrap();
        assert!(!slow.success);
        assert!(slow.warnings.iter().any(|w| w.contains("timed out")));
    }

    #[tokio::test]
    async fn test_prioritization_orders_assignment() {
        let mock = MockAuthenticator::new();
        mock.script("r1", "profile.a", vec![MockOutcome::Reply("first".into())]);
        mock.script("r2", "id.b", vec![MockOutcome::Reply("second".into())]);
        let relay = relay(&mock, ParallelConfig::default().with_max_concurrent(1)).await;

        // The high-priority request is assigned first and therefore gets
        // the first round-robin slot (r1).
        let low = request("low").with_priority(1);
        let high = request("high").with_priority(9);
        let response = relay
            .converse_parallel_with(
                vec![low, high],
                ParallelOptions::default().with_target_regions(1),
            )
            .await
            .unwrap();

        assert_eq!(
            response.response_for("high").unwrap().region_used.as_deref(),
            Some("r1")
        );
        assert_eq!(
            response.response_for("low").unwrap().region_used.as_deref(),
            Some("r2")
        );
    }

    #[tokio::test]
    async fn test_missing_ids_are_assigned() {
        let mock = MockAuthenticator::new();
        mock.script(
            "r1",
            "profile.a",
            vec![
                MockOutcome::Reply("one".into()),
                MockOutcome::Reply("two".into()),
            ],
        );
        let relay = relay(&mock, ParallelConfig::default()).await;

        let batch = vec![
            ConverseRequest::new(vec![Message::user("x")]),
            ConverseRequest::new(vec![Message::user("y")]),
        ];
        let response = relay
            .converse_parallel_with(batch, ParallelOptions::default().with_target_regions(2))
            .await
            .unwrap();
        assert!(response.per_request.contains_key("request-0"));
        assert!(response.per_request.contains_key("request-1"));
    }

    #[tokio::test]
    async fn test_batch_cancellation() {
        let mock = MockAuthenticator::new();
        let relay = relay(&mock, ParallelConfig::default()).await;
        let cancel = CancelHandle::new();
        cancel.cancel();

        let response = relay
            .converse_parallel_with(
                vec![request("a"), request("b")],
                ParallelOptions::default()
                    .with_target_regions(1)
                    .with_cancel(cancel),
            )
            .await
            .unwrap();
        assert!(!response.overall_success);
        assert_eq!(response.stats.failed, 2);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_least_loaded_strategy_spreads_requests() {
        let mock = MockAuthenticator::new();
        mock.script("r1", "profile.a", vec![MockOutcome::Reply("r1 reply".into())]);
        mock.script("r2", "id.b", vec![MockOutcome::Reply("r2 reply".into())]);
        let relay = relay(
            &mock,
            ParallelConfig::default()
                .with_max_concurrent(1)
                .with_load_balancing(LoadBalancing::LeastLoaded),
        )
        .await;

        let response = relay
            .converse_parallel_with(
                vec![request("a"), request("b")],
                ParallelOptions::default().with_target_regions(1),
            )
            .await
            .unwrap();

        let regions: std::collections::HashSet<_> = response
            .per_request
            .values()
            .filter_map(|r| r.region_used.clone())
            .collect();
        assert_eq!(regions.len(), 2, "both regions should be used");
    }
}
