//! Retry planning and per-failure decisions.
//!
//! [`RetryManager`] turns the configured model and region lists into an
//! ordered attempt plan (region-first or model-first), computes jitter-free
//! exponential backoff, and maps classified failures to [`RetryDecision`]s
//! the orchestrator executes.

pub mod classify;

pub use classify::{Classified, ErrorClass, PATTERN_TABLE_VERSION};

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tracing::debug;

use crate::catalog::{AccessInfo, CatalogSnapshot};
use crate::config::{RetryConfig, RetryStrategy};
use crate::transport::RpcFailure;
use crate::types::FeatureTag;

/// One planned (model, region) target with its resolved access info.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTarget {
    /// Friendly model name.
    pub model_name: String,
    /// Region to call.
    pub region: String,
    /// How the pair is reachable.
    pub access: AccessInfo,
}

/// Why the orchestrator is moving to the next target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Access-class failure on this target.
    Access,
    /// The per-target transient budget is spent.
    TransientExhausted,
    /// The model rejected a content block kind (never filtered away).
    ContentCompat(&'static str),
    /// A compatibility retry was already performed for this signature.
    CompatRetrySpent,
}

/// What to do about one failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Sleep, then retry the same target.
    RetryAfterBackoff(Duration),
    /// Disable the feature and retry the same target immediately.
    DisableFeatureAndRetry {
        /// Feature to disable.
        tag: FeatureTag,
        /// Classification table that matched, for the warning.
        table: &'static str,
    },
    /// Strip additional request fields and retry the same target.
    StripParameterAndRetry {
        /// The offending field, when the message named one.
        field: Option<String>,
    },
    /// Give up on this target and move to the next.
    NextTarget(SkipReason),
    /// Surface the failure; no recovery applies.
    Fail,
}

/// Drives target ordering, backoff, and failure decisions.
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    /// Build a manager from validated configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration in force.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Produce the ordered attempt plan for `models` x `regions`.
    ///
    /// Pairs the catalog cannot resolve are omitted, as are pairs already in
    /// `failed` (from earlier replans within the same call).
    pub fn plan_targets(
        &self,
        models: &[String],
        regions: &[String],
        snapshot: &CatalogSnapshot,
        failed: &HashSet<(String, String)>,
    ) -> Vec<PlannedTarget> {
        let mut plan = Vec::new();
        let mut push = |model: &String, region: &String| {
            if failed.contains(&(model.clone(), region.clone())) {
                return;
            }
            match snapshot.get_access_info(model, region) {
                Some(access) => plan.push(PlannedTarget {
                    model_name: model.clone(),
                    region: region.clone(),
                    access: access.clone(),
                }),
                None => {
                    debug!(model = %model, region = %region, "pair unreachable; omitted from plan");
                }
            }
        };

        match self.config.strategy {
            RetryStrategy::RegionFirst => {
                for model in models {
                    for region in regions {
                        push(model, region);
                    }
                }
            }
            RetryStrategy::ModelFirst => {
                for region in regions {
                    for model in models {
                        push(model, region);
                    }
                }
            }
        }
        plan
    }

    /// Backoff before attempt `n` (1-based) against one target. Zero for
    /// the first attempt; jitter-free multiplicative growth after.
    pub fn backoff_delay(&self, attempt_on_target: u32) -> Duration {
        self.config.delay_for_attempt(attempt_on_target)
    }

    /// Decide what to do about a failed attempt.
    ///
    /// `attempts_on_target` counts attempts already made against the current
    /// target; `disabled` is the feature set currently filtered out.
    pub fn decide(
        &self,
        failure: &RpcFailure,
        attempts_on_target: u32,
        disabled: &BTreeSet<FeatureTag>,
        additional_fields_present: bool,
    ) -> RetryDecision {
        let classified = classify::classify(failure, &self.config.extra_retryable_error_codes);
        match classified.class {
            ErrorClass::Transient => {
                if attempts_on_target < self.config.max_retries {
                    RetryDecision::RetryAfterBackoff(self.backoff_delay(attempts_on_target + 1))
                } else {
                    RetryDecision::NextTarget(SkipReason::TransientExhausted)
                }
            }
            ErrorClass::Access => RetryDecision::NextTarget(SkipReason::Access),
            ErrorClass::FeatureCompat(tag) => {
                if self.config.enable_feature_fallback && !disabled.contains(&tag) {
                    RetryDecision::DisableFeatureAndRetry {
                        tag,
                        table: classified.table,
                    }
                } else {
                    RetryDecision::NextTarget(SkipReason::CompatRetrySpent)
                }
            }
            ErrorClass::ParameterCompat(field) => {
                if additional_fields_present {
                    RetryDecision::StripParameterAndRetry { field }
                } else {
                    RetryDecision::NextTarget(SkipReason::CompatRetrySpent)
                }
            }
            ErrorClass::ContentCompat(kind) => {
                RetryDecision::NextTarget(SkipReason::ContentCompat(kind))
            }
            ErrorClass::NonRetryable => RetryDecision::Fail,
        }
    }
}
