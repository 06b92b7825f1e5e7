//! The single-request orchestrator.
//!
//! [`Relay`] composes catalog, retry manager, content filter, and transport
//! into `converse` / `converse_stream` calls that survive throttling, access
//! failures, and feature incompatibilities by rewriting the request or
//! moving to the next (model, region) target. The retry loop is strictly
//! sequential per request; the final response always carries the full
//! attempt trail.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assembler::{
    AssembledEvent, CancelHandle, ResponseAssembler, StreamEvent, StreamOutcome,
    StreamingResponse,
};
use crate::catalog::{AccessInfo, AccessMethod, Catalog, CatalogSnapshot, DiscoverySource, HttpDiscovery};
use crate::config::{AuthConfig, CatalogOptions, ParallelConfig, RetryConfig};
use crate::error::{RelayError, Result};
use crate::filter::ContentFilter;
use crate::response::{AttemptRecord, ConverseResponse};
use crate::retry::{PlannedTarget, RetryDecision, RetryManager, SkipReason};
use crate::transport::{Authenticator, ConverseArgs, EventStream, HttpAuthenticator, RawConverseOutput, RpcFailure};
use crate::types::{ConverseRequest, FeatureTag, Message};
use crate::validation::validate_request;

/// Per-call overrides for `converse` and `converse_stream`.
#[derive(Debug, Clone, Default)]
pub struct ConverseOptions {
    /// Models to try, overriding the relay-wide list.
    pub models: Option<Vec<String>>,
    /// Regions to try, overriding the relay-wide list.
    pub regions: Option<Vec<String>>,
    /// External cancellation handle.
    pub cancel: Option<CancelHandle>,
}

impl ConverseOptions {
    /// Override the model list for this call.
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = Some(models);
        self
    }

    /// Override the region list for this call.
    pub fn with_regions(mut self, regions: Vec<String>) -> Self {
        self.regions = Some(regions);
        self
    }

    /// Attach a cancellation handle.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub(crate) struct RelayCore {
    pub(crate) catalog: Catalog,
    pub(crate) auth: Arc<dyn Authenticator>,
    pub(crate) retry: RetryManager,
    pub(crate) parallel_config: ParallelConfig,
    pub(crate) models: Vec<String>,
    pub(crate) regions: Vec<String>,
}

/// Resilient multi-region client for the converse RPC.
///
/// Cheap to clone; clones share the catalog, authenticator, and
/// configuration.
///
/// # Example
///
/// ```no_run
/// use llm_relay::{Relay, types::{ConverseRequest, Message}};
/// use llm_relay::config::AuthConfig;
///
/// # async fn demo() -> llm_relay::Result<()> {
/// let relay = Relay::builder()
///     .models(["claude-3-haiku", "llama-3-70b-instruct"])
///     .regions(["us-east-1", "us-west-2"])
///     .auth_config(AuthConfig::new("https://runtime.{region}.provider.example/v1"))
///     .build()
///     .await?;
///
/// let response = relay
///     .converse(ConverseRequest::new(vec![Message::user("Hello!")]))
///     .await?;
/// println!("{}", response.content().unwrap_or_default());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Relay {
    pub(crate) core: Arc<RelayCore>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("models", &self.core.models)
            .field("regions", &self.core.regions)
            .finish()
    }
}

impl Relay {
    /// Start building a relay.
    pub fn builder() -> RelayBuilder {
        RelayBuilder::default()
    }

    /// The model catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.core.catalog
    }

    /// Refresh the catalog; `force` bypasses caches.
    pub async fn refresh_catalog(&self, force: bool) -> Result<()> {
        self.core.catalog.refresh(force).await
    }

    /// Execute one blocking converse call with relay-wide defaults.
    ///
    /// Returns `Ok` even when every target failed; inspect
    /// [`ConverseResponse::success`] and the attempt trail. Errors are
    /// reserved for validation faults and cancellation.
    pub async fn converse(&self, request: ConverseRequest) -> Result<ConverseResponse> {
        self.converse_with(request, ConverseOptions::default()).await
    }

    /// Execute one blocking converse call with per-call overrides.
    pub async fn converse_with(
        &self,
        request: ConverseRequest,
        options: ConverseOptions,
    ) -> Result<ConverseResponse> {
        let warnings = validate_request(&request)?;
        let models = options.models.unwrap_or_else(|| self.core.models.clone());
        let regions = options.regions.unwrap_or_else(|| self.core.regions.clone());
        let cancel = options.cancel.unwrap_or_default();
        self.core
            .run_blocking(request, &models, &regions, warnings, &cancel)
            .await
    }

    /// Like [`converse`](Self::converse), but raises
    /// [`RelayError::RetryExhausted`] when no target succeeded.
    pub async fn converse_strict(&self, request: ConverseRequest) -> Result<ConverseResponse> {
        let response = self.converse(request).await?;
        if response.success {
            return Ok(response);
        }
        let models_tried: Vec<String> = dedup(response.attempts.iter().map(|a| a.model_name.clone()));
        let regions_tried: Vec<String> = dedup(response.attempts.iter().map(|a| a.region.clone()));
        Err(RelayError::RetryExhausted {
            attempts_made: response.attempts.len(),
            last_errors: response
                .attempts
                .iter()
                .filter_map(|a| a.error.clone())
                .collect(),
            models_tried,
            regions_tried,
        })
    }

    /// Open a streaming converse call with relay-wide defaults.
    pub async fn converse_stream(&self, request: ConverseRequest) -> Result<StreamingResponse> {
        self.converse_stream_with(request, ConverseOptions::default())
            .await
    }

    /// Open a streaming converse call with per-call overrides.
    ///
    /// The returned [`StreamingResponse`] yields chunks as they arrive; the
    /// terminal fields become readable after the last chunk.
    pub async fn converse_stream_with(
        &self,
        mut request: ConverseRequest,
        options: ConverseOptions,
    ) -> Result<StreamingResponse> {
        request.stream = true;
        let warnings = validate_request(&request)?;
        let models = options.models.unwrap_or_else(|| self.core.models.clone());
        let regions = options.regions.unwrap_or_else(|| self.core.regions.clone());
        let cancel = options.cancel.unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        let core = self.core.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            core.run_streaming(request, models, regions, warnings, tx, task_cancel)
                .await
        });
        Ok(StreamingResponse::new(rx, handle, cancel))
    }
}

fn dedup(iter: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in iter {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// Resolve the id to invoke for a target, preferring direct access when the
/// pair is reachable both ways.
fn resolve_invoke(access: &AccessInfo) -> (Option<String>, AccessMethod) {
    match access.access_method {
        AccessMethod::CrisOnly => (
            access.inference_profile_id.clone(),
            AccessMethod::CrisOnly,
        ),
        _ => (access.model_id.clone(), access.effective_method()),
    }
}

fn strip_fields(
    request: &mut ConverseRequest,
    stripped: &BTreeSet<String>,
    strip_all: bool,
) {
    if strip_all {
        request.additional_model_request_fields = None;
        return;
    }
    if stripped.is_empty() {
        return;
    }
    if let Some(fields) = request.additional_model_request_fields.as_mut() {
        for name in stripped {
            fields.remove(name);
        }
        if fields.is_empty() {
            request.additional_model_request_fields = None;
        }
    }
}

/// Mutable per-call bookkeeping shared by the blocking and streaming loops.
struct CallState {
    attempts: Vec<AttemptRecord>,
    warnings: Vec<String>,
    disabled: BTreeSet<FeatureTag>,
    stripped_fields: BTreeSet<String>,
    strip_all_fields: bool,
    attempt_number: u32,
}

impl CallState {
    fn new(warnings: Vec<String>) -> Self {
        Self {
            attempts: Vec::new(),
            warnings,
            disabled: BTreeSet::new(),
            stripped_fields: BTreeSet::new(),
            strip_all_fields: false,
            attempt_number: 0,
        }
    }

    fn features_disabled(&self) -> Vec<FeatureTag> {
        self.disabled.iter().copied().collect()
    }

    /// Re-enable features the upcoming model supports, with a warning per
    /// restored feature.
    fn restore_for_target(
        &mut self,
        filter: &ContentFilter,
        snapshot: &CatalogSnapshot,
        model_name: &str,
    ) {
        if self.disabled.is_empty() {
            return;
        }
        let Some(entry) = snapshot.models.get(model_name) else {
            return;
        };
        let (should_restore, features) = filter.should_restore_for_model(entry);
        if !should_restore {
            return;
        }
        for tag in features {
            self.disabled.remove(&tag);
            info!(feature = %tag, model = %model_name, "restoring feature for capable model");
            self.warnings
                .push(format!("restored {tag} for model {model_name}"));
        }
    }

    /// Handle a strip-parameter decision; returns whether a retry makes
    /// sense (false when there was nothing left to strip).
    fn strip_parameter(
        &mut self,
        prepared: &ConverseRequest,
        field: Option<String>,
        model_name: &str,
    ) -> bool {
        let present = prepared
            .additional_model_request_fields
            .as_ref()
            .map(|m| !m.is_empty())
            .unwrap_or(false);
        if !present {
            return false;
        }
        match field {
            Some(name)
                if prepared
                    .additional_model_request_fields
                    .as_ref()
                    .is_some_and(|m| m.contains_key(&name)) =>
            {
                self.warnings.push(format!(
                    "removed additional request field '{name}' for model {model_name}"
                ));
                self.stripped_fields.insert(name);
            }
            _ => {
                let names: Vec<String> = prepared
                    .additional_model_request_fields
                    .as_ref()
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default();
                self.warnings.push(format!(
                    "removed additional request fields [{}] for model {model_name}",
                    names.join(", ")
                ));
                self.strip_all_fields = true;
            }
        }
        true
    }
}

/// What a failed attempt means for the loop driving it.
enum FailureStep {
    RetrySameTarget,
    NextTarget,
    Terminal,
}

impl RelayCore {
    /// Prepare the filtered request for the next attempt.
    fn prepare_request(&self, filter: &mut ContentFilter, state: &mut CallState) -> ConverseRequest {
        let mut prepared = filter.apply(&state.disabled);
        state.warnings.extend(filter.take_warnings());
        strip_fields(&mut prepared, &state.stripped_fields, state.strip_all_fields);
        prepared
    }

    /// Apply a retry decision after a failed attempt. Sleeps for transient
    /// retries.
    async fn handle_failure(
        &self,
        failure: &RpcFailure,
        target: &PlannedTarget,
        attempts_on_target: u32,
        prepared: &ConverseRequest,
        state: &mut CallState,
        cancel: &CancelHandle,
    ) -> Result<FailureStep> {
        let has_fields = prepared
            .additional_model_request_fields
            .as_ref()
            .map(|m| !m.is_empty())
            .unwrap_or(false);
        let decision =
            self.retry
                .decide(failure, attempts_on_target, &state.disabled, has_fields);

        match decision {
            RetryDecision::RetryAfterBackoff(delay) => {
                debug!(
                    model = %target.model_name,
                    region = %target.region,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure; backing off before retrying same target"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if cancel.is_cancelled() {
                    return Err(RelayError::Cancelled);
                }
                Ok(FailureStep::RetrySameTarget)
            }
            RetryDecision::DisableFeatureAndRetry { tag, table } => {
                warn!(
                    feature = %tag,
                    model = %target.model_name,
                    "disabling feature after compatibility error"
                );
                state.disabled.insert(tag);
                state.warnings.push(format!(
                    "disabled {tag} for model {} after {table} error: {failure}",
                    target.model_name
                ));
                Ok(FailureStep::RetrySameTarget)
            }
            RetryDecision::StripParameterAndRetry { field } => {
                if state.strip_parameter(prepared, field, &target.model_name) {
                    Ok(FailureStep::RetrySameTarget)
                } else {
                    Ok(FailureStep::NextTarget)
                }
            }
            RetryDecision::NextTarget(reason) => {
                if let SkipReason::ContentCompat(kind) = reason {
                    state.warnings.push(format!(
                        "model {} does not support {kind} content; trying next target",
                        target.model_name
                    ));
                }
                Ok(FailureStep::NextTarget)
            }
            RetryDecision::Fail => {
                state.warnings.push(format!(
                    "non-retryable error from {} in {}: {failure}",
                    target.model_name, target.region
                ));
                Ok(FailureStep::Terminal)
            }
        }
    }

    pub(crate) async fn run_blocking(
        &self,
        request: ConverseRequest,
        models: &[String],
        regions: &[String],
        initial_warnings: Vec<String>,
        cancel: &CancelHandle,
    ) -> Result<ConverseResponse> {
        let started = Instant::now();
        let snapshot = self.catalog.snapshot();
        let mut filter = ContentFilter::new(&request);
        let mut state = CallState::new(initial_warnings);

        let plan = self
            .retry
            .plan_targets(models, regions, &snapshot, &HashSet::new());
        if plan.is_empty() {
            state
                .warnings
                .push("no reachable (model, region) pairs for this request".to_string());
        }

        'targets: for target in &plan {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            state.restore_for_target(&filter, &snapshot, &target.model_name);

            let mut attempts_on_target = 0u32;
            loop {
                attempts_on_target += 1;
                state.attempt_number += 1;

                let (invoke_id, method) = resolve_invoke(&target.access);
                let Some(invoke_id) = invoke_id else {
                    state.warnings.push(format!(
                        "inconsistent access info for {} in {}; skipping",
                        target.model_name, target.region
                    ));
                    continue 'targets;
                };

                let prepared = self.prepare_request(&mut filter, &mut state);
                let args = ConverseArgs::from_request(&prepared, &invoke_id);
                let mut record = AttemptRecord::start(
                    &target.model_name,
                    &target.region,
                    method,
                    state.attempt_number,
                );
                info!(
                    model = %target.model_name,
                    region = %target.region,
                    attempt = state.attempt_number,
                    "converse attempt"
                );

                let client = match self.auth.client_for(&target.region).await {
                    Ok(client) => client,
                    Err(error) => {
                        warn!(region = %target.region, %error, "client construction failed");
                        record.fail(error.to_string());
                        state.attempts.push(record);
                        continue 'targets;
                    }
                };

                match client.converse(&args).await {
                    Ok(raw) => {
                        record.succeed();
                        state.attempts.push(record);
                        info!(
                            model = %target.model_name,
                            region = %target.region,
                            attempts = state.attempt_number,
                            "converse succeeded"
                        );
                        return Ok(finish_blocking(raw, target, method, state, started));
                    }
                    Err(failure) => {
                        warn!(
                            model = %target.model_name,
                            region = %target.region,
                            error = %failure,
                            "converse attempt failed"
                        );
                        record.fail(failure.to_string());
                        state.attempts.push(record);
                        match self
                            .handle_failure(
                                &failure,
                                target,
                                attempts_on_target,
                                &prepared,
                                &mut state,
                                cancel,
                            )
                            .await?
                        {
                            FailureStep::RetrySameTarget => continue,
                            FailureStep::NextTarget => continue 'targets,
                            FailureStep::Terminal => {
                                return Ok(failed_blocking(state, started));
                            }
                        }
                    }
                }
            }
        }

        warn!("all converse targets exhausted");
        Ok(failed_blocking(state, started))
    }

    pub(crate) async fn run_streaming(
        &self,
        request: ConverseRequest,
        models: Vec<String>,
        regions: Vec<String>,
        initial_warnings: Vec<String>,
        tx: mpsc::UnboundedSender<String>,
        cancel: CancelHandle,
    ) -> StreamOutcome {
        let started = Instant::now();
        let snapshot = self.catalog.snapshot();
        let mut filter = ContentFilter::new(&request);
        let mut state = CallState::new(initial_warnings);
        let mut assembler = ResponseAssembler::new();

        let plan = self
            .retry
            .plan_targets(&models, &regions, &snapshot, &HashSet::new());
        if plan.is_empty() {
            state
                .warnings
                .push("no reachable (model, region) pairs for this request".to_string());
        }
        let plan_len = plan.len();

        'targets: for (target_index, target) in plan.iter().enumerate() {
            if cancel.is_cancelled() {
                state.warnings.push("streaming call cancelled".to_string());
                return finish_streaming(assembler, false, None, state, started);
            }
            state.restore_for_target(&filter, &snapshot, &target.model_name);

            let mut attempts_on_target = 0u32;
            loop {
                attempts_on_target += 1;
                state.attempt_number += 1;

                let (invoke_id, method) = resolve_invoke(&target.access);
                let Some(invoke_id) = invoke_id else {
                    state.warnings.push(format!(
                        "inconsistent access info for {} in {}; skipping",
                        target.model_name, target.region
                    ));
                    continue 'targets;
                };

                let mut prepared = self.prepare_request(&mut filter, &mut state);
                // Mid-stream recovery: the replacement model continues from
                // the partial content rather than restarting.
                if assembler.has_content() {
                    prepared
                        .messages
                        .push(Message::assistant(assembler.full_content()));
                }
                let args = ConverseArgs::from_request(&prepared, &invoke_id);
                let mut record = AttemptRecord::start(
                    &target.model_name,
                    &target.region,
                    method,
                    state.attempt_number,
                );
                info!(
                    model = %target.model_name,
                    region = %target.region,
                    attempt = state.attempt_number,
                    streaming = prepared.stream,
                    "converse-stream attempt"
                );

                let client = match self.auth.client_for(&target.region).await {
                    Ok(client) => client,
                    Err(error) => {
                        warn!(region = %target.region, %error, "client construction failed");
                        record.fail(error.to_string());
                        state.attempts.push(record);
                        continue 'targets;
                    }
                };

                // The streaming feature can be disabled by compatibility
                // fallback; degrade to a blocking call and emit one chunk.
                let fault: RpcFailure = if prepared.stream {
                    match client.converse_stream(&args).await {
                        Ok(stream) => {
                            match drive_stream(stream, &mut assembler, &tx, &cancel).await {
                                Ok(DriveEnd::Completed) => {
                                    record.succeed();
                                    state.attempts.push(record);
                                    return finish_streaming(
                                        assembler,
                                        true,
                                        Some((target, method)),
                                        state,
                                        started,
                                    );
                                }
                                Ok(DriveEnd::EndedWithoutStop) => {
                                    state.warnings.push(
                                        "stream ended without a message-stop event".to_string(),
                                    );
                                    record.succeed();
                                    state.attempts.push(record);
                                    return finish_streaming(
                                        assembler,
                                        true,
                                        Some((target, method)),
                                        state,
                                        started,
                                    );
                                }
                                Ok(DriveEnd::Cancelled) => {
                                    record.fail("cancelled");
                                    state.attempts.push(record);
                                    state.warnings.push("streaming call cancelled".to_string());
                                    return finish_streaming(
                                        assembler, false, None, state, started,
                                    );
                                }
                                Err(failure) => {
                                    record.fail(failure.to_string());
                                    state.attempts.push(record);
                                    failure
                                }
                            }
                        }
                        Err(failure) => {
                            record.fail(failure.to_string());
                            state.attempts.push(record);
                            failure
                        }
                    }
                } else {
                    match client.converse(&args).await {
                        Ok(raw) => {
                            let text = raw
                                .output
                                .message
                                .content
                                .iter()
                                .filter_map(|b| match b {
                                    crate::types::ContentBlock::Text(t) => Some(t.as_str()),
                                    _ => None,
                                })
                                .collect::<Vec<_>>()
                                .join("\n");
                            if !text.is_empty() {
                                if let AssembledEvent::Chunk(chunk) =
                                    assembler.handle_event(StreamEvent::text_delta(0, text))
                                {
                                    let _ = tx.send(chunk);
                                }
                            }
                            assembler.stop_reason = raw.stop_reason.clone();
                            assembler.usage = raw.usage;
                            assembler.api_latency_ms = raw.metrics.map(|m| m.latency_ms);
                            record.succeed();
                            state.attempts.push(record);
                            return finish_streaming(
                                assembler,
                                true,
                                Some((target, method)),
                                state,
                                started,
                            );
                        }
                        Err(failure) => {
                            record.fail(failure.to_string());
                            state.attempts.push(record);
                            failure
                        }
                    }
                };

                warn!(
                    model = %target.model_name,
                    region = %target.region,
                    error = %fault,
                    "streaming attempt failed"
                );

                if assembler.has_content() {
                    // Mid-stream fault: the prefix is already with the
                    // caller, so recovery means continuation, not retry.
                    assembler.record_mid_stream_exception(
                        &target.model_name,
                        &target.region,
                        &fault,
                    );
                    let recovery_possible = self.retry.config().enable_mid_stream_recovery
                        && target_index + 1 < plan_len;
                    if recovery_possible {
                        assembler.mark_recovered();
                        state.warnings.push(format!(
                            "mid-stream fault on {} in {} at position {}; continuing on next target",
                            target.model_name, target.region, assembler.stream_position
                        ));
                        continue 'targets;
                    }
                    state.warnings.push(format!(
                        "mid-stream fault on {} in {} with no remaining target; partial content preserved",
                        target.model_name, target.region
                    ));
                    return finish_streaming(assembler, false, None, state, started);
                }

                match self
                    .handle_failure(
                        &fault,
                        target,
                        attempts_on_target,
                        &prepared,
                        &mut state,
                        &cancel,
                    )
                    .await
                {
                    Ok(FailureStep::RetrySameTarget) => continue,
                    Ok(FailureStep::NextTarget) => continue 'targets,
                    Ok(FailureStep::Terminal) => {
                        return finish_streaming(assembler, false, None, state, started);
                    }
                    Err(_) => {
                        state.warnings.push("streaming call cancelled".to_string());
                        return finish_streaming(assembler, false, None, state, started);
                    }
                }
            }
        }

        warn!("all converse-stream targets exhausted");
        finish_streaming(assembler, false, None, state, started)
    }
}

enum DriveEnd {
    Completed,
    EndedWithoutStop,
    Cancelled,
}

/// Pump one event stream into the assembler, forwarding chunks to the
/// caller. Keeps reading after message-stop so trailing metadata is
/// captured.
async fn drive_stream(
    mut stream: EventStream,
    assembler: &mut ResponseAssembler,
    tx: &mpsc::UnboundedSender<String>,
    cancel: &CancelHandle,
) -> std::result::Result<DriveEnd, RpcFailure> {
    use futures::StreamExt;

    let mut completed = false;
    while let Some(item) = stream.next().await {
        if cancel.is_cancelled() {
            return Ok(DriveEnd::Cancelled);
        }
        let event = item?;
        match assembler.handle_event(event) {
            AssembledEvent::Chunk(chunk) => {
                // A dropped receiver means the caller went away; treat it
                // as cancellation.
                if tx.send(chunk).is_err() {
                    return Ok(DriveEnd::Cancelled);
                }
            }
            AssembledEvent::Fault(failure) => return Err(failure),
            AssembledEvent::Completed => completed = true,
            AssembledEvent::Ignored => {}
        }
    }
    if completed {
        Ok(DriveEnd::Completed)
    } else {
        Ok(DriveEnd::EndedWithoutStop)
    }
}

fn finish_blocking(
    raw: RawConverseOutput,
    target: &PlannedTarget,
    method: AccessMethod,
    state: CallState,
    started: Instant,
) -> ConverseResponse {
    let api_latency_ms = raw.metrics.map(|m| m.latency_ms);
    let features_disabled = state.features_disabled();
    ConverseResponse {
        success: true,
        raw: Some(raw),
        model_used: Some(target.model_name.clone()),
        region_used: Some(target.region.clone()),
        access_method_used: Some(method),
        attempts: state.attempts,
        total_duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        api_latency_ms,
        warnings: state.warnings,
        features_disabled,
    }
}

fn failed_blocking(state: CallState, started: Instant) -> ConverseResponse {
    let features_disabled = state.features_disabled();
    ConverseResponse {
        success: false,
        raw: None,
        model_used: None,
        region_used: None,
        access_method_used: None,
        attempts: state.attempts,
        total_duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        api_latency_ms: None,
        warnings: state.warnings,
        features_disabled,
    }
}

fn finish_streaming(
    assembler: ResponseAssembler,
    success: bool,
    target: Option<(&PlannedTarget, AccessMethod)>,
    state: CallState,
    started: Instant,
) -> StreamOutcome {
    let features_disabled = state.features_disabled();
    StreamOutcome {
        success,
        model_used: target.map(|(t, _)| t.model_name.clone()),
        region_used: target.map(|(t, _)| t.region.clone()),
        access_method_used: target.map(|(_, m)| m),
        attempts: state.attempts,
        time_to_first_token_ms: assembler.time_to_first_token_ms(),
        time_to_last_token_ms: assembler.time_to_last_token_ms(),
        token_generation_duration_ms: assembler.token_generation_duration_ms(),
        content_parts: assembler.content_parts,
        stream_position: assembler.stream_position,
        stream_errors: assembler.stream_errors,
        mid_stream_exceptions: assembler.mid_stream_exceptions,
        target_switches: assembler.target_switches,
        total_duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        api_latency_ms: assembler.api_latency_ms,
        usage: assembler.usage,
        stop_reason: assembler.stop_reason,
        warnings: state.warnings,
        features_disabled,
    }
}

/// Builder for [`Relay`].
#[derive(Default)]
pub struct RelayBuilder {
    models: Vec<String>,
    regions: Vec<String>,
    auth_config: Option<AuthConfig>,
    authenticator: Option<Arc<dyn Authenticator>>,
    discovery: Option<Arc<dyn DiscoverySource>>,
    retry_config: Option<RetryConfig>,
    parallel_config: Option<ParallelConfig>,
    catalog_options: Option<CatalogOptions>,
}

impl RelayBuilder {
    /// Friendly model names to use, in preference order.
    pub fn models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Regions to use, in preference order.
    pub fn regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    /// Transport configuration for the default HTTP authenticator and
    /// discovery client.
    pub fn auth_config(mut self, config: AuthConfig) -> Self {
        self.auth_config = Some(config);
        self
    }

    /// Custom authenticator (overrides `auth_config` for RPC transport).
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Custom discovery source (overrides `auth_config` for discovery).
    pub fn discovery(mut self, discovery: Arc<dyn DiscoverySource>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Retry configuration.
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }

    /// Parallel-executor configuration.
    pub fn parallel_config(mut self, config: ParallelConfig) -> Self {
        self.parallel_config = Some(config);
        self
    }

    /// Catalog cache and matching options.
    pub fn catalog_options(mut self, options: CatalogOptions) -> Self {
        self.catalog_options = Some(options);
        self
    }

    /// Build the relay: validate configuration, construct the catalog
    /// (fail-fast when nothing is reachable), and wire the transport.
    pub async fn build(self) -> Result<Relay> {
        let retry_config = self.retry_config.unwrap_or_default();
        retry_config.validate()?;
        let parallel_config = self.parallel_config.unwrap_or_default();
        parallel_config.validate()?;
        let catalog_options = self.catalog_options.unwrap_or_default();

        let discovery: Arc<dyn DiscoverySource> = match (self.discovery, &self.auth_config) {
            (Some(discovery), _) => discovery,
            (None, Some(auth_config)) => Arc::new(HttpDiscovery::new(auth_config.clone())?),
            (None, None) => {
                return Err(RelayError::Configuration(
                    "either a discovery source or an auth_config is required".into(),
                ))
            }
        };
        let auth: Arc<dyn Authenticator> = match (self.authenticator, self.auth_config) {
            (Some(authenticator), _) => authenticator,
            (None, Some(auth_config)) => Arc::new(HttpAuthenticator::new(auth_config)?),
            (None, None) => {
                return Err(RelayError::Configuration(
                    "either an authenticator or an auth_config is required".into(),
                ))
            }
        };

        let catalog = Catalog::new(
            self.models.clone(),
            self.regions.clone(),
            catalog_options,
            discovery,
        )
        .await?;

        Ok(Relay {
            core: Arc::new(RelayCore {
                catalog,
                auth,
                retry: RetryManager::new(retry_config),
                parallel_config,
                models: self.models,
                regions: self.regions,
            }),
        })
    }
}
