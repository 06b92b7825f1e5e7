//! The unified model catalog.
//!
//! Maps (model name, region) to access information — direct model id,
//! inference-profile id, or both — by merging the provider's two discovery
//! listings. The catalog is read-mostly: readers take an immutable
//! [`CatalogSnapshot`] handle; [`Catalog::refresh`] builds a new snapshot
//! and swaps the reference atomically, so no reader ever observes a
//! half-built catalog.

pub mod access;
pub mod cache;
pub mod discovery;
pub mod merge;

pub use access::{AccessInfo, AccessMethod, AccessRecommendation};
pub use cache::{CacheBlob, CatalogMetadata};
pub use discovery::{BaseModelListing, DiscoverySource, HttpDiscovery, ProfileListing, StaticDiscovery};
pub use merge::MergeStats;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::config::{CacheMode, CatalogOptions};
use crate::error::{RelayError, Result};

/// Unified view of one model across all regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Canonical friendly name.
    pub model_name: String,
    /// Publishing provider.
    pub provider: String,
    /// Region -> access info. Keys are the union of direct-reachable and
    /// profile-reachable regions.
    pub per_region: BTreeMap<String, AccessInfo>,
    /// Whether the streaming variant is supported.
    pub streaming_supported: bool,
    /// Input modalities the model accepts.
    #[serde(default)]
    pub input_modalities: Vec<String>,
    /// Output modalities the model produces.
    #[serde(default)]
    pub output_modalities: Vec<String>,
}

impl ModelEntry {
    /// Whether the model is reachable from `region` via any access method.
    pub fn is_available_in(&self, region: &str) -> bool {
        self.per_region.contains_key(region)
    }

    /// Access info for `region`, if reachable.
    pub fn access_for(&self, region: &str) -> Option<&AccessInfo> {
        self.per_region.get(region)
    }

    /// Whether the model accepts the given input modality.
    pub fn supports_input(&self, modality: &str) -> bool {
        self.input_modalities
            .iter()
            .any(|m| m.eq_ignore_ascii_case(modality))
    }
}

/// An immutable, consistent view of the catalog at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// When the underlying discovery data was fetched.
    pub retrieval_timestamp: DateTime<Utc>,
    /// Unified model entries, keyed by model name.
    pub models: BTreeMap<String, ModelEntry>,
    /// Which regions contributed to this snapshot.
    pub metadata: CatalogMetadata,
}

impl CatalogSnapshot {
    fn from_blob(blob: CacheBlob) -> Self {
        Self {
            retrieval_timestamp: blob.retrieval_timestamp,
            models: blob.models,
            metadata: blob.metadata,
        }
    }

    fn to_blob(&self) -> CacheBlob {
        CacheBlob {
            format_version: cache::CACHE_FORMAT_VERSION,
            retrieval_timestamp: self.retrieval_timestamp,
            models: self.models.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Access info for (model, region). `None` means unreachable — not an
    /// error.
    pub fn get_access_info(&self, model_name: &str, region: &str) -> Option<&AccessInfo> {
        self.models.get(model_name)?.access_for(region)
    }

    /// Whether (model, region) is reachable via any access method.
    pub fn is_available(&self, model_name: &str, region: &str) -> bool {
        self.get_access_info(model_name, region).is_some()
    }

    /// Recommended access for (model, region): direct when available,
    /// otherwise the inference profile, with the other route listed as an
    /// alternative when both work.
    pub fn get_recommended_access(
        &self,
        model_name: &str,
        region: &str,
    ) -> Option<AccessRecommendation> {
        let info = self.get_access_info(model_name, region)?;
        let recommendation = match info.access_method {
            AccessMethod::Direct => AccessRecommendation {
                primary: info.clone(),
                alternatives: Vec::new(),
                rationale: format!("direct access is available in {region}"),
            },
            AccessMethod::CrisOnly => AccessRecommendation {
                primary: info.clone(),
                alternatives: Vec::new(),
                rationale: format!(
                    "only the inference profile reaches {model_name} from {region}"
                ),
            },
            AccessMethod::Both => {
                let direct = AccessInfo {
                    access_method: AccessMethod::Direct,
                    region: region.to_string(),
                    model_id: info.model_id.clone(),
                    inference_profile_id: info.inference_profile_id.clone(),
                };
                let cris = AccessInfo {
                    access_method: AccessMethod::CrisOnly,
                    region: region.to_string(),
                    model_id: None,
                    inference_profile_id: info.inference_profile_id.clone(),
                };
                AccessRecommendation {
                    primary: direct,
                    alternatives: vec![cris],
                    rationale: "direct access is preferred when both routes work".to_string(),
                }
            }
        };
        Some(recommendation)
    }

    /// Models reachable from `region`.
    pub fn models_by_region(&self, region: &str) -> Vec<&ModelEntry> {
        self.models
            .values()
            .filter(|entry| entry.is_available_in(region))
            .collect()
    }

    /// Models from `provider`.
    pub fn models_by_provider(&self, provider: &str) -> Vec<&ModelEntry> {
        self.models
            .values()
            .filter(|entry| entry.provider.eq_ignore_ascii_case(provider))
            .collect()
    }

    /// Models that support streaming.
    pub fn streaming_models(&self) -> Vec<&ModelEntry> {
        self.models
            .values()
            .filter(|entry| entry.streaming_supported)
            .collect()
    }

    /// All regions reachable by at least one model, sorted.
    pub fn all_supported_regions(&self) -> Vec<String> {
        let regions: BTreeSet<&String> = self
            .models
            .values()
            .flat_map(|entry| entry.per_region.keys())
            .collect();
        regions.into_iter().cloned().collect()
    }

    /// All model names, sorted.
    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Number of models.
    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Whether the catalog knows `model_name`.
    pub fn has_model(&self, model_name: &str) -> bool {
        self.models.contains_key(model_name)
    }

    /// Serialize the snapshot in the cache-blob format.
    pub fn to_json(&self, pretty: bool) -> Result<String> {
        let blob = self.to_blob();
        let text = if pretty {
            serde_json::to_string_pretty(&blob)?
        } else {
            serde_json::to_string(&blob)?
        };
        Ok(text)
    }
}

/// The refreshable catalog.
///
/// Construction populates from (in order) an unexpired cache, fresh
/// discovery fetches across the configured regions, or the bundled snapshot
/// when every fetch fails. Construction fails fast when none of the
/// configured models is reachable in any configured region.
pub struct Catalog {
    options: CatalogOptions,
    configured_models: Vec<String>,
    configured_regions: Vec<String>,
    source: Arc<dyn DiscoverySource>,
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("models", &self.configured_models)
            .field("regions", &self.configured_regions)
            .field("cache_mode", &self.options.cache_mode)
            .field("model_count", &self.snapshot().model_count())
            .finish()
    }
}

impl Catalog {
    /// Build a catalog for the given models and regions.
    pub async fn new(
        models: Vec<String>,
        regions: Vec<String>,
        options: CatalogOptions,
        source: Arc<dyn DiscoverySource>,
    ) -> Result<Self> {
        if models.is_empty() {
            return Err(RelayError::Configuration(
                "at least one model must be configured".into(),
            ));
        }
        if regions.is_empty() {
            return Err(RelayError::Configuration(
                "at least one region must be configured".into(),
            ));
        }

        let snapshot = build_snapshot(&*source, &regions, &options, false).await?;
        let catalog = Self {
            options,
            configured_models: models,
            configured_regions: regions,
            source,
            current: RwLock::new(Arc::new(snapshot)),
        };
        catalog.check_reachability()?;
        Ok(catalog)
    }

    /// An immutable handle on the current snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current
            .read()
            .expect("catalog snapshot lock poisoned")
            .clone()
    }

    /// Rebuild the snapshot under the same merge rules and swap it in
    /// atomically. `force` bypasses caches.
    pub async fn refresh(&self, force: bool) -> Result<()> {
        let snapshot =
            build_snapshot(&*self.source, &self.configured_regions, &self.options, force).await?;
        *self
            .current
            .write()
            .expect("catalog snapshot lock poisoned") = Arc::new(snapshot);
        Ok(())
    }

    /// Access info for (model, region), cloned out of the current snapshot.
    pub fn get_access_info(&self, model_name: &str, region: &str) -> Option<AccessInfo> {
        self.snapshot().get_access_info(model_name, region).cloned()
    }

    /// Recommended access for (model, region).
    pub fn get_recommended_access(
        &self,
        model_name: &str,
        region: &str,
    ) -> Option<AccessRecommendation> {
        self.snapshot().get_recommended_access(model_name, region)
    }

    /// Whether (model, region) is reachable.
    pub fn is_available(&self, model_name: &str, region: &str) -> bool {
        self.snapshot().is_available(model_name, region)
    }

    /// All model names known to the catalog.
    pub fn model_names(&self) -> Vec<String> {
        self.snapshot().model_names()
    }

    /// Number of models known to the catalog.
    pub fn model_count(&self) -> usize {
        self.snapshot().model_count()
    }

    /// Whether the catalog knows `model_name`.
    pub fn has_model(&self, model_name: &str) -> bool {
        self.snapshot().has_model(model_name)
    }

    /// All regions reachable by at least one model.
    pub fn all_supported_regions(&self) -> Vec<String> {
        self.snapshot().all_supported_regions()
    }

    /// The models this catalog was configured with.
    pub fn configured_models(&self) -> &[String] {
        &self.configured_models
    }

    /// The regions this catalog was configured with.
    pub fn configured_regions(&self) -> &[String] {
        &self.configured_regions
    }

    /// Fail-fast rule: at least one configured model must be reachable in at
    /// least one configured region.
    fn check_reachability(&self) -> Result<()> {
        let snapshot = self.snapshot();
        let mut unreachable = Vec::new();
        for model in &self.configured_models {
            let reachable = self
                .configured_regions
                .iter()
                .any(|region| snapshot.is_available(model, region));
            if !reachable {
                unreachable.push(model.clone());
            }
        }
        if unreachable.len() == self.configured_models.len() {
            return Err(RelayError::Configuration(format!(
                "no configured model is reachable: models [{}] have no access in regions [{}]",
                unreachable.join(", "),
                self.configured_regions.join(", ")
            )));
        }
        for model in &unreachable {
            warn!(model = %model, "configured model has no reachable region");
        }
        Ok(())
    }
}

async fn build_snapshot(
    source: &dyn DiscoverySource,
    regions: &[String],
    options: &CatalogOptions,
    force: bool,
) -> Result<CatalogSnapshot> {
    let region_key = cache::memory_key(regions);

    if !force {
        match options.cache_mode {
            CacheMode::File => {
                if let Some(dir) = &options.cache_directory {
                    if let Some(blob) = cache::load_file(&cache::cache_path(dir), options.max_cache_age)
                    {
                        info!("loaded model catalog from file cache");
                        return Ok(CatalogSnapshot::from_blob(blob));
                    }
                }
            }
            CacheMode::Memory => {
                if let Some(blob) = cache::load_memory(&region_key, options.max_cache_age) {
                    info!("loaded model catalog from memory cache");
                    return Ok(CatalogSnapshot::from_blob(blob));
                }
            }
            CacheMode::None => {}
        }
    }

    // Fetch both listings from every region in parallel; per-region failures
    // are non-fatal as long as one region succeeds.
    let fetches = regions.iter().map(|region| async move {
        let models = source.base_models(region).await;
        let profiles = source.inference_profiles(region).await;
        (region.clone(), models.and_then(|m| profiles.map(|p| (m, p))))
    });
    let results = futures::future::join_all(fetches).await;

    let mut bases = Vec::new();
    let mut profiles = Vec::new();
    let mut metadata = CatalogMetadata::default();
    for (region, result) in results {
        match result {
            Ok((region_models, region_profiles)) => {
                bases.extend(region_models);
                profiles.extend(region_profiles);
                metadata.successful_regions.push(region);
            }
            Err(error) => {
                warn!(region = %region, %error, "discovery fetch failed");
                metadata.failed_regions.push(region);
            }
        }
    }

    if metadata.successful_regions.is_empty() {
        warn!("all discovery fetches failed; falling back to the bundled snapshot");
        let (bundled_models, bundled_profiles) = discovery::bundled_listings()?;
        bases = bundled_models;
        profiles = bundled_profiles;
    }

    let (models, stats) = merge::merge_listings(bases, profiles, options.enable_fuzzy_matching);
    info!(
        models = models.len(),
        exact = stats.exact_matches,
        fuzzy = stats.fuzzy_matches,
        unmatched_profiles = stats.unmatched_profiles,
        "model catalog refreshed"
    );

    let blob = CacheBlob::new(models, metadata);
    match options.cache_mode {
        CacheMode::File => {
            if let Some(dir) = &options.cache_directory {
                if let Err(error) = cache::store_file(&cache::cache_path(dir), &blob) {
                    warn!(%error, "failed to persist catalog cache");
                }
            }
        }
        CacheMode::Memory => cache::store_memory(&region_key, blob.clone()),
        CacheMode::None => {}
    }

    Ok(CatalogSnapshot::from_blob(blob))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> StaticDiscovery {
        StaticDiscovery::new(
            vec![
                BaseModelListing {
                    model_name: "model-a".into(),
                    model_id: "provider.model-a".into(),
                    provider: "acme".into(),
                    regions: vec!["us-west-2".into()],
                    input_modalities: vec!["text".into(), "image".into()],
                    output_modalities: vec!["text".into()],
                    streaming_supported: true,
                },
                BaseModelListing {
                    model_name: "model-b".into(),
                    model_id: "provider.model-b".into(),
                    provider: "acme".into(),
                    regions: vec!["us-east-1".into(), "us-west-2".into()],
                    input_modalities: vec!["text".into()],
                    output_modalities: vec!["text".into()],
                    streaming_supported: false,
                },
            ],
            vec![ProfileListing {
                inference_profile_id: "us.provider.model-a".into(),
                model_name: "model-a".into(),
                regions: vec!["us-east-1".into(), "us-west-2".into()],
            }],
        )
    }

    fn options() -> CatalogOptions {
        CatalogOptions::default().with_cache_mode(CacheMode::None)
    }

    async fn catalog() -> Catalog {
        Catalog::new(
            vec!["model-a".into(), "model-b".into()],
            vec!["us-east-1".into(), "us-west-2".into()],
            options(),
            Arc::new(source()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_access_info_merge() {
        let catalog = catalog().await;
        // model-a: profile-only in us-east-1, both in us-west-2
        let east = catalog.get_access_info("model-a", "us-east-1").unwrap();
        assert_eq!(east.access_method, AccessMethod::CrisOnly);
        let west = catalog.get_access_info("model-a", "us-west-2").unwrap();
        assert_eq!(west.access_method, AccessMethod::Both);
        // model-b: direct everywhere it exists
        let b = catalog.get_access_info("model-b", "us-east-1").unwrap();
        assert_eq!(b.access_method, AccessMethod::Direct);
        // Unreachable pair is None, not an error
        assert!(catalog.get_access_info("model-b", "eu-west-1").is_none());
        assert!(catalog.get_access_info("missing", "us-east-1").is_none());
    }

    #[tokio::test]
    async fn test_recommendation_prefers_direct() {
        let catalog = catalog().await;
        let rec = catalog
            .get_recommended_access("model-a", "us-west-2")
            .unwrap();
        assert_eq!(rec.primary.access_method, AccessMethod::Direct);
        assert_eq!(rec.alternatives.len(), 1);
        assert_eq!(rec.alternatives[0].access_method, AccessMethod::CrisOnly);

        let cris = catalog
            .get_recommended_access("model-a", "us-east-1")
            .unwrap();
        assert_eq!(cris.primary.access_method, AccessMethod::CrisOnly);
        assert!(cris.alternatives.is_empty());
    }

    #[tokio::test]
    async fn test_query_surface() {
        let catalog = catalog().await;
        let snapshot = catalog.snapshot();
        assert_eq!(catalog.model_count(), 2);
        assert!(catalog.has_model("model-a"));
        assert_eq!(snapshot.models_by_region("us-east-1").len(), 2);
        assert_eq!(snapshot.models_by_provider("acme").len(), 2);
        assert_eq!(snapshot.streaming_models().len(), 1);
        assert_eq!(
            catalog.all_supported_regions(),
            vec!["us-east-1".to_string(), "us-west-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fail_fast_when_nothing_reachable() {
        let result = Catalog::new(
            vec!["model-a".into()],
            vec!["ap-south-1".into()],
            options(),
            Arc::new(source()),
        )
        .await;
        match result {
            Err(RelayError::Configuration(message)) => {
                assert!(message.contains("model-a"));
                assert!(message.contains("ap-south-1"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_discovery_failure_non_fatal() {
        let failing = source().with_failing_region("us-east-1");
        let catalog = Catalog::new(
            vec!["model-a".into()],
            vec!["us-east-1".into(), "us-west-2".into()],
            options(),
            Arc::new(failing),
        )
        .await
        .unwrap();
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.metadata.failed_regions, vec!["us-east-1"]);
        assert_eq!(snapshot.metadata.successful_regions, vec!["us-west-2"]);
        assert!(catalog.is_available("model-a", "us-west-2"));
    }

    #[tokio::test]
    async fn test_total_discovery_failure_uses_bundled_snapshot() {
        let failing = StaticDiscovery::default()
            .with_failing_region("us-east-1")
            .with_failing_region("us-west-2");
        let catalog = Catalog::new(
            vec!["claude-3-haiku".into()],
            vec!["us-east-1".into(), "us-west-2".into()],
            options(),
            Arc::new(failing),
        )
        .await
        .unwrap();
        assert!(catalog.has_model("claude-3-haiku"));
        assert!(catalog.is_available("claude-3-haiku", "us-east-1"));
    }

    #[tokio::test]
    async fn test_refresh_swaps_snapshot() {
        let catalog = catalog().await;
        let before = catalog.snapshot();
        catalog.refresh(true).await.unwrap();
        let after = catalog.snapshot();
        assert!(after.retrieval_timestamp >= before.retrieval_timestamp);
        // The old handle is still fully usable.
        assert_eq!(before.model_count(), 2);
    }

    #[tokio::test]
    async fn test_file_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cached_options = CatalogOptions::default()
            .with_cache_mode(CacheMode::File)
            .with_cache_directory(dir.path());

        let first = Catalog::new(
            vec!["model-a".into()],
            vec!["us-west-2".into()],
            cached_options.clone(),
            Arc::new(source()),
        )
        .await
        .unwrap();
        let stamp = first.snapshot().retrieval_timestamp;

        // Second construction must read the blob instead of refetching:
        // give it a source that always fails.
        let second = Catalog::new(
            vec!["model-a".into()],
            vec!["us-west-2".into()],
            cached_options,
            Arc::new(StaticDiscovery::default().with_failing_region("us-west-2")),
        )
        .await
        .unwrap();
        assert_eq!(second.snapshot().retrieval_timestamp, stamp);
    }

    #[tokio::test]
    async fn test_snapshot_export() {
        let catalog = catalog().await;
        let text = catalog.snapshot().to_json(false).unwrap();
        let blob: CacheBlob = serde_json::from_str(&text).unwrap();
        assert_eq!(blob.models.len(), 2);
    }
}
