//! Discovery sources: the provider's per-region model and inference-profile
//! listings.
//!
//! The catalog consumes the [`DiscoverySource`] trait only.
//! [`HttpDiscovery`] reads the provider's read-only listing endpoints;
//! [`StaticDiscovery`] serves fixed listings for tests and backs the bundled
//! snapshot shipped with the library.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::AuthConfig;
use crate::error::{RelayError, Result};

/// One base model as listed by the provider's discovery endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseModelListing {
    /// Canonical friendly name (correlation key across sources).
    pub model_name: String,
    /// Concrete model id accepted by the converse RPC.
    pub model_id: String,
    /// Publishing provider.
    pub provider: String,
    /// Regions that offer the model directly.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Input modalities (`"text"`, `"image"`, `"document"`, `"video"`).
    #[serde(default)]
    pub input_modalities: Vec<String>,
    /// Output modalities.
    #[serde(default)]
    pub output_modalities: Vec<String>,
    /// Whether the streaming variant is supported.
    #[serde(default)]
    pub streaming_supported: bool,
}

/// One cross-region inference profile as listed by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileListing {
    /// Profile id accepted by the converse RPC in place of a model id.
    pub inference_profile_id: String,
    /// Friendly name of the model the profile fronts.
    pub model_name: String,
    /// Regions the profile routes into.
    #[serde(default)]
    pub regions: Vec<String>,
}

/// Read-only access to the provider's per-region discovery listings.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Base models visible from `region`.
    async fn base_models(&self, region: &str) -> Result<Vec<BaseModelListing>>;

    /// Inference profiles visible from `region`.
    async fn inference_profiles(&self, region: &str) -> Result<Vec<ProfileListing>>;
}

#[derive(Debug, Deserialize)]
struct ModelsEnvelope {
    models: Vec<BaseModelListing>,
}

#[derive(Debug, Deserialize)]
struct ProfilesEnvelope {
    profiles: Vec<ProfileListing>,
}

/// Discovery over the provider's HTTP listing endpoints.
#[derive(Debug)]
pub struct HttpDiscovery {
    http: Client,
    config: AuthConfig,
}

impl HttpDiscovery {
    /// Build a discovery client from the transport configuration.
    pub fn new(config: AuthConfig) -> Result<Self> {
        config.validate()?;
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(RelayError::Http)?;
        Ok(Self { http, config })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut request = self.http.get(url);
        if let Some(ref key) = self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Other(format!(
                "discovery request to {} failed with status {}",
                url,
                response.status()
            )));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl DiscoverySource for HttpDiscovery {
    async fn base_models(&self, region: &str) -> Result<Vec<BaseModelListing>> {
        let base = self.config.discovery_endpoint_for(region);
        let url = format!("{}/foundation-models", base.trim_end_matches('/'));
        let envelope: ModelsEnvelope = self.get_json(&url).await?;
        Ok(envelope.models)
    }

    async fn inference_profiles(&self, region: &str) -> Result<Vec<ProfileListing>> {
        let base = self.config.discovery_endpoint_for(region);
        let url = format!("{}/inference-profiles", base.trim_end_matches('/'));
        let envelope: ProfilesEnvelope = self.get_json(&url).await?;
        Ok(envelope.profiles)
    }
}

/// Fixed in-memory discovery data, for tests and the bundled snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    models: Vec<BaseModelListing>,
    profiles: Vec<ProfileListing>,
    failing_regions: HashSet<String>,
}

impl StaticDiscovery {
    /// Build from explicit listings.
    pub fn new(models: Vec<BaseModelListing>, profiles: Vec<ProfileListing>) -> Self {
        Self {
            models,
            profiles,
            failing_regions: HashSet::new(),
        }
    }

    /// Make discovery calls for `region` fail, to exercise partial-failure
    /// handling.
    pub fn with_failing_region(mut self, region: impl Into<String>) -> Self {
        self.failing_regions.insert(region.into());
        self
    }

    fn check_region(&self, region: &str) -> Result<()> {
        if self.failing_regions.contains(region) {
            return Err(RelayError::Other(format!(
                "discovery unavailable in {region}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn base_models(&self, region: &str) -> Result<Vec<BaseModelListing>> {
        self.check_region(region)?;
        Ok(self
            .models
            .iter()
            .filter(|m| m.regions.iter().any(|r| r == region))
            .cloned()
            .collect())
    }

    async fn inference_profiles(&self, region: &str) -> Result<Vec<ProfileListing>> {
        self.check_region(region)?;
        Ok(self
            .profiles
            .iter()
            .filter(|p| p.regions.iter().any(|r| r == region))
            .cloned()
            .collect())
    }
}

/// Last-resort model data shipped with the library, used when every
/// discovery fetch fails.
const BUNDLED_SNAPSHOT: &str = include_str!("bundled_catalog.json");

#[derive(Debug, Deserialize)]
struct BundledData {
    models: Vec<BaseModelListing>,
    profiles: Vec<ProfileListing>,
}

/// Parse the bundled snapshot into listings.
pub fn bundled_listings() -> Result<(Vec<BaseModelListing>, Vec<ProfileListing>)> {
    let data: BundledData = serde_json::from_str(BUNDLED_SNAPSHOT)?;
    Ok((data.models, data.profiles))
}
