//! Access methods: how a model is reachable in a region.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a (model, region) pair can be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMethod {
    /// The provider accepts the base model id in the region.
    Direct,
    /// Only an inference profile reaches the model from this region.
    CrisOnly,
    /// Both routes work; direct is preferred.
    Both,
}

impl AccessMethod {
    /// Snake-case name used in attempt records and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMethod::Direct => "direct",
            AccessMethod::CrisOnly => "cris_only",
            AccessMethod::Both => "both",
        }
    }
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access information for one (model, region) pair.
///
/// Invariants: `Direct` implies `model_id` is set; `CrisOnly` implies
/// `inference_profile_id` is set; `Both` implies both are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessInfo {
    /// How the pair is reachable.
    pub access_method: AccessMethod,
    /// The region this info applies to.
    pub region: String,
    /// Base model id, when direct access exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Inference-profile id, when profile access exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_profile_id: Option<String>,
}

impl AccessInfo {
    /// Direct-only access.
    pub fn direct(region: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            access_method: AccessMethod::Direct,
            region: region.into(),
            model_id: Some(model_id.into()),
            inference_profile_id: None,
        }
    }

    /// Profile-only access.
    pub fn cris_only(region: impl Into<String>, profile_id: impl Into<String>) -> Self {
        Self {
            access_method: AccessMethod::CrisOnly,
            region: region.into(),
            model_id: None,
            inference_profile_id: Some(profile_id.into()),
        }
    }

    /// Access via both routes.
    pub fn both(
        region: impl Into<String>,
        model_id: impl Into<String>,
        profile_id: impl Into<String>,
    ) -> Self {
        Self {
            access_method: AccessMethod::Both,
            region: region.into(),
            model_id: Some(model_id.into()),
            inference_profile_id: Some(profile_id.into()),
        }
    }

    /// The identifier to pass to the converse RPC, preferring direct access.
    pub fn preferred_invoke_id(&self) -> Option<&str> {
        match self.access_method {
            AccessMethod::Direct | AccessMethod::Both => self.model_id.as_deref(),
            AccessMethod::CrisOnly => self.inference_profile_id.as_deref(),
        }
    }

    /// The access method actually exercised by [`preferred_invoke_id`]:
    /// `Both` resolves to `Direct`.
    ///
    /// [`preferred_invoke_id`]: Self::preferred_invoke_id
    pub fn effective_method(&self) -> AccessMethod {
        match self.access_method {
            AccessMethod::Both => AccessMethod::Direct,
            m => m,
        }
    }

    /// Check the method/id invariants.
    pub fn is_consistent(&self) -> bool {
        match self.access_method {
            AccessMethod::Direct => self.model_id.is_some(),
            AccessMethod::CrisOnly => self.inference_profile_id.is_some(),
            AccessMethod::Both => self.model_id.is_some() && self.inference_profile_id.is_some(),
        }
    }
}

/// A recommendation produced by the catalog: the preferred route plus
/// alternatives and a short rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecommendation {
    /// The route to use.
    pub primary: AccessInfo,
    /// Other workable routes, if any.
    pub alternatives: Vec<AccessInfo>,
    /// Why the primary was chosen.
    pub rationale: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_id_prefers_direct() {
        let both = AccessInfo::both("us-east-1", "provider.model-v1", "us.provider.model-v1");
        assert_eq!(both.preferred_invoke_id(), Some("provider.model-v1"));
        assert_eq!(both.effective_method(), AccessMethod::Direct);

        let cris = AccessInfo::cris_only("eu-west-1", "eu.provider.model-v1");
        assert_eq!(cris.preferred_invoke_id(), Some("eu.provider.model-v1"));
        assert_eq!(cris.effective_method(), AccessMethod::CrisOnly);
    }

    #[test]
    fn test_consistency() {
        assert!(AccessInfo::direct("r", "m").is_consistent());
        assert!(AccessInfo::cris_only("r", "p").is_consistent());
        assert!(AccessInfo::both("r", "m", "p").is_consistent());

        let broken = AccessInfo {
            access_method: AccessMethod::Both,
            region: "r".into(),
            model_id: None,
            inference_profile_id: Some("p".into()),
        };
        assert!(!broken.is_consistent());
    }
}
