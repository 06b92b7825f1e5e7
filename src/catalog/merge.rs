//! Merging the two discovery sources into unified model entries.
//!
//! Rules: a (model, region) pair present only in the base-model listing is
//! `Direct`; present only in a profile listing is `CrisOnly`; present in
//! both is `Both`. Correlation across sources is by canonical model name —
//! exact match first, then (when enabled) a conservative fuzzy match that
//! logs both strings.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::discovery::{BaseModelListing, ProfileListing};
use super::{AccessInfo, ModelEntry};

/// Counters from one merge pass, logged after refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Profiles linked to a base model by exact name.
    pub exact_matches: usize,
    /// Profiles linked via fuzzy matching.
    pub fuzzy_matches: usize,
    /// Profiles with no base-model counterpart (entry created as
    /// profile-only).
    pub unmatched_profiles: usize,
    /// Base models with no profile.
    pub base_only_models: usize,
}

/// Lowercased, alphanumeric-only form used for fuzzy comparison.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn fuzzy_find<'a>(
    profile_name: &str,
    bases: &'a BTreeMap<String, BaseModelListing>,
) -> Option<&'a str> {
    let needle = normalize(profile_name);
    if needle.is_empty() {
        return None;
    }
    // Normalized equality beats containment.
    for name in bases.keys() {
        if normalize(name) == needle {
            return Some(name.as_str());
        }
    }
    bases
        .keys()
        .find(|name| {
            let hay = normalize(name);
            hay.contains(&needle) || needle.contains(&hay)
        })
        .map(String::as_str)
}

/// Merge base-model and profile listings into unified entries.
///
/// Duplicate base listings for the same model (one per region queried) are
/// unioned first. `enable_fuzzy` controls the last-resort name correlation.
pub fn merge_listings(
    bases: Vec<BaseModelListing>,
    profiles: Vec<ProfileListing>,
    enable_fuzzy: bool,
) -> (BTreeMap<String, ModelEntry>, MergeStats) {
    let mut stats = MergeStats::default();

    // Union duplicate base listings by model name.
    let mut base_index: BTreeMap<String, BaseModelListing> = BTreeMap::new();
    for listing in bases {
        match base_index.get_mut(&listing.model_name) {
            Some(existing) => {
                for region in listing.regions {
                    if !existing.regions.contains(&region) {
                        existing.regions.push(region);
                    }
                }
            }
            None => {
                base_index.insert(listing.model_name.clone(), listing);
            }
        }
    }

    // Link each profile to a base model name (or keep it standalone).
    // profile routes: model name -> region -> profile id
    let mut profile_routes: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut standalone_profiles: Vec<ProfileListing> = Vec::new();
    for profile in profiles {
        let linked_name = if base_index.contains_key(&profile.model_name) {
            stats.exact_matches += 1;
            Some(profile.model_name.clone())
        } else if enable_fuzzy {
            match fuzzy_find(&profile.model_name, &base_index) {
                Some(base_name) => {
                    warn!(
                        profile_model = %profile.model_name,
                        base_model = %base_name,
                        "fuzzy-matched inference profile to base model"
                    );
                    stats.fuzzy_matches += 1;
                    Some(base_name.to_string())
                }
                None => None,
            }
        } else {
            None
        };

        match linked_name {
            Some(name) => {
                let routes = profile_routes.entry(name).or_default();
                for region in &profile.regions {
                    routes.insert(region.clone(), profile.inference_profile_id.clone());
                }
            }
            None => {
                debug!(
                    profile_model = %profile.model_name,
                    "no base model for inference profile; keeping profile-only entry"
                );
                stats.unmatched_profiles += 1;
                standalone_profiles.push(profile);
            }
        }
    }

    let mut entries = BTreeMap::new();

    for (name, base) in base_index {
        let routes = profile_routes.remove(&name).unwrap_or_default();
        if routes.is_empty() {
            stats.base_only_models += 1;
        }

        let mut per_region: BTreeMap<String, AccessInfo> = BTreeMap::new();
        for region in &base.regions {
            per_region.insert(
                region.clone(),
                match routes.get(region) {
                    Some(profile_id) => AccessInfo::both(region, &base.model_id, profile_id),
                    None => AccessInfo::direct(region, &base.model_id),
                },
            );
        }
        for (region, profile_id) in &routes {
            per_region
                .entry(region.clone())
                .or_insert_with(|| AccessInfo::cris_only(region, profile_id));
        }

        entries.insert(
            name.clone(),
            ModelEntry {
                model_name: name,
                provider: base.provider,
                per_region,
                streaming_supported: base.streaming_supported,
                input_modalities: base.input_modalities,
                output_modalities: base.output_modalities,
            },
        );
    }

    // Profiles with no base model still yield reachable entries.
    for profile in standalone_profiles {
        let entry = entries
            .entry(profile.model_name.clone())
            .or_insert_with(|| ModelEntry {
                model_name: profile.model_name.clone(),
                provider: "unknown".into(),
                per_region: BTreeMap::new(),
                streaming_supported: false,
                input_modalities: vec!["text".into()],
                output_modalities: vec!["text".into()],
            });
        for region in &profile.regions {
            entry
                .per_region
                .entry(region.clone())
                .or_insert_with(|| AccessInfo::cris_only(region, &profile.inference_profile_id));
        }
    }

    (entries, stats)
}
