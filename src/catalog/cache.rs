//! Persistence of discovery data: a single versioned JSON blob, on disk or
//! in process memory.
//!
//! A stored blob whose `format_version` differs from the current one is
//! discarded; expiry is age-based. Unknown keys in the blob are ignored on
//! read so newer writers do not break older readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

use super::ModelEntry;
use crate::error::Result;

/// Version of the cache blob layout. Bump on incompatible changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// File name of the on-disk blob inside the configured cache directory.
pub const CACHE_FILE_NAME: &str = "model_catalog.json";

/// Which regions contributed to (or failed out of) the last refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogMetadata {
    /// Regions whose discovery fetches succeeded.
    #[serde(default)]
    pub successful_regions: Vec<String>,
    /// Regions whose discovery fetches failed (non-fatal).
    #[serde(default)]
    pub failed_regions: Vec<String>,
}

/// The serialized catalog: everything needed to rebuild a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheBlob {
    /// Layout version; mismatches discard the blob.
    pub format_version: u32,
    /// When the discovery data was fetched.
    pub retrieval_timestamp: DateTime<Utc>,
    /// Unified model entries.
    pub models: BTreeMap<String, ModelEntry>,
    /// Refresh provenance.
    #[serde(default)]
    pub metadata: CatalogMetadata,
}

impl CacheBlob {
    /// Build a blob stamped with the current time.
    pub fn new(models: BTreeMap<String, ModelEntry>, metadata: CatalogMetadata) -> Self {
        Self {
            format_version: CACHE_FORMAT_VERSION,
            retrieval_timestamp: Utc::now(),
            models,
            metadata,
        }
    }

    /// Whether the blob is older than `max_age`.
    pub fn is_expired(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.retrieval_timestamp);
        match chrono::Duration::from_std(max_age) {
            Ok(max) => age > max,
            Err(_) => false,
        }
    }
}

/// Full path of the blob inside `directory`.
pub fn cache_path(directory: &Path) -> PathBuf {
    directory.join(CACHE_FILE_NAME)
}

/// Load a usable blob from disk, or `None` when absent, unreadable,
/// version-mismatched, or expired.
pub fn load_file(path: &Path, max_age: Duration) -> Option<CacheBlob> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => {
            debug!(path = %path.display(), "no catalog cache file");
            return None;
        }
    };
    let blob: CacheBlob = match serde_json::from_str(&text) {
        Ok(blob) => blob,
        Err(error) => {
            warn!(path = %path.display(), %error, "discarding unreadable catalog cache");
            return None;
        }
    };
    if blob.format_version != CACHE_FORMAT_VERSION {
        warn!(
            stored = blob.format_version,
            current = CACHE_FORMAT_VERSION,
            "discarding catalog cache with mismatched format version"
        );
        return None;
    }
    if blob.is_expired(max_age) {
        debug!(path = %path.display(), "catalog cache expired");
        return None;
    }
    Some(blob)
}

/// Write the blob to disk, creating the parent directory if needed.
pub fn store_file(path: &Path, blob: &CacheBlob) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| crate::error::RelayError::Other(format!("cannot create {}: {e}", parent.display())))?;
    }
    let text = serde_json::to_string_pretty(blob)?;
    std::fs::write(path, text)
        .map_err(|e| crate::error::RelayError::Other(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

fn memory_store() -> &'static Mutex<HashMap<String, CacheBlob>> {
    static STORE: OnceLock<Mutex<HashMap<String, CacheBlob>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Cache key for a region set: sorted and joined, so ordering does not
/// fragment the cache.
pub fn memory_key(regions: &[String]) -> String {
    let mut sorted: Vec<&str> = regions.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

/// Load an unexpired blob from the process-wide memory cache.
pub fn load_memory(key: &str, max_age: Duration) -> Option<CacheBlob> {
    let store = memory_store().lock().expect("memory cache lock poisoned");
    store
        .get(key)
        .filter(|blob| blob.format_version == CACHE_FORMAT_VERSION && !blob.is_expired(max_age))
        .cloned()
}

/// Store a blob in the process-wide memory cache.
pub fn store_memory(key: &str, blob: CacheBlob) {
    let mut store = memory_store().lock().expect("memory cache lock poisoned");
    store.insert(key.to_string(), blob);
}
