//! Routing-table cache with TTL-gated reconciliation.
//!
//! The manifest maps function names to resource identifiers and
//! resource identifiers to endpoint URLs. The external store is always
//! the source of truth; the local file is a whole-file cache whose
//! modification time doubles as the staleness clock, so the hot path
//! never touches the network. Refresh is request-scoped (no background
//! daemons) and single-flight within the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceEntry {
    pub endpoint: String,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

/// One immutable generation of the routing table. Never merged
/// incrementally: a fetch replaces the whole thing or nothing.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub generation: u64,
    /// function name -> resource identifier
    #[serde(default)]
    pub functions: HashMap<String, String>,
    /// resource identifier -> endpoint
    #[serde(default)]
    pub resources: HashMap<String, ResourceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl Manifest {
    /// Resolves a function to the endpoint of its (healthy) resource.
    pub fn endpoint_for(&self, function: &str) -> Option<&str> {
        let resource = self.functions.get(function)?;
        self.resources
            .get(resource)
            .filter(|entry| entry.healthy)
            .map(|entry| entry.endpoint.as_str())
    }

    /// The resource a function is mapped to, healthy or not.
    pub fn resource_for(&self, function: &str) -> Option<&str> {
        self.functions.get(function).map(String::as_str)
    }
}

/// External source of truth for manifests.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn fetch(&self, endpoint_id: &str) -> anyhow::Result<Option<Manifest>>;
}

/// Manifest store client over HTTP with bearer-token auth.
pub struct HttpManifestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpManifestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(HttpManifestStore {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl ManifestStore for HttpManifestStore {
    async fn fetch(&self, endpoint_id: &str) -> anyhow::Result<Option<Manifest>> {
        let url = format!(
            "{}/v1/endpoints/{}/manifest",
            self.base_url.trim_end_matches('/'),
            endpoint_id
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json::<Manifest>().await?))
    }
}

/// Store for deployments with no manifest source configured; the
/// reconciler's identity gate keeps it from ever being consulted.
pub struct NullStore;

#[async_trait]
impl ManifestStore for NullStore {
    async fn fetch(&self, _endpoint_id: &str) -> anyhow::Result<Option<Manifest>> {
        Ok(None)
    }
}

/// Identity needed to talk to the manifest store. Refresh is
/// structurally inapplicable without it.
#[derive(Debug, Clone)]
pub struct StoreIdentity {
    pub endpoint_id: String,
    pub api_key: String,
}

pub struct ManifestReconciler {
    path: PathBuf,
    ttl: Duration,
    store: Arc<dyn ManifestStore>,
    identity: Option<StoreIdentity>,
    disabled: bool,
    // Single-flight gate: concurrent in-process callers wait for the
    // one in-flight refresh instead of issuing duplicate fetches.
    refresh_gate: Mutex<()>,
}

impl ManifestReconciler {
    pub fn new(
        path: impl Into<PathBuf>,
        ttl: Duration,
        store: Arc<dyn ManifestStore>,
        identity: Option<StoreIdentity>,
        disabled: bool,
    ) -> Self {
        ManifestReconciler {
            path: path.into(),
            ttl,
            store,
            identity,
            disabled,
            refresh_gate: Mutex::new(()),
        }
    }

    /// Refreshes the local manifest from the store when its age has
    /// reached the TTL. Returns `true` when the manifest is fresh,
    /// was refreshed, or failed to refresh but remains usable as-is;
    /// `false` only when refresh does not apply to this deployment at
    /// all. Never fails on transient store errors.
    pub async fn refresh_if_stale(&self) -> bool {
        if self.disabled {
            debug!("manifest refresh disabled by configuration");
            return false;
        }
        let Some(identity) = &self.identity else {
            debug!("no store identity configured, skipping manifest refresh");
            return false;
        };

        if !self.is_stale() {
            return true;
        }

        let _flight = self.refresh_gate.lock().await;
        // Re-check under the gate: the refresh we waited on may have
        // already replaced the file.
        if !self.is_stale() {
            return true;
        }

        debug!(path = %self.path.display(), "manifest is stale, refreshing from store");
        match self.store.fetch(&identity.endpoint_id).await {
            Ok(Some(mut manifest)) => {
                manifest.fetched_at = Some(Utc::now());
                if let Err(err) = self.persist(&manifest) {
                    warn!(%err, "failed to persist refreshed manifest");
                } else {
                    info!(generation = manifest.generation, "manifest refreshed from store");
                }
            }
            Ok(None) => {
                warn!("store holds no manifest for this endpoint, keeping local copy");
            }
            Err(err) => {
                warn!(%err, "manifest refresh failed, continuing with stale manifest");
            }
        }
        true
    }

    /// Staleness from local filesystem metadata only. Missing or
    /// unreadable files count as stale; age equal to the TTL is stale.
    pub fn is_stale(&self) -> bool {
        age_of(&self.path)
            .map(|age| age >= self.ttl)
            .unwrap_or(true)
    }

    /// Loads the current manifest generation, if any. A corrupt file is
    /// treated the same as a missing one.
    pub fn load(&self) -> Option<Manifest> {
        let raw = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "manifest file unreadable, ignoring");
                None
            }
        }
    }

    /// Atomic whole-file replacement: write to a scratch file in the
    /// same directory, then rename over the old generation so a reader
    /// never observes a mix of two generations.
    fn persist(&self, manifest: &Manifest) -> std::io::Result<()> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut scratch = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut scratch, manifest)?;
        scratch.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn age_of(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with(function: &str, resource: &str, endpoint: &str, healthy: bool) -> Manifest {
        let mut m = Manifest {
            generation: 1,
            ..Default::default()
        };
        m.functions.insert(function.into(), resource.into());
        m.resources.insert(
            resource.into(),
            ResourceEntry {
                endpoint: endpoint.into(),
                healthy,
            },
        );
        m
    }

    #[test]
    fn endpoint_resolution_requires_healthy_resource() {
        let m = manifest_with("embed", "res-1", "http://a:8000", true);
        assert_eq!(m.endpoint_for("embed"), Some("http://a:8000"));
        assert_eq!(m.endpoint_for("missing"), None);

        let sick = manifest_with("embed", "res-1", "http://a:8000", false);
        assert_eq!(sick.endpoint_for("embed"), None);
        assert_eq!(sick.resource_for("embed"), Some("res-1"));
    }

    #[test]
    fn persist_replaces_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ManifestStore> = Arc::new(NullStore);
        let reconciler = ManifestReconciler::new(
            dir.path().join("manifest.json"),
            Duration::from_secs(300),
            store,
            None,
            false,
        );

        reconciler
            .persist(&manifest_with("a", "r1", "http://a", true))
            .unwrap();
        reconciler
            .persist(&manifest_with("b", "r2", "http://b", true))
            .unwrap();

        let loaded = reconciler.load().unwrap();
        assert!(loaded.functions.contains_key("b"));
        assert!(!loaded.functions.contains_key("a"));
    }

    #[test]
    fn missing_or_corrupt_manifest_is_stale_and_unloadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let reconciler = ManifestReconciler::new(
            &path,
            Duration::from_secs(300),
            Arc::new(NullStore) as Arc<dyn ManifestStore>,
            None,
            false,
        );
        assert!(reconciler.is_stale());
        assert!(reconciler.load().is_none());

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(reconciler.load().is_none());
    }
}
