//! Environment-driven worker configuration.
//!
//! Read once at startup; components receive plain values or a shared
//! `WorkerConfig` rather than consulting the environment themselves, so
//! tests can construct isolated instances per case.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MANIFEST_TTL_SECS: u64 = 300;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOCK_POLL_MS: u64 = 500;
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;

/// Default mount point of the shared network volume. When absent the
/// worker falls back to container-local storage with no cross-process
/// sharing.
pub const DEFAULT_VOLUME_PATH: &str = "/rexec-volume";
pub const DEFAULT_LOCAL_WORKSPACE: &str = "/app";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root of the (possibly network-backed) volume holding workspaces.
    pub volume_path: PathBuf,
    /// Fallback workspace when no volume is mounted.
    pub local_workspace: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest_ttl: Duration,
    pub manifest_refresh_disabled: bool,
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
    pub exec_timeout: Duration,
    /// Identity of this deployment in the external manifest store.
    pub endpoint_id: Option<String>,
    pub api_key: Option<String>,
    pub state_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            volume_path: PathBuf::from(DEFAULT_VOLUME_PATH),
            local_workspace: PathBuf::from(DEFAULT_LOCAL_WORKSPACE),
            manifest_path: PathBuf::from(DEFAULT_LOCAL_WORKSPACE).join("manifest.json"),
            manifest_ttl: Duration::from_secs(DEFAULT_MANIFEST_TTL_SECS),
            manifest_refresh_disabled: false,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            lock_poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_MS),
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            endpoint_id: None,
            api_key: None,
            state_url: None,
        }
    }
}

impl WorkerConfig {
    /// Builds the configuration from `REXEC_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = WorkerConfig::default();
        let volume_path = env_path("REXEC_VOLUME_PATH").unwrap_or(defaults.volume_path);
        let local_workspace =
            env_path("REXEC_WORKSPACE_PATH").unwrap_or(defaults.local_workspace);
        let manifest_path =
            env_path("REXEC_MANIFEST_PATH").unwrap_or_else(|| local_workspace.join("manifest.json"));

        WorkerConfig {
            volume_path,
            local_workspace,
            manifest_path,
            manifest_ttl: env_secs("REXEC_MANIFEST_TTL_SECS", DEFAULT_MANIFEST_TTL_SECS),
            manifest_refresh_disabled: env_flag("REXEC_DISABLE_MANIFEST_REFRESH"),
            lock_timeout: env_secs("REXEC_LOCK_TIMEOUT_SECS", DEFAULT_LOCK_TIMEOUT_SECS),
            lock_poll_interval: Duration::from_millis(env_u64(
                "REXEC_LOCK_POLL_MS",
                DEFAULT_LOCK_POLL_MS,
            )),
            exec_timeout: env_secs("REXEC_EXEC_TIMEOUT_SECS", DEFAULT_EXEC_TIMEOUT_SECS),
            endpoint_id: env_nonempty("REXEC_ENDPOINT_ID"),
            api_key: env_nonempty("REXEC_API_KEY"),
            state_url: env_nonempty("REXEC_STATE_URL"),
        }
    }

    /// Whether a shared persistent volume is mounted on this host.
    pub fn has_volume(&self) -> bool {
        self.volume_path.exists()
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_nonempty(key).map(PathBuf::from)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_nonempty(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_u64(key, default))
}

fn env_flag(key: &str) -> bool {
    matches!(
        env_nonempty(key).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.manifest_ttl, Duration::from_secs(300));
        assert_eq!(cfg.lock_timeout, Duration::from_secs(30));
        assert_eq!(cfg.lock_poll_interval, Duration::from_millis(500));
        assert!(!cfg.manifest_refresh_disabled);
        assert!(cfg.endpoint_id.is_none());
    }
}
