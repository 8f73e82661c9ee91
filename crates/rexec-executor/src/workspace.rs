//! Persistent workspace provisioning on a shared volume.
//!
//! Many worker processes (possibly on separate hosts mounting the same
//! network path) share one workspace per deployment identifier. The
//! initialization path must therefore hold an OS advisory lock, not an
//! in-memory flag: contenders are separate processes. Validity is
//! re-checked under the lock because another initializer may have
//! finished while this one waited.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rexec_common::{Result, WorkerError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::runtime::{CommandRunner, CommandSpec};

pub const RUNTIMES_DIR: &str = "runtimes";
pub const VENV_DIR: &str = ".venv";
pub const CACHE_DIR: &str = ".uv-cache";
pub const LOCK_FILE: &str = ".init.lock";
pub const READY_MARKER: &str = ".ready";

/// A provisioned workspace: per-identifier subtree plus the
/// volume-wide package cache shared across identifiers.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub id: String,
    pub path: PathBuf,
    pub venv: PathBuf,
    pub cache: PathBuf,
}

impl WorkspaceHandle {
    pub fn python(&self) -> PathBuf {
        self.venv.join("bin").join("python")
    }

    fn marker(&self) -> PathBuf {
        self.path.join(READY_MARKER)
    }

    fn lock_path(&self) -> PathBuf {
        self.path.join(LOCK_FILE)
    }
}

pub struct WorkspaceManager {
    root: PathBuf,
    lock_timeout: Duration,
    poll_interval: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl WorkspaceManager {
    pub fn new(
        root: impl Into<PathBuf>,
        lock_timeout: Duration,
        poll_interval: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        WorkspaceManager {
            root: root.into(),
            lock_timeout,
            poll_interval,
            runner,
        }
    }

    pub fn handle_for(&self, id: &str) -> WorkspaceHandle {
        let path = self.root.join(RUNTIMES_DIR).join(id);
        WorkspaceHandle {
            id: id.to_string(),
            venv: path.join(VENV_DIR),
            cache: self.root.join(CACHE_DIR),
            path,
        }
    }

    /// Ensures a valid execution environment exists for `id`, creating
    /// it at most once across all concurrent callers sharing the
    /// volume. Idempotent; safe to call per request.
    pub async fn ensure_ready(&self, id: &str) -> Result<WorkspaceHandle> {
        let handle = self.handle_for(id);

        // Fast path: no locking when the environment already validates.
        if self.is_valid(&handle).await {
            return Ok(handle);
        }

        tokio::fs::create_dir_all(&handle.path).await?;
        tokio::fs::create_dir_all(&handle.cache).await?;

        let guard = match self.acquire_lock(&handle).await? {
            Some(guard) => guard,
            // The lock holder finished initializing while we waited.
            None => return Ok(handle),
        };

        // Double-check: another process may have initialized while we
        // waited on the lock.
        if self.is_valid(&handle).await {
            debug!(id, "workspace initialized by a concurrent worker");
            drop(guard);
            return Ok(handle);
        }

        let created = self.create_environment(&handle).await;
        drop(guard);
        created?;
        Ok(handle)
    }

    /// Cheap functional validation: the ready marker must be present
    /// and the provisioned interpreter must actually start. A broken
    /// or partially-written environment fails here and gets rebuilt.
    pub async fn is_valid(&self, handle: &WorkspaceHandle) -> bool {
        if !handle.marker().exists() {
            return false;
        }
        let python = handle.python();
        if !python.exists() {
            return false;
        }
        match self
            .runner
            .run(
                CommandSpec::new(python.to_string_lossy())
                    .arg("-c")
                    .arg("import sys"),
            )
            .await
        {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(id = %handle.id, stderr = %output.stderr, "workspace interpreter probe failed");
                false
            }
            Err(err) => {
                warn!(id = %handle.id, %err, "workspace interpreter probe could not run");
                false
            }
        }
    }

    /// Acquires the per-identifier advisory lock with a bounded polled
    /// wait. Returns `None` when the workspace became valid while
    /// waiting: the holder finished, so there is nothing left to do.
    async fn acquire_lock(&self, handle: &WorkspaceHandle) -> Result<Option<LockGuard>> {
        let lock_path = handle.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            if try_lock_exclusive(&file)? {
                debug!(id = %handle.id, "acquired workspace lock");
                return Ok(Some(LockGuard { file }));
            }
            if self.is_valid(handle).await {
                debug!(id = %handle.id, "workspace became valid while waiting for lock");
                return Ok(None);
            }
            if Instant::now() >= deadline {
                warn!(id = %handle.id, timeout = ?self.lock_timeout, "workspace lock wait timed out");
                return Err(WorkerError::WorkspaceLockTimeout(self.lock_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// (Re)creates the environment from scratch under the lock,
    /// discarding any partial prior state first.
    async fn create_environment(&self, handle: &WorkspaceHandle) -> Result<()> {
        if handle.venv.exists() {
            debug!(id = %handle.id, "discarding partial or corrupt environment");
            tokio::fs::remove_dir_all(&handle.venv).await?;
        }
        let _ = tokio::fs::remove_file(handle.marker()).await;

        info!(id = %handle.id, venv = %handle.venv.display(), "creating workspace environment");
        let output = self
            .runner
            .run(
                CommandSpec::new("uv")
                    .arg("venv")
                    .arg(handle.venv.to_string_lossy())
                    .env("UV_CACHE_DIR", handle.cache.to_string_lossy()),
            )
            .await
            .map_err(|e| WorkerError::WorkspaceInit(format!("failed to run uv: {e}")))?;

        if !output.success() {
            return Err(WorkerError::WorkspaceInit(format!(
                "uv venv exited with {:?}: {}",
                output.exit_code, output.stderr
            )));
        }

        tokio::fs::write(handle.marker(), b"ok").await?;
        info!(id = %handle.id, "workspace environment ready");
        Ok(())
    }
}

/// RAII guard over the advisory lock file. Dropping it releases the
/// lock and closes the descriptor on every exit path.
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Errors on unlock are unrecoverable here; the close below
        // releases the lock regardless.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Non-blocking exclusive `flock`. `Ok(false)` means another process
/// (or another descriptor in this one) holds the lock.
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}
