//! Subprocess plumbing and runtime-environment detection.
//!
//! Every component that shells out (workspace creation, package
//! installs, the guest driver) goes through the [`CommandRunner`] seam
//! so tests can substitute a scripted runner.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Interleaved textual output, stdout first, matching what callers
    /// report back in `ExecutionResult.output`.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        combined.push_str(&self.stderr);
        combined
    }
}

/// Invocation descriptor for a single child process.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
    pub cwd: Option<std::path::PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Real runner backed by `tokio::process`, killing the child on
/// timeout so no subprocess outlives its request.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: CommandSpec) -> std::io::Result<CommandOutput> {
        debug!(program = %spec.program, args = ?spec.args, "spawning child process");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let child = command.spawn()?;
        let output = match spec.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(program = %spec.program, ?timeout, "child process timed out, killed");
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("{} timed out after {:?}", spec.program, timeout),
                    ));
                }
            },
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Where the worker process is running, which drives the install
/// strategy (isolated prefix vs. system-wide).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnv {
    Containerized,
    Host,
}

impl RuntimeEnv {
    pub fn probe() -> Self {
        Self::probe_at(Path::new("/.dockerenv"))
    }

    pub fn probe_at(docker_marker: &Path) -> Self {
        if docker_marker.exists() || std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
            RuntimeEnv::Containerized
        } else {
            RuntimeEnv::Host
        }
    }
}
