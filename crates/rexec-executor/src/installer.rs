//! Differential installation of language and OS packages.
//!
//! Probes what is already present, installs only the missing subset in
//! one batched invocation per package class, and picks the install
//! strategy from the runtime environment: an isolated venv prefix when
//! a shared workspace is mounted, system-wide inside a container.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rexec_common::{Result, WorkerError};
use tracing::{debug, info};

use crate::runtime::{CommandRunner, CommandSpec, RuntimeEnv};
use crate::workspace::WorkspaceHandle;

/// Fast local probe of what the active environment already provides.
/// Read-only and safe to recompute per request.
#[derive(Debug, Default, Clone)]
pub struct InstalledPackageSet {
    /// language package name -> installed version
    pub language: HashMap<String, String>,
    pub os: HashSet<String>,
}

impl InstalledPackageSet {
    /// A `name==version` pin is satisfied only by that exact version;
    /// an unpinned name is satisfied by any installed version.
    pub fn satisfies_language(&self, spec: &str) -> bool {
        match spec.split_once("==") {
            Some((name, version)) => self.language.get(name.trim()) == Some(&version.trim().into()),
            None => {
                let name = spec
                    .split(|c| c == '>' || c == '<' || c == '~')
                    .next()
                    .unwrap_or(spec)
                    .trim();
                // Range-constrained specs always go to the installer;
                // only bare names can be skipped on a version match.
                name == spec && self.language.contains_key(name)
            }
        }
    }

    pub fn satisfies_os(&self, name: &str) -> bool {
        self.os.contains(name)
    }
}

#[derive(Debug, Default, Clone)]
pub struct InstallReport {
    pub installed_language: Vec<String>,
    pub installed_os: Vec<String>,
    pub skipped: Vec<String>,
    pub output: String,
}

pub struct DependencyInstaller {
    runner: Arc<dyn CommandRunner>,
    workspace: Option<WorkspaceHandle>,
    env: RuntimeEnv,
}

impl DependencyInstaller {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        workspace: Option<WorkspaceHandle>,
        env: RuntimeEnv,
    ) -> Self {
        DependencyInstaller {
            runner,
            workspace,
            env,
        }
    }

    /// Installs the missing subset of the requested packages. Any
    /// single failure fails the whole call with the offending package
    /// class and names in the error detail; there is no partial silent
    /// success.
    pub async fn install(&self, language: &[String], os: &[String]) -> Result<InstallReport> {
        let mut report = InstallReport::default();
        if language.is_empty() && os.is_empty() {
            return Ok(report);
        }

        let installed = self.probe_installed().await;

        let missing_os: Vec<String> = os
            .iter()
            .filter(|p| !installed.satisfies_os(p))
            .cloned()
            .collect();
        let missing_language: Vec<String> = language
            .iter()
            .filter(|p| !installed.satisfies_language(p))
            .cloned()
            .collect();
        report.skipped = language
            .iter()
            .chain(os.iter())
            .filter(|p| !missing_language.contains(p) && !missing_os.contains(p))
            .cloned()
            .collect();

        // OS packages first: language packages may need their shared
        // libraries at build time.
        if !missing_os.is_empty() {
            self.install_os(&missing_os, &mut report).await?;
            report.installed_os = missing_os;
        }
        if !missing_language.is_empty() {
            self.install_language(&missing_language, &mut report).await?;
            report.installed_language = missing_language;
        }

        Ok(report)
    }

    pub async fn probe_installed(&self) -> InstalledPackageSet {
        let mut set = InstalledPackageSet::default();

        let mut freeze = CommandSpec::new("uv").args(["pip", "list", "--format=freeze"]);
        if let Some(ws) = &self.workspace {
            freeze = freeze.env("VIRTUAL_ENV", ws.venv.to_string_lossy());
        }
        if let Ok(output) = self.runner.run(freeze).await {
            if output.success() {
                for line in output.stdout.lines() {
                    if let Some((name, version)) = line.split_once("==") {
                        set.language
                            .insert(name.trim().to_string(), version.trim().to_string());
                    }
                }
            }
        }

        let dpkg = CommandSpec::new("dpkg-query").args(["-W", "-f=${Package}\\n"]);
        if let Ok(output) = self.runner.run(dpkg).await {
            if output.success() {
                set.os
                    .extend(output.stdout.lines().map(|l| l.trim().to_string()));
            }
        }

        debug!(
            language = set.language.len(),
            os = set.os.len(),
            "probed installed packages"
        );
        set
    }

    async fn install_os(&self, packages: &[String], report: &mut InstallReport) -> Result<()> {
        info!(?packages, "installing OS packages");

        let update = self
            .runner
            .run(
                CommandSpec::new("apt-get")
                    .arg("update")
                    .env("DEBIAN_FRONTEND", "noninteractive"),
            )
            .await
            .map_err(|e| dependency_error(packages, format!("apt-get update failed: {e}")))?;
        report.output.push_str(&update.combined());
        if !update.success() {
            return Err(dependency_error(
                packages,
                format!("apt-get update exited with {:?}", update.exit_code),
            ));
        }

        let install = self
            .runner
            .run(
                CommandSpec::new("apt-get")
                    .args(["install", "-y", "--no-install-recommends"])
                    .args(packages.iter().cloned())
                    .env("DEBIAN_FRONTEND", "noninteractive"),
            )
            .await
            .map_err(|e| dependency_error(packages, e.to_string()))?;
        report.output.push_str(&install.combined());
        if !install.success() {
            return Err(dependency_error(packages, install.stderr));
        }
        Ok(())
    }

    async fn install_language(
        &self,
        packages: &[String],
        report: &mut InstallReport,
    ) -> Result<()> {
        info!(?packages, "installing language packages");

        let mut spec = CommandSpec::new("uv")
            .args(["pip", "install", "--no-cache-dir"])
            .args(packages.iter().cloned());
        match &self.workspace {
            Some(ws) => {
                spec = spec
                    .env("VIRTUAL_ENV", ws.venv.to_string_lossy())
                    .env("UV_CACHE_DIR", ws.cache.to_string_lossy());
            }
            // No isolated prefix to target; inside a container the
            // system interpreter is the only environment there is.
            None if self.env == RuntimeEnv::Containerized => {
                spec = spec.arg("--system");
            }
            None => {}
        }

        let install = self
            .runner
            .run(spec)
            .await
            .map_err(|e| dependency_error(packages, e.to_string()))?;
        report.output.push_str(&install.combined());
        if !install.success() {
            return Err(dependency_error(packages, install.stderr));
        }
        Ok(())
    }
}

fn dependency_error(packages: &[String], detail: String) -> WorkerError {
    WorkerError::Dependency {
        packages: packages.join(", "),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted runner: canned probe output, records every install
    /// invocation it sees.
    struct ScriptedRunner {
        freeze: String,
        dpkg: String,
        calls: Mutex<Vec<CommandSpec>>,
        fail_matching: Option<String>,
    }

    impl ScriptedRunner {
        fn new(freeze: &str, dpkg: &str) -> Self {
            ScriptedRunner {
                freeze: freeze.into(),
                dpkg: dpkg.into(),
                calls: Mutex::new(Vec::new()),
                fail_matching: None,
            }
        }

        fn install_calls(&self) -> Vec<CommandSpec> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.args.contains(&"install".to_string()))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: CommandSpec) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            let stdout = match (spec.program.as_str(), spec.args.first().map(String::as_str)) {
                ("uv", Some("pip")) if spec.args.contains(&"list".to_string()) => {
                    self.freeze.clone()
                }
                ("dpkg-query", _) => self.dpkg.clone(),
                _ => String::new(),
            };
            if let Some(pattern) = &self.fail_matching {
                if spec.args.iter().any(|a| a.contains(pattern.as_str())) {
                    return Ok(CommandOutput {
                        exit_code: Some(1),
                        stdout: String::new(),
                        stderr: format!("unable to install {pattern}"),
                    });
                }
            }
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout,
                stderr: String::new(),
            })
        }
    }

    fn installer(runner: Arc<ScriptedRunner>) -> DependencyInstaller {
        DependencyInstaller::new(runner, None, RuntimeEnv::Host)
    }

    #[tokio::test]
    async fn already_installed_packages_are_skipped_entirely() {
        let runner = Arc::new(ScriptedRunner::new("numpy==1.26.0\n", "curl\n"));
        let report = installer(runner.clone())
            .install(&["numpy".into()], &["curl".into()])
            .await
            .unwrap();

        assert!(runner.install_calls().is_empty());
        assert!(report.installed_language.is_empty());
        assert!(report.installed_os.is_empty());
        assert_eq!(report.skipped.len(), 2);
    }

    #[tokio::test]
    async fn only_missing_subset_is_installed() {
        let runner = Arc::new(ScriptedRunner::new("numpy==1.26.0\n", "curl\n"));
        let report = installer(runner.clone())
            .install(
                &["numpy".into(), "pandas".into()],
                &["curl".into(), "ffmpeg".into()],
            )
            .await
            .unwrap();

        assert_eq!(report.installed_language, vec!["pandas".to_string()]);
        assert_eq!(report.installed_os, vec!["ffmpeg".to_string()]);

        let installs = runner.install_calls();
        let pip = installs.iter().find(|c| c.program == "uv").unwrap();
        assert!(pip.args.contains(&"pandas".to_string()));
        assert!(!pip.args.contains(&"numpy".to_string()));
        let apt = installs.iter().find(|c| c.program == "apt-get").unwrap();
        assert!(apt.args.contains(&"ffmpeg".to_string()));
        assert!(!apt.args.contains(&"curl".to_string()));
    }

    #[tokio::test]
    async fn version_pin_mismatch_reinstalls() {
        let runner = Arc::new(ScriptedRunner::new("numpy==1.26.0\n", ""));
        let report = installer(runner)
            .install(&["numpy==2.0.0".into()], &[])
            .await
            .unwrap();
        assert_eq!(report.installed_language, vec!["numpy==2.0.0".to_string()]);
    }

    #[tokio::test]
    async fn single_failure_fails_the_whole_call_with_detail() {
        let mut runner = ScriptedRunner::new("", "");
        runner.fail_matching = Some("torch".into());
        let err = installer(Arc::new(runner))
            .install(&["torch".into(), "requests".into()], &[])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "DependencyError");
        let msg = err.to_string();
        assert!(msg.contains("torch"), "missing offender in: {msg}");
    }

    #[tokio::test]
    async fn container_without_workspace_installs_system_wide() {
        let runner = Arc::new(ScriptedRunner::new("", ""));
        let installer =
            DependencyInstaller::new(runner.clone(), None, RuntimeEnv::Containerized);
        installer.install(&["requests".into()], &[]).await.unwrap();

        let installs = runner.install_calls();
        assert!(installs[0].args.contains(&"--system".to_string()));
    }

    #[tokio::test]
    async fn workspace_prefix_targets_the_venv() {
        let runner = Arc::new(ScriptedRunner::new("", ""));
        let ws = WorkspaceHandle {
            id: "ep".into(),
            path: "/vol/runtimes/ep".into(),
            venv: "/vol/runtimes/ep/.venv".into(),
            cache: "/vol/.uv-cache".into(),
        };
        let installer = DependencyInstaller::new(runner.clone(), Some(ws), RuntimeEnv::Host);
        installer.install(&["requests".into()], &[]).await.unwrap();

        let installs = runner.install_calls();
        assert_eq!(
            installs[0].envs.get("VIRTUAL_ENV"),
            Some(&"/vol/runtimes/ep/.venv".to_string())
        );
    }
}
