//! The request orchestrator.
//!
//! One entry point, `RemoteExecutor::execute`, which always returns a
//! well-formed [`ExecutionResult`]: mode decision (inline vs. routed),
//! manifest refresh before any routing decision, workspace and
//! dependency preparation on the local path, forward-and-relay on the
//! routed path. No input a client can construct crashes the worker.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rexec_common::{ExecutionRequest, ExecutionResult, Result, WorkerError};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::engine::ExecutionEngine;
use crate::installer::DependencyInstaller;
use crate::manifest::{
    HttpManifestStore, ManifestReconciler, ManifestStore, NullStore, StoreIdentity,
};
use crate::resolver::CallableResolver;
use crate::runtime::{CommandRunner, ProcessRunner, RuntimeEnv};
use crate::workspace::{WorkspaceHandle, WorkspaceManager, RUNTIMES_DIR};

/// Transport seam for cross-endpoint calls.
#[async_trait]
pub trait CallForwarder: Send + Sync {
    async fn forward(
        &self,
        endpoint: &str,
        request: &ExecutionRequest,
    ) -> anyhow::Result<ExecutionResult>;
}

/// Forwards a call to another worker's `/execute` surface.
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(HttpForwarder {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl CallForwarder for HttpForwarder {
    async fn forward(
        &self,
        endpoint: &str,
        request: &ExecutionRequest,
    ) -> anyhow::Result<ExecutionResult> {
        let url = format!("{}/execute", endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<ExecutionResult>().await?)
    }
}

pub struct RemoteExecutor {
    config: WorkerConfig,
    runner: Arc<dyn CommandRunner>,
    env: RuntimeEnv,
    workspace: Option<WorkspaceManager>,
    reconciler: ManifestReconciler,
    resolver: CallableResolver,
    engine: ExecutionEngine,
    forwarder: Arc<dyn CallForwarder>,
}

impl RemoteExecutor {
    /// Wires the production collaborators from configuration.
    pub fn new(config: WorkerConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn ManifestStore> = match (&config.state_url, &config.api_key) {
            (Some(url), Some(key)) => Arc::new(HttpManifestStore::new(url, key)?),
            _ => Arc::new(NullStore),
        };
        let forwarder = Arc::new(HttpForwarder::new(config.exec_timeout)?);
        Ok(Self::with_collaborators(
            config,
            Arc::new(ProcessRunner),
            RuntimeEnv::probe(),
            store,
            forwarder,
        ))
    }

    pub fn with_collaborators(
        config: WorkerConfig,
        runner: Arc<dyn CommandRunner>,
        env: RuntimeEnv,
        store: Arc<dyn ManifestStore>,
        forwarder: Arc<dyn CallForwarder>,
    ) -> Self {
        let workspace = config.has_volume().then(|| {
            WorkspaceManager::new(
                &config.volume_path,
                config.lock_timeout,
                config.lock_poll_interval,
                runner.clone(),
            )
        });

        let identity = match (&config.endpoint_id, &config.api_key) {
            (Some(endpoint_id), Some(api_key)) => Some(StoreIdentity {
                endpoint_id: endpoint_id.clone(),
                api_key: api_key.clone(),
            }),
            _ => None,
        };
        let reconciler = ManifestReconciler::new(
            &config.manifest_path,
            config.manifest_ttl,
            store,
            identity,
            config.manifest_refresh_disabled,
        );

        let code_dir = match (&config.endpoint_id, config.has_volume()) {
            (Some(id), true) => config.volume_path.join(RUNTIMES_DIR).join(id),
            _ => config.local_workspace.clone(),
        };
        let resolver = CallableResolver::new(code_dir);
        let engine = ExecutionEngine::new(runner.clone(), config.exec_timeout);

        RemoteExecutor {
            config,
            runner,
            env,
            workspace,
            reconciler,
            resolver,
            engine,
            forwarder,
        }
    }

    /// Handles one request end to end. Infallible by construction:
    /// every error category lands in the result's `error` field.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        // Keep the routing table loosely synchronized before any
        // manifest-dependent decision; failure here is non-fatal.
        self.reconciler.refresh_if_stale().await;

        if request.inline_source.is_some() {
            debug!(name = %request.name, "executing inline-supplied code locally");
            return self.execute_local(&request).await;
        }
        self.execute_routed(&request).await
    }

    async fn execute_local(&self, request: &ExecutionRequest) -> ExecutionResult {
        let workspace = match self.ensure_workspace().await {
            Ok(workspace) => workspace,
            Err(err) => return ExecutionResult::from_error(&err),
        };

        let mut install_output = String::new();
        if !request.language_packages.is_empty() || !request.os_packages.is_empty() {
            let installer =
                DependencyInstaller::new(self.runner.clone(), workspace.clone(), self.env);
            match installer
                .install(&request.language_packages, &request.os_packages)
                .await
            {
                Ok(report) => {
                    if !report.installed_language.is_empty() || !report.installed_os.is_empty() {
                        info!(
                            language = ?report.installed_language,
                            os = ?report.installed_os,
                            "installed request dependencies"
                        );
                    }
                    install_output = report.output;
                }
                Err(err) => return ExecutionResult::from_error(&err),
            }
        }

        let call = match self.resolver.resolve(request) {
            Ok(call) => call,
            Err(err) => return ExecutionResult::from_error(&err),
        };

        let interpreter = workspace
            .as_ref()
            .map(WorkspaceHandle::python)
            .unwrap_or_else(|| PathBuf::from("python3"));
        let mut result = self.engine.execute(&call, request, &interpreter).await;
        if !install_output.is_empty() {
            result.output = format!("{install_output}{}", result.output);
        }
        result
    }

    async fn execute_routed(&self, request: &ExecutionRequest) -> ExecutionResult {
        let manifest = self.reconciler.load().unwrap_or_default();
        // Class-method calls route by their class.
        let key = request.name.split('.').next().unwrap_or(&request.name);

        match manifest.resource_for(key) {
            Some(resource) if Some(resource) == self.config.endpoint_id.as_deref() => {
                debug!(key, "manifest maps the call to this deployment");
                self.execute_local(request).await
            }
            Some(resource) => match manifest.endpoint_for(key) {
                Some(endpoint) => self.forward(endpoint, request).await,
                // Mapped elsewhere but unroutable: failing here keeps
                // "not owned by this deployment" distinct from "not
                // yet provisioned" instead of quietly running locally.
                None => {
                    let err = WorkerError::Resolution(format!(
                        "'{key}' is owned by resource '{resource}' which is currently unroutable"
                    ));
                    warn!(key, resource, "routed call target is unhealthy");
                    ExecutionResult::from_error(&err)
                }
            },
            None => {
                if self.resolver.is_registered(key) {
                    warn!(key, "not in manifest, falling back to local resolution");
                    self.execute_local(request).await
                } else {
                    ExecutionResult::from_error(&WorkerError::Resolution(format!(
                        "'{}' is not in the manifest and not provisioned locally",
                        request.name
                    )))
                }
            }
        }
    }

    async fn forward(&self, endpoint: &str, request: &ExecutionRequest) -> ExecutionResult {
        info!(endpoint, name = %request.name, "forwarding call to owning endpoint");
        match self.forwarder.forward(endpoint, request).await {
            Ok(result) => result,
            Err(err) => {
                warn!(endpoint, %err, "cross-endpoint forward failed");
                ExecutionResult::from_error(&WorkerError::Execution(format!(
                    "forward to {endpoint} failed: {err}"
                )))
            }
        }
    }

    async fn ensure_workspace(&self) -> Result<Option<WorkspaceHandle>> {
        let Some(manager) = &self.workspace else {
            return Ok(None);
        };
        let id = self
            .config
            .endpoint_id
            .clone()
            .unwrap_or_else(|| "default".to_string());
        manager.ensure_ready(&id).await.map(Some)
    }
}
