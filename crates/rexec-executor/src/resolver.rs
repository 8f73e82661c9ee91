//! Produces invokable handles from a request.
//!
//! Resolution is deliberately isolated from orchestration: the
//! resolver only knows how to turn "inline source" or "name known to
//! the local provisioned-function registry" into a [`ResolvedCall`];
//! it has no opinion on whether a call should have been routed
//! elsewhere.

use std::path::PathBuf;

use rexec_common::{CallKind, ExecutionRequest, Result, WorkerError};
use serde::Deserialize;
use tracing::debug;

use crate::engine::ResolvedCall;

pub const REGISTRY_FILE: &str = "registry.json";

/// One provisioned function: name -> source file relative to the
/// registry's directory.
#[derive(Debug, Deserialize)]
struct RegistryEntry {
    source: String,
}

pub struct CallableResolver {
    /// Directory holding `registry.json` and provisioned source files.
    code_dir: PathBuf,
}

impl CallableResolver {
    pub fn new(code_dir: impl Into<PathBuf>) -> Self {
        CallableResolver {
            code_dir: code_dir.into(),
        }
    }

    /// Resolves the request into an invokable handle, preferring the
    /// inline payload over the local registry. Fails with a resolution
    /// error when neither applies.
    pub fn resolve(&self, request: &ExecutionRequest) -> Result<ResolvedCall> {
        let (symbol, method) = self.split_target(request)?;

        if let Some(source) = &request.inline_source {
            return Ok(ResolvedCall {
                source: source.clone(),
                symbol,
                method,
            });
        }

        let source = self.registered_source(&symbol)?;
        Ok(ResolvedCall {
            source,
            symbol,
            method,
        })
    }

    /// Whether `name` could be resolved here without inline source.
    pub fn is_registered(&self, name: &str) -> bool {
        let symbol = name.split('.').next().unwrap_or(name);
        self.load_registry()
            .map(|entries| entries.iter().any(|(n, _)| n == symbol))
            .unwrap_or(false)
    }

    fn split_target(&self, request: &ExecutionRequest) -> Result<(String, Option<String>)> {
        match request.kind {
            CallKind::Function => Ok((request.name.clone(), None)),
            CallKind::ClassMethod => {
                let (class, method) = request.class_and_method().ok_or_else(|| {
                    WorkerError::Resolution(format!(
                        "class-method call needs a Class.method name, got '{}'",
                        request.name
                    ))
                })?;
                Ok((class.to_string(), Some(method.to_string())))
            }
        }
    }

    fn registered_source(&self, symbol: &str) -> Result<String> {
        let entries = self.load_registry().ok_or_else(|| {
            WorkerError::Resolution(format!(
                "'{symbol}' has no inline source and no registry is provisioned"
            ))
        })?;

        let entry = entries
            .into_iter()
            .find_map(|(name, entry)| (name == symbol).then_some(entry))
            .ok_or_else(|| {
                WorkerError::Resolution(format!(
                    "'{symbol}' not found in the provisioned-function registry"
                ))
            })?;

        let path = self.code_dir.join(&entry.source);
        debug!(symbol, path = %path.display(), "resolved via registry");
        std::fs::read_to_string(&path).map_err(|err| {
            WorkerError::Resolution(format!(
                "registered source for '{symbol}' unreadable at {}: {err}",
                path.display()
            ))
        })
    }

    fn load_registry(&self) -> Option<Vec<(String, RegistryEntry)>> {
        let raw = std::fs::read(self.code_dir.join(REGISTRY_FILE)).ok()?;
        let entries: std::collections::HashMap<String, RegistryEntry> =
            serde_json::from_slice(&raw).ok()?;
        Some(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioned(dir: &std::path::Path) {
        std::fs::write(
            dir.join(REGISTRY_FILE),
            r#"{"embed": {"source": "embed.py"}}"#,
        )
        .unwrap();
        std::fs::write(dir.join("embed.py"), "def embed(x): return x").unwrap();
    }

    #[test]
    fn inline_source_wins() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CallableResolver::new(dir.path());
        let mut req = ExecutionRequest::function("add");
        req.inline_source = Some("def add(a, b): return a + b".into());

        let call = resolver.resolve(&req).unwrap();
        assert_eq!(call.symbol, "add");
        assert!(call.source.contains("a + b"));
    }

    #[test]
    fn registry_resolves_provisioned_functions() {
        let dir = tempfile::tempdir().unwrap();
        provisioned(dir.path());
        let resolver = CallableResolver::new(dir.path());

        assert!(resolver.is_registered("embed"));
        let call = resolver.resolve(&ExecutionRequest::function("embed")).unwrap();
        assert_eq!(call.source, "def embed(x): return x");
    }

    #[test]
    fn unknown_name_is_a_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        provisioned(dir.path());
        let resolver = CallableResolver::new(dir.path());

        let err = resolver
            .resolve(&ExecutionRequest::function("missing"))
            .unwrap_err();
        assert_eq!(err.kind(), "ResolutionError");
    }

    #[test]
    fn class_method_name_must_split() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CallableResolver::new(dir.path());
        let mut req = ExecutionRequest::function("Embedder");
        req.kind = CallKind::ClassMethod;
        req.inline_source = Some("class Embedder: pass".into());

        assert!(resolver.resolve(&req).is_err());

        req.name = "Embedder.encode".into();
        let call = resolver.resolve(&req).unwrap();
        assert_eq!(call.symbol, "Embedder");
        assert_eq!(call.method.as_deref(), Some("encode"));
    }
}
