//! rexec-executor: execution orchestration for a stateless,
//! horizontally-scaled remote-execution worker.
//!
//! A worker accepts a description of a unit of work (function or class
//! method plus arguments), prepares the environment it needs (shared
//! workspace, missing dependencies), runs it or forwards it to the
//! worker that owns it, and returns a structured result. The pieces:
//!
//! - [`workspace::WorkspaceManager`] — at-most-one initialization of a
//!   shared, persistent workspace across competing processes, via an
//!   advisory file lock with bounded wait.
//! - [`manifest::ManifestReconciler`] — TTL-gated, single-flight
//!   refresh of the function-to-endpoint routing table.
//! - [`installer::DependencyInstaller`] — differential installation of
//!   language and OS packages.
//! - [`engine::ExecutionEngine`] — guest-code execution with output
//!   capture and structured error containment.
//! - [`executor::RemoteExecutor`] — the per-request orchestrator tying
//!   the above together.

pub mod config;
pub mod engine;
pub mod executor;
pub mod installer;
pub mod manifest;
pub mod resolver;
pub mod runtime;
pub mod workspace;

pub use config::WorkerConfig;
pub use executor::{CallForwarder, HttpForwarder, RemoteExecutor};
pub use rexec_common as common;
