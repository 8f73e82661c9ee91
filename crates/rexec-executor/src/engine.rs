//! Guest-code execution with full output capture.
//!
//! The engine never interprets user code itself: it materializes the
//! resolved source plus a call descriptor into a scratch directory and
//! drives a small guest driver through the workspace interpreter. The
//! driver binds the target callable, detects whether it is synchronous
//! or suspendable (the latter runs to completion on a dedicated event
//! loop per call), and reports back through a structured result
//! envelope. Anything the guest prints lands in `output`; anything it
//! raises lands in the structured error field. Nothing propagates to
//! the transport layer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rexec_common::{Blob, ErrorInfo, ExecutionRequest, ExecutionResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::runtime::{CommandRunner, CommandSpec};

const SOURCE_FILE: &str = "source.py";
const CALL_FILE: &str = "call.json";
const DRIVER_FILE: &str = "driver.py";
const RESULT_FILE: &str = "result.json";

/// An invokable handle produced by the resolver: the source defining
/// the target plus how to bind it.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub source: String,
    pub symbol: String,
    /// Set for class-method calls; the symbol is then the class.
    pub method: Option<String>,
}

/// On-disk call descriptor handed to the guest driver.
#[derive(Debug, Serialize)]
struct CallDescriptor<'a> {
    symbol: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    args: Vec<String>,
    kwargs: HashMap<&'a str, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance: Option<String>,
}

/// Result envelope written by the guest driver.
#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    ok: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<ErrorInfo>,
    #[serde(default)]
    instance: Option<String>,
}

pub struct ExecutionEngine {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    /// Serialized state of live class instances, keyed by instance id.
    instances: DashMap<String, Vec<u8>>,
}

impl ExecutionEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        ExecutionEngine {
            runner,
            timeout,
            instances: DashMap::new(),
        }
    }

    /// Runs a resolved call with `interpreter`, capturing all textual
    /// output and converting every failure mode into a structured
    /// error on the result.
    pub async fn execute(
        &self,
        call: &ResolvedCall,
        request: &ExecutionRequest,
        interpreter: &Path,
    ) -> ExecutionResult {
        let instance_state = match &request.instance_id {
            Some(id) => match self.instances.get(id) {
                Some(state) => Some(Blob(state.clone()).to_base64()),
                None => {
                    return ExecutionResult::failure(
                        ErrorInfo {
                            kind: "ResolutionError".into(),
                            message: format!("unknown instance id: {id}"),
                            trace: String::new(),
                        },
                        String::new(),
                    );
                }
            },
            None => None,
        };

        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => return execution_failure(format!("failed to create scratch dir: {err}")),
        };
        if let Err(err) = self.stage_call(scratch.path(), call, request, instance_state) {
            return execution_failure(format!("failed to stage call: {err}"));
        }

        debug!(symbol = %call.symbol, dir = %scratch.path().display(), "dispatching to guest driver");
        let run = self
            .runner
            .run(
                CommandSpec::new(interpreter.to_string_lossy())
                    .arg(scratch.path().join(DRIVER_FILE).to_string_lossy())
                    .arg(scratch.path().to_string_lossy())
                    .timeout(self.timeout),
            )
            .await;

        let output = match &run {
            Ok(out) => out.combined(),
            Err(_) => String::new(),
        };

        let envelope = match std::fs::read(scratch.path().join(RESULT_FILE)) {
            Ok(raw) => match serde_json::from_slice::<ResultEnvelope>(&raw) {
                Ok(envelope) => envelope,
                Err(err) => {
                    return ExecutionResult::failure(
                        ErrorInfo {
                            kind: "ExecutionError".into(),
                            message: format!("unreadable result envelope: {err}"),
                            trace: String::new(),
                        },
                        output,
                    )
                }
            },
            // No envelope at all: the driver itself died (crash,
            // timeout, missing interpreter).
            Err(_) => {
                let detail = match run {
                    Ok(out) => format!(
                        "guest driver exited with {:?} without reporting a result",
                        out.exit_code
                    ),
                    Err(err) => format!("guest driver failed to run: {err}"),
                };
                warn!(symbol = %call.symbol, detail, "guest driver produced no result envelope");
                return ExecutionResult::failure(
                    ErrorInfo {
                        kind: "ExecutionError".into(),
                        message: detail,
                        trace: String::new(),
                    },
                    output,
                );
            }
        };

        self.assemble(envelope, request, output)
    }

    fn stage_call(
        &self,
        dir: &Path,
        call: &ResolvedCall,
        request: &ExecutionRequest,
        instance: Option<String>,
    ) -> std::io::Result<()> {
        std::fs::write(dir.join(SOURCE_FILE), &call.source)?;
        std::fs::write(dir.join(DRIVER_FILE), GUEST_DRIVER)?;

        let descriptor = CallDescriptor {
            symbol: &call.symbol,
            method: call.method.as_deref(),
            args: request.args.iter().map(Blob::to_base64).collect(),
            kwargs: request
                .kwargs
                .iter()
                .map(|(k, v)| (k.as_str(), v.to_base64()))
                .collect(),
            instance,
        };
        std::fs::write(dir.join(CALL_FILE), serde_json::to_vec(&descriptor)?)?;
        Ok(())
    }

    fn assemble(
        &self,
        envelope: ResultEnvelope,
        request: &ExecutionRequest,
        output: String,
    ) -> ExecutionResult {
        if !envelope.ok {
            let error = envelope.error.unwrap_or_else(|| ErrorInfo {
                kind: "ExecutionError".into(),
                message: "guest reported failure without detail".into(),
                trace: String::new(),
            });
            return ExecutionResult::failure(error, output);
        }

        let result = match envelope.result.as_deref().map(Blob::from_base64) {
            Some(Ok(blob)) => blob,
            Some(Err(err)) => {
                return ExecutionResult::failure(
                    ErrorInfo {
                        kind: "ExecutionError".into(),
                        message: format!("undecodable guest result: {err}"),
                        trace: String::new(),
                    },
                    output,
                )
            }
            None => Blob::default(),
        };

        // Cache updated instance state under a stable id so later
        // method calls hit the same logical object.
        let instance_id = match envelope.instance.as_deref().map(Blob::from_base64) {
            Some(Ok(state)) => {
                let id = request
                    .instance_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                self.instances.insert(id.clone(), state.0);
                Some(id)
            }
            _ => None,
        };

        ExecutionResult::ok(result, output).with_instance(instance_id)
    }

    #[cfg(test)]
    pub fn cached_instances(&self) -> usize {
        self.instances.len()
    }
}

fn execution_failure(message: String) -> ExecutionResult {
    ExecutionResult::failure(
        ErrorInfo {
            kind: "ExecutionError".into(),
            message,
            trace: String::new(),
        },
        String::new(),
    )
}

/// Guest-side driver. Binds the symbol from the staged source, decodes
/// the adapter-encoded arguments, runs suspendable callables on a
/// fresh single-threaded event loop, and writes the result envelope.
const GUEST_DRIVER: &str = r#"
import asyncio
import base64
import inspect
import json
import os
import pickle
import sys
import traceback


def _decode(value):
    return json.loads(base64.b64decode(value))


def _encode(value):
    return base64.b64encode(json.dumps(value).encode()).decode()


def _invoke(fn, args, kwargs):
    if inspect.iscoroutinefunction(fn):
        loop = asyncio.new_event_loop()
        try:
            return loop.run_until_complete(fn(*args, **kwargs))
        finally:
            loop.close()
    return fn(*args, **kwargs)


def _failure(kind, message, trace=""):
    return {"ok": False, "error": {"kind": kind, "message": message, "trace": trace}}


def main(workdir):
    with open(os.path.join(workdir, "call.json")) as f:
        call = json.load(f)

    namespace = {}
    with open(os.path.join(workdir, "source.py")) as f:
        exec(compile(f.read(), "source.py", "exec"), namespace)

    symbol = call["symbol"]
    if symbol not in namespace:
        return _failure(
            "ResolutionError", "symbol %r not found in the provided code" % symbol
        )

    target = namespace[symbol]
    args = [_decode(a) for a in call.get("args", [])]
    kwargs = {k: _decode(v) for k, v in call.get("kwargs", {}).items()}

    try:
        envelope = {"ok": True}
        method = call.get("method")
        if method:
            state = call.get("instance")
            if state:
                instance = pickle.loads(base64.b64decode(state))
            else:
                instance = target()
            bound = getattr(instance, method)
            result = _invoke(bound, args, kwargs)
            envelope["instance"] = base64.b64encode(pickle.dumps(instance)).decode()
        else:
            result = _invoke(target, args, kwargs)
        envelope["result"] = _encode(result)
        return envelope
    except Exception as exc:
        return _failure("ExecutionError", str(exc), traceback.format_exc())


if __name__ == "__main__":
    workdir = sys.argv[1]
    try:
        envelope = main(workdir)
    except Exception as exc:
        envelope = _failure("ExecutionError", str(exc), traceback.format_exc())
    with open(os.path.join(workdir, "result.json"), "w") as f:
        json.dump(envelope, f)
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CommandOutput;
    use async_trait::async_trait;
    use rexec_common::codec;
    use std::path::PathBuf;

    /// Emulates the guest driver: inspects the staged call descriptor
    /// and writes a canned (or computed) result envelope.
    struct FakeGuest {
        behavior: Behavior,
    }

    enum Behavior {
        Echo,
        Raise,
        Crash,
    }

    #[async_trait]
    impl CommandRunner for FakeGuest {
        async fn run(&self, spec: CommandSpec) -> std::io::Result<CommandOutput> {
            let workdir = PathBuf::from(spec.args.last().unwrap());
            let call: serde_json::Value =
                serde_json::from_slice(&std::fs::read(workdir.join(CALL_FILE)).unwrap()).unwrap();

            match self.behavior {
                Behavior::Crash => Ok(CommandOutput {
                    exit_code: Some(139),
                    stdout: String::new(),
                    stderr: "segfault".into(),
                }),
                Behavior::Raise => {
                    let envelope = serde_json::json!({
                        "ok": false,
                        "error": {
                            "kind": "ExecutionError",
                            "message": "boom",
                            "trace": "Traceback (most recent call last):\n  boom",
                        },
                    });
                    std::fs::write(
                        workdir.join(RESULT_FILE),
                        serde_json::to_vec(&envelope).unwrap(),
                    )?;
                    Ok(CommandOutput {
                        exit_code: Some(0),
                        stdout: "before the crash\n".into(),
                        stderr: String::new(),
                    })
                }
                Behavior::Echo => {
                    // Echo the first argument back, attach instance
                    // state for method calls.
                    let first = call["args"][0].as_str().unwrap().to_string();
                    let mut envelope = serde_json::json!({"ok": true, "result": first});
                    if call.get("method").is_some() {
                        envelope["instance"] =
                            serde_json::json!(Blob::from(b"state".to_vec()).to_base64());
                    }
                    std::fs::write(
                        workdir.join(RESULT_FILE),
                        serde_json::to_vec(&envelope).unwrap(),
                    )?;
                    Ok(CommandOutput {
                        exit_code: Some(0),
                        stdout: "guest output\n".into(),
                        stderr: String::new(),
                    })
                }
            }
        }
    }

    fn engine(behavior: Behavior) -> ExecutionEngine {
        ExecutionEngine::new(Arc::new(FakeGuest { behavior }), Duration::from_secs(5))
    }

    fn call() -> ResolvedCall {
        ResolvedCall {
            source: "def add(a, b): return a + b".into(),
            symbol: "add".into(),
            method: None,
        }
    }

    fn request_with_arg() -> ExecutionRequest {
        let mut req = ExecutionRequest::function("add");
        req.args = vec![codec::encode_value(&serde_json::json!(2)).unwrap()];
        req
    }

    #[tokio::test]
    async fn successful_call_relays_result_and_output() {
        let result = engine(Behavior::Echo)
            .execute(&call(), &request_with_arg(), Path::new("python3"))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "guest output\n");
        let value = codec::decode_value(&result.result.unwrap()).unwrap();
        assert_eq!(value, serde_json::json!(2));
    }

    #[tokio::test]
    async fn guest_exception_becomes_structured_error_with_trace() {
        let result = engine(Behavior::Raise)
            .execute(&call(), &request_with_arg(), Path::new("python3"))
            .await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, "ExecutionError");
        assert_eq!(error.message, "boom");
        assert!(!error.trace.is_empty());
        // Output produced before the failure is still captured.
        assert_eq!(result.output, "before the crash\n");
    }

    #[tokio::test]
    async fn driver_crash_without_envelope_is_contained() {
        let result = engine(Behavior::Crash)
            .execute(&call(), &request_with_arg(), Path::new("python3"))
            .await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, "ExecutionError");
        assert!(error.message.contains("139"), "got: {}", error.message);
    }

    #[tokio::test]
    async fn class_method_calls_reuse_cached_instance_state() {
        let engine = engine(Behavior::Echo);
        let call = ResolvedCall {
            source: "class Counter: pass".into(),
            symbol: "Counter".into(),
            method: Some("bump".into()),
        };

        let first = engine
            .execute(&call, &request_with_arg(), Path::new("python3"))
            .await;
        assert!(first.success);
        let id = first.instance_id.expect("constructor call yields an id");
        assert_eq!(engine.cached_instances(), 1);

        let mut followup = request_with_arg();
        followup.instance_id = Some(id.clone());
        let second = engine
            .execute(&call, &followup, Path::new("python3"))
            .await;
        assert!(second.success);
        assert_eq!(second.instance_id, Some(id));
        assert_eq!(engine.cached_instances(), 1);
    }

    #[tokio::test]
    async fn unknown_instance_id_is_a_resolution_error() {
        let mut req = request_with_arg();
        req.instance_id = Some("no-such-instance".into());
        let result = engine(Behavior::Echo)
            .execute(&call(), &req, Path::new("python3"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, "ResolutionError");
    }

    // End-to-end through a real interpreter. Requires python3 on PATH,
    // so it stays out of the default run.
    #[tokio::test]
    #[ignore]
    async fn real_interpreter_adds_two_and_three() {
        let engine = ExecutionEngine::new(
            Arc::new(crate::runtime::ProcessRunner),
            Duration::from_secs(30),
        );
        let call = ResolvedCall {
            source: "def add(a, b): return a + b".into(),
            symbol: "add".into(),
            method: None,
        };
        let mut req = ExecutionRequest::function("add");
        req.args = vec![
            codec::encode_value(&serde_json::json!(2)).unwrap(),
            codec::encode_value(&serde_json::json!(3)).unwrap(),
        ];

        let result = engine.execute(&call, &req, Path::new("python3")).await;
        assert!(result.success, "error: {:?}", result.error);
        let value = codec::decode_value(&result.result.unwrap()).unwrap();
        assert_eq!(value, serde_json::json!(5));
    }
}
