//! Subprocess backend
//!
//! Node, Python and Ruby handlers run inside a long-lived interpreter
//! process per function. A small helper script loads the handler module and
//! speaks newline-delimited JSON: `{id, event, context}` on stdin, `{id,
//! result}` or `{id, error}` on stdout. Handler output is redirected to
//! stderr by the helpers and forwarded to the log.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::correlation::{self, CallReply, CallRequest, PendingCalls};
use super::shared::{SharedUnit, SharedUnits};
use super::{absolute_path, Runner, RunnerKind};
use crate::config::LambdaConfig;
use crate::context::LambdaContext;
use crate::function::{FunctionDefinition, RuntimeFamily};
use crate::invocation::InvocationError;

const NODE_HELPER: &str = include_str!("helpers/node_helper.js");
const PYTHON_HELPER: &str = include_str!("helpers/python_helper.py");
const RUBY_HELPER: &str = include_str!("helpers/ruby_helper.rb");

/// Interpreter command line for one function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// Running helper processes, shared by every instance of a function
pub struct ProcessRegistry {
    units: SharedUnits<ProcessHandle>,
    helpers: OnceCell<TempDir>,
    node_binary: String,
    python_binary: String,
    ruby_binary: String,
}

impl ProcessRegistry {
    pub fn new(config: &LambdaConfig) -> Self {
        Self {
            units: SharedUnits::new(),
            helpers: OnceCell::new(),
            node_binary: config.node_binary.clone(),
            python_binary: config.python_binary.clone(),
            ruby_binary: config.ruby_binary.clone(),
        }
    }

    /// Directory holding the helper scripts, written on first use
    async fn helper_dir(&self) -> Result<&Path, InvocationError> {
        let dir = self
            .helpers
            .get_or_try_init(|| async {
                let dir = tempfile::Builder::new()
                    .prefix("offstack-helpers-")
                    .tempdir()
                    .map_err(|e| InvocationError::transport(format!("Failed to create helper dir: {e}")))?;
                for (name, source) in [
                    ("node_helper.js", NODE_HELPER),
                    ("python_helper.py", PYTHON_HELPER),
                    ("ruby_helper.rb", RUBY_HELPER),
                ] {
                    tokio::fs::write(dir.path().join(name), source)
                        .await
                        .map_err(|e| InvocationError::transport(format!("Failed to write {name}: {e}")))?;
                }
                Ok::<_, InvocationError>(dir)
            })
            .await?;
        Ok(dir.path())
    }

    /// Command line that serves `function` from `code_dir`
    pub fn spec(&self, function: &FunctionDefinition, code_dir: &Path, helper_dir: &Path) -> Result<ProcessSpec, InvocationError> {
        let (module_path, export) = function.handler_parts();
        let module_path = module_path.trim_start_matches("./");
        let working_dir = absolute_path(code_dir);
        let helper = |name: &str| helper_dir.join(name).display().to_string();

        let (program, args) = match function.runtime.family() {
            RuntimeFamily::Node => (
                self.node_binary.clone(),
                vec![
                    helper("node_helper.js"),
                    working_dir.join(module_path).display().to_string(),
                    export.to_string(),
                ],
            ),
            RuntimeFamily::Python => (
                self.python_binary.clone(),
                vec![
                    "-u".to_string(),
                    helper("python_helper.py"),
                    working_dir.display().to_string(),
                    module_path.replace('/', "."),
                    export.to_string(),
                ],
            ),
            RuntimeFamily::Ruby => (
                self.ruby_binary.clone(),
                vec![
                    helper("ruby_helper.rb"),
                    working_dir.join(module_path).display().to_string(),
                    export.to_string(),
                ],
            ),
            _ => {
                return Err(InvocationError::UnsupportedRuntime {
                    function: function.key.clone(),
                    runtime: function.runtime.as_str().to_string(),
                })
            }
        };

        Ok(ProcessSpec {
            program,
            args,
            working_dir,
        })
    }

    pub async fn shutdown_all(&self) {
        self.units.shutdown_all().await;
    }
}

/// One interpreter process and its in-flight calls
struct ProcessHandle {
    function: String,
    stdin: Mutex<ChildStdin>,
    child: Arc<Mutex<Option<Child>>>,
    pending: Arc<PendingCalls>,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    fn spawn(function: &str, spec: &ProcessSpec, env: &HashMap<String, String>) -> Result<Self, InvocationError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InvocationError::transport(format!("Failed to spawn {} for {function}: {e}", spec.program))
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(InvocationError::transport("Child process has no stdio pipes"));
        };

        info!(function = %function, pid = ?child.id(), program = %spec.program, "Started function process");

        let child = Arc::new(Mutex::new(Some(child)));
        let pending = Arc::new(PendingCalls::default());
        let alive = Arc::new(AtomicBool::new(true));

        let reader = {
            let pending = pending.clone();
            let alive = alive.clone();
            let child = child.clone();
            let function = function.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply: CallReply = match serde_json::from_str(&line) {
                        Ok(reply) => reply,
                        Err(_) => {
                            debug!(function = %function, line = %line, "Ignoring non-protocol output");
                            continue;
                        }
                    };
                    match reply.into_result() {
                        (Some(id), result) => {
                            pending.resolve(&id, result);
                        }
                        (None, result) => {
                            let error = match result {
                                Err(error) => error,
                                Ok(_) => InvocationError::transport("Function process reported an unknown failure"),
                            };
                            warn!(function = %function, error = %error, "Function process failed");
                            alive.store(false, Ordering::SeqCst);
                            pending.fail_all(&error);
                            kill(&child, &function).await;
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                let failed = pending.fail_all(&InvocationError::transport(format!(
                    "Function process for {function} exited"
                )));
                debug!(function = %function, failed, "Function process output closed");
            })
        };

        let logger = {
            let function = function.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "offstack::function", function = %function, "{line}");
                }
            })
        };

        Ok(Self {
            function: function.to_string(),
            stdin: Mutex::new(stdin),
            child,
            pending,
            alive,
            tasks: vec![reader, logger],
        })
    }

    async fn call(&self, event: &Value, context: &LambdaContext) -> Result<Value, InvocationError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut line = serde_json::to_vec(&CallRequest {
            id: &id,
            event,
            context,
        })
        .map_err(|e| InvocationError::transport(format!("Failed to encode invocation: {e}")))?;
        line.push(b'\n');

        let (_guard, rx) = self.pending.register(&id);
        if !self.is_alive() {
            return Err(InvocationError::transport(format!(
                "Function process for {} is not running",
                self.function
            )));
        }
        {
            let mut stdin = self.stdin.lock().await;
            let written = async {
                stdin.write_all(&line).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                self.alive.store(false, Ordering::SeqCst);
                return Err(InvocationError::transport(format!(
                    "Failed to write to function process for {}: {e}",
                    self.function
                )));
            }
        }

        correlation::wait(rx).await
    }
}

#[async_trait]
impl SharedUnit for ProcessHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.pending
            .fail_all(&InvocationError::transport("Function process stopped"));
        kill(&self.child, &self.function).await;
        for task in &self.tasks {
            task.abort();
        }
        info!(function = %self.function, "Stopped function process");
    }
}

async fn kill(child: &Mutex<Option<Child>>, function: &str) {
    if let Some(mut child) = child.lock().await.take() {
        if let Err(e) = child.kill().await {
            debug!(function = %function, error = %e, "Function process already gone");
        }
    }
}

pub struct SubprocessRunner {
    function: Arc<FunctionDefinition>,
    code_dir: PathBuf,
    env: Arc<HashMap<String, String>>,
    processes: Arc<ProcessRegistry>,
    unit_key: String,
    released: AtomicBool,
}

impl SubprocessRunner {
    pub fn new(
        function: Arc<FunctionDefinition>,
        code_dir: PathBuf,
        env: Arc<HashMap<String, String>>,
        processes: Arc<ProcessRegistry>,
    ) -> Result<Self, InvocationError> {
        match function.runtime.family() {
            RuntimeFamily::Node | RuntimeFamily::Python | RuntimeFamily::Ruby => {}
            _ => {
                return Err(InvocationError::UnsupportedRuntime {
                    function: function.key.clone(),
                    runtime: function.runtime.as_str().to_string(),
                })
            }
        }

        // Instances extracted from an artifact each get their own process
        let unit_key = format!("{}:{}", function.key, code_dir.display());
        processes.units.acquire(&unit_key);

        Ok(Self {
            function,
            code_dir,
            env,
            processes,
            unit_key,
            released: AtomicBool::new(false),
        })
    }

    async fn process(&self) -> Result<Arc<ProcessHandle>, InvocationError> {
        let helper_dir = self.processes.helper_dir().await?;
        let spec = self.processes.spec(&self.function, &self.code_dir, helper_dir)?;
        self.processes
            .units
            .get_or_start(&self.unit_key, || async {
                ProcessHandle::spawn(&self.function.key, &spec, &self.env)
            })
            .await
    }
}

#[async_trait]
impl Runner for SubprocessRunner {
    async fn run(&self, event: Value, context: LambdaContext) -> Result<Value, InvocationError> {
        let process = self.process().await?;
        process.call(&event, &context).await
    }

    async fn cleanup(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.processes.units.release(&self.unit_key).await;
        }
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::Subprocess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Runtime;

    fn registry() -> ProcessRegistry {
        ProcessRegistry::new(&LambdaConfig::default())
    }

    #[test]
    fn test_node_spec() {
        let def = FunctionDefinition::new("hello", "src/handler.hello", Runtime::Nodejs20);
        let spec = registry()
            .spec(&def, Path::new("/srv/app"), Path::new("/tmp/helpers"))
            .unwrap();
        assert_eq!(spec.program, "node");
        assert_eq!(
            spec.args,
            vec!["/tmp/helpers/node_helper.js", "/srv/app/src/handler", "hello"]
        );
        assert_eq!(spec.working_dir, PathBuf::from("/srv/app"));
    }

    #[test]
    fn test_python_spec_uses_dotted_module() {
        let def = FunctionDefinition::new("hello", "./api/users.handler", Runtime::Python312);
        let spec = registry()
            .spec(&def, Path::new("/srv/app"), Path::new("/tmp/helpers"))
            .unwrap();
        assert_eq!(spec.program, "python3");
        assert_eq!(
            spec.args,
            vec!["-u", "/tmp/helpers/python_helper.py", "/srv/app", "api.users", "handler"]
        );
    }

    #[test]
    fn test_ruby_spec() {
        let def = FunctionDefinition::new("hello", "handler.hello", Runtime::Ruby33);
        let spec = registry()
            .spec(&def, Path::new("/srv/app"), Path::new("/tmp/helpers"))
            .unwrap();
        assert_eq!(spec.program, "ruby");
        assert_eq!(spec.args[1], "/srv/app/handler");
    }

    #[test]
    fn test_native_runtime_rejected() {
        let def = Arc::new(FunctionDefinition::new("native", "h.handler", Runtime::ProvidedAl2));
        let result = SubprocessRunner::new(
            def,
            PathBuf::from("."),
            Arc::new(HashMap::new()),
            Arc::new(registry()),
        );
        assert!(matches!(result, Err(InvocationError::UnsupportedRuntime { .. })));
    }

    #[tokio::test]
    async fn test_helpers_written_once() {
        let registry = registry();
        let first = registry.helper_dir().await.unwrap().to_path_buf();
        let second = registry.helper_dir().await.unwrap().to_path_buf();
        assert_eq!(first, second);
        assert!(first.join("node_helper.js").is_file());
        assert!(first.join("python_helper.py").is_file());
        assert!(first.join("ruby_helper.rb").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fatal_error_kills_the_process() {
        let spec = ProcessSpec {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"echo '{"error":{"errorType":"Error","errorMessage":"crash"}}'; sleep 30"#.to_string(),
            ],
            working_dir: std::env::temp_dir(),
        };
        let handle = ProcessHandle::spawn("crashing", &spec, &HashMap::new()).unwrap();

        for _ in 0..100 {
            if handle.child.lock().await.is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(handle.child.lock().await.is_none());
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_runners_share_one_claim_each() {
        let registry = Arc::new(registry());
        let def = Arc::new(FunctionDefinition::new("hello", "handler.hello", Runtime::Nodejs20));
        let a = SubprocessRunner::new(def.clone(), PathBuf::from("."), Arc::new(HashMap::new()), registry.clone()).unwrap();
        let b = SubprocessRunner::new(def, PathBuf::from("."), Arc::new(HashMap::new()), registry.clone()).unwrap();
        assert_eq!(registry.units.users("hello:."), 2);

        a.cleanup().await;
        a.cleanup().await;
        assert_eq!(registry.units.users("hello:."), 1);
        b.cleanup().await;
        assert_eq!(registry.units.users("hello:."), 0);
    }
}
