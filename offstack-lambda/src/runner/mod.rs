//! Execution backends
//!
//! Every backend implements [`Runner`]. The factory picks one per function
//! instance from the runtime family and the configuration flags; the
//! instance then caches it until the instance is cleaned up.

pub mod container;
mod correlation;
pub mod external;
pub mod in_process;
pub mod module_cache;
mod shared;
pub mod subprocess;
pub mod worker;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::LambdaConfig;
use crate::context::LambdaContext;
use crate::function::{FunctionDefinition, RuntimeFamily};
use crate::invocation::InvocationError;
use module_cache::{HandlerRegistry, ModuleCache};
use subprocess::ProcessRegistry;
use worker::WorkerRegistry;

/// Uniform backend contract
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, event: Value, context: LambdaContext) -> Result<Value, InvocationError>;

    /// Release the backend's resources. Must be idempotent.
    async fn cleanup(&self);

    fn kind(&self) -> RunnerKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    InProcess,
    Subprocess,
    Worker,
    Container,
    External,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::Subprocess => "subprocess",
            Self::Worker => "worker",
            Self::Container => "container",
            Self::External => "external",
        }
    }
}

/// Resources shared by every backend of one pool
pub struct RunnerEnv {
    pub config: LambdaConfig,
    pub registry: HandlerRegistry,
    pub modules: Arc<ModuleCache>,
    pub processes: Arc<ProcessRegistry>,
    pub workers: Arc<WorkerRegistry>,
}

impl RunnerEnv {
    pub fn new(config: LambdaConfig, registry: HandlerRegistry) -> Self {
        let modules = Arc::new(ModuleCache::new(registry.clone(), config.reload_policy));
        Self {
            processes: Arc::new(ProcessRegistry::new(&config)),
            workers: Arc::new(WorkerRegistry::new(registry.clone(), config.reload_policy)),
            modules,
            registry,
            config,
        }
    }

    /// Tear down shared processes and workers that outlived their instances
    pub async fn shutdown(&self) {
        self.processes.shutdown_all().await;
        self.workers.shutdown_all().await;
    }
}

/// `path` resolved against the working directory
pub(crate) fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Decide which backend runs `function`
pub fn select(function: &FunctionDefinition, config: &LambdaConfig) -> Result<RunnerKind, InvocationError> {
    if config.use_docker {
        return Ok(RunnerKind::Container);
    }
    if config.invoke_command.is_some() {
        return Ok(RunnerKind::External);
    }
    match function.runtime.family() {
        RuntimeFamily::Native if config.use_worker_threads => Ok(RunnerKind::Worker),
        RuntimeFamily::Native => Ok(RunnerKind::InProcess),
        RuntimeFamily::Node | RuntimeFamily::Python | RuntimeFamily::Ruby => Ok(RunnerKind::Subprocess),
        RuntimeFamily::Java | RuntimeFamily::DotNet | RuntimeFamily::Go => {
            Err(InvocationError::UnsupportedRuntime {
                function: function.key.clone(),
                runtime: function.runtime.as_str().to_string(),
            })
        }
    }
}

/// Build the backend for one function instance
pub fn create(
    function: &Arc<FunctionDefinition>,
    code_dir: &Path,
    env: &Arc<RunnerEnv>,
) -> Result<Arc<dyn Runner>, InvocationError> {
    let kind = select(function, &env.config)?;
    let task_root = if kind == RunnerKind::Container {
        "/var/task".to_string()
    } else {
        code_dir.display().to_string()
    };
    let variables: Arc<HashMap<String, String>> =
        Arc::new(function.lambda_environment(&env.config.region, &task_root));

    debug!(function = %function.key, backend = kind.as_str(), "Creating runner");

    let runner: Arc<dyn Runner> = match kind {
        RunnerKind::InProcess => Arc::new(in_process::InProcessRunner::new(
            function.clone(),
            code_dir.to_path_buf(),
            variables,
            env.modules.clone(),
        )),
        RunnerKind::Worker => Arc::new(worker::WorkerRunner::new(
            function.clone(),
            code_dir.to_path_buf(),
            variables,
            env.workers.clone(),
        )),
        RunnerKind::Subprocess => Arc::new(subprocess::SubprocessRunner::new(
            function.clone(),
            code_dir.to_path_buf(),
            variables,
            env.processes.clone(),
        )?),
        RunnerKind::Container => Arc::new(container::ContainerRunner::new(
            function.clone(),
            code_dir.to_path_buf(),
            variables,
            env.config.docker.clone(),
        )),
        RunnerKind::External => Arc::new(external::ExternalRunner::new(
            function.clone(),
            code_dir.to_path_buf(),
            variables,
            env.config.invoke_command.clone().unwrap_or_default(),
        )),
    };
    Ok(runner)
}
