//! Execution configuration

use serde::Deserialize;
use std::time::Duration;

/// When the in-process module cache re-instantiates a handler module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadPolicy {
    /// Fresh module on every invocation
    Always,
    /// Load once and keep
    Never,
    /// Reload when the module file's digest changes
    #[default]
    OnChange,
}

impl ReloadPolicy {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            "on-change" | "onchange" | "on_change" => Some(Self::OnChange),
            _ => None,
        }
    }
}

/// Container backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker network to attach containers to
    pub network: Option<String>,
    /// Address the host reaches published container ports on
    pub host_address: String,
    /// Seconds to wait for the runtime interface to answer
    pub readiness_timeout_secs: u64,
    /// Pull images that are not present locally
    pub pull: bool,
    /// Extra `docker create` arguments
    pub extra_args: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network: None,
            host_address: "127.0.0.1".to_string(),
            readiness_timeout_secs: 30,
            pull: true,
            extra_args: Vec::new(),
        }
    }
}

impl DockerConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

/// Function pool and backend selection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LambdaConfig {
    /// Idle instances older than this are reaped
    pub idle_timeout_secs: f64,
    pub reap_interval_ms: u64,
    /// Disable the invocation timeout race
    pub no_timeout: bool,
    pub use_docker: bool,
    pub use_worker_threads: bool,
    /// Delegate invocations to an external command (`-f <name>` appended)
    pub invoke_command: Option<Vec<String>>,
    pub reload_policy: ReloadPolicy,
    pub region: String,
    pub docker: DockerConfig,
    pub node_binary: String,
    pub python_binary: String,
    pub ruby_binary: String,
}

impl Default for LambdaConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60.0,
            reap_interval_ms: 1_000,
            no_timeout: false,
            use_docker: false,
            use_worker_threads: false,
            invoke_command: None,
            reload_policy: ReloadPolicy::default(),
            region: "us-east-1".to_string(),
            docker: DockerConfig::default(),
            node_binary: "node".to_string(),
            python_binary: "python3".to_string(),
            ruby_binary: "ruby".to_string(),
        }
    }
}

impl LambdaConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_secs.max(0.0))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }
}
