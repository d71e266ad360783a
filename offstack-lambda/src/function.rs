//! Function definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Supported Lambda runtimes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Runtime {
    #[serde(rename = "nodejs16.x")]
    Nodejs16,
    #[serde(rename = "nodejs18.x")]
    Nodejs18,
    #[serde(rename = "nodejs20.x")]
    Nodejs20,
    #[serde(rename = "nodejs22.x")]
    Nodejs22,
    #[serde(rename = "python3.8")]
    Python38,
    #[serde(rename = "python3.9")]
    Python39,
    #[serde(rename = "python3.10")]
    Python310,
    #[serde(rename = "python3.11")]
    Python311,
    #[serde(rename = "python3.12")]
    Python312,
    #[serde(rename = "python3.13")]
    Python313,
    #[serde(rename = "ruby3.2")]
    Ruby32,
    #[serde(rename = "ruby3.3")]
    Ruby33,
    #[serde(rename = "java17")]
    Java17,
    #[serde(rename = "java21")]
    Java21,
    #[serde(rename = "dotnet8")]
    Dotnet8,
    #[serde(rename = "go1.x")]
    Go1,
    #[serde(rename = "provided.al2")]
    ProvidedAl2,
    #[serde(rename = "provided.al2023")]
    ProvidedAl2023,
}

/// Runtime families decide which execution backend can run a function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFamily {
    Node,
    Python,
    Ruby,
    Java,
    DotNet,
    Go,
    /// Handlers compiled into the host and registered in-process
    Native,
}

impl Runtime {
    /// Get the Lambda base image for this runtime
    pub fn container_image(&self) -> &'static str {
        match self {
            Self::Nodejs16 => "public.ecr.aws/lambda/nodejs:16",
            Self::Nodejs18 => "public.ecr.aws/lambda/nodejs:18",
            Self::Nodejs20 => "public.ecr.aws/lambda/nodejs:20",
            Self::Nodejs22 => "public.ecr.aws/lambda/nodejs:22",
            Self::Python38 => "public.ecr.aws/lambda/python:3.8",
            Self::Python39 => "public.ecr.aws/lambda/python:3.9",
            Self::Python310 => "public.ecr.aws/lambda/python:3.10",
            Self::Python311 => "public.ecr.aws/lambda/python:3.11",
            Self::Python312 => "public.ecr.aws/lambda/python:3.12",
            Self::Python313 => "public.ecr.aws/lambda/python:3.13",
            Self::Ruby32 => "public.ecr.aws/lambda/ruby:3.2",
            Self::Ruby33 => "public.ecr.aws/lambda/ruby:3.3",
            Self::Java17 => "public.ecr.aws/lambda/java:17",
            Self::Java21 => "public.ecr.aws/lambda/java:21",
            Self::Dotnet8 => "public.ecr.aws/lambda/dotnet:8",
            Self::Go1 => "public.ecr.aws/lambda/go:1",
            Self::ProvidedAl2 => "public.ecr.aws/lambda/provided:al2",
            Self::ProvidedAl2023 => "public.ecr.aws/lambda/provided:al2023",
        }
    }

    pub fn family(&self) -> RuntimeFamily {
        match self {
            Self::Nodejs16 | Self::Nodejs18 | Self::Nodejs20 | Self::Nodejs22 => RuntimeFamily::Node,
            Self::Python38
            | Self::Python39
            | Self::Python310
            | Self::Python311
            | Self::Python312
            | Self::Python313 => RuntimeFamily::Python,
            Self::Ruby32 | Self::Ruby33 => RuntimeFamily::Ruby,
            Self::Java17 | Self::Java21 => RuntimeFamily::Java,
            Self::Dotnet8 => RuntimeFamily::DotNet,
            Self::Go1 => RuntimeFamily::Go,
            Self::ProvidedAl2 | Self::ProvidedAl2023 => RuntimeFamily::Native,
        }
    }

    /// Parse runtime string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "nodejs16.x" => Some(Self::Nodejs16),
            "nodejs18.x" => Some(Self::Nodejs18),
            "nodejs20.x" => Some(Self::Nodejs20),
            "nodejs22.x" => Some(Self::Nodejs22),
            "python3.8" => Some(Self::Python38),
            "python3.9" => Some(Self::Python39),
            "python3.10" => Some(Self::Python310),
            "python3.11" => Some(Self::Python311),
            "python3.12" => Some(Self::Python312),
            "python3.13" => Some(Self::Python313),
            "ruby3.2" => Some(Self::Ruby32),
            "ruby3.3" => Some(Self::Ruby33),
            "java17" => Some(Self::Java17),
            "java21" => Some(Self::Java21),
            "dotnet8" => Some(Self::Dotnet8),
            "go1.x" => Some(Self::Go1),
            "provided.al2" => Some(Self::ProvidedAl2),
            "provided.al2023" => Some(Self::ProvidedAl2023),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nodejs16 => "nodejs16.x",
            Self::Nodejs18 => "nodejs18.x",
            Self::Nodejs20 => "nodejs20.x",
            Self::Nodejs22 => "nodejs22.x",
            Self::Python38 => "python3.8",
            Self::Python39 => "python3.9",
            Self::Python310 => "python3.10",
            Self::Python311 => "python3.11",
            Self::Python312 => "python3.12",
            Self::Python313 => "python3.13",
            Self::Ruby32 => "ruby3.2",
            Self::Ruby33 => "ruby3.3",
            Self::Java17 => "java17",
            Self::Java21 => "java21",
            Self::Dotnet8 => "dotnet8",
            Self::Go1 => "go1.x",
            Self::ProvidedAl2 => "provided.al2",
            Self::ProvidedAl2023 => "provided.al2023",
        }
    }
}

/// A function as declared by the project, immutable once loaded
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDefinition {
    /// Key used by routes to refer to the function
    pub key: String,
    /// Deployed function name, defaults to the key
    #[serde(default)]
    pub name: Option<String>,
    /// `path/to/module.export`
    pub handler: String,
    #[serde(default = "default_runtime")]
    pub runtime: Runtime,
    #[serde(default = "default_memory_size")]
    pub memory_size: u32,
    /// Seconds
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Directory the handler path is relative to
    #[serde(default = "default_code_dir")]
    pub code_dir: PathBuf,
    /// Packaged zip artifact, extracted per instance when present
    #[serde(default)]
    pub artifact: Option<PathBuf>,
}

fn default_runtime() -> Runtime {
    Runtime::Nodejs20
}

fn default_memory_size() -> u32 {
    1024
}

fn default_timeout() -> f64 {
    6.0
}

fn default_code_dir() -> PathBuf {
    PathBuf::from(".")
}

impl FunctionDefinition {
    pub fn new(key: impl Into<String>, handler: impl Into<String>, runtime: Runtime) -> Self {
        Self {
            key: key.into(),
            name: None,
            handler: handler.into(),
            runtime,
            memory_size: default_memory_size(),
            timeout_secs: default_timeout(),
            environment: HashMap::new(),
            code_dir: default_code_dir(),
            artifact: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }

    /// Split the handler into module path and export name
    pub fn handler_parts(&self) -> (&str, &str) {
        match self.handler.rsplit_once('.') {
            Some((module, export)) if !module.is_empty() && !export.is_empty() => (module, export),
            _ => (self.handler.as_str(), "handler"),
        }
    }

    /// Environment seen by the handler: emulated platform variables first,
    /// then the function's own environment
    pub fn lambda_environment(&self, region: &str, task_root: &str) -> HashMap<String, String> {
        let name = self.name();
        let mut env: HashMap<String, String> = [
            ("AWS_DEFAULT_REGION", region.to_string()),
            ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", self.memory_size.to_string()),
            ("AWS_LAMBDA_FUNCTION_NAME", name.to_string()),
            ("AWS_LAMBDA_FUNCTION_VERSION", "$LATEST".to_string()),
            ("AWS_LAMBDA_LOG_GROUP_NAME", format!("/aws/lambda/{name}")),
            ("AWS_LAMBDA_LOG_STREAM_NAME", "2016/12/02/[$LATEST]f77ff5e4026c45bda9a9ebcec6bc9cad".to_string()),
            ("AWS_REGION", region.to_string()),
            ("IS_OFFLINE", "true".to_string()),
            ("LAMBDA_RUNTIME_DIR", "/var/runtime".to_string()),
            ("LAMBDA_TASK_ROOT", task_root.to_string()),
            ("LANG", "en_US.UTF-8".to_string()),
            ("LD_LIBRARY_PATH", "/usr/local/lib64/node-v4.3.x/lib:/lib64:/usr/lib64:/var/runtime:/var/runtime/lib:/var/task:/var/task/lib".to_string()),
            ("_HANDLER", self.handler.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        env.extend(self.environment.clone());
        env
    }
}
