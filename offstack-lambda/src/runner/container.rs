//! Container backend
//!
//! Runs a function inside the AWS Lambda base image for its runtime. The
//! code directory is mounted read-only at `/var/task` and invocations go
//! through the image's runtime interface emulator on a published port.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{absolute_path, Runner, RunnerKind};
use crate::config::DockerConfig;
use crate::context::LambdaContext;
use crate::function::FunctionDefinition;
use crate::invocation::{HandlerError, InvocationError};

/// Port of the runtime interface emulator inside the image
const EMULATOR_PORT: u16 = 8080;
const INVOKE_PATH: &str = "/2015-03-31/functions/function/invocations";

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Docker not available: {0}")]
    NotAvailable(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Container did not become ready within {0:?}")]
    NotReady(Duration),

    #[error("Image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("Container request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ContainerError> for InvocationError {
    fn from(error: ContainerError) -> Self {
        InvocationError::transport(error.to_string())
    }
}

struct RunningContainer {
    id: String,
    endpoint: String,
}

pub struct ContainerRunner {
    function: Arc<FunctionDefinition>,
    code_dir: PathBuf,
    env: Arc<HashMap<String, String>>,
    config: DockerConfig,
    client: reqwest::Client,
    container: Mutex<Option<RunningContainer>>,
    cleaned: AtomicBool,
}

impl ContainerRunner {
    pub fn new(
        function: Arc<FunctionDefinition>,
        code_dir: PathBuf,
        env: Arc<HashMap<String, String>>,
        config: DockerConfig,
    ) -> Self {
        Self {
            function,
            code_dir,
            env,
            config,
            client: reqwest::Client::new(),
            container: Mutex::new(None),
            cleaned: AtomicBool::new(false),
        }
    }

    /// Make sure the image is present locally, pulling it when allowed
    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        let output = Command::new("docker")
            .args(["image", "inspect", image])
            .output()
            .await
            .map_err(|e| ContainerError::NotAvailable(e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }
        if !self.config.pull {
            return Err(ContainerError::ImagePullFailed(format!(
                "{image} is not available locally and pulling is disabled"
            )));
        }

        info!(image = %image, "Pulling Lambda base image");
        let output = Command::new("docker").args(["pull", image]).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::ImagePullFailed(format!(
                "Failed to pull {image}: {stderr}"
            )));
        }
        Ok(())
    }

    async fn start(&self) -> Result<RunningContainer, ContainerError> {
        let image = self.function.runtime.container_image();
        self.ensure_image(image).await?;

        let port = portpicker::pick_unused_port()
            .ok_or_else(|| ContainerError::StartFailed("no free port for the container".to_string()))?;
        let name = format!(
            "offstack-{}-{}",
            sanitize(&self.function.key),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let args = create_args(
            &name,
            &absolute_path(&self.code_dir),
            port,
            &self.config,
            &self.env,
            image,
            &self.function.handler,
        );

        debug!(args = ?args, "Creating Docker container");
        let output = Command::new("docker").args(&args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "Failed to create container");
            return Err(ContainerError::StartFailed(stderr.to_string()));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let output = Command::new("docker").args(["start", &id]).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            remove_container(&id).await;
            return Err(ContainerError::StartFailed(stderr.to_string()));
        }

        let container = RunningContainer {
            endpoint: format!("http://{}:{port}{INVOKE_PATH}", self.config.host_address),
            id,
        };
        if let Err(e) = self.wait_ready(port).await {
            remove_container(&container.id).await;
            return Err(e);
        }

        info!(
            container_id = %container.id,
            function = %self.function.key,
            image = %image,
            port,
            "Started container"
        );
        Ok(container)
    }

    /// Poll the published port until the emulator answers
    async fn wait_ready(&self, port: u16) -> Result<(), ContainerError> {
        let url = format!("http://{}:{port}/", self.config.host_address);
        let timeout = self.config.readiness_timeout();
        let started = Instant::now();
        while started.elapsed() < timeout {
            if self.client.get(&url).send().await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(ContainerError::NotReady(timeout))
    }
}

#[async_trait]
impl Runner for ContainerRunner {
    async fn run(&self, event: Value, _context: LambdaContext) -> Result<Value, InvocationError> {
        let endpoint = {
            let mut container = self.container.lock().await;
            if self.cleaned.load(Ordering::SeqCst) {
                return Err(InvocationError::PoolClosed);
            }
            if container.is_none() {
                *container = Some(self.start().await?);
            }
            container
                .as_ref()
                .map(|c| c.endpoint.clone())
                .unwrap_or_default()
        };

        debug!(function = %self.function.key, endpoint = %endpoint, "Invoking function in container");
        let response = self
            .client
            .post(&endpoint)
            .json(&event)
            .send()
            .await
            .map_err(ContainerError::from)?;
        let status = response.status();
        let body = response.bytes().await.map_err(ContainerError::from)?;

        if !status.is_success() {
            return Err(InvocationError::transport(format!(
                "Container returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        interpret_response(&body)
    }

    async fn cleanup(&self) {
        self.cleaned.store(true, Ordering::SeqCst);
        if let Some(container) = self.container.lock().await.take() {
            remove_container(&container.id).await;
            info!(container_id = %container.id, function = %self.function.key, "Removed container");
        }
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::Container
    }
}

async fn remove_container(id: &str) {
    match Command::new("docker").args(["rm", "-f", id]).output().await {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(
            container_id = %id,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Failed to remove container"
        ),
        Err(e) => warn!(container_id = %id, error = %e, "Failed to remove container"),
    }
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// `docker create` arguments for one function container
fn create_args(
    name: &str,
    code_dir: &Path,
    port: u16,
    config: &DockerConfig,
    env: &HashMap<String, String>,
    image: &str,
    handler: &str,
) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-v".to_string(),
        format!("{}:/var/task:ro,delegated", code_dir.display()),
        "-p".to_string(),
        format!("{port}:{EMULATOR_PORT}"),
    ];
    if let Some(network) = &config.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }

    let mut variables: Vec<_> = env.iter().collect();
    variables.sort();
    for (key, value) in variables {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    args.extend(config.extra_args.iter().cloned());
    args.push(image.to_string());
    args.push(handler.to_string());
    args
}

/// The emulator reports handler failures as a 200 with an error object
fn interpret_response(body: &[u8]) -> Result<Value, InvocationError> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| InvocationError::transport(format!("Invalid container response: {e}")))?;
    let is_error = value
        .as_object()
        .is_some_and(|o| o.contains_key("errorMessage") && o.contains_key("errorType"));
    if is_error {
        return Err(HandlerError::from_value(&value).into());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_args() {
        let config = DockerConfig {
            network: Some("offline".to_string()),
            extra_args: vec!["--memory".to_string(), "512m".to_string()],
            ..DockerConfig::default()
        };
        let env = HashMap::from([
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "1".to_string()),
        ]);
        let args = create_args(
            "offstack-hello-1234abcd",
            Path::new("/srv/app"),
            9100,
            &config,
            &env,
            "public.ecr.aws/lambda/nodejs:20",
            "handler.hello",
        );

        assert_eq!(
            args,
            vec![
                "create",
                "--name",
                "offstack-hello-1234abcd",
                "-v",
                "/srv/app:/var/task:ro,delegated",
                "-p",
                "9100:8080",
                "--network",
                "offline",
                "-e",
                "A=1",
                "-e",
                "B=2",
                "--memory",
                "512m",
                "public.ecr.aws/lambda/nodejs:20",
                "handler.hello",
            ]
        );
    }

    #[test]
    fn test_interpret_response() {
        assert_eq!(interpret_response(br#"{"statusCode":200}"#).unwrap(), json!({"statusCode": 200}));
        assert_eq!(interpret_response(b"").unwrap(), Value::Null);

        let error = interpret_response(
            br#"{"errorMessage":"boom","errorType":"Error","stackTrace":["at x"]}"#,
        )
        .unwrap_err();
        assert_eq!(error.to_string(), "boom");
        assert_eq!(error.stack_trace(), ["at x".to_string()]);

        assert!(interpret_response(b"not json").unwrap_err().is_transport());
    }

    #[test]
    fn test_sanitize_container_name() {
        assert_eq!(sanitize("users/get:v1"), "users-get-v1");
    }
}
