//! Configuration management
//!
//! Everything the emulator serves is declared in `offstack.toml` (or the
//! file given with `--config`), layered under `OFFSTACK_`-prefixed
//! environment variables such as `OFFSTACK_LAMBDA__IDLE_TIMEOUT_SECS=30`.

use offstack_apigateway::{EndpointDescriptor, GatewayOptions};
use offstack_lambda::{FunctionDefinition, LambdaConfig};
use offstack_websocket::config::DEFAULT_ROUTE_SELECTION_EXPRESSION;
use offstack_websocket::{WebSocketOptions, WebSocketRouteDescriptor};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub lambda: LambdaConfig,

    #[serde(default)]
    pub gateway: GatewayOptions,

    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,

    /// HTTP events
    #[serde(default)]
    pub http: Vec<EndpointDescriptor>,

    #[serde(default)]
    pub websocket: WebSocketConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    #[serde(default = "default_lambda_port")]
    pub lambda_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            websocket_port: default_websocket_port(),
            lambda_port: default_lambda_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_route_selection_expression")]
    pub route_selection_expression: String,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_hard_timeout_secs")]
    pub hard_timeout_secs: u64,

    #[serde(default)]
    pub routes: Vec<WebSocketRouteDescriptor>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            route_selection_expression: default_route_selection_expression(),
            idle_timeout_secs: default_idle_timeout_secs(),
            hard_timeout_secs: default_hard_timeout_secs(),
            routes: Vec::new(),
        }
    }
}

impl WebSocketConfig {
    /// Gateway options, sharing auth and error settings with the HTTP gateway
    pub fn options(&self, gateway: &GatewayOptions) -> WebSocketOptions {
        WebSocketOptions {
            route_selection_expression: self.route_selection_expression.clone(),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            hard_timeout: Duration::from_secs(self.hard_timeout_secs),
            hide_stack_traces: gateway.hide_stack_traces,
            region: gateway.region.clone(),
            no_auth: gateway.no_auth,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_http_port() -> u16 {
    3000
}

fn default_websocket_port() -> u16 {
    3001
}

fn default_lambda_port() -> u16 {
    3002
}

fn default_route_selection_expression() -> String {
    DEFAULT_ROUTE_SELECTION_EXPRESSION.to_string()
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_hard_timeout_secs() -> u64 {
    7200
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// An explicit `path` must exist; otherwise `offstack.toml` in the
    /// working directory is read when present.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("offstack").required(false),
        };
        Self::from_sources(config::Config::builder().add_source(file))
    }

    fn from_sources(builder: config::ConfigBuilder<config::builder::DefaultState>) -> anyhow::Result<Self> {
        let config = builder
            .add_source(
                config::Environment::with_prefix("OFFSTACK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize::<Config>()?)
    }

    #[cfg(test)]
    fn from_toml(source: &str) -> anyhow::Result<Self> {
        Self::from_sources(
            config::Config::builder().add_source(config::File::from_str(source, config::FileFormat::Toml)),
        )
    }
}
