//! offstack - local serverless gateway emulator
//!
//! Serves declared functions behind an API Gateway style HTTP listener, a
//! WebSocket gateway and the Lambda invoke API, running handlers in
//! process, in child processes or in containers.

mod config;
mod router;

use anyhow::Context;
use clap::Parser;
use offstack_lambda::{HandlerRegistry, LambdaService};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "offstack")]
#[command(about = "Local serverless gateway emulator", long_about = None)]
struct Args {
    /// Configuration file, defaults to ./offstack.toml when present
    #[arg(short, long, env = "OFFSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "OFFSTACK_HOST")]
    host: Option<String>,

    /// Port of the HTTP gateway
    #[arg(long, env = "OFFSTACK_HTTP_PORT")]
    http_port: Option<u16>,

    /// Port of the WebSocket gateway
    #[arg(long, env = "OFFSTACK_WEBSOCKET_PORT")]
    websocket_port: Option<u16>,

    /// Port of the Lambda invoke API
    #[arg(long, env = "OFFSTACK_LAMBDA_PORT")]
    lambda_port: Option<u16>,

    /// Skip authorizers and API key checks
    #[arg(long, env = "OFFSTACK_NO_AUTH")]
    no_auth: bool,

    /// Run every function in a container
    #[arg(long, env = "OFFSTACK_USE_DOCKER")]
    use_docker: bool,

    /// Disable invocation timeouts
    #[arg(long, env = "OFFSTACK_NO_TIMEOUT")]
    no_timeout: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OFFSTACK_LOG_LEVEL")]
    log_level: String,
}

impl Args {
    /// Flags win over the configuration file
    fn apply(&self, config: &mut config::Config) {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.http_port {
            config.server.http_port = port;
        }
        if let Some(port) = self.websocket_port {
            config.server.websocket_port = port;
        }
        if let Some(port) = self.lambda_port {
            config.server.lambda_port = port;
        }
        if self.no_auth {
            config.gateway.no_auth = true;
        }
        if self.use_docker {
            config.lambda.use_docker = true;
        }
        if self.no_timeout {
            config.lambda.no_timeout = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("offstack={},tower_http=debug", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = config::Config::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);

    info!("Starting offstack...");
    let service = Arc::new(LambdaService::new(config.lambda.clone(), HandlerRegistry::new()));
    let registered = router::register_functions(&service, &config.functions);
    info!("  Functions: {registered}/{}", config.functions.len());

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut servers = Vec::new();
    for listener in router::create_listeners(&config, &service) {
        let addr = format!("{}:{}", config.server.host, listener.port);
        let socket = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind the {} to {addr}", listener.name))?;
        info!("{} listening on http://{addr}", listener.name);

        let mut shutdown = shutdown_rx.clone();
        let app = listener.router.into_make_service_with_connect_info::<SocketAddr>();
        servers.push(tokio::spawn(async move {
            axum::serve(socket, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
        }));
    }

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    let _ = shutdown_tx.send(());
    for server in servers {
        server.await??;
    }
    service.shutdown().await;

    Ok(())
}
