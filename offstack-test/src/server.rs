//! Test server management

use axum::Router;
use portpicker::pick_unused_port;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use crate::STARTUP_TIMEOUT_SECS;

/// Errors that can occur with test server
#[derive(Debug, Error)]
pub enum TestError {
    #[error("No available port found")]
    NoPortAvailable,

    #[error("Failed to start server: {0}")]
    StartFailed(String),

    #[error("Server startup timed out")]
    StartupTimeout,

    #[error("Client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// A router served on a local port for the duration of a test
pub struct TestServer {
    addr: SocketAddr,
    base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Serve `router` on a random free port and wait until it answers
    pub async fn serve(router: Router) -> Result<Self, TestError> {
        let port = pick_unused_port().ok_or(TestError::NoPortAvailable)?;
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TestError::StartFailed(e.to_string()))?;

        let (shutdown, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = stopped.await;
                })
                .await;
        });

        let server = Self {
            addr,
            base_url: format!("http://{addr}"),
            shutdown: Some(shutdown),
            handle,
        };
        server.wait_ready().await?;
        info!(port, "Test server ready");
        Ok(server)
    }

    /// Any HTTP response, 404 included, means the listener is up
    async fn wait_ready(&self) -> Result<(), TestError> {
        let client = reqwest::Client::new();
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(STARTUP_TIMEOUT_SECS) {
            if client.get(&self.base_url).send().await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err(TestError::StartupTimeout)
    }

    /// Base URL, e.g. `http://127.0.0.1:41234`
    pub fn url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket URL for `path`
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client(&self) -> crate::TestClient {
        crate::TestClient::new(self.base_url.clone())
    }

    /// Stop accepting connections and wait for the server task
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn test_serve_and_stop() {
        let router = Router::new().route("/ping", get(|| async { "pong" }));
        let server = TestServer::serve(router).await.unwrap();

        let body = server.client().get("/ping").await.unwrap().text().await.unwrap();
        assert_eq!(body, "pong");
        assert!(server.ws_url("/").starts_with("ws://127.0.0.1:"));

        let url = server.url().to_string();
        server.stop().await;
        assert!(reqwest::get(&url).await.is_err());
    }
}
