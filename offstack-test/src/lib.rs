//! Test utilities for offstack
//!
//! Serves any axum router on a free local port and waits until it answers,
//! plus a small HTTP client for the invoke API and gateway routes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use offstack_test::TestServer;
//!
//! #[tokio::test]
//! async fn test_gateway() {
//!     let router = axum::Router::new();
//!     let server = TestServer::serve(router).await.unwrap();
//!
//!     let response = server.client().get("/dev/hello").await.unwrap();
//!     assert_eq!(response.status(), 404);
//! }
//! ```

pub mod client;
pub mod server;

pub use client::TestClient;
pub use server::{TestError, TestServer};

/// Timeout for waiting on a server to accept requests
pub const STARTUP_TIMEOUT_SECS: u64 = 10;

/// Install a test log subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("offstack=debug")),
        )
        .with_test_writer()
        .try_init();
}
