//! Client for exercising a running offstack server

use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;

use crate::TestError;

/// Thin reqwest wrapper rooted at a server's base URL
pub struct TestClient {
    base_url: String,
    client: Client,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying client, for requests the helpers do not cover
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> Result<Response, TestError> {
        Ok(self.client.get(self.url(path)).send().await?)
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Response, TestError> {
        Ok(self.client.post(self.url(path)).json(body).send().await?)
    }

    // === Lambda invoke API ===

    /// Invoke `function_name`, optionally with an `X-Amz-Invocation-Type`
    pub async fn invoke(
        &self,
        function_name: &str,
        payload: &Value,
        invocation_type: Option<&str>,
    ) -> Result<Response, TestError> {
        let mut request = self
            .client
            .post(self.url(&format!("/2015-03-31/functions/{function_name}/invocations")))
            .body(payload.to_string());
        if let Some(invocation_type) = invocation_type {
            request = request.header("X-Amz-Invocation-Type", invocation_type);
        }
        Ok(request.send().await?)
    }
}
