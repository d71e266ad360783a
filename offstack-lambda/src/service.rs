//! Lambda service: function table plus the pool that runs them

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::config::LambdaConfig;
use crate::function::FunctionDefinition;
use crate::invocation::InvocationError;
use crate::pool::FunctionPool;
use crate::runner::{self, module_cache::HandlerRegistry};

#[derive(Debug, Error)]
pub enum LambdaServiceError {
    #[error("Function already exists: {0}")]
    FunctionExists(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),
}

/// Registered functions and the pool that executes them
pub struct LambdaService {
    functions: DashMap<String, Arc<FunctionDefinition>>,
    /// Deployed name -> key
    names: DashMap<String, String>,
    pool: Arc<FunctionPool>,
}

impl LambdaService {
    /// Must be called inside a tokio runtime (the pool starts its reaper)
    pub fn new(config: LambdaConfig, registry: HandlerRegistry) -> Self {
        Self {
            functions: DashMap::new(),
            names: DashMap::new(),
            pool: FunctionPool::new(config, registry),
        }
    }

    /// Register a function. Runtimes no backend can run are rejected.
    pub fn register_function(&self, function: FunctionDefinition) -> Result<Arc<FunctionDefinition>, LambdaServiceError> {
        if self.functions.contains_key(&function.key) {
            return Err(LambdaServiceError::FunctionExists(function.key));
        }
        let backend = runner::select(&function, self.pool.config())?;

        let function = Arc::new(function);
        info!(
            function = %function.key,
            runtime = %function.runtime.as_str(),
            backend = backend.as_str(),
            "Registered function"
        );
        self.names.insert(function.name().to_string(), function.key.clone());
        self.functions.insert(function.key.clone(), function.clone());
        Ok(function)
    }

    pub fn get_function(&self, key: &str) -> Option<Arc<FunctionDefinition>> {
        self.functions.get(key).map(|f| f.clone())
    }

    /// Look a function up by deployed name, falling back to its key
    pub fn get_by_name(&self, name: &str) -> Option<Arc<FunctionDefinition>> {
        self.names
            .get(name)
            .and_then(|key| self.get_function(&key))
            .or_else(|| self.get_function(name))
    }

    pub fn list_functions(&self) -> Vec<Arc<FunctionDefinition>> {
        let mut functions: Vec<_> = self.functions.iter().map(|r| r.value().clone()).collect();
        functions.sort_by(|a, b| a.key.cmp(&b.key));
        functions
    }

    pub fn registry(&self) -> &HandlerRegistry {
        self.pool.registry()
    }

    pub fn pool(&self) -> &Arc<FunctionPool> {
        &self.pool
    }

    /// Run `key` with `event` and wait for its result
    pub async fn invoke(&self, key: &str, event: Value, client_context: Option<Value>) -> Result<Value, InvocationError> {
        let function = self
            .get_function(key)
            .ok_or_else(|| InvocationError::FunctionNotFound(key.to_string()))?;
        let lease = self.pool.get(&function)?;
        lease.run(event, client_context).await
    }

    /// Start `key` without waiting; failures are only logged
    pub fn invoke_async(&self, key: &str, event: Value) -> Result<(), InvocationError> {
        let function = self
            .get_function(key)
            .ok_or_else(|| InvocationError::FunctionNotFound(key.to_string()))?;
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let result = match pool.get(&function) {
                Ok(lease) => lease.run(event, None).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(function = %function.key, error = %e, "Asynchronous invocation failed");
            }
        });
        Ok(())
    }

    /// Drop warm instances so the next invocation starts fresh
    pub async fn flush(&self) {
        self.pool.flush().await;
    }

    /// Tear down every instance and shared backend
    pub async fn shutdown(&self) {
        self.pool.cleanup().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Runtime;
    use crate::runner::in_process::{async_handler, sync_handler};
    use serde_json::json;
    use std::time::Duration;

    fn service() -> LambdaService {
        let registry = HandlerRegistry::new();
        registry.register(
            "handler.hello",
            sync_handler(|event, ctx| {
                ctx.succeed(json!({ "hello": event["name"] }));
                Ok(())
            }),
        );
        registry.register(
            "handler.context",
            async_handler(|_event, ctx| async move {
                Ok(ctx.lambda_context().client_context.clone().unwrap_or(Value::Null))
            }),
        );
        LambdaService::new(LambdaConfig::default(), registry)
    }

    #[tokio::test]
    async fn test_register_and_get_function() {
        let service = service();
        let mut definition = FunctionDefinition::new("hello", "handler.hello", Runtime::ProvidedAl2023);
        definition.name = Some("offline-dev-hello".to_string());
        service.register_function(definition).unwrap();

        assert_eq!(service.get_function("hello").unwrap().key, "hello");
        assert_eq!(service.get_by_name("offline-dev-hello").unwrap().key, "hello");
        assert_eq!(service.get_by_name("hello").unwrap().key, "hello");
        assert_eq!(service.list_functions().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_unsupported_functions() {
        let service = service();
        service
            .register_function(FunctionDefinition::new("hello", "handler.hello", Runtime::ProvidedAl2023))
            .unwrap();

        let duplicate = service.register_function(FunctionDefinition::new("hello", "handler.hello", Runtime::ProvidedAl2023));
        assert!(matches!(duplicate, Err(LambdaServiceError::FunctionExists(_))));

        let java = service.register_function(FunctionDefinition::new("java", "x", Runtime::Java17));
        assert!(matches!(
            java,
            Err(LambdaServiceError::Invocation(InvocationError::UnsupportedRuntime { .. }))
        ));
    }

    #[tokio::test]
    async fn test_invoke() {
        let service = service();
        service
            .register_function(FunctionDefinition::new("hello", "handler.hello", Runtime::ProvidedAl2023))
            .unwrap();

        let result = service.invoke("hello", json!({"name": "offline"}), None).await.unwrap();
        assert_eq!(result, json!({"hello": "offline"}));

        let missing = service.invoke("nope", Value::Null, None).await;
        assert!(matches!(missing, Err(InvocationError::FunctionNotFound(_))));
    }

    #[tokio::test]
    async fn test_client_context_reaches_handler() {
        let service = service();
        service
            .register_function(FunctionDefinition::new("ctx", "handler.context", Runtime::ProvidedAl2023))
            .unwrap();

        let result = service
            .invoke("ctx", Value::Null, Some(json!({"custom": {"a": 1}})))
            .await
            .unwrap();
        assert_eq!(result, json!({"custom": {"a": 1}}));
    }

    #[tokio::test]
    async fn test_invoke_async_and_shutdown() {
        let service = service();
        service
            .register_function(FunctionDefinition::new("hello", "handler.hello", Runtime::ProvidedAl2023))
            .unwrap();

        service.invoke_async("hello", json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.pool().instance_count("hello"), 1);

        service.shutdown().await;
        let closed = service.invoke("hello", Value::Null, None).await;
        assert!(matches!(closed, Err(InvocationError::PoolClosed)));
    }
}
