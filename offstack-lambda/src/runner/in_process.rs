//! In-process backend: native handlers executed on the host runtime

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use super::module_cache::ModuleCache;
use super::{Runner, RunnerKind};
use crate::completion::{settle, Completion, HandlerContext, Outcome};
use crate::context::LambdaContext;
use crate::function::FunctionDefinition;
use crate::invocation::{HandlerError, InvocationError};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

/// A function handler.
///
/// `call` returning `Err` is a synchronous throw. Returning a future makes
/// its output one more completion candidate next to the context's
/// `succeed`/`fail`/`done` and the callback; the first one to resolve wins.
pub trait Handler: Send + Sync {
    fn call(&self, event: Value, context: HandlerContext) -> Result<Option<HandlerFuture>, HandlerError>;
}

struct AsyncHandler<F>(F);

impl<F, Fut> Handler for AsyncHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    fn call(&self, event: Value, context: HandlerContext) -> Result<Option<HandlerFuture>, HandlerError> {
        Ok(Some(Box::pin((self.0)(event, context))))
    }
}

struct SyncHandler<F>(F);

impl<F> Handler for SyncHandler<F>
where
    F: Fn(Value, HandlerContext) -> Result<(), HandlerError> + Send + Sync,
{
    fn call(&self, event: Value, context: HandlerContext) -> Result<Option<HandlerFuture>, HandlerError> {
        (self.0)(event, context).map(|()| None)
    }
}

/// Handler resolved by the value of the future it returns
pub fn async_handler<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    Arc::new(AsyncHandler(f))
}

/// Handler that completes through its context or callback
pub fn sync_handler<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Value, HandlerContext) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(SyncHandler(f))
}

fn panic_error(payload: Box<dyn Any + Send>) -> HandlerError {
    let message = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    HandlerError::new("Runtime.HandlerPanic", message)
}

/// Run one handler to its first completion.
///
/// Resolves to `null` when every handle on the completion is dropped
/// without anything completing it.
pub(crate) async fn invoke_handler(
    handler: Arc<dyn Handler>,
    event: Value,
    context: LambdaContext,
    env: Arc<HashMap<String, String>>,
) -> Outcome {
    let (completion, rx) = Completion::channel(&context.aws_request_id);
    let handler_context = HandlerContext::new(context, env, completion.clone());

    match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(event, handler_context))) {
        Err(payload) => {
            completion.complete(Err(panic_error(payload)), "throw");
        }
        Ok(Err(error)) => {
            completion.complete(settle(Some(error), None), "throw");
        }
        Ok(Ok(Some(future))) => {
            let completion = completion.clone();
            tokio::spawn(async move {
                let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Err(error)) => settle(Some(error), None),
                    Ok(outcome) => outcome,
                    Err(payload) => Err(panic_error(payload)),
                };
                completion.complete(outcome, "promise");
            });
        }
        Ok(Ok(None)) => {}
    }
    drop(completion);

    rx.await.unwrap_or(Ok(Value::Null))
}

/// Resolve the handler export of `function` through the module cache
pub(crate) fn resolve_handler(
    function: &FunctionDefinition,
    code_dir: &std::path::Path,
    modules: &ModuleCache,
) -> Result<Arc<dyn Handler>, InvocationError> {
    let (module_path, export) = function.handler_parts();
    let module = modules.load(code_dir, module_path)?;
    module.get(export).ok_or_else(|| {
        InvocationError::transport(format!(
            "Handler export '{export}' not found in module '{module_path}'"
        ))
    })
}

pub struct InProcessRunner {
    function: Arc<FunctionDefinition>,
    code_dir: PathBuf,
    env: Arc<HashMap<String, String>>,
    modules: Arc<ModuleCache>,
}

impl InProcessRunner {
    pub fn new(
        function: Arc<FunctionDefinition>,
        code_dir: PathBuf,
        env: Arc<HashMap<String, String>>,
        modules: Arc<ModuleCache>,
    ) -> Self {
        Self {
            function,
            code_dir,
            env,
            modules,
        }
    }
}

#[async_trait]
impl Runner for InProcessRunner {
    async fn run(&self, event: Value, context: LambdaContext) -> Result<Value, InvocationError> {
        let handler = resolve_handler(&self.function, &self.code_dir, &self.modules)?;
        Ok(invoke_handler(handler, event, context, self.env.clone()).await?)
    }

    async fn cleanup(&self) {}

    fn kind(&self) -> RunnerKind {
        RunnerKind::InProcess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReloadPolicy;
    use crate::function::Runtime;
    use crate::runner::module_cache::{HandlerModule, HandlerRegistry};
    use serde_json::json;
    use std::time::Duration;

    fn runner(handler: &str, module: HandlerModule) -> InProcessRunner {
        let registry = HandlerRegistry::new();
        let (module_path, _) = handler.rsplit_once('.').unwrap();
        registry.register_module(module_path, move || module.clone());
        let function = Arc::new(FunctionDefinition::new("fn", handler, Runtime::ProvidedAl2023));
        let env = Arc::new(function.lambda_environment("us-east-1", "."));
        InProcessRunner::new(
            function,
            PathBuf::from("."),
            env,
            Arc::new(ModuleCache::new(registry, ReloadPolicy::Never)),
        )
    }

    fn context() -> LambdaContext {
        let def = FunctionDefinition::new("fn", "h.handler", Runtime::ProvidedAl2023);
        LambdaContext::starting_now(&def, "req-1")
    }

    #[tokio::test]
    async fn test_async_handler_value() {
        let module = HandlerModule::new().export(
            "echo",
            async_handler(|event, _ctx| async move { Ok(json!({ "got": event })) }),
        );
        let result = runner("handler.echo", module).run(json!(1), context()).await.unwrap();
        assert_eq!(result, json!({ "got": 1 }));
    }

    #[tokio::test]
    async fn test_sync_handler_sees_env() {
        let module = HandlerModule::new().export(
            "offline",
            sync_handler(|_event, ctx| {
                ctx.succeed(ctx.env("IS_OFFLINE").unwrap_or("no"));
                Ok(())
            }),
        );
        let result = runner("handler.offline", module).run(Value::Null, context()).await.unwrap();
        assert_eq!(result, json!("true"));
    }

    #[tokio::test]
    async fn test_callback_beats_later_promise() {
        let module = HandlerModule::new().export(
            "race",
            async_handler(|_event, ctx| async move {
                ctx.callback().call(None, Some(json!("callback")));
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("promise"))
            }),
        );
        let result = runner("handler.race", module).run(Value::Null, context()).await.unwrap();
        assert_eq!(result, json!("callback"));
    }

    #[tokio::test]
    async fn test_completion_styles_agree_and_first_wins() {
        let cases: Vec<(&str, Arc<dyn Handler>)> = vec![
            (
                "returned",
                async_handler(|_event, ctx| async move {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        ctx.succeed("late");
                    });
                    Ok(json!({"ok": true}))
                }),
            ),
            (
                "awaited",
                async_handler(|_event, ctx| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let late = ctx.callback();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        late.call(None, Some(json!("late")));
                    });
                    Ok(json!({"ok": true}))
                }),
            ),
            (
                "callback",
                sync_handler(|_event, ctx| {
                    ctx.callback().call(None, Some(json!({"ok": true})));
                    ctx.succeed("late");
                    ctx.fail(HandlerError::new("Error", "late"));
                    Ok(())
                }),
            ),
            (
                "succeed",
                sync_handler(|_event, ctx| {
                    ctx.succeed(json!({"ok": true}));
                    ctx.callback().call(None, Some(json!("late")));
                    ctx.done(Some(HandlerError::new("Error", "late")), None);
                    Ok(())
                }),
            ),
        ];

        for (name, handler) in cases {
            let module = HandlerModule::new().export(name, handler);
            let result = runner(&format!("handler.{name}"), module)
                .run(Value::Null, context())
                .await
                .unwrap();
            assert_eq!(result, json!({"ok": true}), "{name}");
        }
    }

    #[tokio::test]
    async fn test_thrown_error() {
        let module = HandlerModule::new().export(
            "boom",
            sync_handler(|_event, _ctx| Err(HandlerError::new("TypeError", "bad input"))),
        );
        let error = runner("handler.boom", module).run(Value::Null, context()).await.unwrap_err();
        assert_eq!(error.error_type(), "TypeError");
        assert_eq!(error.to_string(), "bad input");
    }

    #[tokio::test]
    async fn test_panic_becomes_handler_error() {
        let module = HandlerModule::new().export(
            "panics",
            async_handler(|_event, _ctx| async move {
                if true {
                    panic!("exploded");
                }
                Ok(Value::Null)
            }),
        );
        let error = runner("handler.panics", module).run(Value::Null, context()).await.unwrap_err();
        assert_eq!(error.error_type(), "Runtime.HandlerPanic");
        assert_eq!(error.to_string(), "exploded");
    }

    #[tokio::test]
    async fn test_dropped_context_resolves_null() {
        let module = HandlerModule::new().export("noop", sync_handler(|_event, _ctx| Ok(())));
        let result = runner("handler.noop", module).run(Value::Null, context()).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_export_is_transport_error() {
        let module = HandlerModule::new().export("noop", sync_handler(|_event, _ctx| Ok(())));
        let error = runner("handler.missing", module).run(Value::Null, context()).await.unwrap_err();
        assert!(error.is_transport());
    }
}
