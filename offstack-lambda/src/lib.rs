//! Function execution for offstack
//!
//! Holds the function table, the warm-instance pool, the execution
//! backends and the Lambda invoke API.

pub mod artifact;
pub mod completion;
pub mod config;
pub mod context;
pub mod function;
pub mod handlers;
pub mod instance;
pub mod invocation;
pub mod pool;
pub mod runner;
pub mod service;

pub use completion::{Callback, HandlerContext};
pub use config::{DockerConfig, LambdaConfig, ReloadPolicy};
pub use context::LambdaContext;
pub use function::{FunctionDefinition, Runtime, RuntimeFamily};
pub use handlers::LambdaState;
pub use invocation::{HandlerError, InvocationError};
pub use pool::FunctionPool;
pub use runner::in_process::{async_handler, sync_handler, Handler, HandlerFuture};
pub use runner::module_cache::{HandlerModule, HandlerRegistry};
pub use service::{LambdaService, LambdaServiceError};
