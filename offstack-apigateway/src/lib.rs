//! HTTP API gateway emulation for offstack
//!
//! Turns HTTP requests into function invocations the way API Gateway does,
//! for REST APIs (payload 1.0, proxy or template-mapped integrations) and
//! HTTP APIs (payload 2.0), with authorizers, API keys and CORS.

pub mod auth;
pub mod cors;
pub mod endpoint;
pub mod events;
pub mod handlers;
pub mod request;
pub mod response;
pub mod routes;
pub mod schema;
pub mod template;

pub use endpoint::{
    AuthorizerDescriptor, AuthorizerKind, ConfigurationError, CorsDescriptor, Endpoint, EndpointDescriptor,
    GatewayOptions, HttpApiCors,
};
pub use handlers::{handle_request, router, GatewayState};
pub use request::GatewayRequest;
pub use template::{SubstitutionRenderer, TemplateContext, TemplateError, TemplateRenderer};
