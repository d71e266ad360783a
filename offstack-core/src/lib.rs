//! Core types shared by the offstack gateways
//!
//! This crate provides wire helpers used by both the HTTP and the WebSocket
//! gateway: error bodies, request ids, header/query normalization, bearer
//! claims and authorizer policy evaluation.

pub mod authorizer;
pub mod error;
pub mod json_path;
pub mod jwt;
pub mod params;
pub mod request_id;
pub mod time;

pub use authorizer::{AuthorizedPrincipal, PolicyError};
pub use error::{ErrorCode, GatewayError};
pub use request_id::RequestId;
