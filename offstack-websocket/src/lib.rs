//! WebSocket API gateway emulation for offstack
//!
//! Accepts WebSocket connections, routes each inbound message to a function
//! by the route selection expression and lets functions talk back through
//! the `@connections` API served on the same listener.

pub mod clients;
pub mod config;
pub mod events;
pub mod handlers;
pub mod routes;

pub use clients::{Connection, ConnectionRegistry};
pub use config::{ConnectAuthorizer, WebSocketOptions, WebSocketRouteDescriptor};
pub use handlers::{router, WebSocketState};
