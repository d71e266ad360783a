//! WebSocket gateway options and route declarations

use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_ROUTE_SELECTION_EXPRESSION: &str = "$request.body.action";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(7200);

#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    pub route_selection_expression: String,
    /// Close a connection nothing was sent or received on for this long
    pub idle_timeout: Duration,
    /// Close every connection this long after it opened
    pub hard_timeout: Duration,
    pub hide_stack_traces: bool,
    pub region: String,
    /// Skip the `$connect` authorizer
    pub no_auth: bool,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            route_selection_expression: DEFAULT_ROUTE_SELECTION_EXPRESSION.to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            hard_timeout: DEFAULT_HARD_TIMEOUT,
            hide_stack_traces: false,
            region: "us-east-1".to_string(),
            no_auth: false,
        }
    }
}

/// Request authorizer of the `$connect` route
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectAuthorizer {
    pub name: String,
    /// Function key, defaults to `name`
    pub function: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl ConnectAuthorizer {
    pub fn function_key(&self) -> &str {
        self.function.as_deref().unwrap_or(&self.name)
    }
}

/// A `websocket` event as declared by the project
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebSocketRouteDescriptor {
    pub route: String,
    pub function: String,
    /// `$default` sends the handler's `body` back on the socket
    pub route_response_selection_expression: Option<String>,
    pub authorizer: Option<ConnectAuthorizer>,
}
