//! Route keys and route selection

use offstack_core::json_path;
use serde_json::Value;
use std::collections::HashMap;

pub const CONNECT: &str = "$connect";
pub const DISCONNECT: &str = "$disconnect";
pub const DEFAULT: &str = "$default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketRoute {
    pub function: String,
    /// Send the handler's `body` back to the client
    pub echo_body: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, WebSocketRoute>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, route_key: impl Into<String>, route: WebSocketRoute) {
        self.routes.insert(route_key.into(), route);
    }

    /// Declared key serving `route_key`. `$connect` and `$disconnect` only
    /// match themselves, anything else falls back to `$default`.
    pub fn declared_key(&self, route_key: &str) -> Option<&str> {
        match self.routes.get_key_value(route_key) {
            Some((key, _)) => Some(key.as_str()),
            None if route_key == CONNECT || route_key == DISCONNECT => None,
            None => self.routes.get_key_value(DEFAULT).map(|(key, _)| key.as_str()),
        }
    }

    /// Route for `route_key`, after the `$default` fallback
    pub fn resolve(&self, route_key: &str) -> Option<&WebSocketRoute> {
        self.declared_key(route_key).and_then(|key| self.routes.get(key))
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Route key of an inbound message: the value `expression` points at when
/// the message is JSON and that value is a non-empty string, else `$default`
pub fn select_route(expression: &str, message: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(message) else {
        return DEFAULT.to_string();
    };
    let path = expression.replacen("request.body", "", 1);
    match json_path::resolve(&parsed, &path) {
        Some(Value::String(route)) if !route.is_empty() => route.clone(),
        _ => DEFAULT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(function: &str) -> WebSocketRoute {
        WebSocketRoute {
            function: function.to_string(),
            echo_body: false,
        }
    }

    #[test]
    fn test_select_route() {
        let expression = "$request.body.action";
        assert_eq!(select_route(expression, r#"{"action":"send"}"#), "send");
        assert_eq!(select_route(expression, r#"{"action":""}"#), DEFAULT);
        assert_eq!(select_route(expression, r#"{"action":5}"#), DEFAULT);
        assert_eq!(select_route(expression, r#"{"other":"x"}"#), DEFAULT);
        assert_eq!(select_route(expression, "not json"), DEFAULT);
        assert_eq!(select_route("$request.body.meta.kind", r#"{"meta":{"kind":"ping"}}"#), "ping");
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let mut table = RouteTable::new();
        table.insert(DEFAULT, route("fallback"));
        table.insert("send", route("send"));

        assert_eq!(table.resolve("send").unwrap().function, "send");
        assert_eq!(table.resolve("unknown").unwrap().function, "fallback");
        assert!(table.resolve(CONNECT).is_none());
        assert!(table.resolve(DISCONNECT).is_none());

        assert_eq!(table.declared_key("send"), Some("send"));
        assert_eq!(table.declared_key("unknown"), Some(DEFAULT));
        assert_eq!(table.declared_key(CONNECT), None);
        assert_eq!(RouteTable::new().declared_key("unknown"), None);
    }

    #[test]
    fn test_keys_sorted() {
        let mut table = RouteTable::new();
        table.insert("b", route("b"));
        table.insert(CONNECT, route("c"));
        assert_eq!(table.keys(), vec!["$connect", "b"]);
    }
}
