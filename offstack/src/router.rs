//! The routers served by the emulator, one listener each

use axum::Router;
use std::sync::Arc;
use tracing::warn;

use offstack_apigateway::GatewayState;
use offstack_lambda::{FunctionDefinition, LambdaService};
use offstack_websocket::WebSocketState;

use crate::config::Config;

/// A router and the port it listens on
pub struct Listener {
    pub name: &'static str,
    pub port: u16,
    pub router: Router,
}

/// Register every declared function, skipping the ones that fail
pub fn register_functions(service: &LambdaService, functions: &[FunctionDefinition]) -> usize {
    functions
        .iter()
        .filter(|function| match service.register_function((*function).clone()) {
            Ok(_) => true,
            Err(error) => {
                warn!(function = %function.key, %error, "Skipping function");
                false
            }
        })
        .count()
}

/// Create the gateway, WebSocket and invoke API routers
pub fn create_listeners(config: &Config, service: &Arc<LambdaService>) -> Vec<Listener> {
    let gateway = GatewayState::new(service.clone(), config.gateway.clone(), &config.http);
    let websocket = WebSocketState::new(
        service.clone(),
        config.websocket.options(&config.gateway),
        &config.websocket.routes,
    );

    vec![
        Listener {
            name: "HTTP gateway",
            port: config.server.http_port,
            router: offstack_apigateway::router(gateway),
        },
        Listener {
            name: "WebSocket gateway",
            port: config.server.websocket_port,
            router: offstack_websocket::router(websocket),
        },
        Listener {
            name: "Lambda invoke API",
            port: config.server.lambda_port,
            router: offstack_lambda::handlers::router(service.clone()),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use offstack_lambda::{async_handler, HandlerRegistry, LambdaConfig, Runtime};
    use offstack_test::TestServer;
    use serde_json::{json, Value};

    fn config() -> Config {
        let mut config = Config::default();
        config.functions = vec![
            FunctionDefinition::new("hello", "src/hello.handler", Runtime::ProvidedAl2023),
            FunctionDefinition::new("hello", "src/other.handler", Runtime::ProvidedAl2023),
        ];
        config.http = serde_json::from_value(json!([{"function": "hello", "method": "get", "path": "/hello"}])).unwrap();
        config.websocket.routes = serde_json::from_value(json!([{"route": "$default", "function": "hello"}])).unwrap();
        config
    }

    fn service() -> Arc<LambdaService> {
        let registry = HandlerRegistry::new();
        registry.register(
            "src/hello.handler",
            async_handler(|_event, _ctx| async move { Ok(json!({"statusCode": 200, "body": "hi"})) }),
        );
        Arc::new(LambdaService::new(LambdaConfig::default(), registry))
    }

    #[tokio::test]
    async fn test_duplicate_functions_are_skipped() {
        let service = service();
        assert_eq!(register_functions(&service, &config().functions), 1);
        assert!(service.get_function("hello").is_some());
    }

    #[tokio::test]
    async fn test_listeners_serve_their_apis() {
        let config = config();
        let service = service();
        register_functions(&service, &config.functions);

        let listeners = create_listeners(&config, &service);
        let ports: Vec<_> = listeners.iter().map(|listener| listener.port).collect();
        assert_eq!(ports, vec![3000, 3001, 3002]);

        let mut listeners = listeners.into_iter();
        let gateway = TestServer::serve(listeners.next().unwrap().router).await.unwrap();
        let response = gateway.client().get("/dev/hello").await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "hi");

        let _websocket = listeners.next().unwrap();
        let invoke = TestServer::serve(listeners.next().unwrap().router).await.unwrap();
        let response = invoke
            .client()
            .post_json("/2015-03-31/functions/hello/invocations", &json!({}))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["body"], "hi");
    }
}
