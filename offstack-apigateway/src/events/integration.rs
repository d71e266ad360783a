//! Template-mapped (`AWS`) integration events

use serde_json::{json, Value};

use super::EventInput;
use crate::auth::v1_authorizer;
use crate::template::TemplateContext;

/// Template context for a request; `payload` is the parsed body for request
/// templates and the function result for response templates
pub fn template_context(input: &EventInput<'_>, payload: Value) -> TemplateContext {
    let request = input.request;
    let endpoint = &input.route.endpoint;
    let bearer = input.bearer();

    TemplateContext {
        payload,
        context: json!({
            "apiId": "offlineContext_apiId",
            "authorizer": v1_authorizer(input.credentials, bearer.as_ref()),
            "httpMethod": input.http_method(),
            "identity": input.identity(),
            "requestId": input.request_id.id,
            "resourceId": "offlineContext_resourceId",
            "resourcePath": endpoint.path,
            "stage": endpoint.stage,
        }),
        path_params: input.route.path_params.clone(),
        query: request.query().single.unwrap_or_default(),
        headers: request.header_values().single,
        stage_variables: input.stage_variables(),
    }
}

/// Event of the built-in request template
pub fn default_event(input: &EventInput<'_>, context: &TemplateContext) -> Value {
    let authorizer = &context.context["authorizer"];
    let enhanced_auth_context = input.credentials.map(crate::auth::AuthCredentials::context).unwrap_or_default();

    json!({
        "body": context.payload,
        "method": context.context["httpMethod"],
        "principalId": authorizer["principalId"],
        "stage": context.context["stage"],
        "cognitoPoolClaims": {
            "sub": authorizer["claims"]["sub"].as_str().unwrap_or_default(),
        },
        "enhancedAuthContext": enhanced_auth_context,
        "headers": context.headers,
        "query": context.query,
        "path": context.path_params,
        "identity": context.context["identity"],
        "stageVariables": context.stage_variables,
        "requestPath": context.context["resourcePath"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, EndpointDescriptor, GatewayOptions};
    use crate::request::tests::request;
    use crate::routes::RouteTable;
    use http::{HeaderValue, Method};
    use offstack_core::RequestId;
    use std::sync::Arc;

    #[test]
    fn test_default_event() {
        let descriptor: EndpointDescriptor = serde_json::from_value(json!({
            "function": "f", "method": "post", "path": "/orders/{id}", "integration": "lambda"
        }))
        .unwrap();
        let options = GatewayOptions::default();
        let mut table = RouteTable::new();
        table.add(Arc::new(Endpoint::resolve(&descriptor, &options).unwrap()), true);

        let mut req = request(Method::POST, "/dev/orders/5?expand=true", r#"{"qty":2}"#);
        req.headers.insert("x-client", HeaderValue::from_static("cli"));
        let route = table.find("POST", &req.path).unwrap();
        let request_id = RequestId::with_id("req-3");
        let input = EventInput {
            request: &req,
            route: &route,
            credentials: None,
            options: &options,
            request_id: &request_id,
        };

        let context = template_context(&input, req.payload());
        let event = default_event(&input, &context);

        assert_eq!(event["body"], json!({"qty": 2}));
        assert_eq!(event["method"], "POST");
        assert_eq!(event["principalId"], "offlineContext_authorizer_principalId");
        assert_eq!(event["stage"], "dev");
        assert_eq!(event["cognitoPoolClaims"], json!({"sub": ""}));
        assert_eq!(event["enhancedAuthContext"], json!({}));
        assert_eq!(event["headers"]["x-client"], "cli");
        assert_eq!(event["query"], json!({"expand": "true"}));
        assert_eq!(event["path"], json!({"id": "5"}));
        assert_eq!(event["requestPath"], "/orders/{id}");
        assert_eq!(event["identity"]["sourceIp"], "127.0.0.1");
    }
}
