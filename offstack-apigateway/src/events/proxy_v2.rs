//! HTTP API proxy event (payload format 2.0)

use offstack_core::{params::parse_cookies, time::format_clf};
use serde_json::{json, Value};

use super::EventInput;
use crate::auth::v2_authorizer;

pub fn build(input: &EventInput<'_>) -> Value {
    let request = input.request;
    let endpoint = &input.route.endpoint;
    let body = input.request.event_body();
    let bearer = input.bearer();
    let route_key = endpoint.route_key.clone().unwrap_or_else(|| endpoint.describe());

    let mut request_context = json!({
        "accountId": "offlineContext_accountId",
        "apiId": "offlineContext_apiId",
        "authorizer": v2_authorizer(input.credentials, bearer.as_ref()),
        "domainName": "offlineContext_domainName",
        "domainPrefix": "offlineContext_domainPrefix",
        "http": {
            "method": input.http_method(),
            "path": request.path,
            "protocol": "HTTP/1.1",
            "sourceIp": request.source_ip,
            "userAgent": request.user_agent(),
        },
        "requestId": input.request_id.id,
        "routeKey": route_key,
        "stage": endpoint.stage,
        "time": format_clf(&request.received_at),
        "timeEpoch": request.received_at.timestamp_millis(),
    });
    if let Some(operation) = &endpoint.operation_id {
        request_context["operationName"] = json!(operation);
    }

    json!({
        "version": "2.0",
        "routeKey": route_key,
        "rawPath": request.path,
        "rawQueryString": request.raw_query.clone().unwrap_or_default(),
        "cookies": parse_cookies(&request.headers),
        "headers": request.header_values().joined(),
        "queryStringParameters": request.query().joined(),
        "requestContext": request_context,
        "body": body.body,
        "pathParameters": input.path_parameters(),
        "isBase64Encoded": body.is_base64_encoded,
        "stageVariables": input.stage_variables(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthCredentials;
    use crate::endpoint::{Endpoint, EndpointDescriptor, GatewayOptions};
    use crate::request::tests::request;
    use crate::routes::RouteTable;
    use http::{HeaderValue, Method};
    use offstack_core::{AuthorizedPrincipal, RequestId};
    use serde_json::Map;
    use std::sync::Arc;

    fn event_for(req: &crate::request::GatewayRequest, credentials: Option<&AuthCredentials>) -> Value {
        let descriptor: EndpointDescriptor = serde_json::from_value(json!({
            "function": "f", "http_api": true, "route_key": "GET /items/{id}", "operation_id": "getItem"
        }))
        .unwrap();
        let options = GatewayOptions::default();
        let mut table = RouteTable::new();
        table.add(Arc::new(Endpoint::resolve(&descriptor, &options).unwrap()), true);
        let route = table.find("GET", &req.path).unwrap();

        let request_id = RequestId::with_id("req-2");
        build(&EventInput {
            request: req,
            route: &route,
            credentials,
            options: &options,
            request_id: &request_id,
        })
    }

    #[test]
    fn test_v2_shape() {
        let mut req = request(Method::GET, "/items/9?tag=a&tag=b", "");
        req.headers.append("x-multi", HeaderValue::from_static("1"));
        req.headers.append("x-multi", HeaderValue::from_static("2"));
        req.headers.insert("cookie", HeaderValue::from_static("a=1; b=2"));

        let event = event_for(&req, None);
        assert_eq!(event["version"], "2.0");
        assert_eq!(event["routeKey"], "GET /items/{id}");
        assert_eq!(event["rawPath"], "/items/9");
        assert_eq!(event["rawQueryString"], "tag=a&tag=b");
        assert_eq!(event["queryStringParameters"], json!({"tag": "a,b"}));
        assert_eq!(event["headers"]["x-multi"], "1,2");
        assert_eq!(event["cookies"], json!(["a=1", "b=2"]));
        assert_eq!(event["pathParameters"], json!({"id": "9"}));
        assert_eq!(event["requestContext"]["http"]["method"], "GET");
        assert_eq!(event["requestContext"]["stage"], "$default");
        assert_eq!(event["requestContext"]["operationName"], "getItem");
        assert_eq!(event["requestContext"]["authorizer"], json!({}));
        assert!(event.get("multiValueHeaders").is_none());
    }

    #[test]
    fn test_lambda_authorizer_context() {
        let mut context = Map::new();
        context.insert("tenant".to_string(), json!("acme"));
        let credentials = AuthCredentials::Lambda(AuthorizedPrincipal {
            principal_id: String::new(),
            context,
            usage_identifier_key: None,
        });

        let req = request(Method::GET, "/items/9", "");
        let event = event_for(&req, Some(&credentials));
        assert_eq!(event["requestContext"]["authorizer"], json!({"lambda": {"tenant": "acme"}}));
        assert_eq!(event["queryStringParameters"], Value::Null);
    }
}
