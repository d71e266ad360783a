//! REST API proxy event (payload format 1.0)

use offstack_core::time::format_clf;
use serde_json::{json, Value};

use super::EventInput;
use crate::auth::v1_authorizer;

/// Build the proxy event. HTTP API routes on payload 1.0 use their route
/// key as `resource`.
pub fn build(input: &EventInput<'_>) -> Value {
    let request = input.request;
    let endpoint = &input.route.endpoint;
    let headers = request.header_values();
    let query = request.query();
    let body = request.event_body();
    let http_method = input.http_method();
    let path = input.path();
    let bearer = input.bearer();

    let resource = endpoint.route_key.clone().unwrap_or_else(|| endpoint.path.clone());

    json!({
        "body": body.body,
        "headers": headers.single,
        "httpMethod": http_method,
        "isBase64Encoded": body.is_base64_encoded,
        "multiValueHeaders": headers.multi,
        "multiValueQueryStringParameters": query.multi,
        "path": path,
        "pathParameters": input.path_parameters(),
        "queryStringParameters": query.single,
        "requestContext": {
            "accountId": "offlineContext_accountId",
            "apiId": "offlineContext_apiId",
            "authorizer": v1_authorizer(input.credentials, bearer.as_ref()),
            "domainName": "offlineContext_domainName",
            "domainPrefix": "offlineContext_domainPrefix",
            "extendedRequestId": input.request_id.extended_id,
            "httpMethod": http_method,
            "identity": input.identity(),
            "path": path,
            "protocol": "HTTP/1.1",
            "requestId": input.request_id.id,
            "requestTime": format_clf(&request.received_at),
            "requestTimeEpoch": request.received_at.timestamp_millis(),
            "resourceId": "offlineContext_resourceId",
            "resourcePath": endpoint.path,
            "stage": endpoint.stage,
        },
        "resource": resource,
        "stageVariables": input.stage_variables(),
    })
}
