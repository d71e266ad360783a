//! Invocation events of WebSocket routes

use chrono::{DateTime, Utc};
use http::HeaderMap;
use offstack_core::{params::HeaderValues, params::QueryValues, time::format_clf, AuthorizedPrincipal};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::routes::CONNECT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Connect,
    Message,
    Disconnect,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Message => "MESSAGE",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

/// Outcome of the `$connect` authorizer, carried by every later event of
/// the connection
#[derive(Debug, Clone)]
pub struct ConnectAuthorization {
    pub principal: AuthorizedPrincipal,
    pub source_ip: String,
    pub user_agent: String,
}

impl ConnectAuthorization {
    pub fn authorizer(&self) -> Value {
        let mut authorizer = Map::new();
        authorizer.insert("integrationLatency".to_string(), json!("42"));
        authorizer.insert("principalId".to_string(), json!(self.principal.principal_id));
        for (key, value) in &self.principal.context {
            authorizer.insert(key.clone(), value.clone());
        }
        Value::Object(authorizer)
    }
}

/// Per-event data of `requestContext`
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    pub event_type: EventType,
    pub route_key: &'a str,
    pub connection_id: &'a str,
    pub connected_at: DateTime<Utc>,
    pub authorization: Option<&'a ConnectAuthorization>,
}

impl EventContext<'_> {
    pub fn request_context(&self) -> Value {
        let now = Utc::now();
        let mut identity = json!({
            "accessKey": null,
            "accountId": null,
            "caller": null,
            "cognitoAuthenticationProvider": null,
            "cognitoAuthenticationType": null,
            "cognitoIdentityId": null,
            "cognitoIdentityPoolId": null,
            "principalOrgId": null,
            "sourceIp": "127.0.0.1",
            "user": null,
            "userAgent": null,
            "userArn": null,
        });

        let mut context = json!({
            "apiId": "private",
            "connectedAt": self.connected_at.timestamp_millis(),
            "connectionId": self.connection_id,
            "domainName": "localhost",
            "eventType": self.event_type.as_str(),
            "extendedRequestId": Uuid::new_v4().to_string(),
            "messageDirection": "IN",
            "messageId": Uuid::new_v4().to_string(),
            "requestId": Uuid::new_v4().to_string(),
            "requestTime": format_clf(&now),
            "requestTimeEpoch": now.timestamp_millis(),
            "routeKey": self.route_key,
            "stage": "local",
        });

        if let Some(authorization) = self.authorization {
            identity["apiKey"] = json!(authorization.principal.usage_identifier_key);
            identity["sourceIp"] = json!(authorization.source_ip);
            identity["userAgent"] = json!(authorization.user_agent);
            context["authorizer"] = authorization.authorizer();
        }
        context["identity"] = identity;
        context
    }
}

fn with_query(event: &mut Value, raw_query: Option<&str>) {
    let query = QueryValues::parse(raw_query);
    if let (Some(single), Some(multi)) = (query.single, query.multi) {
        event["queryStringParameters"] = json!(single);
        event["multiValueQueryStringParameters"] = json!(multi);
    }
}

pub fn connect_event(context: &EventContext<'_>, headers: &HeaderMap, raw_query: Option<&str>) -> Value {
    let headers = HeaderValues::from_header_map(headers);
    let mut event = json!({
        "headers": headers.single,
        "isBase64Encoded": false,
        "multiValueHeaders": headers.multi,
        "requestContext": context.request_context(),
    });
    with_query(&mut event, raw_query);
    event
}

pub fn message_event(context: &EventContext<'_>, body: &str) -> Value {
    json!({
        "body": body,
        "isBase64Encoded": false,
        "requestContext": context.request_context(),
    })
}

pub fn disconnect_event(context: &EventContext<'_>) -> Value {
    json!({
        "headers": {
            "Host": "localhost",
            "x-api-key": "",
            "x-restapi": "",
        },
        "isBase64Encoded": false,
        "multiValueHeaders": {
            "Host": ["localhost"],
            "x-api-key": [""],
            "x-restapi": [""],
        },
        "requestContext": context.request_context(),
    })
}

/// `REQUEST` authorizer event of the handshake
pub fn authorizer_event(connection_id: &str, headers: &HeaderMap, raw_query: Option<&str>, region: &str) -> Value {
    let context = EventContext {
        event_type: EventType::Connect,
        route_key: CONNECT,
        connection_id,
        connected_at: Utc::now(),
        authorization: None,
    }
    .request_context();
    let method_arn = format!(
        "arn:aws:execute-api:{region}:{}:{}/{}/{CONNECT}",
        "random-account-id",
        context["apiId"].as_str().unwrap_or_default(),
        context["stage"].as_str().unwrap_or_default(),
    );

    let values = HeaderValues::from_header_map(headers);
    let mut event = json!({
        "headers": values.single,
        "methodArn": method_arn,
        "multiValueHeaders": values.multi,
        "requestContext": context,
        "type": "REQUEST",
    });
    with_query(&mut event, raw_query);
    event
}
