//! Invocation events built from gateway requests

pub mod integration;
pub mod proxy_v1;
pub mod proxy_v2;

use offstack_core::jwt::{bearer_claims, BearerClaims};
use offstack_core::RequestId;
use serde_json::{json, Value};

use crate::auth::AuthCredentials;
use crate::endpoint::GatewayOptions;
use crate::request::GatewayRequest;
use crate::routes::RouteMatch;

/// Everything an event builder reads
#[derive(Debug, Clone, Copy)]
pub struct EventInput<'a> {
    pub request: &'a GatewayRequest,
    pub route: &'a RouteMatch,
    pub credentials: Option<&'a AuthCredentials>,
    pub options: &'a GatewayOptions,
    pub request_id: &'a RequestId,
}

impl EventInput<'_> {
    pub fn http_method(&self) -> String {
        self.request.method.as_str().to_uppercase()
    }

    /// Request path without the stage prefix
    pub fn path(&self) -> String {
        self.request.path_without_stage(self.route.stage_prefix.as_deref())
    }

    /// `pathParameters`: null when the route has none
    pub fn path_parameters(&self) -> Value {
        if self.route.path_params.is_empty() {
            Value::Null
        } else {
            json!(self.route.path_params)
        }
    }

    pub fn stage_variables(&self) -> Value {
        json!(self.options.stage_variables)
    }

    pub fn bearer(&self) -> Option<BearerClaims> {
        bearer_claims(&self.request.headers)
    }

    /// `identity` block shared by proxy v1 events and mapping templates
    pub fn identity(&self) -> Value {
        let request = self.request;
        json!({
            "accessKey": null,
            "accountId": "offlineContext_accountId",
            "apiKey": "offlineContext_apiKey",
            "apiKeyId": "offlineContext_apiKeyId",
            "caller": "offlineContext_caller",
            "cognitoAuthenticationProvider": request
                .header("cognito-authentication-provider")
                .unwrap_or("offlineContext_cognitoAuthenticationProvider"),
            "cognitoAuthenticationType": "offlineContext_cognitoAuthenticationType",
            "cognitoIdentityId": request
                .header("cognito-identity-id")
                .unwrap_or("offlineContext_cognitoIdentityId"),
            "cognitoIdentityPoolId": "offlineContext_cognitoIdentityPoolId",
            "principalOrgId": null,
            "sourceIp": request.source_ip,
            "user": "offlineContext_user",
            "userAgent": request.user_agent(),
            "userArn": "offlineContext_userArn",
        })
    }
}
