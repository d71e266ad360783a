//! HTTP gateway request pipeline
//!
//! Every request goes through one fallback handler: route match, API key,
//! authorizer, schema validation, event construction, invocation, response
//! mapping and finally the CORS stage.

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use chrono::Utc;
use offstack_core::RequestId;
use offstack_lambda::LambdaService;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{self, api_key, ApiKeys, AuthCredentials, AuthorizerError};
use crate::cors;
use crate::endpoint::{
    ConfigurationError, Endpoint, EndpointDescriptor, GatewayOptions, IntegrationType, PayloadVersion,
    RequestTemplate,
};
use crate::events::{integration, proxy_v1, proxy_v2, EventInput};
use crate::request::GatewayRequest;
use crate::response;
use crate::routes::{RouteMatch, RouteTable};
use crate::template::{SubstitutionRenderer, TemplateRenderer};

/// Largest request body the gateway buffers
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state for the gateway handler
pub struct GatewayState {
    pub service: Arc<LambdaService>,
    pub routes: RouteTable,
    pub options: GatewayOptions,
    pub api_keys: ApiKeys,
    pub renderer: Arc<dyn TemplateRenderer>,
}

impl GatewayState {
    /// Resolve and register every endpoint. Endpoints that cannot be set up
    /// are logged and skipped.
    pub fn new(service: Arc<LambdaService>, options: GatewayOptions, endpoints: &[EndpointDescriptor]) -> Self {
        let mut routes = RouteTable::new();
        let mut has_private = false;

        for descriptor in endpoints {
            match Self::resolve(&service, &options, descriptor) {
                Ok(endpoint) => {
                    info!(route = %endpoint.describe(), function = %endpoint.function, "Registered HTTP route");
                    has_private |= endpoint.private;
                    routes.add(Arc::new(endpoint), !options.no_prepend_stage_in_url);
                }
                Err(e) => warn!(function = %descriptor.function, error = %e, "Skipping HTTP endpoint"),
            }
        }

        let api_keys = ApiKeys::from_options(&options, has_private);
        Self {
            service,
            routes,
            options,
            api_keys,
            renderer: Arc::new(SubstitutionRenderer),
        }
    }

    /// Replace the built-in template renderer
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    fn resolve(
        service: &LambdaService,
        options: &GatewayOptions,
        descriptor: &EndpointDescriptor,
    ) -> Result<Endpoint, ConfigurationError> {
        if service.get_function(&descriptor.function).is_none() {
            return Err(ConfigurationError::UnknownFunction(descriptor.function.clone()));
        }
        let endpoint = Endpoint::resolve(descriptor, options)?;
        if let Some(authorizer) = &endpoint.authorizer {
            auth::validate(authorizer, service)?;
        }
        Ok(endpoint)
    }
}

/// Router answering every path through the gateway pipeline
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn route_not_found(state: &GatewayState, method: &Method, path: &str) -> Response {
    let body = json!({
        "currentRoute": format!("{method} - {path}"),
        "error": "offstack: route not found.",
        "existingRoutes": state.routes.describe(),
        "statusCode": 404,
    });
    json_response(StatusCode::NOT_FOUND, body.to_string())
}

fn authorizer_failure(error: &AuthorizerError, request_id: &RequestId) -> Response {
    let error = error.to_gateway_error().with_request_id(request_id.id.clone());
    let status = StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, error.to_json())
}

/// Handle any request that reaches the gateway listener
pub async fn handle_request(
    State(state): State<Arc<GatewayState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Rejecting request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let request = GatewayRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        raw_query: parts.uri.query().map(ToString::to_string),
        headers: parts.headers,
        body,
        source_ip: connect_info.map_or_else(|| "127.0.0.1".to_string(), |ConnectInfo(addr)| addr.ip().to_string()),
        received_at: Utc::now(),
    };

    if cors::is_preflight(&state.options, &request.method, &request.headers)
        && !state.routes.has_explicit(Method::OPTIONS.as_str(), &request.path)
    {
        return preflight(&state, &request);
    }

    let Some(route) = state.routes.find(request.method.as_str(), &request.path) else {
        info!(method = %request.method, path = %request.path, "No route");
        let response = route_not_found(&state, &request.method, &request.path);
        return cors::decorate(&state.options, None, &request.method, &request.headers, response);
    };

    let response = dispatch(&state, &request, &route).await;
    cors::decorate(
        &state.options,
        route.endpoint.cors.as_ref(),
        &request.method,
        &request.headers,
        response,
    )
}

/// OPTIONS answered by the gateway, with the CORS declaration of the route
/// the browser is asking about
fn preflight(state: &GatewayState, request: &GatewayRequest) -> Response {
    let requested = request
        .header(header::ACCESS_CONTROL_REQUEST_METHOD.as_str())
        .unwrap_or(Method::GET.as_str())
        .to_uppercase();
    let route = state.routes.find(&requested, &request.path);
    debug!(path = %request.path, method = %requested, "CORS preflight");

    let cors = route.as_ref().and_then(|route| route.endpoint.cors.as_ref());
    cors::decorate(
        &state.options,
        cors,
        &request.method,
        &request.headers,
        Response::new(Body::empty()),
    )
}

async fn dispatch(state: &GatewayState, request: &GatewayRequest, route: &RouteMatch) -> Response {
    let endpoint = &route.endpoint;
    let request_id = RequestId::new();
    info!(
        method = %request.method,
        path = %request.path,
        function = %endpoint.function,
        request_id = %request_id.id,
        "Invoking function"
    );

    let credentials = match check_access(state, request, route, &request_id).await {
        Ok(credentials) => credentials,
        Err(response) => return response,
    };

    let input = EventInput {
        request,
        route,
        credentials: credentials.as_ref(),
        options: &state.options,
        request_id: &request_id,
    };
    let hide = state.options.hide_stack_traces;

    let payload = request.payload();
    if !endpoint.schemas.is_empty() {
        if let Err(message) = endpoint.schemas.validate(&request.content_type(), &payload) {
            debug!(error = %message, "Request failed schema validation");
            return response::error_reply(StatusCode::BAD_REQUEST, &message, "ValidationError", &[], hide);
        }
    }

    match endpoint.integration {
        IntegrationType::Template => {
            let context = integration::template_context(&input, payload);
            let event = match template_event(state, &input, &context) {
                Ok(event) => event,
                Err(response) => return response,
            };

            let outcome = if endpoint.is_async {
                match state.service.invoke_async(&endpoint.function, event) {
                    Ok(()) => Ok(json!({})),
                    Err(e) => Err(e),
                }
            } else {
                state.service.invoke(&endpoint.function, event, None).await
            };
            if let Err(e) = &outcome {
                if e.is_transport() {
                    return response::transport_error(endpoint, e, hide);
                }
            }
            response::integration_response(endpoint, outcome, state.renderer.as_ref(), context, hide)
        }
        IntegrationType::Proxy => {
            let event = match endpoint.payload {
                PayloadVersion::V1 => proxy_v1::build(&input),
                PayloadVersion::V2 => proxy_v2::build(&input),
            };
            let outcome = state.service.invoke(&endpoint.function, event, None).await;
            if let Err(e) = &outcome {
                if e.is_transport() {
                    return response::transport_error(endpoint, e, hide);
                }
            }
            response::proxy_response(endpoint, outcome, hide)
        }
    }
}

/// API key and authorizer checks. `no_auth` skips both.
async fn check_access(
    state: &GatewayState,
    request: &GatewayRequest,
    route: &RouteMatch,
    request_id: &RequestId,
) -> Result<Option<AuthCredentials>, Response> {
    if state.options.no_auth {
        return Ok(None);
    }
    let endpoint = &route.endpoint;

    let explicit_key = request.header(api_key::API_KEY_HEADER);
    if endpoint.private {
        if let Some(key) = explicit_key {
            if !state.api_keys.contains(key) {
                debug!("Unknown x-api-key");
                return Err(api_key::forbidden_response());
            }
        }
    }

    let credentials = auth::authorize(&state.service, &state.options, request, route)
        .await
        .map_err(|e| {
            info!(function = %endpoint.function, error = %e, "Authorization failed");
            authorizer_failure(&e, request_id)
        })?;

    if endpoint.private && explicit_key.is_none() {
        let usage_key = credentials.as_ref().and_then(AuthCredentials::usage_identifier_key);
        if !usage_key.is_some_and(|key| state.api_keys.contains(key)) {
            debug!("No usable API key on a private route");
            return Err(api_key::forbidden_response());
        }
    }
    Ok(credentials)
}

/// Event of a template-mapped endpoint: the request template for the
/// content type, else the parsed body when it is an object
fn template_event(
    state: &GatewayState,
    input: &EventInput<'_>,
    context: &crate::template::TemplateContext,
) -> Result<Value, Response> {
    let endpoint = &input.route.endpoint;
    match endpoint.request_templates.get(&input.request.content_type()) {
        Some(RequestTemplate::Default) => Ok(integration::default_event(input, context)),
        Some(RequestTemplate::Custom(template)) => state.renderer.render(template, context).map_err(|e| {
            error!(function = %endpoint.function, error = %e, "Error while rendering request template");
            response::error_reply(
                StatusCode::BAD_GATEWAY,
                &e.to_string(),
                "TemplateError",
                &[],
                state.options.hide_stack_traces,
            )
        }),
        None => match &context.payload {
            Value::Object(_) => Ok(context.payload.clone()),
            _ => Ok(json!({})),
        },
    }
}
