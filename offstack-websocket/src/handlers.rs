//! WebSocket gateway: handshake, per-connection socket task and the
//! `@connections` management API on the same listener

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use offstack_core::authorizer;
use offstack_lambda::{InvocationError, LambdaService};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::{Connection, ConnectionRegistry, Outbound};
use crate::config::{ConnectAuthorizer, WebSocketOptions, WebSocketRouteDescriptor};
use crate::events::{self, ConnectAuthorization, EventContext, EventType};
use crate::routes::{select_route, RouteTable, WebSocketRoute, CONNECT, DISCONNECT};

const GOING_AWAY: u16 = 1001;
const POLICY_VIOLATION: u16 = 1008;
const INTERNAL_ERROR: u16 = 1011;

/// Shared state of the WebSocket gateway
pub struct WebSocketState {
    pub service: Arc<LambdaService>,
    pub routes: RouteTable,
    pub options: WebSocketOptions,
    pub connections: ConnectionRegistry,
    pub connect_authorizer: Option<ConnectAuthorizer>,
}

impl WebSocketState {
    /// Register every route whose function exists
    pub fn new(service: Arc<LambdaService>, options: WebSocketOptions, descriptors: &[WebSocketRouteDescriptor]) -> Self {
        let mut routes = RouteTable::new();
        let mut connect_authorizer = None;

        for descriptor in descriptors {
            if service.get_function(&descriptor.function).is_none() {
                warn!(route = %descriptor.route, function = %descriptor.function, "Skipping WebSocket route, function is not registered");
                continue;
            }
            routes.insert(
                descriptor.route.clone(),
                WebSocketRoute {
                    function: descriptor.function.clone(),
                    echo_body: descriptor.route_response_selection_expression.as_deref() == Some("$default"),
                },
            );
            info!(route = %descriptor.route, function = %descriptor.function, "Registered WebSocket route");

            if let Some(authorizer) = &descriptor.authorizer {
                if options.no_auth {
                    continue;
                }
                if descriptor.route != CONNECT {
                    warn!(route = %descriptor.route, "Authorizers are only supported on the $connect route");
                } else if authorizer.kind.as_deref().is_some_and(|kind| kind.eq_ignore_ascii_case("token")) {
                    warn!(authorizer = %authorizer.name, "WebSockets do not support the TOKEN authorizer type");
                } else if service.get_function(authorizer.function_key()).is_none() {
                    warn!(authorizer = %authorizer.name, "Authorization function does not exist");
                } else {
                    info!(authorizer = %authorizer.name, "Configured $connect authorizer");
                    connect_authorizer = Some(authorizer.clone());
                }
            }
        }

        Self {
            service,
            routes,
            options,
            connections: ConnectionRegistry::new(),
            connect_authorizer,
        }
    }
}

/// Router for WebSocket upgrades and `@connections`
pub fn router(state: WebSocketState) -> Router {
    Router::new()
        .route(
            "/@connections/:connection_id",
            get(get_connection).post(post_to_connection).delete(delete_connection),
        )
        .fallback(handle_upgrade)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// POST /@connections/{connectionId}
async fn post_to_connection(
    State(state): State<Arc<WebSocketState>>,
    Path(connection_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    if state.connections.post(&connection_id, body.to_vec()) {
        debug!(connection_id = %connection_id, "Sent data to connection");
        StatusCode::OK
    } else {
        StatusCode::GONE
    }
}

/// DELETE /@connections/{connectionId}
async fn delete_connection(State(state): State<Arc<WebSocketState>>, Path(connection_id): Path<String>) -> StatusCode {
    if state.connections.close(&connection_id) {
        debug!(connection_id = %connection_id, "Closed connection");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::GONE
    }
}

/// GET /@connections/{connectionId}
async fn get_connection(State(state): State<Arc<WebSocketState>>, Path(connection_id): Path<String>) -> Response {
    match state.connections.get(&connection_id) {
        Some(connection) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            connection.info().to_string(),
        )
            .into_response(),
        None => StatusCode::GONE.into_response(),
    }
}

/// Handshake: run the `$connect` authorizer, then upgrade
async fn handle_upgrade(
    State(state): State<Arc<WebSocketState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    upgrade: WebSocketUpgrade,
) -> Response {
    let connection_id = Uuid::new_v4().simple().to_string();
    let source_ip = connect_info.map_or_else(|| "127.0.0.1".to_string(), |ConnectInfo(addr)| addr.ip().to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let raw_query = uri.query().map(ToString::to_string);
    debug!(connection_id = %connection_id, "Verifying client");

    let authorization = match &state.connect_authorizer {
        Some(authorizer) => {
            match authorize(&state, authorizer, &connection_id, &headers, raw_query.as_deref()).await {
                Ok(principal) => Some(ConnectAuthorization {
                    principal,
                    source_ip: source_ip.clone(),
                    user_agent: user_agent.clone(),
                }),
                Err(status) => return status.into_response(),
            }
        }
        None => None,
    };

    let handshake = Handshake {
        connection_id,
        source_ip,
        user_agent,
        authorization,
        headers,
        raw_query,
    };
    upgrade.on_upgrade(move |socket| run_connection(state, socket, handshake))
}

/// What the socket task needs from the HTTP handshake
struct Handshake {
    connection_id: String,
    source_ip: String,
    user_agent: String,
    authorization: Option<ConnectAuthorization>,
    headers: HeaderMap,
    raw_query: Option<String>,
}

async fn authorize(
    state: &WebSocketState,
    descriptor: &ConnectAuthorizer,
    connection_id: &str,
    headers: &HeaderMap,
    raw_query: Option<&str>,
) -> Result<offstack_core::AuthorizedPrincipal, StatusCode> {
    info!(authorizer = %descriptor.name, "Running authorization function for $connect");
    let event = events::authorizer_event(connection_id, headers, raw_query, &state.options.region);
    let method_arn = event["methodArn"].as_str().unwrap_or_default().to_string();

    let result = match state.service.invoke(descriptor.function_key(), event, None).await {
        Ok(result) => result,
        Err(e) if e.to_string() == "Unauthorized" => return Err(StatusCode::UNAUTHORIZED),
        Err(e) => {
            debug!(authorizer = %descriptor.name, error = %e, "Error in $connect authorizer");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    authorizer::evaluate(&result, &method_arn).map_err(|e| {
        info!(authorizer = %descriptor.name, reason = %e, "Authorization denied");
        StatusCode::from_u16(e.to_gateway_error().status()).unwrap_or(StatusCode::FORBIDDEN)
    })
}

type Sink = SplitSink<WebSocket, Message>;

async fn close(sink: &mut Sink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

/// Flush frames queued while the socket task was busy
async fn flush(sink: &mut Sink, outbound: &mut mpsc::UnboundedReceiver<Outbound>) {
    while let Ok(frame) = outbound.try_recv() {
        let message = match frame {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Binary(bytes) => Message::Binary(bytes),
            Outbound::Close { .. } => return,
        };
        if sink.send(message).await.is_err() {
            return;
        }
    }
}

fn event_context<'a>(connection: &'a Connection, event_type: EventType, route_key: &'a str) -> EventContext<'a> {
    EventContext {
        event_type,
        route_key,
        connection_id: &connection.id,
        connected_at: connection.connected_at,
        authorization: connection.authorization(),
    }
}

async fn run_connection(state: Arc<WebSocketState>, socket: WebSocket, handshake: Handshake) {
    let (sender, mut outbound) = mpsc::unbounded_channel();
    let connection = state.connections.register(Connection::new(
        handshake.connection_id,
        handshake.source_ip,
        handshake.user_agent,
        handshake.authorization,
        sender,
    ));
    let (mut sink, mut stream) = socket.split();
    info!(connection_id = %connection.id, "WebSocket connected");

    let event = events::connect_event(
        &event_context(&connection, EventType::Connect, CONNECT),
        &handshake.headers,
        handshake.raw_query.as_deref(),
    );
    match dispatch(&state, &connection, CONNECT, event).await {
        Some(Err(_)) => {
            flush(&mut sink, &mut outbound).await;
            close(&mut sink, INTERNAL_ERROR, "Internal server error").await;
            state.connections.remove(&connection.id);
            return;
        }
        Some(Ok(result)) => {
            let status = result.get("statusCode").and_then(Value::as_u64);
            if status.is_some_and(|status| !(200..300).contains(&status)) {
                info!(connection_id = %connection.id, status = ?status, "$connect handler refused the connection");
                flush(&mut sink, &mut outbound).await;
                close(&mut sink, POLICY_VIOLATION, "Connection refused").await;
                state.connections.remove(&connection.id);
                return;
            }
        }
        None => {}
    }

    let hard_deadline = connection.opened + state.options.hard_timeout;
    loop {
        let idle_deadline = connection.last_active() + state.options.idle_timeout;
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => on_message(&state, &connection, text),
                Some(Ok(Message::Binary(bytes))) => on_message(&state, &connection, String::from_utf8_lossy(&bytes).into_owned()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %connection.id, error = %e, "Socket error");
                    break;
                }
            },
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Binary(bytes)) => {
                    if sink.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    close(&mut sink, code, &reason).await;
                    break;
                }
                None => break,
            },
            () = tokio::time::sleep_until(idle_deadline.min(hard_deadline)) => {
                let now = Instant::now();
                if now >= hard_deadline {
                    debug!(connection_id = %connection.id, "timeout:hard");
                    close(&mut sink, GOING_AWAY, "Going away").await;
                    break;
                }
                if now >= connection.last_active() + state.options.idle_timeout {
                    debug!(connection_id = %connection.id, "timeout:idle");
                    close(&mut sink, GOING_AWAY, "Going away").await;
                    break;
                }
            }
        }
    }

    state.connections.remove(&connection.id);
    info!(connection_id = %connection.id, "WebSocket disconnected");
    let event = events::disconnect_event(&event_context(&connection, EventType::Disconnect, DISCONNECT));
    dispatch(&state, &connection, DISCONNECT, event).await;
}

fn on_message(state: &Arc<WebSocketState>, connection: &Arc<Connection>, message: String) {
    connection.touch();
    let selected = select_route(&state.options.route_selection_expression, &message);
    let route_key = state
        .routes
        .declared_key(&selected)
        .map_or(selected.clone(), ToString::to_string);
    debug!(connection_id = %connection.id, selected = %selected, route = %route_key, "Message received");
    let event = events::message_event(&event_context(connection, EventType::Message, &route_key), &message);

    let state = state.clone();
    let connection = connection.clone();
    tokio::spawn(async move {
        dispatch(&state, &connection, &route_key, event).await;
    });
}

/// Invoke the route for `route_key`; `None` when no route applies
async fn dispatch(
    state: &WebSocketState,
    connection: &Connection,
    route_key: &str,
    event: Value,
) -> Option<Result<Value, InvocationError>> {
    let route = state.routes.resolve(route_key)?;
    let request_id = event["requestContext"]["requestId"].clone();
    let outcome = state.service.invoke(&route.function, event, None).await;

    match &outcome {
        Ok(result) if route.echo_body && route_key != DISCONNECT => match result.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(body)) if body.is_empty() => {}
            Some(Value::String(body)) => {
                connection.send(body.clone());
            }
            Some(body) => {
                connection.send(body.to_string());
            }
        },
        Ok(_) => {}
        Err(e) => {
            error!(route = %route_key, function = %route.function, error = %e, "Error in route handler");
            let frame = json!({
                "connectionId": connection.id,
                "message": "Internal server error",
                "requestId": request_id,
            });
            connection.send(frame.to_string());
        }
    }
    Some(outcome)
}
