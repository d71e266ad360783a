//! Open connections, addressable by connection id

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::events::ConnectAuthorization;

/// Frames queued for a connection's socket task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub opened: Instant,
    pub source_ip: String,
    pub user_agent: String,
    authorization: Option<ConnectAuthorization>,
    sender: mpsc::UnboundedSender<Outbound>,
    last_active: Mutex<Activity>,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        source_ip: impl Into<String>,
        user_agent: impl Into<String>,
        authorization: Option<ConnectAuthorization>,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let activity = Activity::now();
        Self {
            id: id.into(),
            connected_at: activity.wall,
            opened: activity.at,
            source_ip: source_ip.into(),
            user_agent: user_agent.into(),
            authorization,
            sender,
            last_active: Mutex::new(activity),
        }
    }

    pub fn authorization(&self) -> Option<&ConnectAuthorization> {
        self.authorization.as_ref()
    }

    /// Reset the idle timer
    pub fn touch(&self) {
        *self.last_active.lock() = Activity::now();
    }

    pub fn last_active(&self) -> Instant {
        self.last_active.lock().at
    }

    /// Queue a text frame; false once the socket task is gone
    pub fn send(&self, payload: impl Into<String>) -> bool {
        self.touch();
        self.sender.send(Outbound::Text(payload.into())).is_ok()
    }

    /// Queue a binary frame
    pub fn send_binary(&self, payload: Vec<u8>) -> bool {
        self.touch();
        self.sender.send(Outbound::Binary(payload)).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.sender
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// `GET @connections/{id}` body
    pub fn info(&self) -> Value {
        json!({
            "connectedAt": self.connected_at.to_rfc3339(),
            "identity": {
                "sourceIp": self.source_ip,
                "userAgent": self.user_agent,
            },
            "lastActiveAt": self.last_active.lock().wall.to_rfc3339(),
        })
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Connection) -> Arc<Connection> {
        let connection = Arc::new(connection);
        debug!(connection_id = %connection.id, "Connection registered");
        self.connections.insert(connection.id.clone(), connection.clone());
        connection
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.remove(connection_id).map(|(_, connection)| connection)
    }

    /// Deliver `payload` to an open connection
    pub fn send(&self, connection_id: &str, payload: impl Into<String>) -> bool {
        self.get(connection_id).is_some_and(|connection| connection.send(payload))
    }

    /// Deliver a posted body verbatim: a text frame when it is UTF-8,
    /// a binary frame otherwise
    pub fn post(&self, connection_id: &str, payload: Vec<u8>) -> bool {
        self.get(connection_id).is_some_and(|connection| match String::from_utf8(payload) {
            Ok(text) => connection.send(text),
            Err(e) => connection.send_binary(e.into_bytes()),
        })
    }

    /// Ask an open connection to close
    pub fn close(&self, connection_id: &str) -> bool {
        self.get(connection_id)
            .is_some_and(|connection| connection.close(1000, "Closed by the server"))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
