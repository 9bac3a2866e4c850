//! Per-connection state and the outbound queue feeding its socket writer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::error::HubError;

use super::events::Payload;

/// Process-unique connection identifier (snowflake).
pub type ConnectionId = u64;

/// Close code sent when the hub drops a connection it can no longer serve.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// A frame queued for the socket writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Best-effort, non-sensitive identity summary bound to a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub session_found: bool,
    /// Masked session id (first 8 chars).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Truncated national id; never the full number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub national_id: Option<String>,
}

impl UserContext {
    /// The part of the context attached to messages relayed to other
    /// connections. Name, email and national id stay on the connection.
    pub fn relayed(&self) -> Value {
        let mut summary = serde_json::Map::new();
        summary.insert("sessionFound".to_string(), Value::Bool(self.session_found));
        if let Some(user_id) = &self.user_id {
            summary.insert("userId".to_string(), user_id.clone());
        }
        Value::Object(summary)
    }
}

/// Mutable session binding of a connection.
#[derive(Debug, Clone, Default)]
pub struct SessionBinding {
    pub session_id: Option<String>,
    /// True when the id came from the primary session cookie (or an
    /// explicit `update_session`), false for the generic fallback cookie.
    pub is_booking_session: bool,
    pub user_context: Option<UserContext>,
    /// Session room the connection was auto-joined to.
    pub primary_room_id: Option<String>,
    /// Set when no session could be resolved at connect time.
    pub requires_session_id: bool,
    pub cookie_count: usize,
}

/// One live socket.
///
/// Sends never block: frames go onto an unbounded queue drained by the
/// connection's writer task. A send fails once the writer is gone or the
/// connection has been closed.
pub struct Connection {
    pub id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub user_agent: String,
    tx: mpsc::UnboundedSender<Outbound>,
    binding: Mutex<SessionBinding>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        user_agent: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id,
            remote_addr,
            connected_at: Utc::now(),
            user_agent: user_agent.into(),
            tx,
            binding: Mutex::new(SessionBinding::default()),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        });
        (conn, rx)
    }

    /// Normalize and queue a payload for this connection.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), HubError> {
        self.send_wire(payload.into().into_wire())
    }

    /// Queue an already-normalized frame.
    pub fn send_wire(&self, wire: String) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed { conn_id: self.id });
        }
        self.tx
            .send(Outbound::Text(wire))
            .map_err(|_| HubError::ConnectionClosed { conn_id: self.id })
    }

    /// Ask the writer to send a close frame and wake the reader loop.
    /// Idempotent.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.close_signal.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }

    /// Snapshot of the session binding.
    pub fn binding(&self) -> SessionBinding {
        self.binding.lock().clone()
    }

    /// Mutate the session binding under its lock.
    pub fn update_binding<R>(&self, f: impl FnOnce(&mut SessionBinding) -> R) -> R {
        f(&mut self.binding.lock())
    }

    pub fn session_id(&self) -> Option<String> {
        self.binding.lock().session_id.clone()
    }

    pub fn primary_room_id(&self) -> Option<String> {
        self.binding.lock().primary_room_id.clone()
    }

    pub fn user_context(&self) -> Option<UserContext> {
        self.binding.lock().user_context.clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
