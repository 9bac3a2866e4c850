//! Best-effort delivery to many connections at once.
//!
//! Every primitive here normalizes the payload once, then attempts each
//! recipient independently. A failed recipient is logged, closed, and
//! counted; it never stops delivery to the rest.

use std::sync::Arc;

use notify_common::id::{prefix, prefixed_ulid};

use super::connection::{Connection, ConnectionId, CLOSE_GOING_AWAY};
use super::events::{Payload, ServerMessage};
use super::registry::ConnectionRegistry;
use super::spool::{Spool, SpoolKind};

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub failed: usize,
}

/// Send one payload to each recipient.
pub fn deliver(recipients: &[Arc<Connection>], payload: Payload) -> Delivery {
    let wire = payload.into_wire();
    let mut delivery = Delivery::default();

    for conn in recipients {
        match conn.send_wire(wire.clone()) {
            Ok(()) => delivery.sent += 1,
            Err(err) => {
                tracing::error!(conn_id = conn.id, %err, "failed to deliver message");
                conn.close(CLOSE_GOING_AWAY, "send failed");
                delivery.failed += 1;
            }
        }
    }
    delivery
}

/// Deliver to every registered connection, optionally skipping one.
pub fn broadcast_to_all(
    registry: &ConnectionRegistry,
    payload: impl Into<Payload>,
    exclude: Option<ConnectionId>,
) -> Delivery {
    let recipients: Vec<Arc<Connection>> = registry
        .snapshot()
        .into_iter()
        .filter(|conn| Some(conn.id) != exclude)
        .collect();

    let delivery = deliver(&recipients, payload.into());
    tracing::info!(
        sent = delivery.sent,
        failed = delivery.failed,
        total = registry.count(),
        "broadcast complete"
    );
    delivery
}

/// Broadcast a `server_ping` with a fresh id. Connections that can't take
/// it are closed by [`deliver`].
pub fn send_keepalive(registry: &ConnectionRegistry) -> Delivery {
    let ping = ServerMessage::ServerPing {
        id: prefixed_ulid(prefix::SERVER_PING),
    };
    let delivery = deliver(&registry.snapshot(), ping.into());
    tracing::debug!(sent = delivery.sent, failed = delivery.failed, "keepalive sent");
    delivery
}

/// Broadcast every ready notification file in the spool and delete it.
/// Returns the number of files delivered.
pub async fn drain_fallback_queue(registry: &ConnectionRegistry, spool: &Spool) -> usize {
    let files = match spool.ready(SpoolKind::Notification).await {
        Ok(files) => files,
        Err(err) => {
            tracing::warn!(%err, dir = %spool.dir().display(), "could not read notification spool");
            return 0;
        }
    };

    let mut processed = 0;
    for file in files {
        let delivery = broadcast_to_all(registry, file.payload.clone(), None);
        tracing::info!(file = %file.name(), recipients = delivery.sent, "spooled notification broadcast");
        spool.remove(&file).await;
        processed += 1;
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::Outbound;
    use serde_json::{json, Value};

    fn text(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Option<Value> {
        match rx.try_recv().ok()? {
            Outbound::Text(t) => serde_json::from_str(&t).ok(),
            Outbound::Close { .. } => None,
        }
    }

    #[test]
    fn broadcast_tallies_and_survives_failures() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = Connection::new(1, None, "ua");
        let (b, rb) = Connection::new(2, None, "ua");
        registry.add(a);
        registry.add(b.clone());
        drop(rb);

        let delivery = broadcast_to_all(&registry, json!({"type": "notification"}), None);
        assert_eq!(delivery, Delivery { sent: 1, failed: 1 });
        assert!(text(&mut ra).unwrap()["timestamp"].is_string());
        assert!(b.is_closed());
    }

    #[test]
    fn broadcast_can_exclude_sender() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = Connection::new(1, None, "ua");
        let (b, mut rb) = Connection::new(2, None, "ua");
        registry.add(a);
        registry.add(b);

        let delivery = broadcast_to_all(&registry, json!({"type": "chat"}), Some(1));
        assert_eq!(delivery.sent, 1);
        assert!(text(&mut ra).is_none());
        assert_eq!(text(&mut rb).unwrap()["type"], "chat");
    }

    #[test]
    fn keepalive_sends_unique_server_ping() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = Connection::new(1, None, "ua");
        registry.add(a);

        send_keepalive(&registry);
        send_keepalive(&registry);
        let first = text(&mut ra).unwrap();
        let second = text(&mut ra).unwrap();
        assert_eq!(first["type"], "server_ping");
        assert!(first["id"].as_str().unwrap().starts_with("sping_"));
        assert_ne!(first["id"], second["id"]);
    }

    #[tokio::test]
    async fn drain_broadcasts_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path());
        spool
            .write(SpoolKind::Notification, &json!({"type": "notification", "body": "hi"}))
            .await
            .unwrap();

        let registry = ConnectionRegistry::new();
        let (a, mut ra) = Connection::new(1, None, "ua");
        registry.add(a);

        assert_eq!(drain_fallback_queue(&registry, &spool).await, 1);
        assert_eq!(text(&mut ra).unwrap()["body"], "hi");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(drain_fallback_queue(&registry, &spool).await, 0);
    }
}
