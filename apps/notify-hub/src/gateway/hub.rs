//! The hub: connection lifecycle, inbound dispatch, and the push API used
//! by other parts of the system.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use notify_common::SnowflakeGenerator;

use crate::applications::{ApplicationSource, HttpApplicationSource, UnavailableApplications};
use crate::config::Config;
use crate::error::HubError;
use crate::session_store::{FileSessionStore, SessionStore};

use super::binder::{mask_session_id, session_type, SessionBinder};
use super::bridge::PubSubBridge;
use super::connection::{Connection, ConnectionId};
use super::events::{Environment, Inbound, Payload, RoomKind, ServerMessage};
use super::fanout::{self, Delivery};
use super::handler;
use super::registry::ConnectionRegistry;
use super::rooms::{entity_room_id, RoomMultiplexer, SweepStats};
use super::spool::{Spool, SpoolKind};

pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Close code used when a transport error ends a connection.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Owns every piece of process-wide hub state. Constructed once and shared
/// behind an `Arc`; tests can build as many independent hubs as they like.
pub struct Hub {
    registry: ConnectionRegistry,
    rooms: RoomMultiplexer,
    bridge: PubSubBridge,
    binder: SessionBinder,
    applications: Arc<dyn ApplicationSource>,
    spool: Spool,
    ids: SnowflakeGenerator,
}

impl Hub {
    pub fn new(
        config: &Config,
        sessions: Option<Arc<dyn SessionStore>>,
        applications: Arc<dyn ApplicationSource>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            rooms: RoomMultiplexer::new(config.session_room_hash_len),
            bridge: PubSubBridge::new(config.bus.clone()),
            binder: SessionBinder::new(
                config.primary_session_cookie.clone(),
                config.fallback_session_cookie.clone(),
                sessions,
            ),
            applications,
            spool: Spool::new(config.spool_dir.clone()),
            ids: SnowflakeGenerator::default(),
        }
    }

    /// Build a hub with the collaborators named in the configuration.
    pub fn from_config(config: &Config) -> Result<Self, HubError> {
        let sessions: Option<Arc<dyn SessionStore>> = config
            .session_store_dir
            .as_ref()
            .map(|dir| Arc::new(FileSessionStore::new(dir.clone())) as Arc<dyn SessionStore>);

        let applications: Arc<dyn ApplicationSource> = match &config.applications_url {
            Some(url) => Arc::new(HttpApplicationSource::new(url.clone())?),
            None => Arc::new(UnavailableApplications),
        };

        Ok(Self::new(config, sessions, applications))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomMultiplexer {
        &self.rooms
    }

    pub fn bridge(&self) -> &PubSubBridge {
        &self.bridge
    }

    pub fn binder(&self) -> &SessionBinder {
        &self.binder
    }

    pub fn applications(&self) -> &dyn ApplicationSource {
        self.applications.as_ref()
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.ids.generate()
    }

    pub fn environment(&self) -> Environment {
        Environment {
            version: HUB_VERSION,
            clients: self.registry.count(),
            rooms: self.rooms.room_count(),
            bus_enabled: self.bridge.is_enabled(),
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a new connection, bind its session, and greet it.
    pub async fn on_open(&self, conn: &Arc<Connection>, cookie_header: Option<&str>) {
        let binding = self.binder.extract(conn, cookie_header).await;

        tracing::info!(
            conn_id = conn.id,
            remote_addr = ?conn.remote_addr,
            session_type = session_type(&binding).unwrap_or("none"),
            "new connection"
        );

        self.registry.add(conn.clone());

        let room_id = match &binding.session_id {
            None => {
                let _ = conn.send(ServerMessage::session_id_required());
                None
            }
            Some(session_id) => {
                let room_id = self.rooms.session_room_id(session_id);
                self.rooms.join(&room_id, conn);
                conn.update_binding(|b| b.primary_room_id = Some(room_id.clone()));
                let size = self.rooms.room_size(&room_id);
                let _ = conn.send(ServerMessage::room_joined(&room_id, RoomKind::Session, size));
                Some(room_id)
            }
        };

        let _ = conn.send(ServerMessage::ConnectionSuccess {
            message: "Connected to notification hub".to_string(),
            room_id,
            rooms: self.rooms.summaries_for(conn.id),
            environment: self.environment(),
        });
    }

    /// Decode, enrich, log, and dispatch one text frame.
    pub async fn on_message(&self, conn: &Arc<Connection>, raw: &str) {
        let inbound = Inbound::parse(raw);
        let binding = conn.binding();

        tracing::info!(
            conn_id = conn.id,
            msg_type = inbound.message_type(),
            session_type = session_type(&binding).unwrap_or("none"),
            session = ?binding.session_id.as_deref().map(mask_session_id),
            "message received"
        );

        self.dispatch_inbound(conn, inbound).await;
    }

    pub(crate) async fn dispatch_inbound(&self, conn: &Arc<Connection>, inbound: Inbound) {
        match inbound {
            Inbound::Opaque(text) => {
                self.broadcast_from(conn, Payload::Text(text));
            }
            Inbound::Untyped { body } => {
                let body = self.binder.enrich(conn, false, body);
                self.broadcast_from(conn, Value::Object(body));
            }
            Inbound::Malformed { body } => {
                tracing::warn!(
                    conn_id = conn.id,
                    msg_type = body.get("type").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                    "message fields do not fit its type, dropped"
                );
            }
            Inbound::Typed { event, body } => {
                let body = self.binder.enrich(conn, event.is_keepalive(), body);
                handler::dispatch(self, conn, event, body).await;
            }
        }
    }

    /// Generic fallback: everyone but the sender.
    pub(crate) fn broadcast_from(&self, sender: &Connection, payload: impl Into<Payload>) -> Delivery {
        fanout::broadcast_to_all(&self.registry, payload, Some(sender.id))
    }

    /// Drop the connection from every room and the registry.
    pub fn on_close(&self, conn: &Connection) {
        let rooms_left = self.rooms.leave_all(conn.id);
        self.registry.remove(conn.id);

        let connected_for = Utc::now() - conn.connected_at;
        tracing::info!(
            conn_id = conn.id,
            rooms_left,
            connected_secs = connected_for.num_seconds(),
            remaining_clients = self.registry.count(),
            "connection closed"
        );
        tracing::debug!(
            conn_id = conn.id,
            remote_addr = ?conn.remote_addr,
            user_agent = %conn.user_agent,
            session = ?conn.session_id().as_deref().map(mask_session_id),
            "closed connection details"
        );
    }

    /// Transport failure: close the socket and forget the connection.
    pub fn on_error(&self, conn: &Connection, err: &dyn std::error::Error) {
        tracing::error!(
            conn_id = conn.id,
            remote_addr = ?conn.remote_addr,
            %err,
            "connection error"
        );
        conn.close(CLOSE_INTERNAL_ERROR, "connection error");
        self.registry.remove(conn.id);
    }

    // -----------------------------------------------------------------------
    // Push API
    // -----------------------------------------------------------------------

    /// Deliver to every tab of a session. Returns `false` if nobody from that
    /// session is connected; rooms are never created here.
    pub fn send_to_session_room(&self, session_id: &str, message: impl Into<Payload>) -> bool {
        let room_id = self.rooms.session_room_id(session_id);
        if !self.rooms.room_exists(&room_id) {
            tracing::debug!(session = %mask_session_id(session_id), "no session room to deliver to");
            return false;
        }
        let sent = self.rooms.send_to_all(&room_id, message);
        tracing::info!(room_id = %room_id, sent, "message sent to session room");
        true
    }

    /// Deliver to every watcher of an entity. Returns `false` if the room
    /// doesn't exist.
    pub fn send_to_entity_room(
        &self,
        entity_type: &str,
        entity_id: &str,
        message: impl Into<Payload>,
    ) -> bool {
        let room_id = entity_room_id(entity_type, entity_id);
        if !self.rooms.room_exists(&room_id) {
            tracing::debug!(room_id = %room_id, "no entity room to deliver to");
            return false;
        }
        let sent = self.rooms.send_to_all(&room_id, message);
        tracing::info!(room_id = %room_id, sent, "message sent to entity room");
        true
    }

    pub fn broadcast_notification(&self, message: impl Into<Payload>) {
        fanout::broadcast_to_all(&self.registry, message, None);
    }

    pub fn client_count(&self) -> usize {
        self.registry.count()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.room_count()
    }

    pub fn is_external_bus_enabled(&self) -> bool {
        self.bridge.is_enabled()
    }

    // -----------------------------------------------------------------------
    // Timer work
    // -----------------------------------------------------------------------

    pub fn send_keepalive(&self) -> Delivery {
        fanout::send_keepalive(&self.registry)
    }

    /// Ping every entity room. Returns the number of pings sent.
    pub fn ping_entity_rooms(&self) -> usize {
        let rooms = self.rooms.entity_room_ids();
        let pinged: usize = rooms.iter().map(|id| self.rooms.ping_room(id)).sum();
        if !rooms.is_empty() {
            tracing::debug!(rooms = rooms.len(), pinged, "entity rooms pinged");
        }
        pinged
    }

    pub fn sweep_inactive(&self, threshold: Duration) -> SweepStats {
        let stats = self.rooms.sweep_inactive(threshold);
        if stats.removed > 0 {
            tracing::info!(
                removed = stats.removed,
                rooms = stats.rooms_affected.len(),
                "inactive entity room members removed"
            );
        }
        stats
    }

    pub async fn drain_notification_spool(&self) -> usize {
        fanout::drain_fallback_queue(&self.registry, &self.spool).await
    }

    /// Deliver each spooled session message to its session room and delete
    /// the file. A `data` member is delivered unwrapped, the same as on the
    /// bus. Files without a `sessionId` are discarded.
    pub async fn drain_session_spool(&self) -> usize {
        let files = match self.spool.ready(SpoolKind::Session).await {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(%err, dir = %self.spool.dir().display(), "could not read session spool");
                return 0;
            }
        };

        let mut processed = 0;
        for file in files {
            match file.payload.get("sessionId").and_then(Value::as_str) {
                Some(session_id) => {
                    tracing::info!(
                        file = %file.name(),
                        session = %mask_session_id(session_id),
                        "processing spooled session message"
                    );
                    let body = file.payload.get("data").cloned().unwrap_or_else(|| file.payload.clone());
                    self.send_to_session_room(session_id, body);
                }
                None => tracing::warn!(file = %file.name(), "spooled session message has no sessionId"),
            }
            self.spool.remove(&file).await;
            processed += 1;
        }
        processed
    }

    /// Deliver each spooled room message to the room named by its `roomId`
    /// and delete the file. Rooms are never created here; messages for a
    /// room that no longer exists are dropped.
    pub async fn drain_room_spool(&self) -> usize {
        let files = match self.spool.ready(SpoolKind::Room).await {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(%err, dir = %self.spool.dir().display(), "could not read room spool");
                return 0;
            }
        };

        let mut processed = 0;
        for file in files {
            match file.payload.get("roomId").and_then(Value::as_str) {
                Some(room_id) if self.rooms.room_exists(room_id) => {
                    let sent = self.rooms.send_to_all(room_id, file.payload.clone());
                    tracing::info!(file = %file.name(), room_id, recipients = sent, "spooled room message delivered");
                }
                Some(room_id) => {
                    tracing::warn!(file = %file.name(), room_id, "room not found for spooled message");
                }
                None => tracing::warn!(file = %file.name(), "spooled room message has no roomId"),
            }
            self.spool.remove(&file).await;
            processed += 1;
        }
        processed
    }
}
