//! Room membership, per-member activity tracking, and room-scoped delivery.
//!
//! Rooms come in two flavours, told apart by their id prefix:
//! `session_<hash>` groups every tab of one browser session and
//! `entity_<type>_<id>` groups connections watching one domain entity.
//! Only entity rooms take part in the inactivity sweep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use notify_common::id::{prefix, prefixed_ulid};

use super::connection::{Connection, ConnectionId};
use super::events::{Payload, RoomKind, RoomSummary, ServerMessage};
use super::fanout::deliver;

pub const SESSION_ROOM_PREFIX: &str = "session_";
pub const ENTITY_ROOM_PREFIX: &str = "entity_";

/// Room flavour from its id, `None` for ids outside both namespaces.
pub fn room_kind(room_id: &str) -> Option<RoomKind> {
    if room_id.starts_with(SESSION_ROOM_PREFIX) {
        Some(RoomKind::Session)
    } else if room_id.starts_with(ENTITY_ROOM_PREFIX) {
        Some(RoomKind::Entity)
    } else {
        None
    }
}

/// `session_` + the first `hash_len` hex chars of SHA-256(session id).
/// One-way, so raw session ids never show up in room ids.
pub fn session_room_id(session_id: &str, hash_len: usize) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    let len = hash_len.min(hex.len());
    format!("{SESSION_ROOM_PREFIX}{}", &hex[..len])
}

pub fn entity_room_id(entity_type: &str, entity_id: &str) -> String {
    format!("{ENTITY_ROOM_PREFIX}{entity_type}_{entity_id}")
}

struct Member {
    conn: Arc<Connection>,
    last_activity: Instant,
}

#[derive(Default)]
struct Room {
    members: HashMap<ConnectionId, Member>,
}

/// Rooms plus the reverse index, kept under one lock so that
/// `conn ∈ members(room) ⇔ room ∈ rooms_of(conn)` holds between calls.
#[derive(Default)]
struct RoomTable {
    rooms: HashMap<String, Room>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl RoomTable {
    fn remove_member(&mut self, room_id: &str, conn_id: ConnectionId) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        room.members.remove(&conn_id);
        let remaining = room.members.len();

        if let Some(rooms) = self.memberships.get_mut(&conn_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                self.memberships.remove(&conn_id);
            }
        }

        tracing::debug!(conn_id, room_id, room_size = remaining, "client left room");

        if remaining == 0 {
            self.rooms.remove(room_id);
            tracing::debug!(room_id, "room deleted");
        }
        true
    }

    /// Members of a room (optionally minus one), cloned out of the lock.
    fn recipients(&self, room_id: &str, exclude: Option<ConnectionId>) -> Option<Vec<Arc<Connection>>> {
        let room = self.rooms.get(room_id)?;
        Some(
            room.members
                .values()
                .filter(|m| Some(m.conn.id) != exclude)
                .map(|m| m.conn.clone())
                .collect(),
        )
    }
}

/// Result of an inactivity sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub removed: usize,
    pub rooms_affected: Vec<String>,
}

/// Owner of all room state.
pub struct RoomMultiplexer {
    table: Mutex<RoomTable>,
    hash_len: usize,
}

impl RoomMultiplexer {
    pub fn new(hash_len: usize) -> Self {
        Self {
            table: Mutex::new(RoomTable::default()),
            hash_len,
        }
    }

    pub fn session_room_id(&self, session_id: &str) -> String {
        session_room_id(session_id, self.hash_len)
    }

    /// Add a connection to a room, creating the room if needed. Joining a
    /// room twice only refreshes the member's activity timestamp.
    pub fn join(&self, room_id: &str, conn: &Arc<Connection>) -> bool {
        let mut table = self.table.lock();
        let room = table.rooms.entry(room_id.to_string()).or_insert_with(|| {
            tracing::debug!(room_id, "room created");
            Room::default()
        });
        room.members.insert(
            conn.id,
            Member {
                conn: conn.clone(),
                last_activity: Instant::now(),
            },
        );
        let room_size = room.members.len();
        table
            .memberships
            .entry(conn.id)
            .or_default()
            .insert(room_id.to_string());

        tracing::debug!(conn_id = conn.id, room_id, room_size, "client joined room");
        true
    }

    /// Remove a connection from a room. Returns `false` if the room doesn't
    /// exist. Empty rooms are deleted.
    pub fn leave(&self, room_id: &str, conn_id: ConnectionId) -> bool {
        self.table.lock().remove_member(room_id, conn_id)
    }

    /// Remove a connection from every room it is in. Returns the number of
    /// rooms left.
    pub fn leave_all(&self, conn_id: ConnectionId) -> usize {
        let mut table = self.table.lock();
        let room_ids: Vec<String> = table
            .memberships
            .remove(&conn_id)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();

        for room_id in &room_ids {
            table.remove_member(room_id, conn_id);
        }

        if !room_ids.is_empty() {
            tracing::debug!(conn_id, room_count = room_ids.len(), "client removed from all rooms");
        }
        room_ids.len()
    }

    /// Deliver to every member except `sender`. Returns the number of
    /// successful sends.
    pub fn broadcast_excluding(
        &self,
        room_id: &str,
        sender: ConnectionId,
        payload: impl Into<Payload>,
    ) -> usize {
        let Some(recipients) = self.table.lock().recipients(room_id, Some(sender)) else {
            return 0;
        };
        let delivery = deliver(&recipients, payload.into());
        if delivery.sent > 0 {
            tracing::info!(room_id, recipients = delivery.sent, sender = sender, "message broadcast to room");
        }
        delivery.sent
    }

    /// Deliver to every member. Returns the number of successful sends.
    pub fn send_to_all(&self, room_id: &str, payload: impl Into<Payload>) -> usize {
        let Some(recipients) = self.table.lock().recipients(room_id, None) else {
            return 0;
        };
        let delivery = deliver(&recipients, payload.into());
        if delivery.sent > 0 {
            tracing::info!(room_id, recipients = delivery.sent, "message sent to room");
        }
        delivery.sent
    }

    /// Reset a member's activity timestamp. Returns `false` if the
    /// connection isn't a member of the room.
    pub fn touch_activity(&self, room_id: &str, conn_id: ConnectionId) -> bool {
        let mut table = self.table.lock();
        match table
            .rooms
            .get_mut(room_id)
            .and_then(|room| room.members.get_mut(&conn_id))
        {
            Some(member) => {
                member.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Send a `room_ping` to every member. Activity is only refreshed
    /// when a member answers with `room_ping_response`.
    pub fn ping_room(&self, room_id: &str) -> usize {
        let Some(recipients) = self.table.lock().recipients(room_id, None) else {
            return 0;
        };
        let ping = ServerMessage::RoomPing {
            room_id: room_id.to_string(),
            id: prefixed_ulid(prefix::ROOM_PING),
        };
        let delivery = deliver(&recipients, ping.into());
        tracing::debug!(room_id, pinged = delivery.sent, failed = delivery.failed, "room ping sent");
        delivery.sent
    }

    /// Drop entity room members idle for longer than `threshold`. Session
    /// rooms are never swept; they are cleaned up on disconnect only.
    pub fn sweep_inactive(&self, threshold: Duration) -> SweepStats {
        let now = Instant::now();
        let mut table = self.table.lock();

        let stale: Vec<(String, ConnectionId)> = table
            .rooms
            .iter()
            .filter(|(room_id, _)| room_kind(room_id) == Some(RoomKind::Entity))
            .flat_map(|(room_id, room)| {
                room.members
                    .iter()
                    .filter(|(_, m)| now.duration_since(m.last_activity) > threshold)
                    .map(|(conn_id, _)| (room_id.clone(), *conn_id))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut stats = SweepStats::default();
        for (room_id, conn_id) in stale {
            if table.remove_member(&room_id, conn_id) {
                stats.removed += 1;
                tracing::info!(conn_id, room_id = %room_id, "removed inactive member");
                if !stats.rooms_affected.contains(&room_id) {
                    stats.rooms_affected.push(room_id);
                }
            }
        }
        stats
    }

    pub fn is_member(&self, room_id: &str, conn_id: ConnectionId) -> bool {
        self.table
            .lock()
            .rooms
            .get(room_id)
            .is_some_and(|room| room.members.contains_key(&conn_id))
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.table.lock().rooms.contains_key(room_id)
    }

    pub fn room_size(&self, room_id: &str) -> usize {
        self.table
            .lock()
            .rooms
            .get(room_id)
            .map_or(0, |room| room.members.len())
    }

    pub fn room_count(&self) -> usize {
        self.table.lock().rooms.len()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.table.lock().rooms.keys().cloned().collect()
    }

    pub fn entity_room_ids(&self) -> Vec<String> {
        self.table
            .lock()
            .rooms
            .keys()
            .filter(|id| room_kind(id) == Some(RoomKind::Entity))
            .cloned()
            .collect()
    }

    /// Rooms a connection is recorded in, per the reverse index.
    pub fn rooms_of(&self, conn_id: ConnectionId) -> Vec<String> {
        self.table
            .lock()
            .memberships
            .get(&conn_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Room listing for `connection_success`.
    pub fn summaries_for(&self, conn_id: ConnectionId) -> Vec<RoomSummary> {
        let table = self.table.lock();
        let Some(room_ids) = table.memberships.get(&conn_id) else {
            return Vec::new();
        };
        let mut summaries: Vec<RoomSummary> = room_ids
            .iter()
            .filter_map(|id| {
                let room = table.rooms.get(id)?;
                Some(RoomSummary {
                    id: id.clone(),
                    size: room.members.len(),
                    kind: room_kind(id).unwrap_or(RoomKind::Entity),
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Check the reverse index against room membership.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let table = self.table.lock();
        let forward = table.rooms.iter().all(|(room_id, room)| {
            !room.members.is_empty()
                && room.members.keys().all(|conn_id| {
                    table
                        .memberships
                        .get(conn_id)
                        .is_some_and(|rooms| rooms.contains(room_id))
                })
        });
        let backward = table.memberships.iter().all(|(conn_id, rooms)| {
            rooms.iter().all(|room_id| {
                table
                    .rooms
                    .get(room_id)
                    .is_some_and(|room| room.members.contains_key(conn_id))
            })
        });
        forward && backward
    }

    /// Pretend a member has been idle for `by`.
    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, room_id: &str, conn_id: ConnectionId, by: Duration) {
        let mut table = self.table.lock();
        if let Some(member) = table
            .rooms
            .get_mut(room_id)
            .and_then(|room| room.members.get_mut(&conn_id))
        {
            member.last_activity = Instant::now() - by;
        }
    }
}
