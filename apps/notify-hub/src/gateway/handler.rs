//! Per-type handling of decoded client messages.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use notify_common::id::{prefix, prefixed_ulid};

use crate::error::ErrorCode;

use super::binder::mask_session_id;
use super::connection::Connection;
use super::events::{
    ClientEvent, EntityTarget, PingRequest, PongReply, RoomKind, RoomTarget, ServerMessage,
    SessionUpdateAction, SubscriptionStatus, UpdateSession, UserInfo,
};
use super::fanout;
use super::hub::Hub;
use super::rooms::entity_room_id;

/// Route one typed message. Handlers reply to the sender directly and/or
/// broadcast; anything without a dedicated handler is broadcast to every
/// other connection.
pub async fn dispatch(hub: &Hub, conn: &Arc<Connection>, event: ClientEvent, body: Map<String, Value>) {
    match event {
        ClientEvent::Subscribe(target) => handle_subscribe(hub, conn, &target),
        ClientEvent::Unsubscribe(target) => handle_unsubscribe(hub, conn, &target),
        ClientEvent::RoomMessage(target) => handle_room_message(hub, conn, &target, body),
        ClientEvent::SessionMessage => handle_session_message(hub, conn, body),
        ClientEvent::EntityEvent(target) => handle_entity_event(hub, conn, &target, body),
        ClientEvent::UpdateSession(req) => handle_update_session(hub, conn, &req).await,
        ClientEvent::RoomPingResponse(target) => handle_room_ping_response(hub, conn, &target),
        ClientEvent::Pong(pong) => handle_pong(conn, &pong),
        ClientEvent::UpdateUserInfo(info) => handle_update_user_info(conn, &info),
        ClientEvent::GetPartialApplications => handle_get_partial_applications(hub, conn).await,
        ClientEvent::Notification => {
            fanout::broadcast_to_all(hub.registry(), Value::Object(body), None);
        }
        ClientEvent::Ping(req) => handle_ping(conn, &req),
        ClientEvent::Chat | ClientEvent::Unknown => {
            hub.broadcast_from(conn, Value::Object(body));
        }
    }
}

fn reply(conn: &Connection, message: ServerMessage) {
    if let Err(err) = conn.send(message) {
        tracing::debug!(conn_id = conn.id, %err, "reply dropped");
    }
}

fn handle_subscribe(hub: &Hub, conn: &Arc<Connection>, target: &EntityTarget) {
    let Some((entity_type, entity_id)) = target.resolve() else {
        reply(
            conn,
            ServerMessage::error(ErrorCode::InvalidSubscription, "entityType and entityId are required"),
        );
        return;
    };

    let room_id = entity_room_id(&entity_type, &entity_id);
    hub.rooms().join(&room_id, conn);
    let size = hub.rooms().room_size(&room_id);

    tracing::info!(conn_id = conn.id, room_id = %room_id, room_size = size, "subscribed to entity");
    reply(conn, ServerMessage::entity_room_joined(&room_id, size, &entity_type, &entity_id));
    reply(
        conn,
        ServerMessage::subscription(SubscriptionStatus::Subscribed, &entity_type, &entity_id, &room_id),
    );
}

fn handle_unsubscribe(hub: &Hub, conn: &Arc<Connection>, target: &EntityTarget) {
    let Some((entity_type, entity_id)) = target.resolve() else {
        reply(
            conn,
            ServerMessage::error(ErrorCode::InvalidSubscription, "entityType and entityId are required"),
        );
        return;
    };

    let room_id = entity_room_id(&entity_type, &entity_id);
    let left = hub.rooms().leave(&room_id, conn.id);
    tracing::info!(conn_id = conn.id, room_id = %room_id, left, "unsubscribed from entity");
    reply(
        conn,
        ServerMessage::subscription(SubscriptionStatus::Unsubscribed, &entity_type, &entity_id, &room_id),
    );
}

fn handle_room_message(hub: &Hub, conn: &Arc<Connection>, target: &RoomTarget, body: Map<String, Value>) {
    let Some(room_id) = target.resolve() else {
        reply(conn, ServerMessage::error(ErrorCode::MissingRoomId, "roomId is required"));
        return;
    };

    if !hub.rooms().is_member(&room_id, conn.id) {
        tracing::warn!(conn_id = conn.id, room_id = %room_id, "room message from non-member rejected");
        reply(
            conn,
            ServerMessage::error(ErrorCode::RoomAccessDenied, "You are not a member of this room"),
        );
        return;
    }

    hub.rooms().broadcast_excluding(&room_id, conn.id, Value::Object(body));
}

fn handle_session_message(hub: &Hub, conn: &Arc<Connection>, mut body: Map<String, Value>) {
    let Some(room_id) = conn.primary_room_id() else {
        reply(conn, ServerMessage::error(ErrorCode::NoSession, "No session room for this connection"));
        return;
    };

    body.insert("type".to_string(), Value::String("room_message".to_string()));
    body.insert("roomId".to_string(), Value::String(room_id.clone()));
    hub.rooms().broadcast_excluding(&room_id, conn.id, Value::Object(body));
}

fn handle_entity_event(hub: &Hub, conn: &Arc<Connection>, target: &EntityTarget, body: Map<String, Value>) {
    let Some((entity_type, entity_id)) = target.resolve() else {
        hub.broadcast_from(conn, Value::Object(body));
        return;
    };

    let room_id = entity_room_id(&entity_type, &entity_id);
    if !hub.rooms().room_exists(&room_id) {
        tracing::info!(conn_id = conn.id, room_id = %room_id, "entity room does not exist, event dropped");
        return;
    }
    hub.rooms().broadcast_excluding(&room_id, conn.id, Value::Object(body));
}

async fn handle_update_session(hub: &Hub, conn: &Arc<Connection>, req: &UpdateSession) {
    let Some(session_id) = req.resolve() else {
        reply(
            conn,
            ServerMessage::error(ErrorCode::InvalidSessionId, "sessionId must be a non-empty string"),
        );
        return;
    };

    let previous = conn.binding();
    let new_room = hub.rooms().session_room_id(&session_id);

    if previous.session_id.as_deref() == Some(session_id.as_str()) {
        tracing::info!(conn_id = conn.id, session = %mask_session_id(&session_id), "session id is unchanged");
        let room_id = previous.primary_room_id.unwrap_or(new_room);
        reply(conn, ServerMessage::session_updated(SessionUpdateAction::None, &room_id));
        return;
    }

    if let Some(old_room) = previous.primary_room_id.as_deref() {
        if old_room != new_room {
            hub.rooms().leave(old_room, conn.id);
        }
    }
    hub.rooms().join(&new_room, conn);
    conn.update_binding(|b| {
        b.session_id = Some(session_id.clone());
        b.is_booking_session = true;
        b.requires_session_id = false;
        b.primary_room_id = Some(new_room.clone());
    });

    let action = if previous.session_id.is_some() {
        SessionUpdateAction::Updated
    } else {
        SessionUpdateAction::Set
    };
    tracing::info!(
        conn_id = conn.id,
        old_session = ?previous.session_id.as_deref().map(mask_session_id),
        new_session = %mask_session_id(&session_id),
        room_id = %new_room,
        "session id updated"
    );

    let size = hub.rooms().room_size(&new_room);
    reply(conn, ServerMessage::session_updated(action, &new_room));
    reply(conn, ServerMessage::room_joined(&new_room, RoomKind::Session, size));

    // Room state is settled above; only the identity summary waits on I/O.
    let context = hub.binder().resolve_user_context(&session_id).await;
    conn.update_binding(|b| {
        if b.session_id.as_deref() == Some(session_id.as_str()) {
            b.user_context = context;
        }
    });
}

fn handle_room_ping_response(hub: &Hub, conn: &Arc<Connection>, target: &RoomTarget) {
    let Some(room_id) = target.resolve() else {
        tracing::debug!(conn_id = conn.id, "room ping response without roomId");
        return;
    };
    if !hub.rooms().touch_activity(&room_id, conn.id) {
        tracing::debug!(conn_id = conn.id, room_id = %room_id, "room ping response for a room the client is not in");
    }
}

fn handle_pong(conn: &Connection, pong: &PongReply) {
    let rtt_ms = pong
        .ping_sent_at()
        .map(|sent| (Utc::now() - sent).num_milliseconds());

    tracing::debug!(
        conn_id = conn.id,
        reply_to = ?pong.reply_to,
        heartbeat_id = ?pong.heartbeat_id,
        rtt_ms = ?rtt_ms,
        "pong received"
    );
}

fn handle_update_user_info(conn: &Connection, info: &UserInfo) {
    let Some(user_id) = info.resolve() else {
        reply(conn, ServerMessage::error(ErrorCode::InvalidUserInfo, "userId is required"));
        return;
    };

    conn.update_binding(|b| {
        b.user_context.get_or_insert_with(Default::default).user_id = Some(user_id.clone());
    });
    tracing::info!(conn_id = conn.id, user_id = %user_id, "user info updated");
    reply(
        conn,
        ServerMessage::UserInfoUpdateConfirmation {
            success: true,
            user_id,
        },
    );
}

async fn handle_get_partial_applications(hub: &Hub, conn: &Arc<Connection>) {
    let Some(session_id) = conn.session_id() else {
        reply(conn, ServerMessage::error(ErrorCode::NoSession, "No session for this connection"));
        return;
    };

    let response = match hub.applications().partial_applications(&session_id).await {
        Ok(applications) => {
            tracing::debug!(conn_id = conn.id, count = applications.len(), "partial applications loaded");
            ServerMessage::partial_applications(applications)
        }
        Err(err) => {
            tracing::warn!(conn_id = conn.id, %err, "partial applications lookup failed");
            ServerMessage::partial_applications_failed(err.to_string())
        }
    };
    reply(conn, response);
}

fn handle_ping(conn: &Connection, req: &PingRequest) {
    reply(
        conn,
        ServerMessage::Pong {
            id: prefixed_ulid(prefix::PONG),
            reply_to: req.id.clone(),
            heartbeat_id: req.heartbeat_id.clone(),
        },
    );
}
