//! Inbound side of the bus: routes messages published by other processes
//! into rooms or to every connection.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;

use crate::error::HubError;

use super::binder::mask_session_id;
use super::bridge::channel;
use super::events::{now_iso, scalar_string, Payload};
use super::hub::Hub;

/// Where a bus message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Room { room_id: String, delivered: bool },
    Entity { delivered: bool },
    Session { delivered: bool },
    Broadcast,
    Dropped,
}

/// Route one bus message. Never fails; unusable messages are logged and
/// dropped.
pub fn route(hub: &Hub, channel_name: &str, payload: &str) -> Routed {
    let data: Option<Value> = serde_json::from_str(payload).ok();
    let message_type = data
        .as_ref()
        .and_then(|d| d.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    match channel_name {
        channel::ROOM_MESSAGES => {
            let room_id = data.as_ref().and_then(|d| d.get("roomId")).and_then(Value::as_str);
            let Some(room_id) = room_id.filter(|_| message_type == "room_message") else {
                tracing::warn!(msg_type = %message_type, "unroutable room message from bus");
                return Routed::Dropped;
            };
            if !hub.rooms().room_exists(room_id) {
                tracing::warn!(room_id, "room not found for bus message");
                return Routed::Room {
                    room_id: room_id.to_string(),
                    delivered: false,
                };
            }
            let sent = hub.rooms().send_to_all(room_id, Payload::Text(payload.to_string()));
            tracing::info!(room_id, recipients = sent, "bus room message delivered");
            Routed::Room {
                room_id: room_id.to_string(),
                delivered: true,
            }
        }
        channel::NOTIFICATIONS => route_notification(hub, data, payload, &message_type),
        channel::SESSION_MESSAGES => {
            let Some(data) = data.filter(|_| message_type == "session_targeted") else {
                tracing::warn!(msg_type = %message_type, "invalid session message format");
                return Routed::Dropped;
            };
            let Some(session_id) = data.get("sessionId").and_then(Value::as_str) else {
                tracing::warn!(msg_type = %message_type, "session message without sessionId");
                return Routed::Dropped;
            };
            let body = data.get("data").cloned().unwrap_or_else(|| data.clone());
            let delivered = hub.send_to_session_room(session_id, body);
            tracing::info!(session = %mask_session_id(session_id), delivered, "bus session message");
            Routed::Session { delivered }
        }
        other => {
            tracing::debug!(channel = other, "message on unexpected bus channel");
            Routed::Dropped
        }
    }
}

fn route_notification(hub: &Hub, data: Option<Value>, payload: &str, message_type: &str) -> Routed {
    let Some(Value::Object(mut map)) = data else {
        hub.broadcast_notification(Payload::Text(payload.to_string()));
        return Routed::Broadcast;
    };

    match map.get("target").and_then(Value::as_str) {
        Some("entity") => {
            let entity_type = map.get("entityType").and_then(scalar_string);
            let entity_id = map.get("entityId").and_then(scalar_string);
            if let (Some(entity_type), Some(entity_id)) = (entity_type, entity_id) {
                let delivered = hub.send_to_entity_room(&entity_type, &entity_id, Payload::Text(payload.to_string()));
                tracing::info!(%entity_type, %entity_id, delivered, "bus entity notification");
                return Routed::Entity { delivered };
            }
        }
        Some("session") => {
            if let Some(session_id) = map.get("sessionId").and_then(Value::as_str) {
                let delivered = hub.send_to_session_room(session_id, Payload::Text(payload.to_string()));
                tracing::info!(session = %mask_session_id(session_id), delivered, "bus session notification");
                return Routed::Session { delivered };
            }
        }
        _ => {}
    }

    map.insert("source".to_string(), Value::String("redis".to_string()));
    map.insert("received_at".to_string(), Value::String(now_iso()));
    tracing::info!(
        msg_type = message_type,
        clients = hub.client_count(),
        bytes = payload.len(),
        "broadcasting bus notification"
    );
    hub.broadcast_notification(Value::Object(map));
    Routed::Broadcast
}

/// Keep a subscription to every hub channel alive, reconnecting after the
/// configured retry delay. Runs until aborted.
pub async fn run(hub: Arc<Hub>) {
    let retry = hub.bridge().settings().retry_delay;
    loop {
        match listen(&hub).await {
            Ok(()) => tracing::warn!("bus subscription ended"),
            Err(err) => tracing::warn!(%err, "bus subscription unavailable"),
        }
        tokio::time::sleep(retry).await;
    }
}

/// One subscription lifetime. The bridge counts as enabled from the
/// moment every channel is subscribed until the subscription ends.
async fn listen(hub: &Hub) -> Result<(), HubError> {
    let result = subscribe_and_route(hub).await;
    hub.bridge().disable();
    result
}

async fn subscribe_and_route(hub: &Hub) -> Result<(), HubError> {
    let settings = hub.bridge().settings();
    let client = redis::Client::open(settings.url())?;
    let timeout = settings.connect_timeout;

    let mut pubsub = tokio::time::timeout(timeout, client.get_async_pubsub())
        .await
        .map_err(|_| HubError::BusTimeout(timeout))??;
    for name in channel::ALL {
        pubsub.subscribe(name).await?;
    }
    tracing::info!(channels = ?channel::ALL, "subscribed to bus channels");
    hub.bridge().mark_enabled();

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let channel_name = msg.get_channel_name().to_string();
        match msg.get_payload::<String>() {
            Ok(payload) => {
                route(hub, &channel_name, &payload);
            }
            Err(err) => tracing::warn!(channel = %channel_name, %err, "undecodable bus payload"),
        }
    }
    Ok(())
}
