mod common;

use std::time::Duration;

use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use common::{assert_silent, connect_ready, recv, recv_type, send, start_server, wait_for_clients};

const QUIET: Duration = Duration::from_millis(300);

#[tokio::test]
async fn greeting_without_session_asks_for_one() {
    let (addr, _test) = start_server().await;
    let (_ws, greeting) = connect_ready(addr, None).await;

    assert_eq!(greeting.len(), 2);
    assert_eq!(greeting[0]["type"], "session_id_required");
    assert_eq!(greeting[0]["code"], "NO_SESSION");

    let success = &greeting[1];
    assert_eq!(success["type"], "connection_success");
    assert!(success["roomId"].is_null());
    assert_eq!(success["rooms"], json!([]));
    assert_eq!(success["environment"]["clients"], 1);
    assert_eq!(success["environment"]["busEnabled"], false);
    assert!(success["timestamp"].is_string());
}

#[tokio::test]
async fn greeting_with_cookie_joins_session_room() {
    let (addr, test) = start_server().await;
    let (_ws, greeting) = connect_ready(addr, Some("bookingfrontendsession=s1; other=x")).await;

    let room_id = test.hub().rooms().session_room_id("s1");
    assert_eq!(greeting[0]["type"], "room_joined");
    assert_eq!(greeting[0]["roomId"], room_id.as_str());
    assert_eq!(greeting[0]["roomType"], "session");
    assert_eq!(greeting[0]["roomSize"], 1);

    let success = &greeting[1];
    assert_eq!(success["roomId"], room_id.as_str());
    assert_eq!(success["rooms"][0]["id"], room_id.as_str());
    assert_eq!(success["rooms"][0]["type"], "session");
}

#[tokio::test]
async fn session_room_reaches_every_tab_of_one_session_only() {
    let (addr, test) = start_server().await;
    let (mut tab1, _) = connect_ready(addr, Some("bookingfrontendsession=s1")).await;
    let (mut tab2, _) = connect_ready(addr, Some("bookingfrontendsession=s1")).await;
    let (mut other, _) = connect_ready(addr, Some("bookingfrontendsession=s2")).await;

    let room_id = test.hub().rooms().session_room_id("s1");
    assert_eq!(test.hub().rooms().room_size(&room_id), 2);

    assert!(test
        .hub()
        .send_to_session_room("s1", json!({"type": "cart_update", "items": 3})));

    for tab in [&mut tab1, &mut tab2] {
        let msg = recv_type(tab, "cart_update").await;
        assert_eq!(msg["items"], 3);
        assert!(msg["timestamp"].is_string());
    }
    assert_silent(&mut other, QUIET).await;

    assert!(!test.hub().send_to_session_room("nobody", json!({"type": "x"})));
}

#[tokio::test]
async fn session_message_syncs_sibling_tabs() {
    let (addr, test) = start_server().await;
    let (mut tab1, _) = connect_ready(addr, Some("bookingfrontendsession=s1")).await;
    let (mut tab2, _) = connect_ready(addr, Some("bookingfrontendsession=s1")).await;

    send(&mut tab1, json!({"type": "session_message", "text": "hello"})).await;

    let msg = recv(&mut tab2).await;
    assert_eq!(msg["type"], "room_message");
    assert_eq!(msg["roomId"], test.hub().rooms().session_room_id("s1").as_str());
    assert_eq!(msg["text"], "hello");
    assert_eq!(msg["sessionContext"]["hasSession"], true);
    assert_eq!(msg["sessionContext"]["sessionType"], "booking");
    assert_silent(&mut tab1, QUIET).await;
}

#[tokio::test]
async fn entity_subscription_and_events() {
    let (addr, test) = start_server().await;
    let (mut watcher, _) = connect_ready(addr, None).await;
    let (mut editor, _) = connect_ready(addr, None).await;

    send(&mut watcher, json!({"type": "subscribe", "entityType": "resource", "entityId": 42})).await;
    let joined = recv(&mut watcher).await;
    assert_eq!(joined["type"], "room_joined");
    assert_eq!(joined["roomId"], "entity_resource_42");
    assert_eq!(joined["roomType"], "entity");
    let confirmed = recv(&mut watcher).await;
    assert_eq!(confirmed["type"], "subscription_confirmation");
    assert_eq!(confirmed["status"], "subscribed");

    send(
        &mut editor,
        json!({"type": "entity_event", "entityType": "resource", "entityId": "42", "change": "booked"}),
    )
    .await;
    let event = recv(&mut watcher).await;
    assert_eq!(event["type"], "entity_event");
    assert_eq!(event["change"], "booked");

    // Out-of-process producers reach the same room.
    assert!(test
        .hub()
        .send_to_entity_room("resource", "42", json!({"type": "availability", "free": 0})));
    assert_eq!(recv(&mut watcher).await["type"], "availability");
    assert_silent(&mut editor, QUIET).await;

    send(&mut watcher, json!({"type": "unsubscribe", "entityType": "resource", "entityId": 42})).await;
    let left = recv(&mut watcher).await;
    assert_eq!(left["status"], "unsubscribed");
    assert!(!test.hub().rooms().room_exists("entity_resource_42"));
}

#[tokio::test]
async fn room_message_requires_membership() {
    let (addr, test) = start_server().await;
    let (mut member, _) = connect_ready(addr, None).await;
    let (mut outsider, _) = connect_ready(addr, None).await;

    send(&mut member, json!({"type": "subscribe", "entityType": "resource", "entityId": 1})).await;
    recv_type(&mut member, "subscription_confirmation").await;

    send(&mut outsider, json!({"type": "room_message", "roomId": "entity_resource_1", "text": "x"})).await;
    let denied = recv(&mut outsider).await;
    assert_eq!(denied["type"], "error");
    assert_eq!(denied["code"], "ROOM_ACCESS_DENIED");
    assert_silent(&mut member, QUIET).await;

    send(&mut outsider, json!({"type": "room_message"})).await;
    assert_eq!(recv(&mut outsider).await["code"], "MISSING_ROOM_ID");
    assert_eq!(test.hub().rooms().room_size("entity_resource_1"), 1);
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (addr, _test) = start_server().await;
    let (mut ws, _) = connect_ready(addr, None).await;

    send(&mut ws, json!({"type": "ping", "id": "p-1", "heartbeat_id": "hb-9"})).await;
    let pong = recv(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["reply_to"], "p-1");
    assert_eq!(pong["heartbeat_id"], "hb-9");
    assert!(pong["id"].as_str().unwrap().starts_with("pong_"));
    assert!(pong["timestamp"].is_string());
}

#[tokio::test]
async fn pong_with_epoch_millis_is_not_relayed() {
    let (addr, _test) = start_server().await;
    let (mut a, _) = connect_ready(addr, None).await;
    let (mut b, _) = connect_ready(addr, None).await;

    send(
        &mut a,
        json!({"type": "pong", "reply_to": "sping_1", "ping_timestamp": 1_714_564_800_000_i64}),
    )
    .await;
    assert_silent(&mut b, QUIET).await;
    assert_silent(&mut a, QUIET).await;
}

#[tokio::test]
async fn broadcasts_get_a_timestamp_unless_they_have_one() {
    let (addr, test) = start_server().await;
    let (mut ws, _) = connect_ready(addr, None).await;

    test.hub().broadcast_notification(json!({"type": "notification", "n": 1}));
    let stamped = recv(&mut ws).await;
    assert_eq!(stamped["n"], 1);
    assert!(stamped["timestamp"].is_string());

    test.hub()
        .broadcast_notification(json!({"type": "notification", "timestamp": "2024-01-01T00:00:00Z"}));
    assert_eq!(recv(&mut ws).await["timestamp"], "2024-01-01T00:00:00Z");

    // Non-JSON text passes through untouched.
    test.hub().broadcast_notification("plain text");
    let raw = tokio::time::timeout(Duration::from_secs(5), futures_util::StreamExt::next(&mut ws))
        .await
        .expect("timeout")
        .expect("stream ended")
        .expect("read error");
    assert_eq!(raw, Message::Text("plain text".into()));
}

#[tokio::test]
async fn chat_is_relayed_to_everyone_but_the_sender() {
    let (addr, _test) = start_server().await;
    let (mut a, _) = connect_ready(addr, None).await;
    let (mut b, _) = connect_ready(addr, None).await;

    send(&mut a, json!({"type": "chat", "text": "hi"})).await;
    let got = recv(&mut b).await;
    assert_eq!(got["type"], "chat");
    assert_eq!(got["text"], "hi");
    assert!(got.get("sessionContext").is_none());
    assert_silent(&mut a, QUIET).await;
}

#[tokio::test]
async fn relayed_chat_carries_no_personal_details() {
    let (addr, test) = start_server().await;
    test.sessions.insert(
        "known-session",
        json!({"userId": 42, "name": "Ada", "email": "ada@example.com", "ssn": "01020312345"}),
    );
    let (mut sender, _) = connect_ready(addr, Some("bookingfrontendsession=known-session")).await;
    let (mut stranger, _) = connect_ready(addr, None).await;

    send(&mut sender, json!({"type": "chat", "text": "hi"})).await;
    let got = recv(&mut stranger).await;
    assert_eq!(got["text"], "hi");
    assert_eq!(got["userContext"], json!({"sessionFound": true, "userId": 42}));

    let text = got.to_string();
    assert!(!text.contains("ada@example.com"));
    assert!(!text.contains("Ada"));
    assert!(!text.contains("010203"));
}

#[tokio::test]
async fn disconnect_leaves_every_room() {
    let (addr, test) = start_server().await;
    let (mut ws, _) = connect_ready(addr, Some("bookingfrontendsession=s1")).await;
    send(&mut ws, json!({"type": "subscribe", "entityType": "event", "entityId": 7})).await;
    recv_type(&mut ws, "subscription_confirmation").await;
    assert_eq!(test.hub().room_count(), 2);

    ws.close(None).await.expect("close");
    wait_for_clients(test.hub(), 0).await;

    assert_eq!(test.hub().room_count(), 0);
    assert!(!test.hub().rooms().room_exists("entity_event_7"));
}

#[tokio::test]
async fn update_session_moves_a_connection_into_its_room() {
    let (addr, test) = start_server().await;
    let (mut ws, _) = connect_ready(addr, None).await;

    send(&mut ws, json!({"type": "update_session", "sessionId": "late"})).await;
    let confirm = recv(&mut ws).await;
    assert_eq!(confirm["type"], "session_update_confirmation");
    assert_eq!(confirm["action"], "set");
    let joined = recv(&mut ws).await;
    assert_eq!(joined["type"], "room_joined");

    assert!(test.hub().send_to_session_room("late", json!({"type": "hello"})));
    assert_eq!(recv(&mut ws).await["type"], "hello");
}
