#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use notify_hub::applications::UnavailableApplications;
use notify_hub::config::Config;
use notify_hub::gateway::Hub;
use notify_hub::session_store::{MemorySessionStore, SessionStore};
use notify_hub::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A hub wired to an unreachable bus and a throwaway spool directory.
pub struct TestHub {
    pub state: AppState,
    pub sessions: Arc<MemorySessionStore>,
    pub spool_dir: TempDir,
}

impl TestHub {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }
}

pub fn test_config(spool: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.spool_dir = spool.to_path_buf();
    config.bus.host = "127.0.0.1".to_string();
    config.bus.port = 1;
    config.bus.connect_timeout = Duration::from_millis(200);
    config
}

pub fn test_state() -> TestHub {
    let spool_dir = tempfile::tempdir().expect("spool dir");
    let config = test_config(spool_dir.path());
    let sessions = Arc::new(MemorySessionStore::new());
    let hub = Hub::new(
        &config,
        Some(sessions.clone() as Arc<dyn SessionStore>),
        Arc::new(UnavailableApplications),
    );
    TestHub {
        state: AppState {
            hub: Arc::new(hub),
            config: Arc::new(config),
        },
        sessions,
        spool_dir,
    }
}

/// Full application router wired to the test state.
pub fn test_app(state: &AppState) -> Router {
    notify_hub::routes::router().with_state(state.clone())
}

/// Start a real TCP server in the background.
pub async fn start_server() -> (SocketAddr, TestHub) {
    let test = test_state();
    let app = test_app(&test.state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    (addr, test)
}

/// Open a WebSocket, optionally presenting a cookie header.
pub async fn connect(addr: SocketAddr, cookie: Option<&str>) -> Ws {
    let mut request = format!("ws://{addr}/ws").into_client_request().expect("request");
    if let Some(cookie) = cookie {
        request
            .headers_mut()
            .insert(COOKIE, HeaderValue::from_str(cookie).expect("cookie header"));
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await.expect("ws connect");
    ws
}

/// Connect and consume the greeting up to and including
/// `connection_success`. Returns the greeting messages too.
pub async fn connect_ready(addr: SocketAddr, cookie: Option<&str>) -> (Ws, Vec<Value>) {
    let mut ws = connect(addr, cookie).await;
    let mut greeting = Vec::new();
    loop {
        let msg = recv(&mut ws).await;
        let done = msg["type"] == "connection_success";
        greeting.push(msg);
        if done {
            return (ws, greeting);
        }
    }
}

pub async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

/// Next JSON text message, skipping control frames.
pub async fn recv(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws read error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("parse message");
        }
    }
}

/// Next message with the given `type`, discarding others.
pub async fn recv_type(ws: &mut Ws, message_type: &str) -> Value {
    loop {
        let msg = recv(ws).await;
        if msg["type"] == message_type {
            return msg;
        }
    }
}

/// Assert no text message arrives within `wait`.
pub async fn assert_silent(ws: &mut Ws, wait: Duration) {
    let deadline = time::Instant::now() + wait;
    loop {
        match time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected message: {text}"),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("socket ended unexpectedly: {other:?}"),
        }
    }
}

/// Poll until the hub's client count reaches `expected`.
pub async fn wait_for_clients(hub: &Hub, expected: usize) {
    for _ in 0..100 {
        if hub.client_count() == expected {
            return;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {expected} clients, have {}", hub.client_count());
}
