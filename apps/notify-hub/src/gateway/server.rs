//! WebSocket upgrade handler and per-connection read/write loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::header::{COOKIE, USER_AGENT};
use axum::http::{Extensions, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::AppState;

use super::connection::{Connection, Outbound};
use super::hub::Hub;

const CLOSE_NORMAL: u16 = 1000;

/// How long to wait for the writer to flush its close frame.
const WRITER_SHUTDOWN: Duration = Duration::from_secs(5);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/", get(ws_upgrade))
}

/// Handshake details the hub cares about.
struct Handshake {
    remote_addr: Option<SocketAddr>,
    user_agent: String,
    cookie: Option<String>,
}

impl Handshake {
    fn from_parts(headers: &HeaderMap, extensions: &Extensions) -> Self {
        let cookies: Vec<&str> = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();

        Self {
            remote_addr: extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            user_agent: headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string(),
            cookie: (!cookies.is_empty()).then(|| cookies.join("; ")),
        }
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    extensions: Extensions,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let handshake = Handshake::from_parts(&headers, &extensions);
    let ping_every = state.config.protocol_ping_interval;
    ws.on_upgrade(move |socket| handle_connection(socket, state.hub, handshake, ping_every))
}

async fn handle_connection(socket: WebSocket, hub: Arc<Hub>, handshake: Handshake, ping_every: Duration) {
    let (conn, outbound_rx) = Connection::new(
        hub.next_connection_id(),
        handshake.remote_addr,
        handshake.user_agent,
    );
    let (ws_tx, ws_rx) = socket.split();

    let writer = tokio::spawn(write_loop(conn.clone(), ws_tx, outbound_rx, ping_every));

    hub.on_open(&conn, handshake.cookie.as_deref()).await;
    read_loop(&hub, &conn, ws_rx).await;
    hub.on_close(&conn);

    conn.close(CLOSE_NORMAL, "");
    if time::timeout(WRITER_SHUTDOWN, writer).await.is_err() {
        tracing::debug!(conn_id = conn.id, "writer did not finish in time");
    }
}

/// Process frames in arrival order until the client leaves, the socket
/// fails, or the hub closes the connection.
async fn read_loop(hub: &Hub, conn: &Arc<Connection>, mut ws_rx: SplitStream<WebSocket>) {
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => hub.on_message(conn, text.as_str()).await,
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => hub.on_message(conn, text).await,
                        Err(_) => tracing::debug!(conn_id = conn.id, len = bytes.len(), "non-utf8 binary frame ignored"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        hub.on_error(conn, &err);
                        break;
                    }
                }
            }
            _ = conn.closed() => break,
        }
    }
}

/// Drain the connection's outbound queue into the socket, interleaving
/// protocol-level pings.
async fn write_loop(
    conn: Arc<Connection>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ping_every: Duration,
) {
    let mut ping = time::interval(ping_every.max(Duration::from_secs(1)));
    ping.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(Outbound::Text(text)) => {
                        if let Err(err) = ws_tx.send(Message::Text(text.into())).await {
                            tracing::debug!(conn_id = conn.id, %err, "ws write failed");
                            conn.close(CLOSE_NORMAL, "write failed");
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = send_close(&mut ws_tx, code, &reason).await;
                        break;
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                    conn.close(CLOSE_NORMAL, "ping failed");
                    break;
                }
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
