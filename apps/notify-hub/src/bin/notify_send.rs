//! Out-of-process producer: publishes to the hub's bus channels, falling
//! back to the spool directory when the bus is down.
//!
//! ```text
//! notify-send notification '<json>'
//! notify-send session <sessionId> '<json>'
//! notify-send entity <entityType> <entityId> '<json>'
//! ```

use std::path::Path;
use std::process::ExitCode;

use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use notify_hub::config::Config;
use notify_hub::gateway::bridge::{channel, PubSubBridge};
use notify_hub::gateway::rooms::entity_room_id;
use notify_hub::gateway::spool::Spool;

const USAGE: &str = "usage:
  notify-send notification '<json>'
  notify-send session <sessionId> '<json>'
  notify-send entity <entityType> <entityId> '<json>'";

/// A parsed command line: the channel to publish on and the message.
#[derive(Debug, PartialEq)]
struct Command {
    channel: &'static str,
    message: Value,
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON payload: {e}"))
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["notification", body] => Ok(Command {
            channel: channel::NOTIFICATIONS,
            message: parse_json(body)?,
        }),
        ["session", session_id, body] => Ok(Command {
            channel: channel::SESSION_MESSAGES,
            message: json!({
                "type": "session_targeted",
                "sessionId": session_id,
                "data": parse_json(body)?,
            }),
        }),
        ["entity", entity_type, entity_id, body] => {
            let mut message = match parse_json(body)? {
                Value::Object(map) => map,
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("data".to_string(), other);
                    map
                }
            };
            message.insert("type".to_string(), json!("room_message"));
            message.insert("roomId".to_string(), json!(entity_room_id(entity_type, entity_id)));
            Ok(Command {
                channel: channel::ROOM_MESSAGES,
                message: Value::Object(message),
            })
        }
        _ => Err(USAGE.to_string()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("notify_hub=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    let config = Config::from_env();
    let spool = Spool::new(&config.spool_dir);
    let delivered =
        PubSubBridge::send_notification(&config.bus, &spool, &command.message, command.channel).await;

    if delivered {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
