//! Binds connections to application sessions from their handshake cookies.

use std::collections::HashMap;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde_json::{json, Map, Value};

use crate::session_store::SessionStore;

use super::connection::{Connection, SessionBinding, UserContext};

/// Session id safe for logs: first 8 chars + `...`.
pub fn mask_session_id(session_id: &str) -> String {
    let head: String = session_id.chars().take(8).collect();
    format!("{head}...")
}

fn mask_for_context(session_id: &str) -> String {
    let head: String = session_id.chars().take(8).collect();
    format!("{head}****")
}

/// First six digits of a national id followed by `*****`.
fn mask_national_id(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 6 {
        return None;
    }
    Some(format!("{}*****", &digits[..6]))
}

/// Parse a `Cookie` header into name → value, percent-decoding values
/// (`+` decodes to a space).
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() || value.is_empty() {
                return None;
            }
            let value = value.replace('+', " ");
            let decoded = percent_decode_str(&value).decode_utf8_lossy().into_owned();
            Some((name.to_string(), decoded))
        })
        .collect()
}

fn string_field(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string))
}

/// Build a non-sensitive summary from a stored session record. Only the
/// listed identity fields are read; everything else (credentials
/// included) is ignored.
pub fn summarize_record(session_id: &str, record: &Value) -> UserContext {
    let mut context = UserContext {
        session_found: true,
        session_id: Some(mask_for_context(session_id)),
        ..Default::default()
    };
    let Some(record) = record.as_object() else {
        return context;
    };

    context.user_id = ["userId", "user_id"]
        .iter()
        .filter_map(|k| record.get(*k))
        .find(|v| v.is_number() || v.as_str().is_some_and(|s| !s.is_empty()))
        .cloned();
    context.name = string_field(record, &["name", "orgName"]);
    context.email = string_field(record, &["email"]);
    context.national_id = string_field(record, &["ssn", "nationalId"])
        .as_deref()
        .and_then(mask_national_id);
    context
}

/// Resolves session ids and user context for new connections, and
/// decorates inbound messages with that context.
pub struct SessionBinder {
    primary_cookie: String,
    fallback_cookie: String,
    store: Option<Arc<dyn SessionStore>>,
}

impl SessionBinder {
    pub fn new(
        primary_cookie: impl Into<String>,
        fallback_cookie: impl Into<String>,
        store: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        Self {
            primary_cookie: primary_cookie.into(),
            fallback_cookie: fallback_cookie.into(),
            store,
        }
    }

    /// Work out the session binding from the handshake's `Cookie` header
    /// and store it on the connection.
    pub async fn extract(&self, conn: &Connection, cookie_header: Option<&str>) -> SessionBinding {
        let cookies = cookie_header.map(parse_cookies).unwrap_or_default();

        let primary = cookies.get(&self.primary_cookie).cloned();
        let session_id = primary
            .clone()
            .or_else(|| cookies.get(&self.fallback_cookie).cloned());

        let user_context = match &primary {
            Some(id) => self.resolve_user_context(id).await,
            None => None,
        };

        let binding = SessionBinding {
            requires_session_id: session_id.is_none(),
            is_booking_session: primary.is_some(),
            session_id,
            user_context,
            primary_room_id: None,
            cookie_count: cookies.len(),
        };

        tracing::info!(
            conn_id = conn.id,
            session = ?binding.session_id.as_deref().map(mask_session_id),
            booking_session = binding.is_booking_session,
            cookies = binding.cookie_count,
            user_agent = %conn.user_agent,
            "session data extracted"
        );

        conn.update_binding(|b| *b = binding.clone());
        binding
    }

    /// Best-effort identity lookup. Any store failure leaves the
    /// connection unauthenticated.
    pub async fn resolve_user_context(&self, session_id: &str) -> Option<UserContext> {
        let Some(store) = &self.store else {
            return Some(UserContext {
                session_found: true,
                session_id: Some(mask_for_context(session_id)),
                ..Default::default()
            });
        };

        match store.load(session_id).await {
            Ok(Some(record)) => Some(summarize_record(session_id, &record)),
            Ok(None) => Some(UserContext {
                session_found: false,
                session_id: Some(mask_for_context(session_id)),
                ..Default::default()
            }),
            Err(err) => {
                tracing::warn!(session = %mask_session_id(session_id), %err, "session lookup failed");
                None
            }
        }
    }

    /// Attach `sessionContext` and the relayable part of `userContext` to a
    /// decoded message. Keepalive traffic is returned unchanged.
    pub fn enrich(&self, conn: &Connection, is_keepalive: bool, mut body: Map<String, Value>) -> Map<String, Value> {
        if is_keepalive {
            return body;
        }
        let binding = conn.binding();
        if let Some(session_type) = session_type(&binding) {
            body.insert(
                "sessionContext".to_string(),
                json!({"hasSession": true, "sessionType": session_type}),
            );
        }
        if let Some(context) = binding.user_context {
            body.insert("userContext".to_string(), context.relayed());
        }
        body
    }
}

/// `booking` for primary-cookie sessions, `standard` for the fallback.
pub fn session_type(binding: &SessionBinding) -> Option<&'static str> {
    binding.session_id.as_ref()?;
    Some(if binding.is_booking_session {
        "booking"
    } else {
        "standard"
    })
}
