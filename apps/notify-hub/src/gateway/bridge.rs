//! Optional link to the external pub/sub bus.
//!
//! The bus is a best-effort accelerator: when it can't be reached the
//! bridge reports itself disabled and callers fall back to the spool.
//! `enabled` is re-evaluated on publish and follows the subscriber's
//! connection, so a bus that comes back is picked up again after
//! `retry_delay`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use crate::config::BusSettings;
use crate::error::HubError;

use super::events::Payload;
use super::spool::{Spool, SpoolKind};

/// Bus channel names shared with out-of-process producers.
pub mod channel {
    pub const NOTIFICATIONS: &str = "notifications";
    pub const SESSION_MESSAGES: &str = "session_messages";
    pub const ROOM_MESSAGES: &str = "room_messages";

    pub const ALL: [&str; 3] = [NOTIFICATIONS, SESSION_MESSAGES, ROOM_MESSAGES];
}

/// Spool used when publishing on `channel` fails. Unknown channels have
/// no spool.
pub fn fallback_kind(channel: &str) -> Option<SpoolKind> {
    match channel {
        channel::NOTIFICATIONS => Some(SpoolKind::Notification),
        channel::SESSION_MESSAGES => Some(SpoolKind::Session),
        channel::ROOM_MESSAGES => Some(SpoolKind::Room),
        _ => None,
    }
}

pub struct PubSubBridge {
    settings: BusSettings,
    manager: Mutex<Option<ConnectionManager>>,
    enabled: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
}

impl PubSubBridge {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            settings,
            manager: Mutex::new(None),
            enabled: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Handshake with the bus. Failure is expected in some deployments and
    /// only disables the bridge.
    pub async fn connect(&self) -> bool {
        *self.last_attempt.lock() = Some(Instant::now());

        match self.handshake().await {
            Ok(manager) => {
                *self.manager.lock() = Some(manager);
                self.enabled.store(true, Ordering::Release);
                tracing::info!(url = %self.settings.url(), "bus connected");
                true
            }
            Err(err) => {
                self.disable();
                tracing::warn!(url = %self.settings.url(), %err, "bus unavailable, using spool fallback");
                false
            }
        }
    }

    async fn handshake(&self) -> Result<ConnectionManager, HubError> {
        let client = redis::Client::open(self.settings.url())?;
        let timeout = self.settings.connect_timeout;

        let mut manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| HubError::BusTimeout(timeout))??;

        let _: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut manager))
            .await
            .map_err(|_| HubError::BusTimeout(timeout))??;

        Ok(manager)
    }

    /// The subscriber holds a live subscription.
    pub(crate) fn mark_enabled(&self) {
        if !self.enabled.swap(true, Ordering::AcqRel) {
            tracing::info!(url = %self.settings.url(), "bus subscription live, bridge enabled");
        }
    }

    pub(crate) fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            tracing::warn!(url = %self.settings.url(), "bus lost, bridge disabled");
        }
        *self.manager.lock() = None;
    }

    fn retry_due(&self) -> bool {
        match *self.last_attempt.lock() {
            Some(at) => at.elapsed() >= self.settings.retry_delay,
            None => true,
        }
    }

    /// Publish on `channel`. Returns `false` when disabled or on any
    /// transport error; never raises.
    pub async fn publish(&self, channel: &str, message: impl Into<Payload>) -> bool {
        let live = self.manager.lock().clone().filter(|_| self.is_enabled());
        let mut manager = match live {
            Some(manager) => manager,
            None => {
                if !(self.retry_due() && self.connect().await) {
                    return false;
                }
                let Some(manager) = self.manager.lock().clone() else {
                    return false;
                };
                manager
            }
        };
        let text = message.into().into_text();
        let timeout = self.settings.connect_timeout;

        let result = tokio::time::timeout(timeout, manager.publish::<_, _, i64>(channel, text))
            .await
            .map_err(|_| HubError::BusTimeout(timeout))
            .and_then(|r| r.map_err(HubError::from));

        match result {
            Ok(receivers) => {
                tracing::debug!(channel, receivers, "published to bus");
                true
            }
            Err(err) => {
                self.disable();
                tracing::warn!(channel, %err, "bus publish failed");
                false
            }
        }
    }

    /// Out-of-process delivery: try the bus, then the spool. Returns
    /// `false` only if both paths fail.
    pub async fn send_notification(
        settings: &BusSettings,
        spool: &Spool,
        data: &Value,
        channel: &str,
    ) -> bool {
        let bridge = Self::new(settings.clone());
        if bridge.connect().await && bridge.publish(channel, data.clone()).await {
            return true;
        }

        let Some(kind) = fallback_kind(channel) else {
            tracing::error!(channel, "bus unavailable and channel has no spool fallback");
            return false;
        };

        match spool.write(kind, data).await {
            Ok(path) => {
                tracing::info!(channel, file = %path.display(), "notification spooled");
                true
            }
            Err(err) => {
                tracing::error!(channel, %err, "spool fallback failed");
                false
            }
        }
    }
}
