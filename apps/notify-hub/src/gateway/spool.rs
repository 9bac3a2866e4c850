//! Filesystem hand-off queue used when the bus is unreachable.
//!
//! Producers write `websocket_<kind>_<micros>_<ulid>.json` through a
//! dot-prefixed temp file and a rename; consumers read in name order and
//! delete after delivery.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::Value;

use notify_common::id::{prefix, prefixed_ulid, unix_micros};

use crate::error::HubError;

/// Unparseable files younger than this may still be mid-write by a
/// non-cooperating producer.
const INVALID_GRACE: Duration = Duration::from_secs(10);
const INVALID_SUFFIX: &str = ".invalid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolKind {
    /// Broadcast to every connection.
    Notification,
    /// `{sessionId, ...}` delivered to one session room.
    Session,
    /// `{roomId, ...}` delivered to an existing room.
    Room,
}

impl SpoolKind {
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::Notification => "websocket_notification_",
            Self::Session => "websocket_session_",
            Self::Room => "websocket_room_",
        }
    }

    fn matches(self, name: &str) -> bool {
        name.starts_with(self.file_prefix()) && name.ends_with(".json")
    }
}

/// A spool file that parsed as JSON and is ready for delivery.
#[derive(Debug, Clone)]
pub struct SpoolFile {
    pub path: PathBuf,
    pub payload: Value,
}

impl SpoolFile {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a payload as a new spool file and return its final path.
    pub async fn write(&self, kind: SpoolKind, payload: &Value) -> Result<PathBuf, HubError> {
        let name = format!(
            "{}{}_{}.json",
            kind.file_prefix(),
            unix_micros(),
            prefixed_ulid(prefix::SPOOL)
        );
        let tmp = self.dir.join(format!(".{name}.tmp"));
        let path = self.dir.join(&name);

        let body = serde_json::to_vec(payload)?;
        tokio::fs::write(&tmp, &body).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }

        tracing::debug!(file = %name, bytes = body.len(), "payload spooled");
        Ok(path)
    }

    /// Every parseable file of `kind`, oldest first. Empty files are left
    /// for the next pass; stale unparseable ones are moved aside.
    pub async fn ready(&self, kind: SpoolKind) -> Result<Vec<SpoolFile>, HubError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if kind.matches(&name) {
                names.push(name);
            }
        }
        names.sort();

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let path = self.dir.join(&name);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) => {
                    // Another drain may have taken it.
                    tracing::debug!(file = %name, %err, "spool file vanished");
                    continue;
                }
            };

            if content.trim().is_empty() {
                tracing::debug!(file = %name, "spool file empty, retrying next cycle");
                continue;
            }

            match serde_json::from_str::<Value>(&content) {
                Ok(payload) => files.push(SpoolFile { path, payload }),
                Err(err) => self.set_aside_if_stale(&path, &name, &err).await,
            }
        }
        Ok(files)
    }

    async fn set_aside_if_stale(&self, path: &Path, name: &str, err: &serde_json::Error) {
        let age = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();

        if age < INVALID_GRACE {
            tracing::debug!(file = %name, %err, "spool file not parseable yet");
            return;
        }

        let target = self.dir.join(format!("{name}{INVALID_SUFFIX}"));
        match tokio::fs::rename(path, &target).await {
            Ok(()) => tracing::warn!(file = %name, %err, "invalid spool file set aside"),
            Err(rename_err) => {
                tracing::error!(file = %name, %err, %rename_err, "could not set aside invalid spool file")
            }
        }
    }

    /// Delete a delivered file. A file already gone is not an error.
    pub async fn remove(&self, file: &SpoolFile) -> bool {
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(file = %file.name(), "spool file already removed");
                false
            }
            Err(err) => {
                tracing::error!(file = %file.name(), %err, "failed to delete spool file");
                false
            }
        }
    }
}
