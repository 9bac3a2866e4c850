//! Read-only access to the shared application session store.
//!
//! The hub never creates or validates sessions. It only looks up the
//! record another service wrote, to build a non-sensitive identity
//! summary for logging and message enrichment.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::HubError;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The stored session record, or `None` if there is none.
    async fn load(&self, session_id: &str) -> Result<Option<Value>, HubError>;
}

/// Session ids as issued by the session store: alphanumerics, `,` and `-`.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ',' || c == '-')
}

/// Session records stored as `<dir>/sess_<id>` JSON files.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<Value>, HubError> {
        if !is_valid_session_id(session_id) {
            return Err(HubError::SessionStore("malformed session id".to_string()));
        }

        let path = self.dir.join(format!("sess_{session_id}"));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_str::<Value>(&content)? {
            record @ Value::Object(_) => Ok(Some(record)),
            _ => Err(HubError::SessionStore("session record is not an object".to_string())),
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, Value>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: impl Into<String>, record: Value) {
        self.records.write().insert(session_id.into(), record);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<Value>, HubError> {
        Ok(self.records.read().get(session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_id_charset() {
        assert!(is_valid_session_id("abc123-DEF,9"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("../etc/passwd"));
        assert!(!is_valid_session_id("a b"));
    }

    #[tokio::test]
    async fn file_store_reads_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sess_abc"), r#"{"userId": 7}"#).unwrap();
        let store = FileSessionStore::new(dir.path());

        assert_eq!(store.load("abc").await.unwrap(), Some(json!({"userId": 7})));
        assert_eq!(store.load("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sess_list"), "[1,2]").unwrap();
        std::fs::write(dir.path().join("sess_junk"), "not json").unwrap();
        let store = FileSessionStore::new(dir.path());

        assert!(matches!(store.load("../x").await, Err(HubError::SessionStore(_))));
        assert!(matches!(store.load("list").await, Err(HubError::SessionStore(_))));
        assert!(matches!(store.load("junk").await, Err(HubError::Json(_))));
    }
}
