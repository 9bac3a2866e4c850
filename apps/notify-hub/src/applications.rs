//! Client for the application data service behind `get_partial_applications`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::HubError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ApplicationSource: Send + Sync {
    /// Partial (in-progress) applications belonging to a session.
    async fn partial_applications(&self, session_id: &str) -> Result<Vec<Value>, HubError>;
}

/// Fetches `{base}/applications/partials` with the session in `X-Session-Id`.
pub struct HttpApplicationSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpApplicationSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, HubError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(HubError::Config(format!(
                "application service URL must be http(s), got {base_url:?}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HubError::DataService(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

/// Accepts either a bare array or an object wrapping one in `list`.
pub fn parse_applications(body: Value) -> Result<Vec<Value>, HubError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("list") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(HubError::DataService("response has no application list".to_string())),
        },
        _ => Err(HubError::DataService("unexpected response shape".to_string())),
    }
}

#[async_trait]
impl ApplicationSource for HttpApplicationSource {
    async fn partial_applications(&self, session_id: &str) -> Result<Vec<Value>, HubError> {
        let url = format!("{}/applications/partials", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-Session-Id", session_id)
            .send()
            .await
            .map_err(|e| HubError::DataService(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(HubError::DataService(format!(
                "data service returned {}",
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| HubError::DataService(format!("invalid response body: {e}")))?;
        parse_applications(body)
    }
}

/// Used when no data service is configured.
pub struct UnavailableApplications;

#[async_trait]
impl ApplicationSource for UnavailableApplications {
    async fn partial_applications(&self, _session_id: &str) -> Result<Vec<Value>, HubError> {
        Err(HubError::DataService("application data service is not configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_array_and_wrapped_list() {
        assert_eq!(parse_applications(json!([{"id": 1}])).unwrap().len(), 1);
        assert_eq!(parse_applications(json!({"list": [{"id": 1}, {"id": 2}]})).unwrap().len(), 2);
        assert!(parse_applications(json!({"items": []})).is_err());
        assert!(parse_applications(json!("nope")).is_err());
    }

    #[test]
    fn non_http_base_url_is_a_config_error() {
        assert!(matches!(HttpApplicationSource::new("ftp://x"), Err(HubError::Config(_))));
        let source = HttpApplicationSource::new("http://data.local/").unwrap();
        assert_eq!(source.base_url, "http://data.local");
    }

    #[tokio::test]
    async fn unavailable_always_errors() {
        let err = UnavailableApplications.partial_applications("s").await.unwrap_err();
        assert!(matches!(err, HubError::DataService(_)));
    }
}
