use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Internal hub failure. None of these reach a client directly; handler
/// boundaries log them and carry on.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("bus error: {0}")]
    Bus(#[from] redis::RedisError),
    #[error("bus did not answer within {0:?}")]
    BusTimeout(std::time::Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection {conn_id} is closed")]
    ConnectionClosed { conn_id: u64 },
    #[error("session store: {0}")]
    SessionStore(String),
    #[error("data service: {0}")]
    DataService(String),
    #[error("configuration: {0}")]
    Config(String),
}

/// Error codes carried by `{"type":"error"}` messages on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoSession,
    InvalidSessionId,
    RoomAccessDenied,
    InvalidSubscription,
    MissingRoomId,
    InvalidUserInfo,
    DataServiceError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSession => "NO_SESSION",
            Self::InvalidSessionId => "INVALID_SESSION_ID",
            Self::RoomAccessDenied => "ROOM_ACCESS_DENIED",
            Self::InvalidSubscription => "INVALID_SUBSCRIPTION",
            Self::MissingRoomId => "MISSING_ROOM_ID",
            Self::InvalidUserInfo => "INVALID_USER_INFO",
            Self::DataServiceError => "DATA_SERVICE_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured API error returned to HTTP clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// HTTP-level error type that converts into a response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
