use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured failure taxonomy for the chat core.
///
/// Every fallible operation returns one of these variants so callers are
/// forced to handle both branches instead of inspecting a loose
/// success/error bag.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
    /// Cache unavailable. Logged and absorbed by callers; never surfaced
    /// to the end user.
    #[error("cache degraded: {0}")]
    CacheDegraded(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthenticationFailed,
    Validation,
    Unauthorized,
    NotFound,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(value: ChatError) -> Self {
        let code = match &value {
            ChatError::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            ChatError::ValidationFailed(_) => ErrorCode::Validation,
            ChatError::Unauthorized(_) => ErrorCode::Unauthorized,
            ChatError::NotFound(_) => ErrorCode::NotFound,
            ChatError::PersistenceFailed(_) | ChatError::CacheDegraded(_) => ErrorCode::Internal,
        };
        Self {
            code,
            message: value.to_string(),
        }
    }
}

impl ChatError {
    /// HTTP status the REST surface maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthenticationFailed(_) => 401,
            Self::ValidationFailed(_) => 400,
            Self::Unauthorized(_) => 403,
            Self::NotFound(_) => 404,
            Self::PersistenceFailed(_) | Self::CacheDegraded(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_error_maps_to_wire_codes() {
        let api: ApiError = ChatError::Unauthorized("nope".into()).into();
        assert_eq!(api.code, ErrorCode::Unauthorized);
        let api: ApiError = ChatError::PersistenceFailed("db gone".into()).into();
        assert_eq!(api.code, ErrorCode::Internal);
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ChatError::AuthenticationFailed("x".into()).http_status(), 401);
        assert_eq!(ChatError::ValidationFailed("x".into()).http_status(), 400);
        assert_eq!(ChatError::Unauthorized("x".into()).http_status(), 403);
        assert_eq!(ChatError::NotFound("x".into()).http_status(), 404);
    }
}
