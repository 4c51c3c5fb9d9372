use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body of a failed compute-service response: `{"error": "..."}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }

    /// Parses a failure body, returning the server's message when one is present.
    pub fn message_from_bytes(body: &[u8]) -> Option<String> {
        serde_json::from_slice::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Error)]
#[error("server responded {status}: {message}")]
pub struct ApiException {
    pub status: u16,
    pub message: String,
}

impl ApiException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ApiException> for ErrorBody {
    fn from(value: ApiException) -> Self {
        Self {
            error: Some(value.message),
        }
    }
}
