use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            pub fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(RequestId);
id_newtype!(NoticeId);

/// Lifecycle of one calculation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Validating,
    Running,
    Succeeded,
    Failed,
}

impl SessionStatus {
    pub fn is_running(self) -> bool {
        self == SessionStatus::Running
    }

    pub fn is_settled(self) -> bool {
        matches!(self, SessionStatus::Succeeded | SessionStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Error => "error",
        }
    }
}

/// How `POST /api/calculate` hands back its result.
///
/// A deployment picks exactly one; the controller never guesses from the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// JSON `{filename}` followed by a `GET /api/download/{filename}`.
    #[default]
    Descriptor,
    /// Artifact bytes in the response body, name in `content-disposition`.
    DirectPayload,
}

impl DeliveryMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "descriptor" | "json" => Some(DeliveryMode::Descriptor),
            "direct_payload" | "direct-payload" | "blob" => Some(DeliveryMode::DirectPayload),
            _ => None,
        }
    }
}
