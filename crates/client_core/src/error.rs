use thiserror::Error;

pub const MSG_CALCULATION_DONE: &str = "calculation complete";
pub const MSG_CALCULATION_FAILED: &str = "calculation failed";
pub const MSG_RESULT_NOT_FOUND: &str = "result not found";
pub const MSG_INPUTS_INCOMPLETE: &str = "enter a target address and select one file";
pub const MSG_DOWNLOAD_FAILED: &str = "download failed";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("inputs incomplete: target address and exactly one file are required")]
    Validation,
    #[error("a calculation is already running")]
    Busy,
    #[error("compute service responded {status}: {message}")]
    Request { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no result file on record")]
    ResultMissing,
}

impl ControllerError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        ControllerError::Transport(err.to_string())
    }

    /// Text shown to the user for this failure. Re-entry is silent.
    pub fn notice_text(&self) -> Option<&str> {
        match self {
            ControllerError::Validation => Some(MSG_INPUTS_INCOMPLETE),
            ControllerError::Busy => None,
            ControllerError::Request { message, .. } => Some(message),
            ControllerError::Transport(_) => Some(MSG_CALCULATION_FAILED),
            ControllerError::ResultMissing => Some(MSG_RESULT_NOT_FOUND),
        }
    }
}
