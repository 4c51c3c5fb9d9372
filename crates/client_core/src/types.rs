use bytes::Bytes;
use shared::domain::{NoticeId, Severity};

/// A file picked on the input surface.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub content: Bytes,
}

impl SelectedFile {
    pub fn new(filename: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: None,
            content: content.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// Current contents of the address field and the file picker.
#[derive(Debug, Clone, Default)]
pub struct ValidationInputs {
    pub target_address: String,
    pub files: Vec<SelectedFile>,
}

impl ValidationInputs {
    pub fn is_ready(&self) -> bool {
        !self.target_address.is_empty() && self.files.len() == 1
    }

    /// Moves the inputs into a request payload when they pass validation.
    pub fn into_upload(mut self) -> Option<CalculationUpload> {
        if !self.is_ready() {
            return None;
        }
        let file = self.files.pop()?;
        Some(CalculationUpload {
            target_address: self.target_address,
            file,
        })
    }
}

/// Multipart payload of one calculation: `{file, target_address}`.
#[derive(Debug, Clone)]
pub struct CalculationUpload {
    pub target_address: String,
    pub file: SelectedFile,
}

/// Where a finished calculation's artifact can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultHandle {
    ServerFile { filename: String },
    LocalBlob { url: String },
}

impl ResultHandle {
    pub fn filename(&self) -> Option<&str> {
        match self {
            ResultHandle::ServerFile { filename } => Some(filename),
            ResultHandle::LocalBlob { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: NoticeId,
    pub text: String,
    pub severity: Severity,
}

/// A locally held artifact the view should hand to the user as a download.
#[derive(Debug, Clone)]
pub struct BlobDownload {
    pub url: String,
    pub filename: String,
    pub content: Bytes,
}
