//! Rendering surface the controller drives.

use shared::domain::NoticeId;

use crate::types::{BlobDownload, Notice, ResultHandle, ValidationInputs};

/// Everything the controller knows about page structure goes through this trait.
///
/// Calls are synchronous and cheap; implementations must not block.
pub trait View: Send + Sync {
    fn validation_inputs(&self) -> ValidationInputs;
    fn set_trigger_enabled(&self, enabled: bool);
    fn set_progress_visible(&self, visible: bool);
    fn set_progress(&self, percent: u8);
    /// `None` hides the result section.
    fn show_result(&self, handle: Option<&ResultHandle>);
    /// Newest notices are shown first.
    fn show_notice(&self, notice: &Notice);
    fn remove_notice(&self, id: NoticeId);
    fn navigate(&self, url: &str);
    fn save_download(&self, download: &BlobDownload);
}
