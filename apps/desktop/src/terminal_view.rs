//! A [`View`] that renders to the terminal and saves downloads to a directory.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use client_core::{BlobDownload, Notice, ResultHandle, SelectedFile, ValidationInputs, View};
use shared::domain::{NoticeId, Severity};
use tracing::{error, info};

struct TerminalState {
    target_address: String,
    files: Vec<SelectedFile>,
    saved: Vec<PathBuf>,
    last_progress: Option<u8>,
}

pub struct TerminalView {
    output_dir: PathBuf,
    state: Mutex<TerminalState>,
}

/// Keeps only the final path component of a server-supplied name.
pub fn safe_file_name(raw: &str) -> String {
    Path::new(raw)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(client_core::DEFAULT_RESULT_FILENAME)
        .to_string()
}

impl TerminalView {
    pub fn new(target_address: String, files: Vec<SelectedFile>, output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            state: Mutex::new(TerminalState {
                target_address,
                files,
                saved: Vec::new(),
                last_progress: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TerminalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn save(&self, filename: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(safe_file_name(filename));
        fs::write(&path, content)?;
        self.state().saved.push(path.clone());
        Ok(path)
    }

    pub fn saved(&self) -> Vec<PathBuf> {
        self.state().saved.clone()
    }
}

impl View for TerminalView {
    fn validation_inputs(&self) -> ValidationInputs {
        let state = self.state();
        ValidationInputs {
            target_address: state.target_address.clone(),
            files: state.files.clone(),
        }
    }

    fn set_trigger_enabled(&self, enabled: bool) {
        tracing::debug!(enabled, "trigger");
    }

    fn set_progress_visible(&self, visible: bool) {
        if !visible && self.state().last_progress.take().is_some() {
            eprintln!();
        }
    }

    fn set_progress(&self, percent: u8) {
        let mut state = self.state();
        if state.last_progress == Some(percent) {
            return;
        }
        state.last_progress = Some(percent);
        let filled = usize::from(percent) / 5;
        eprint!("\r[{:<20}] {percent:>3}%", "#".repeat(filled));
        let _ = std::io::stderr().flush();
        if percent == 100 {
            eprintln!();
        }
    }

    fn show_result(&self, handle: Option<&ResultHandle>) {
        if let Some(handle) = handle {
            info!(?handle, "result ready");
        }
    }

    fn show_notice(&self, notice: &Notice) {
        let tag = match notice.severity {
            Severity::Info => "info",
            Severity::Success => "ok",
            Severity::Error => "error",
        };
        println!("[{tag}] {}", notice.text);
    }

    fn remove_notice(&self, _id: NoticeId) {}

    fn navigate(&self, url: &str) {
        info!(%url, "opening");
    }

    fn save_download(&self, download: &BlobDownload) {
        match self.save(&download.filename, &download.content) {
            Ok(path) => println!("saved {}", path.display()),
            Err(err) => error!(filename = %download.filename, "failed to save download: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_names_cannot_escape_the_output_dir() {
        assert_eq!(safe_file_name("result.xlsx"), "result.xlsx");
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name(".."), client_core::DEFAULT_RESULT_FILENAME);
        assert_eq!(safe_file_name(""), client_core::DEFAULT_RESULT_FILENAME);
    }
}
