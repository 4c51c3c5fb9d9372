//! Frame-coalesced progress rendering for the in-flight request.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use shared::{domain::RequestId, protocol::ProgressUpdate};
use tokio::sync::Notify;
use tracing::debug;

use crate::view::View;

/// One animation frame at 60 Hz.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Default)]
struct RelayState {
    accepting: Option<RequestId>,
    pending: Option<u8>,
    displayed: u8,
}

/// Holds at most one pending value; the render loop flushes it once per frame.
pub struct ProgressRelay {
    view: Arc<dyn View>,
    state: Mutex<RelayState>,
    wake: Notify,
}

impl ProgressRelay {
    pub fn new(view: Arc<dyn View>) -> Self {
        Self {
            view,
            state: Mutex::new(RelayState::default()),
            wake: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts accepting pushes for `request` and resets the indicator to 0.
    pub fn begin(&self, request: RequestId) {
        let mut state = self.state();
        state.accepting = Some(request);
        state.pending = None;
        state.displayed = 0;
        self.view.set_progress(0);
    }

    /// Queues a pushed value. Returns false when no request is running or the
    /// push is scoped to a different request.
    pub fn push(&self, update: &ProgressUpdate) -> bool {
        {
            let mut state = self.state();
            let Some(active) = state.accepting else {
                debug!(progress = update.progress, "progress push outside a running request");
                return false;
            };
            if update.request_id.is_some_and(|id| id != active) {
                debug!(
                    progress = update.progress,
                    active = %active,
                    "progress push for another request dropped"
                );
                return false;
            }
            state.pending = Some(update.percent());
        }
        self.wake.notify_one();
        true
    }

    /// Renders the pending value, if any.
    pub fn flush(&self) -> Option<u8> {
        let mut state = self.state();
        let percent = state.pending.take()?;
        state.displayed = percent;
        self.view.set_progress(percent);
        Some(percent)
    }

    /// Stops accepting pushes; a successful finish forces the indicator to 100.
    pub fn finish(&self, completed: bool) {
        let mut state = self.state();
        state.accepting = None;
        state.pending = None;
        if completed {
            state.displayed = 100;
            self.view.set_progress(100);
        }
    }

    pub fn displayed(&self) -> u8 {
        self.state().displayed
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            self.wake.notified().await;
            tokio::time::sleep(FRAME_INTERVAL).await;
            self.flush();
        }
    }
}
