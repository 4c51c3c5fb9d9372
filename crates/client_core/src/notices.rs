//! Transient user notices with a fixed lifetime.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use shared::domain::{NoticeId, Severity};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, warn};

use crate::{types::Notice, view::View};

pub const NOTICE_TTL: Duration = Duration::from_millis(3000);

#[derive(Default)]
struct NoticeState {
    // newest first
    active: Vec<Notice>,
    timers: HashMap<NoticeId, JoinHandle<()>>,
}

pub struct NoticeBoard {
    view: Arc<dyn View>,
    runtime: Option<Handle>,
    next_id: AtomicU64,
    state: Arc<Mutex<NoticeState>>,
}

fn lock(state: &Mutex<NoticeState>) -> MutexGuard<'_, NoticeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NoticeBoard {
    /// Expiry timers run on `runtime`; without one, on the runtime of the caller.
    pub fn new(view: Arc<dyn View>, runtime: Option<Handle>) -> Self {
        Self {
            view,
            runtime,
            next_id: AtomicU64::new(1),
            state: Arc::new(Mutex::new(NoticeState::default())),
        }
    }

    /// Shows a notice and schedules its removal after [`NOTICE_TTL`].
    ///
    /// Callable from any thread. With no runtime to host the timer the notice
    /// stays until [`NoticeBoard::clear`].
    pub fn show(&self, text: impl Into<String>, severity: Severity) -> NoticeId {
        let notice = Notice {
            id: NoticeId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            text: text.into(),
            severity,
        };
        let id = notice.id;
        debug!(notice_id = %id, severity = severity.as_str(), text = %notice.text, "notice shown");

        let mut guard = lock(&self.state);
        self.view.show_notice(&notice);
        guard.active.insert(0, notice);

        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            warn!(notice_id = %id, "no tokio runtime available, notice will not expire");
            return id;
        };
        let view = Arc::clone(&self.view);
        let state = Arc::clone(&self.state);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(NOTICE_TTL).await;
            let mut guard = lock(&state);
            guard.active.retain(|n| n.id != id);
            guard.timers.remove(&id);
            view.remove_notice(id);
        });
        guard.timers.insert(id, timer);
        id
    }

    pub fn active(&self) -> Vec<Notice> {
        lock(&self.state).active.clone()
    }

    /// Drops every live notice and its pending timer.
    pub fn clear(&self) {
        let mut guard = lock(&self.state);
        for (_, timer) in guard.timers.drain() {
            timer.abort();
        }
        for notice in guard.active.drain(..) {
            self.view.remove_notice(notice.id);
        }
    }
}

impl Drop for NoticeBoard {
    fn drop(&mut self) {
        for (_, timer) in lock(&self.state).timers.drain() {
            timer.abort();
        }
    }
}
