//! Locally held result artifacts addressed by `blob:` URLs.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

const BLOB_SCHEME: &str = "blob:";

#[derive(Default)]
pub struct BlobRegistry {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Bytes>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `content` and returns the URL that resolves to it until revoked.
    pub fn create_url(&self, content: Bytes) -> String {
        let url = format!("{BLOB_SCHEME}{}", Uuid::new_v4());
        debug!(%url, size = content.len(), "blob url created");
        self.entries().insert(url.clone(), content);
        url
    }

    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        self.entries().get(url).cloned()
    }

    /// Returns whether the URL was still live.
    pub fn revoke(&self, url: &str) -> bool {
        let removed = self.entries().remove(url).is_some();
        if removed {
            debug!(%url, "blob url revoked");
        }
        removed
    }

    pub fn revoke_all(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn live_count(&self) -> usize {
        self.entries().len()
    }
}
