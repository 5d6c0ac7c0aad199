//! Same-key coalescing of in-flight operations.
//!
//! Concurrent callers that ask for the same logical operation (same key) share one
//! execution and one settlement: the first caller's future is stored as a shared
//! future under the key before anything is awaited, joiners clone it, and the entry is
//! removed the instant the shared future settles — success or failure alike. A failed
//! call therefore never wedges its key; the next caller simply starts a fresh
//! execution.
//!
//! Entries carry a generation id so a caller finishing late cannot evict a newer
//! entry that reused its key.
//!
//! No retry or rate-limit logic lives here; this is a pure coalescing layer in front
//! of whatever the operation does.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

type SharedOutcome<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct Entry<T: Clone, E: Clone> {
    id: u64,
    future: SharedOutcome<T, E>,
}

/// Coalesces concurrent same-key calls into one in-flight execution.
pub struct Deduplicator<T: Clone, E: Clone = crate::error::ApiError> {
    entries: Mutex<HashMap<String, Entry<T, E>>>,
    next_id: AtomicU64,
}

impl<T: Clone, E: Clone> Default for Deduplicator<T, E> {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()), next_id: AtomicU64::new(0) }
    }
}

impl<T, E> Deduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` under `key`, or join the execution already in flight for it.
    ///
    /// Every caller — the one that started the execution and every joiner — receives
    /// the identical result or the identical error.
    pub async fn run<F, Fut>(&self, key: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (id, shared) = {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(key) {
                tracing::debug!(key, "joining in-flight request");
                (entry.id, entry.future.clone())
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let shared = operation().boxed().shared();
                entries.insert(key.to_string(), Entry { id, future: shared.clone() });
                (id, shared)
            }
        };

        let result = shared.await;

        // Unconditional cleanup: whichever caller observes the settlement first removes
        // the entry. The id check keeps a stale settlement from evicting a newer entry
        // under the same key.
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).map(|entry| entry.id) == Some(id) {
            entries.remove(key);
        }
        drop(entries);

        result
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
