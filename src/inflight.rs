//! Process-local in-flight markers.
//!
//! Deduplicates background revalidation and precomputation per key. The
//! check-and-insert is a single atomic operation on the underlying map
//! entry, so concurrent callers cannot both start work for the same key.
//! Each marker carries a completion channel, letting tests and shutdown
//! await pending background work instead of sleeping.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

/// Registry of keys with background work in progress.
#[derive(Debug, Default)]
pub struct InFlight {
    tasks: Arc<DashMap<String, watch::Receiver<bool>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim `key`. Returns a guard when no work is in flight for
    /// it; `None` when another caller already holds the claim.
    ///
    /// The claim is released (and waiters woken) when the guard drops,
    /// whether the work succeeded, failed, or panicked.
    pub fn begin(&self, key: &str) -> Option<InFlightGuard> {
        match self.tasks.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(false);
                vacant.insert(rx);
                Some(InFlightGuard {
                    key: key.to_string(),
                    tasks: Arc::clone(&self.tasks),
                    done: tx,
                })
            }
        }
    }

    /// Whether work is currently in flight for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait until the work in flight for `key` (if any) completes.
    pub async fn wait(&self, key: &str) {
        let Some(mut rx) = self.tasks.get(key).map(|entry| entry.value().clone()) else {
            return;
        };
        // An Err means the guard dropped without sending, which is also
        // completion.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until every currently registered key completes. Work that
    /// begins after the snapshot is not awaited.
    pub async fn wait_all(&self) {
        let keys: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.wait(&key).await;
        }
    }
}

/// Claim on a key, released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    key: String,
    tasks: Arc<DashMap<String, watch::Receiver<bool>>>,
    done: watch::Sender<bool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tasks.remove(&self.key);
        let _ = self.done.send(true);
    }
}
