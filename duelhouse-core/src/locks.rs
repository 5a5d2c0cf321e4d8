use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Keyed per-session mutexes. Every mutation of a session, its world state
/// or its settlement goes through the session's lock; sessions never share
/// one, so unrelated matches proceed in parallel.
#[derive(Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the lock for a session, creating it on first use. Callers
    /// hold the returned Arc and `.lock().await` it outside this registry.
    pub fn acquire(&self, session_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut inner = self.inner.lock();
        inner
            .entry(session_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Retires a session's lock once no caller holds it. The strong-count
    /// check runs under the registry mutex, and `acquire` clones under the
    /// same mutex, so a lock observed at count 1 here cannot gain a holder
    /// before removal. A busy lock stays registered; the last caller to
    /// finish releases it.
    pub fn release(&self, session_id: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(lock) = inner.get(&session_id) {
            if Arc::strong_count(lock) == 1 {
                inner.remove(&session_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
