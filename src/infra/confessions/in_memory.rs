// In-memory snapshot backend.
//
// Keeps the last written snapshot in a Mutex instead of on disk. Used by the
// core tests, which can also make writes fail or stall to check that the
// store keeps its committed state when persistence goes wrong.

use crate::core::confessions::{PolicyError, SnapshotBackend, StateSnapshot};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct InMemorySnapshotBackend {
    stored: Mutex<Option<StateSnapshot>>,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
    writes: AtomicUsize,
}

impl InMemorySnapshotBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot, as if one was already on disk.
    pub fn preload(&self, snapshot: StateSnapshot) {
        if let Ok(mut stored) = self.stored.lock() {
            *stored = Some(snapshot);
        }
    }

    /// Last successfully written snapshot.
    pub fn stored(&self) -> Option<StateSnapshot> {
        self.stored.lock().ok().and_then(|s| s.clone())
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        if let Ok(mut d) = self.write_delay.lock() {
            *d = delay;
        }
    }
}

#[async_trait]
impl SnapshotBackend for InMemorySnapshotBackend {
    async fn read(&self) -> Result<Option<StateSnapshot>, PolicyError> {
        Ok(self.stored())
    }

    async fn write(&self, snapshot: &StateSnapshot) -> Result<(), PolicyError> {
        let delay = self.write_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PolicyError::Persistence(
                "simulated write failure".to_string(),
            ));
        }

        let mut stored = self
            .stored
            .lock()
            .map_err(|_| PolicyError::Persistence("snapshot lock poisoned".to_string()))?;
        *stored = Some(snapshot.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
