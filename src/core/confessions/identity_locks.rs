// Per-identity mutual exclusion.
//
// Two submissions from the same token must not both observe an "allowed"
// cooldown before either writes back, so the whole check-then-record sequence
// runs under a lock keyed by (guild, token). Different identities never wait
// on each other. Entries are dropped again once nobody holds or waits on them.

use super::confession_models::IdentityToken;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockKey = (u64, IdentityToken);

#[derive(Default)]
pub struct IdentityLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Held while one identity's submission is being processed.
pub struct IdentityGuard<'a> {
    owner: &'a IdentityLocks,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, guild_id: u64, token: &IdentityToken) -> IdentityGuard<'_> {
        let key = (guild_id, token.clone());
        // Clone the Arc out so the DashMap shard lock is released before awaiting
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        IdentityGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of identities currently holding or waiting for a lock.
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex first so the strong count below only reflects
        // the map entry plus any waiters.
        self.guard.take();
        self.owner
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn token(c: char) -> IdentityToken {
        IdentityToken::from_hex(std::iter::repeat(c).take(64).collect())
    }

    #[tokio::test]
    async fn entries_are_collected_when_idle() {
        let locks = IdentityLocks::new();
        {
            let _guard = locks.acquire(1, &token('a')).await;
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn same_identity_is_serialized() {
        let locks = Arc::new(IdentityLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(1, &token('a')).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_identities_do_not_block() {
        let locks = IdentityLocks::new();
        let _a = locks.acquire(1, &token('a')).await;
        // Would deadlock if the lock were global
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(1, &token('b')))
            .await
            .expect("different identity should not wait");
        assert_eq!(locks.active(), 2);
    }
}
