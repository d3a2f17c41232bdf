// Policy store - the single in-memory source of truth for guild policy and
// runtime counters, backed by a durable snapshot.
//
// Every mutation follows the same sequence under one write gate:
//   clone committed snapshot -> apply change -> persist full snapshot -> swap in
// If any step fails, the committed snapshot is untouched, so readers only
// ever see the last state that actually made it to disk. A write that times
// out may still land later, so the committed snapshot is written again before
// the gate is released.

use super::confession_models::{
    GuildState, GuildStats, IdentityToken, PolicyConfig, PostRecord, StateSnapshot,
    StatsSnapshot, SubmissionRecord, SNAPSHOT_VERSION,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Lower bound for rewriting the committed snapshot after a timed-out write.
const MIN_RESTORE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum PolicyError {
    /// Durable storage failed or timed out. Nothing was changed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Guild {0} has not been set up")]
    NotFound(u64),

    #[error("Invalid input: {0}")]
    Validation(String),
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

/// Durable home of the full state snapshot.
///
/// Implementations must make `write` atomic: after a failed or interrupted
/// write, `read` still returns the previous snapshot.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Returns `None` if nothing has been persisted yet.
    async fn read(&self) -> Result<Option<StateSnapshot>, PolicyError>;

    async fn write(&self, snapshot: &StateSnapshot) -> Result<(), PolicyError>;
}

#[async_trait]
impl<T: SnapshotBackend + ?Sized> SnapshotBackend for std::sync::Arc<T> {
    async fn read(&self) -> Result<Option<StateSnapshot>, PolicyError> {
        (**self).read().await
    }

    async fn write(&self, snapshot: &StateSnapshot) -> Result<(), PolicyError> {
        (**self).write(snapshot).await
    }
}

// ============================================================================
// STORE
// ============================================================================

pub struct PolicyStore<B: SnapshotBackend> {
    backend: B,
    /// Last committed snapshot
    state: RwLock<StateSnapshot>,
    /// Serializes read-modify-persist sequences
    write_gate: Mutex<()>,
    persist_timeout: Duration,
}

impl<B: SnapshotBackend> PolicyStore<B> {
    /// Load persisted state, or start empty and write an initial snapshot.
    pub async fn load(backend: B, persist_timeout: Duration) -> Result<Self, PolicyError> {
        let existing = backend.read().await?;
        let fresh = existing.is_none();
        let snapshot = existing.unwrap_or_default();
        let guilds = snapshot.guilds.len();

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(PolicyError::Persistence(format!(
                "snapshot version {} is newer than supported version {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let store = Self {
            backend,
            state: RwLock::new(snapshot),
            write_gate: Mutex::new(()),
            persist_timeout,
        };

        if fresh {
            let initial = store.state.read().await.clone();
            store.persist(&initial).await?;
            tracing::info!("Created new confession state snapshot");
        } else {
            tracing::info!(guilds, "Loaded confession state snapshot");
        }

        Ok(store)
    }

    async fn persist(&self, snapshot: &StateSnapshot) -> Result<(), PolicyError> {
        self.persist_within(snapshot, self.persist_timeout).await
    }

    async fn persist_within(
        &self,
        snapshot: &StateSnapshot,
        limit: Duration,
    ) -> Result<(), PolicyError> {
        match tokio::time::timeout(limit, self.backend.write(snapshot)).await {
            Ok(result) => result,
            Err(_) => Err(PolicyError::Persistence(format!(
                "write timed out after {:?}",
                limit
            ))),
        }
    }

    /// Apply `change` to a copy of the committed snapshot, persist it, and
    /// only then make it visible.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut StateSnapshot) -> Result<T, PolicyError>,
    ) -> Result<T, PolicyError> {
        let _gate = self.write_gate.lock().await;
        let mut next = self.state.read().await.clone();

        let output = change(&mut next)?;

        match tokio::time::timeout(self.persist_timeout, self.backend.write(&next)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Failed to persist confession state: {}", e);
                return Err(e);
            }
            Err(_) => {
                // The abandoned write may still have reached the disk. Put
                // the committed snapshot back before anyone else can write.
                let committed = self.state.read().await.clone();
                let limit = self.persist_timeout.max(MIN_RESTORE_TIMEOUT);
                if let Err(e) = self.persist_within(&committed, limit).await {
                    tracing::error!("Failed to restore committed confession state: {}", e);
                }
                let e = PolicyError::Persistence(format!(
                    "write timed out after {:?}",
                    self.persist_timeout
                ));
                tracing::error!("Failed to persist confession state: {}", e);
                return Err(e);
            }
        }
        *self.state.write().await = next;
        Ok(output)
    }

    /// Atomically update one guild's state.
    pub async fn update_guild<T>(
        &self,
        guild_id: u64,
        change: impl FnOnce(&mut GuildState) -> Result<T, PolicyError>,
    ) -> Result<T, PolicyError> {
        self.commit(|snapshot| {
            let guild = snapshot
                .guilds
                .get_mut(&guild_id)
                .ok_or(PolicyError::NotFound(guild_id))?;
            change(guild)
        })
        .await
    }

    async fn read_guild<T>(
        &self,
        guild_id: u64,
        view: impl FnOnce(&GuildState) -> T,
    ) -> Result<T, PolicyError> {
        let state = self.state.read().await;
        state
            .guilds
            .get(&guild_id)
            .map(view)
            .ok_or(PolicyError::NotFound(guild_id))
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Create the guild's config on first setup, or update its channels.
    pub async fn setup_community(
        &self,
        guild_id: u64,
        target_channel_id: u64,
        mod_channel_id: Option<u64>,
    ) -> Result<PolicyConfig, PolicyError> {
        self.commit(|snapshot| {
            let now = Utc::now();
            let guild = snapshot
                .guilds
                .entry(guild_id)
                .or_insert_with(|| GuildState::new(PolicyConfig::new(guild_id, now)));
            guild.config.target_channel_id = Some(target_channel_id);
            if mod_channel_id.is_some() {
                guild.config.mod_channel_id = mod_channel_id;
            }
            guild.config.updated_at = now;
            Ok(guild.config.clone())
        })
        .await
    }

    pub async fn get_config(&self, guild_id: u64) -> Result<PolicyConfig, PolicyError> {
        self.read_guild(guild_id, |g| g.config.clone()).await
    }

    /// Apply a config change and persist it before returning the new config.
    ///
    /// If `mutation` returns an error nothing is written.
    pub async fn apply_config_mutation(
        &self,
        guild_id: u64,
        mutation: impl FnOnce(&mut PolicyConfig) -> Result<(), PolicyError>,
    ) -> Result<PolicyConfig, PolicyError> {
        self.update_guild(guild_id, |guild| {
            mutation(&mut guild.config)?;
            guild.config.updated_at = Utc::now();
            Ok(guild.config.clone())
        })
        .await
    }

    pub async fn reset_community(&self, guild_id: u64) -> Result<(), PolicyError> {
        self.commit(|snapshot| {
            snapshot
                .guilds
                .remove(&guild_id)
                .map(|_| ())
                .ok_or(PolicyError::NotFound(guild_id))
        })
        .await
    }

    pub async fn list_guilds(&self) -> Vec<u64> {
        self.state.read().await.guilds.keys().copied().collect()
    }

    // ------------------------------------------------------------------------
    // Bans
    // ------------------------------------------------------------------------

    pub async fn is_banned(&self, guild_id: u64, token: &IdentityToken) -> Result<bool, PolicyError> {
        self.read_guild(guild_id, |g| g.config.banner_list.contains(token))
            .await
    }

    /// Returns `false` if the token was already banned.
    pub async fn add_to_banner(
        &self,
        guild_id: u64,
        token: &IdentityToken,
    ) -> Result<bool, PolicyError> {
        let mut added = false;
        self.apply_config_mutation(guild_id, |config| {
            added = config.banner_list.insert(token.clone());
            Ok(())
        })
        .await?;
        Ok(added)
    }

    /// Returns `false` if the token was not banned.
    pub async fn remove_from_banner(
        &self,
        guild_id: u64,
        token: &IdentityToken,
    ) -> Result<bool, PolicyError> {
        let mut removed = false;
        self.apply_config_mutation(guild_id, |config| {
            removed = config.banner_list.remove(token);
            Ok(())
        })
        .await?;
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Submission records
    // ------------------------------------------------------------------------

    /// Read-only lookup; a token that never submitted gets an empty record.
    pub async fn submission_record(
        &self,
        guild_id: u64,
        token: &IdentityToken,
    ) -> Result<SubmissionRecord, PolicyError> {
        self.read_guild(guild_id, |g| {
            g.records
                .get(token)
                .cloned()
                .unwrap_or_else(|| SubmissionRecord::new(token.clone()))
        })
        .await
    }

    pub async fn get_or_create_submission_record(
        &self,
        guild_id: u64,
        token: &IdentityToken,
    ) -> Result<SubmissionRecord, PolicyError> {
        let existing = self
            .read_guild(guild_id, |g| g.records.get(token).cloned())
            .await?;
        if let Some(record) = existing {
            return Ok(record);
        }
        self.update_guild(guild_id, |guild| Ok(guild.record_mut(token).clone()))
            .await
    }

    /// Stamp a new submission time and bump counters.
    pub async fn record_submission(
        &self,
        guild_id: u64,
        token: &IdentityToken,
        at: DateTime<Utc>,
        flagged: bool,
    ) -> Result<SubmissionRecord, PolicyError> {
        self.update_guild(guild_id, |guild| {
            Ok(apply_submission(guild, token, at, flagged).clone())
        })
        .await
    }

    /// Count an attempt that was refused outright. The cooldown window is
    /// left alone.
    pub async fn record_flagged_attempt(
        &self,
        guild_id: u64,
        token: &IdentityToken,
    ) -> Result<SubmissionRecord, PolicyError> {
        self.update_guild(guild_id, |guild| Ok(apply_flagged_attempt(guild, token).clone()))
            .await
    }

    /// Reset the cooldown window for one token, or for everyone in the guild.
    /// Returns how many records were touched.
    pub async fn clear_cooldowns(
        &self,
        guild_id: u64,
        token: Option<&IdentityToken>,
    ) -> Result<usize, PolicyError> {
        self.update_guild(guild_id, |guild| {
            let mut cleared = 0;
            for record in guild.records.values_mut() {
                if token.map_or(true, |t| *t == record.identity_token)
                    && record.last_submission_at.take().is_some()
                {
                    cleared += 1;
                }
            }
            Ok(cleared)
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Posts and stats
    // ------------------------------------------------------------------------

    pub async fn record_post(
        &self,
        guild_id: u64,
        message_id: u64,
        post: PostRecord,
    ) -> Result<(), PolicyError> {
        self.update_guild(guild_id, |guild| {
            guild.posts.insert(message_id, post);
            Ok(())
        })
        .await
    }

    pub async fn author_of_post(
        &self,
        guild_id: u64,
        message_id: u64,
    ) -> Result<Option<IdentityToken>, PolicyError> {
        self.read_guild(guild_id, |g| {
            g.posts.get(&message_id).map(|p| p.identity_token.clone())
        })
        .await
    }

    pub async fn post_record(
        &self,
        guild_id: u64,
        message_id: u64,
    ) -> Result<Option<PostRecord>, PolicyError> {
        self.read_guild(guild_id, |g| g.posts.get(&message_id).cloned())
            .await
    }

    pub async fn bump_stats(
        &self,
        guild_id: u64,
        bump: impl FnOnce(&mut GuildStats),
    ) -> Result<GuildStats, PolicyError> {
        self.update_guild(guild_id, |guild| {
            bump(&mut guild.stats);
            Ok(guild.stats.clone())
        })
        .await
    }

    pub async fn stats_snapshot(&self, guild_id: u64) -> Result<StatsSnapshot, PolicyError> {
        self.read_guild(guild_id, |g| StatsSnapshot {
            stats: g.stats.clone(),
            tracked_identities: g.records.len(),
            banned_identities: g.config.banner_list.len(),
            flagged_identities: g.records.values().filter(|r| r.flagged_count > 0).count(),
            banned_words: g.config.banned_words.len(),
        })
        .await
    }

    /// Copy of the last committed snapshot.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.state.read().await.clone()
    }
}

/// Stamp a submission onto a guild's record for `token`.
pub(crate) fn apply_submission<'a>(
    guild: &'a mut GuildState,
    token: &IdentityToken,
    at: DateTime<Utc>,
    flagged: bool,
) -> &'a SubmissionRecord {
    let record = guild.record_mut(token);
    record.last_submission_at = Some(at);
    record.total_submissions += 1;
    if flagged {
        record.flagged_count += 1;
    }
    record
}

/// Count a refused attempt without touching the cooldown window.
pub(crate) fn apply_flagged_attempt<'a>(
    guild: &'a mut GuildState,
    token: &IdentityToken,
) -> &'a SubmissionRecord {
    let record = guild.record_mut(token);
    record.total_submissions += 1;
    record.flagged_count += 1;
    record
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::confessions::InMemorySnapshotBackend;
    use std::sync::Arc;

    fn token(c: char) -> IdentityToken {
        IdentityToken::from_hex(std::iter::repeat(c).take(64).collect())
    }

    async fn store_with_guild() -> (PolicyStore<Arc<InMemorySnapshotBackend>>, Arc<InMemorySnapshotBackend>) {
        let backend = Arc::new(InMemorySnapshotBackend::new());
        let store = PolicyStore::load(Arc::clone(&backend), Duration::from_secs(1))
            .await
            .unwrap();
        store.setup_community(1, 100, Some(200)).await.unwrap();
        (store, backend)
    }

    #[tokio::test]
    async fn load_writes_initial_snapshot() {
        let backend = Arc::new(InMemorySnapshotBackend::new());
        let _store = PolicyStore::load(Arc::clone(&backend), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(backend.write_count(), 1);
        assert_eq!(backend.stored(), Some(StateSnapshot::default()));
    }

    #[tokio::test]
    async fn unconfigured_guild_is_not_found() {
        let (store, _) = store_with_guild().await;
        assert!(matches!(store.get_config(99).await, Err(PolicyError::NotFound(99))));
        assert!(matches!(
            store.apply_config_mutation(99, |_| Ok(())).await,
            Err(PolicyError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn setup_uses_defaults() {
        let (store, _) = store_with_guild().await;
        let config = store.get_config(1).await.unwrap();

        assert_eq!(config.target_channel_id, Some(100));
        assert_eq!(config.mod_channel_id, Some(200));
        assert_eq!(config.cooldown_seconds, 0);
        assert!(config.banned_words.is_empty());
        assert!(!config.auto_delete_enabled);
        assert!(!config.crisis_response_enabled);
    }

    #[tokio::test]
    async fn mutation_is_persisted_before_returning() {
        let (store, backend) = store_with_guild().await;
        let updated = store
            .apply_config_mutation(1, |c| {
                c.cooldown_seconds = 60;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(updated.cooldown_seconds, 60);
        let on_disk = backend.stored().unwrap();
        assert_eq!(on_disk.guilds[&1].config, updated);
        assert_eq!(on_disk, store.snapshot().await);
    }

    #[tokio::test]
    async fn failed_mutation_closure_writes_nothing() {
        let (store, backend) = store_with_guild().await;
        let writes_before = backend.write_count();

        let result = store
            .apply_config_mutation(1, |c| {
                c.cooldown_seconds = 999;
                Err(PolicyError::Validation("nope".to_string()))
            })
            .await;

        assert!(matches!(result, Err(PolicyError::Validation(_))));
        assert_eq!(backend.write_count(), writes_before);
        assert_eq!(store.get_config(1).await.unwrap().cooldown_seconds, 0);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_state() {
        let (store, backend) = store_with_guild().await;
        let before = store.snapshot().await;

        backend.set_fail_writes(true);
        let result = store.add_to_banner(1, &token('a')).await;
        assert!(matches!(result, Err(PolicyError::Persistence(_))));

        assert_eq!(store.snapshot().await, before);
        assert!(!store.is_banned(1, &token('a')).await.unwrap());

        // Recovers on the next successful write
        backend.set_fail_writes(false);
        assert!(store.add_to_banner(1, &token('a')).await.unwrap());
        assert!(store.is_banned(1, &token('a')).await.unwrap());
    }

    #[tokio::test]
    async fn slow_write_times_out() {
        let backend = Arc::new(InMemorySnapshotBackend::new());
        let store = PolicyStore::load(Arc::clone(&backend), Duration::from_millis(50))
            .await
            .unwrap();
        store.setup_community(1, 100, None).await.unwrap();

        backend.set_write_delay(Some(Duration::from_millis(500)));
        let result = store.record_submission(1, &token('a'), Utc::now(), false).await;

        assert!(matches!(result, Err(PolicyError::Persistence(_))));
        assert_eq!(
            store.submission_record(1, &token('a')).await.unwrap().total_submissions,
            0
        );
        // What is stored matches what the store reports
        assert_eq!(backend.stored(), Some(store.snapshot().await));
    }

    #[tokio::test]
    async fn ban_list_add_and_remove() {
        let (store, _) = store_with_guild().await;

        assert!(store.add_to_banner(1, &token('a')).await.unwrap());
        assert!(!store.add_to_banner(1, &token('a')).await.unwrap());
        assert!(store.is_banned(1, &token('a')).await.unwrap());
        assert!(!store.is_banned(1, &token('b')).await.unwrap());

        assert!(store.remove_from_banner(1, &token('a')).await.unwrap());
        assert!(!store.remove_from_banner(1, &token('a')).await.unwrap());
        assert!(!store.is_banned(1, &token('a')).await.unwrap());
    }

    #[tokio::test]
    async fn get_or_create_record_is_lazy_and_stable() {
        let (store, backend) = store_with_guild().await;
        let writes_before = backend.write_count();

        let created = store.get_or_create_submission_record(1, &token('a')).await.unwrap();
        assert_eq!(created.total_submissions, 0);
        assert_eq!(created.last_submission_at, None);
        assert_eq!(backend.write_count(), writes_before + 1);

        let again = store.get_or_create_submission_record(1, &token('a')).await.unwrap();
        assert_eq!(again, created);
        assert_eq!(backend.write_count(), writes_before + 1);
    }

    #[tokio::test]
    async fn record_submission_updates_counters() {
        let (store, _) = store_with_guild().await;
        let t0 = Utc::now();

        store.record_submission(1, &token('a'), t0, false).await.unwrap();
        let record = store.record_submission(1, &token('a'), t0, true).await.unwrap();

        assert_eq!(record.total_submissions, 2);
        assert_eq!(record.flagged_count, 1);
        assert_eq!(record.last_submission_at, Some(t0));
    }

    #[tokio::test]
    async fn flagged_attempt_leaves_timestamp_alone() {
        let (store, _) = store_with_guild().await;
        let record = store.record_flagged_attempt(1, &token('a')).await.unwrap();

        assert_eq!(record.total_submissions, 1);
        assert_eq!(record.flagged_count, 1);
        assert_eq!(record.last_submission_at, None);
    }

    #[tokio::test]
    async fn clear_cooldowns_for_one_or_all() {
        let (store, _) = store_with_guild().await;
        let now = Utc::now();
        store.record_submission(1, &token('a'), now, false).await.unwrap();
        store.record_submission(1, &token('b'), now, false).await.unwrap();

        assert_eq!(store.clear_cooldowns(1, Some(&token('a'))).await.unwrap(), 1);
        assert_eq!(
            store.submission_record(1, &token('a')).await.unwrap().last_submission_at,
            None
        );
        assert_eq!(store.clear_cooldowns(1, None).await.unwrap(), 1);
        assert_eq!(store.clear_cooldowns(1, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn posts_map_to_author_tokens() {
        let (store, _) = store_with_guild().await;
        store
            .record_post(
                1,
                555,
                PostRecord {
                    identity_token: token('c'),
                    posted_at: Utc::now(),
                    channel_id: Some(100),
                    replies_allowed: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(store.author_of_post(1, 555).await.unwrap(), Some(token('c')));
        assert_eq!(store.author_of_post(1, 556).await.unwrap(), None);
        assert!(!store.post_record(1, 555).await.unwrap().unwrap().replies_allowed);
        assert!(store.post_record(1, 556).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_removes_guild() {
        let (store, _) = store_with_guild().await;
        store.reset_community(1).await.unwrap();

        assert!(matches!(store.get_config(1).await, Err(PolicyError::NotFound(1))));
        assert!(matches!(store.reset_community(1).await, Err(PolicyError::NotFound(1))));
        assert!(store.list_guilds().await.is_empty());
    }

    #[tokio::test]
    async fn stats_snapshot_counts() {
        let (store, _) = store_with_guild().await;
        store.record_submission(1, &token('a'), Utc::now(), true).await.unwrap();
        store.record_submission(1, &token('b'), Utc::now(), false).await.unwrap();
        store.add_to_banner(1, &token('a')).await.unwrap();
        store.bump_stats(1, |s| s.confessions += 2).await.unwrap();

        let snapshot = store.stats_snapshot(1).await.unwrap();
        assert_eq!(snapshot.stats.confessions, 2);
        assert_eq!(snapshot.tracked_identities, 2);
        assert_eq!(snapshot.flagged_identities, 1);
        assert_eq!(snapshot.banned_identities, 1);
    }

    #[tokio::test]
    async fn newer_snapshot_version_is_refused() {
        let backend = Arc::new(InMemorySnapshotBackend::new());
        backend.preload(StateSnapshot {
            version: SNAPSHOT_VERSION + 1,
            ..Default::default()
        });

        let result = PolicyStore::load(backend, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PolicyError::Persistence(_))));
    }
}
