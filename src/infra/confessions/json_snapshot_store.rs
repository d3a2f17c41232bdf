use crate::core::confessions::{PolicyError, SnapshotBackend, StateSnapshot};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// JSON snapshot file. The whole state lives in one document:
/// { "version": 1, "guilds": { guild_id: { config, records, stats, posts } } }
///
/// Writes go to a sibling temp file which is fsynced and then renamed over
/// the real one, so a crash mid-write leaves the previous snapshot intact.
/// A write whose future is dropped (timeout) never renames its temp file.
pub struct JsonSnapshotFile {
    path: PathBuf,
    attempts: AtomicU64,
}

impl JsonSnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Each attempt gets its own temp file so an abandoned writer can not
    /// clobber the next one.
    fn temp_path(&self, attempt: u64) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", attempt));
        self.path.with_file_name(name)
    }
}

/// Set once the caller stopped waiting for a write. Checked and acted on
/// under the same lock as the final rename.
#[derive(Default)]
struct Abandoned(Mutex<bool>);

/// Marks the attempt abandoned when the write future goes away.
struct AbandonOnDrop(Arc<Abandoned>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        *self.0 .0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

fn write_atomically(
    path: &Path,
    temp: &Path,
    bytes: &[u8],
    abandoned: &Abandoned,
) -> std::io::Result<()> {
    let result = write_and_commit(path, temp, bytes, abandoned);
    if result.is_err() {
        let _ = std::fs::remove_file(temp);
    }
    result
}

fn write_and_commit(
    path: &Path,
    temp: &Path,
    bytes: &[u8],
    abandoned: &Abandoned,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(temp)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    let abandoned = abandoned.0.lock().unwrap_or_else(PoisonError::into_inner);
    if *abandoned {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "write abandoned before commit",
        ));
    }
    std::fs::rename(temp, path)
}

#[async_trait]
impl SnapshotBackend for JsonSnapshotFile {
    async fn read(&self) -> Result<Option<StateSnapshot>, PolicyError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PolicyError::Persistence(e.to_string())),
        };
        let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            PolicyError::Persistence(format!("{} is not a valid snapshot: {}", self.path.display(), e))
        })?;
        Ok(Some(snapshot))
    }

    async fn write(&self, snapshot: &StateSnapshot) -> Result<(), PolicyError> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| PolicyError::Persistence(e.to_string()))?;
        let path = self.path.clone();
        let temp = self.temp_path(self.attempts.fetch_add(1, Ordering::Relaxed));

        let abandoned = Arc::new(Abandoned::default());
        let _abandon_on_drop = AbandonOnDrop(Arc::clone(&abandoned));

        tokio::task::spawn_blocking(move || write_atomically(&path, &temp, &bytes, &abandoned))
            .await
            .map_err(|e| PolicyError::Persistence(format!("writer task failed: {}", e)))?
            .map_err(|e| PolicyError::Persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::confessions::{PolicyStore, Pseudonymizer};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let file = JsonSnapshotFile::new(dir.path().join("state.json"));
        assert!(file.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let file = JsonSnapshotFile::new(path);
        assert!(matches!(file.read().await, Err(PolicyError::Persistence(_))));
    }

    #[tokio::test]
    async fn creates_parent_dirs_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let file = JsonSnapshotFile::new(path.clone());

        file.write(&StateSnapshot::default()).await.unwrap();
        file.write(&StateSnapshot::default()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[test]
    fn abandoned_write_is_not_renamed_into_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let abandoned = Abandoned::default();
        *abandoned.0.lock().unwrap() = true;

        let result = write_atomically(&path, &dir.path().join("state.json.0.tmp"), b"{}", &abandoned);

        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn timed_out_write_does_not_reach_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = PolicyStore::load(JsonSnapshotFile::new(path.clone()), Duration::from_secs(5))
                .await
                .unwrap();
            store.setup_community(1, 10, None).await.unwrap();
        }

        // Too short for any real disk write
        let store = PolicyStore::load(JsonSnapshotFile::new(path.clone()), Duration::from_nanos(1))
            .await
            .unwrap();
        let result = store
            .apply_config_mutation(1, |c| {
                c.cooldown_seconds = 777;
                Ok(())
            })
            .await;

        // Let any writer still running in the background finish
        tokio::time::sleep(Duration::from_millis(500)).await;

        let in_memory = store.get_config(1).await.unwrap().cooldown_seconds;
        let on_disk = JsonSnapshotFile::new(path.clone())
            .read()
            .await
            .unwrap()
            .unwrap()
            .guilds[&1]
            .config
            .cooldown_seconds;
        assert_eq!(on_disk, in_memory);
        if result.is_err() {
            assert_eq!(in_memory, 0);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let token = Pseudonymizer::new("secret").unwrap().token_for(42);

        {
            let store = PolicyStore::load(JsonSnapshotFile::new(path.clone()), Duration::from_secs(5))
                .await
                .unwrap();
            store.setup_community(1, 10, Some(20)).await.unwrap();
            store
                .apply_config_mutation(1, |c| {
                    c.cooldown_seconds = 90;
                    c.banned_words.push("xyz".to_string());
                    Ok(())
                })
                .await
                .unwrap();
            store.add_to_banner(1, &token).await.unwrap();
        }

        let store = PolicyStore::load(JsonSnapshotFile::new(path.clone()), Duration::from_secs(5))
            .await
            .unwrap();
        let config = store.get_config(1).await.unwrap();
        assert_eq!(config.cooldown_seconds, 90);
        assert_eq!(config.banned_words, vec!["xyz".to_string()]);
        assert_eq!(config.mod_channel_id, Some(20));
        assert!(store.is_banned(1, &token).await.unwrap());

        // The raw id never reaches the file
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("\"42\""));
        assert!(raw.contains(token.as_str()));
    }
}
