use super::CounterStore;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const STORE_LOCK_TIMEOUT_SECS: u64 = 10;
const STORE_LOCK_RETRY_MS: u64 = 25;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    /// Unix seconds
    expires_at: i64,
}

/// JSON file shared by every process of one run. Each access takes an fs2
/// lock on a sibling `.lock` file, and writes go through a temp file + rename.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    default_ttl: Duration,
}

struct StoreLock {
    file: std::fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileStore {
    pub fn open(path: &Path, default_ttl: Duration) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock_path: path.with_extension("lock"),
            default_ttl,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<StoreLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(STORE_LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for store lock ({}s)",
                            STORE_LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(STORE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }

    fn read_entries(&self) -> HashMap<String, Entry> {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "counter store unreadable, starting empty: {}", err);
                HashMap::new()
            }
        }
    }
}

impl CounterStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _lock = self.lock(false)?;
        let now = chrono::Utc::now().timestamp();
        Ok(self
            .read_entries()
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let now = chrono::Utc::now().timestamp();
        let mut entries = self.read_entries();
        entries.retain(|_, e| e.expires_at > now);
        let ttl = ttl.unwrap_or(self.default_ttl).as_secs() as i64;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl.max(1),
            },
        );
        write_atomic(&self.path, &serde_json::to_string_pretty(&entries)?)
    }
}

fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{fold_tokens, keys};
    use tempfile::tempdir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/counters.json");

        let store = FileStore::open(&path, Duration::from_secs(60)).unwrap();
        store.set(keys::FUNCTION_NAME, "sqlite3VdbeExec", None).unwrap();
        drop(store);

        let reopened = FileStore::open(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(
            reopened.get(keys::FUNCTION_NAME).unwrap().as_deref(),
            Some("sqlite3VdbeExec")
        );
    }

    #[test]
    fn test_two_handles_share_counters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.json");
        let parent = FileStore::open(&path, Duration::from_secs(60)).unwrap();
        let child = FileStore::open(&path, Duration::from_secs(60)).unwrap();

        child.add_f64(keys::TOKEN_COUNT, 40.0).unwrap();
        child.add_f64(keys::TOKEN_COUNT, 2.5).unwrap();
        let spent = fold_tokens(&parent, keys::TESTCASE_TOKEN).unwrap();

        assert_eq!(spent, 42.5);
        assert_eq!(child.get_f64(keys::TESTCASE_TOKEN), 42.5);
    }

    #[test]
    fn test_corrupt_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.json");
        fs::write(&path, "{not json").unwrap();
        let store = FileStore::open(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(store.get_or_zero(keys::POC_TIME), "0");
        store.set(keys::POC_TIME, "1.5", None).unwrap();
        assert_eq!(store.get_f64(keys::POC_TIME), 1.5);
    }
}
