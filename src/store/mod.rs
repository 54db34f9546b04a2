//! Cross-process key/value store for shared counters and small pieces of
//! discovery state (the function under analysis, the sink code, the winning
//! testcase context).
//!
//! Reads of missing keys yield `"0"` through [`CounterStore::get_or_zero`],
//! so counters can be folded without first being initialised.

mod file;

pub use file::FileStore;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Well-known keys.
pub mod keys {
    /// Tokens spent by whichever process is currently running
    pub const TOKEN_COUNT: &str = "TokenCount";
    pub const PATH_AGENT_TOKEN: &str = "PathAgentToken";
    pub const TESTCASE_TOKEN: &str = "TestcaseToken";
    pub const TESTCASE_TIME: &str = "TestcaseTime";
    pub const POC_TOKEN: &str = "PocToken";
    pub const POC_TIME: &str = "PocTime";
    pub const FUNCTION_NAME: &str = "FunctionName";
    pub const SINK_CODE: &str = "SinkCode";
    pub const SUCCESS_CALL: &str = "SuccessCall";

    /// Every counter reset at the start of a vulnerability record.
    pub const SESSION_COUNTERS: &[&str] = &[
        TOKEN_COUNT,
        PATH_AGENT_TOKEN,
        TESTCASE_TOKEN,
        POC_TOKEN,
        TESTCASE_TIME,
        POC_TIME,
    ];
}

pub trait CounterStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Store `value`; `ttl` of `None` uses the store's default expiry.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()>;

    fn get_or_zero(&self, key: &str) -> String {
        match self.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => "0".to_string(),
            Err(err) => {
                tracing::warn!(key, "counter store read failed: {}", err);
                "0".to_string()
            }
        }
    }

    fn get_f64(&self, key: &str) -> f64 {
        self.get_or_zero(key).trim().parse::<f64>().unwrap_or(0.0)
    }

    fn set_f64(&self, key: &str, value: f64) -> anyhow::Result<()> {
        self.set(key, &value.to_string(), None)
    }

    /// Read-add-write. Not atomic across processes; phases run sequentially.
    fn add_f64(&self, key: &str, delta: f64) -> anyhow::Result<f64> {
        let total = self.get_f64(key) + delta;
        self.set_f64(key, total)?;
        Ok(total)
    }
}

/// Fold the live `TokenCount` into `into` and reset it. Returns the tokens
/// attributed to the phase that just ended.
pub fn fold_tokens(store: &dyn CounterStore, into: &str) -> anyhow::Result<f64> {
    let spent = store.get_f64(keys::TOKEN_COUNT);
    store.add_f64(into, spent)?;
    store.set(keys::TOKEN_COUNT, "0", None)?;
    Ok(spent)
}

pub fn reset_session(store: &dyn CounterStore) -> anyhow::Result<()> {
    for key in keys::SESSION_COUNTERS {
        store.set(key, "0", None)?;
    }
    Ok(())
}

/// Process-local store used by tests and single-process runs.
pub struct MemoryStore {
    default_ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(18_000))
    }
}

impl CounterStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        match entries.get(key) {
            Some((_, expires)) if Instant::now() >= *expires => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
        let expires = Instant::now() + ttl.unwrap_or(self.default_ttl);
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_reads_as_zero() {
        let store = MemoryStore::default();
        assert_eq!(store.get_or_zero("TokenCount"), "0");
        assert_eq!(store.get_f64("TokenCount"), 0.0);
    }

    #[test]
    fn test_fold_tokens_moves_live_count_into_phase_total() {
        let store = MemoryStore::default();
        store.set_f64(keys::TOKEN_COUNT, 120.0).unwrap();
        store.set_f64(keys::PATH_AGENT_TOKEN, 30.0).unwrap();

        let spent = fold_tokens(&store, keys::PATH_AGENT_TOKEN).unwrap();

        assert_eq!(spent, 120.0);
        assert_eq!(store.get_f64(keys::PATH_AGENT_TOKEN), 150.0);
        assert_eq!(store.get_f64(keys::TOKEN_COUNT), 0.0);
    }

    #[test]
    fn test_reset_session_zeroes_all_counters() {
        let store = MemoryStore::default();
        for key in keys::SESSION_COUNTERS {
            store.set_f64(key, 9.0).unwrap();
        }
        store.set(keys::FUNCTION_NAME, "parse", None).unwrap();

        reset_session(&store).unwrap();

        for key in keys::SESSION_COUNTERS {
            assert_eq!(store.get_f64(key), 0.0);
        }
        assert_eq!(store.get_or_zero(keys::FUNCTION_NAME), "parse");
    }

    #[test]
    fn test_expired_entries_vanish() {
        let store = MemoryStore::default();
        store
            .set("k", "v", Some(Duration::from_millis(0)))
            .unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }
}
