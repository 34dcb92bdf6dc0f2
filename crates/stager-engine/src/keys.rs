use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::util::non_empty;

/// Blocking pause used for cooldowns and backoff. Swapped out in tests.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

pub fn thread_sleeper() -> Sleeper {
    Arc::new(thread::sleep)
}

#[derive(Debug, thiserror::Error)]
pub enum KeyPoolError {
    #[error("no credentials configured: set {prefix}_1, {prefix}_2, ... or {prefix}")]
    Empty { prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyPoolStatus {
    pub total: usize,
    pub disabled: usize,
    pub available: usize,
    pub disabled_fingerprints: Vec<String>,
}

/// Credentials for the generative model plus the set currently presumed
/// quota-exhausted. The disabled set only ever holds pool members.
pub struct KeyPool {
    prefix: String,
    keys: Vec<String>,
    disabled: Mutex<HashSet<String>>,
    cooldown: Duration,
    sleeper: Sleeper,
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("prefix", &self.prefix)
            .field("keys", &self.keys.len())
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl KeyPool {
    pub fn new(
        prefix: impl Into<String>,
        keys: Vec<String>,
        cooldown: Duration,
        sleeper: Sleeper,
    ) -> Result<Self, KeyPoolError> {
        let prefix = prefix.into();
        if keys.is_empty() {
            return Err(KeyPoolError::Empty { prefix });
        }
        Ok(Self {
            prefix,
            keys,
            disabled: Mutex::new(HashSet::new()),
            cooldown,
            sleeper,
        })
    }

    pub fn from_env(prefix: &str, cooldown: Duration) -> Result<Self, KeyPoolError> {
        let keys = load_keys(prefix, |key| std::env::var(key).ok());
        let pool = Self::new(prefix, keys, cooldown, thread_sleeper())?;
        info!(prefix = %prefix, credentials = pool.len(), "key pool loaded");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Pool minus the disabled set. When every credential is disabled this
    /// blocks for the cooldown, then clears the disabled set wholesale and
    /// hands back the full pool without checking that quotas recovered.
    pub fn available(&self) -> Vec<String> {
        let enabled = self.enabled_keys();
        if !enabled.is_empty() {
            return enabled;
        }

        warn!(
            credentials = self.keys.len(),
            cooldown_s = self.cooldown.as_secs_f64(),
            "all credentials disabled; cooling down before retrying the full pool"
        );
        (self.sleeper)(self.cooldown);
        self.reset();
        self.keys.clone()
    }

    pub fn disable(&self, key: &str) -> bool {
        if !self.keys.iter().any(|existing| existing == key) {
            return false;
        }
        let inserted = self.lock_disabled().insert(key.to_string());
        if inserted {
            warn!(key = %key_fingerprint(key), "credential disabled after quota error");
        }
        inserted
    }

    pub fn is_disabled(&self, key: &str) -> bool {
        self.lock_disabled().contains(key)
    }

    pub fn reset(&self) {
        self.lock_disabled().clear();
    }

    pub fn status(&self) -> KeyPoolStatus {
        let disabled = self.lock_disabled();
        let mut disabled_fingerprints = disabled
            .iter()
            .map(|key| key_fingerprint(key))
            .collect::<Vec<String>>();
        disabled_fingerprints.sort();
        let available = self
            .keys
            .iter()
            .filter(|key| !disabled.contains(*key))
            .count();
        KeyPoolStatus {
            total: self.keys.len(),
            disabled: disabled.len(),
            available,
            disabled_fingerprints,
        }
    }

    fn enabled_keys(&self) -> Vec<String> {
        let disabled = self.lock_disabled();
        self.keys
            .iter()
            .filter(|key| !disabled.contains(*key))
            .cloned()
            .collect()
    }

    fn lock_disabled(&self) -> MutexGuard<'_, HashSet<String>> {
        // A panic while holding the guard cannot leave the set half-updated.
        self.disabled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scans `PREFIX_1`, `PREFIX_2`, ... until the first gap, falling back to
/// the unnumbered `PREFIX` when no numbered value exists.
pub fn load_keys<F>(prefix: &str, lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut keys = Vec::new();
    for idx in 1.. {
        match non_empty(lookup(&format!("{prefix}_{idx}"))) {
            Some(key) => keys.push(key),
            None => break,
        }
    }
    if keys.is_empty() {
        if let Some(key) = non_empty(lookup(prefix)) {
            keys.push(key);
        }
    }
    keys
}

/// Short stable identifier for logs; never reveals the credential.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("key-{}", hex::encode(&digest[..4]))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{key_fingerprint, load_keys, KeyPool, KeyPoolError, Sleeper};

    pub(crate) fn recording_sleeper() -> (Sleeper, Arc<Mutex<Vec<Duration>>>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let sink = slept.clone();
        let sleeper: Sleeper = Arc::new(move |duration: Duration| {
            if let Ok(mut rows) = sink.lock() {
                rows.push(duration);
            }
        });
        (sleeper, slept)
    }

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn load_scans_numbered_sequence_until_gap() {
        let vars = env(&[
            ("GEMINI_API_KEY_1", "k1"),
            ("GEMINI_API_KEY_2", " k2 "),
            ("GEMINI_API_KEY_4", "k4"),
            ("GEMINI_API_KEY", "fallback"),
        ]);
        let loaded = load_keys("GEMINI_API_KEY", |key| vars.get(key).cloned());
        assert_eq!(loaded, keys(&["k1", "k2"]));
    }

    #[test]
    fn load_falls_back_to_unnumbered_variable() {
        let vars = env(&[("GEMINI_API_KEY", "solo"), ("GEMINI_API_KEY_2", "k2")]);
        let loaded = load_keys("GEMINI_API_KEY", |key| vars.get(key).cloned());
        assert_eq!(loaded, keys(&["solo"]));
    }

    #[test]
    fn load_returns_empty_when_nothing_configured() {
        let vars = env(&[("GEMINI_API_KEY_1", "   ")]);
        assert!(load_keys("GEMINI_API_KEY", |key| vars.get(key).cloned()).is_empty());
    }

    #[test]
    fn empty_pool_fails_fast() {
        let (sleeper, _) = recording_sleeper();
        let err = KeyPool::new("GEMINI_API_KEY", Vec::new(), Duration::ZERO, sleeper)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("GEMINI_API_KEY_1"));
        assert!(matches!(
            KeyPool::new("X", Vec::new(), Duration::ZERO, Arc::new(|_: Duration| {})),
            Err(KeyPoolError::Empty { .. })
        ));
    }

    #[test]
    fn disabling_foreign_key_is_ignored() -> anyhow::Result<()> {
        let (sleeper, _) = recording_sleeper();
        let pool = KeyPool::new("P", keys(&["a", "b"]), Duration::ZERO, sleeper)?;
        assert!(!pool.disable("zzz"));
        assert_eq!(pool.status().disabled, 0);
        assert!(pool.disable("a"));
        assert!(!pool.disable("a"));
        assert_eq!(pool.available(), keys(&["b"]));
        Ok(())
    }

    #[test]
    fn blanket_exhaustion_waits_cooldown_then_clears() -> anyhow::Result<()> {
        let (sleeper, slept) = recording_sleeper();
        let pool = KeyPool::new(
            "P",
            keys(&["a", "b", "c"]),
            Duration::from_secs(60),
            sleeper,
        )?;
        for key in ["a", "b", "c"] {
            pool.disable(key);
        }
        assert_eq!(pool.status().available, 0);

        let available = pool.available();
        assert_eq!(available, keys(&["a", "b", "c"]));
        assert_eq!(pool.status().disabled, 0);
        assert_eq!(
            slept.lock().map(|rows| rows.clone()).unwrap_or_default(),
            vec![Duration::from_secs(60)]
        );
        Ok(())
    }

    #[test]
    fn status_reports_fingerprints_not_values() -> anyhow::Result<()> {
        let (sleeper, _) = recording_sleeper();
        let pool = KeyPool::new("P", keys(&["secret-1", "secret-2"]), Duration::ZERO, sleeper)?;
        pool.disable("secret-2");
        let status = pool.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.available, 1);
        assert_eq!(status.disabled_fingerprints, vec![key_fingerprint("secret-2")]);
        assert!(!status.disabled_fingerprints[0].contains("secret"));
        Ok(())
    }
}
