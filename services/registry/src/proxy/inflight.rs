use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Keys of artifacts this process is currently caching.
///
/// Only deduplicates within one process. Another instance may fetch the same
/// artifact concurrently, which is harmless since caching is idempotent.
#[derive(Debug, Clone, Default)]
pub struct InflightSet {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InflightSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. Returns `false` if someone else holds it.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.keys.lock().insert(key.to_owned())
    }

    /// Give `key` back.
    pub fn release(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    /// Claim `key` until the returned guard is dropped.
    pub fn guard(&self, key: impl Into<String>) -> Option<InflightGuard> {
        let key = key.into();
        self.try_acquire(&key).then(|| InflightGuard {
            set: self.clone(),
            key,
        })
    }

    /// Whether `key` is held.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct InflightGuard {
    set: InflightSet,
    key: String,
}

impl InflightGuard {
    /// The held key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release() {
        let set = InflightSet::new();
        assert!(set.try_acquire("a"));
        assert!(!set.try_acquire("a"));
        assert!(set.try_acquire("b"));
        set.release("a");
        assert!(set.try_acquire("a"));
    }

    #[test]
    fn guards_release_on_drop() {
        let set = InflightSet::new();
        let guard = set.guard("manifest").unwrap();
        assert_eq!(guard.key(), "manifest");
        assert!(set.guard("manifest").is_none());
        drop(guard);
        assert!(!set.contains("manifest"));
        assert!(set.guard("manifest").is_some());
    }
}
