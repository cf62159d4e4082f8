use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::{Duration, Instant},
};

/// Key-value store where every entry expires after its TTL.
///
/// Expired entries are purged lazily, the next time they are read by
/// [`TtlStore::get`] or [`TtlStore::time_to_live`]. There is no background
/// sweeper, so the map may hold stale entries between reads.
#[derive(Default)]
pub struct TtlStore {
    entries: RwLock<HashMap<String, Entry>>,
}

#[derive(Debug)]
struct Entry {
    value: String,
    /// `None` when the TTL reaches past what an `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    fn remaining(&self, now: Instant) -> Duration {
        match self.expires_at {
            Some(expires_at) => expires_at.saturating_duration_since(now),
            None => Duration::MAX,
        }
    }
}

impl TtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`. A zero `ttl` stores an entry that is
    /// already expired on the next read; a `ttl` too large to add to the
    /// current instant stores one that never expires.
    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        let entry = Entry {
            value: value.to_string(),
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        self.purge_if_expired(key, now);
        None
    }

    /// Remaining lifetime of `key`, or `None` if it is missing or expired.
    /// Entries that never expire report [`Duration::MAX`].
    pub fn time_to_live(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.get(key)?;
            let remaining = entry.remaining(now);
            if !remaining.is_zero() {
                return Some(remaining);
            }
        }
        self.purge_if_expired(key, now);
        None
    }

    /// Snapshot of the keys that have not expired yet, in no particular order.
    ///
    /// Expired entries are skipped but left in place; only `get` and
    /// `time_to_live` purge.
    pub fn list_keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn purge_if_expired(&self, key: &str, now: Instant) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // A writer may have refreshed the key between dropping the read lock
        // and taking the write lock.
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
            tracing::trace!(key, "purged expired entry");
        }
    }

    #[cfg(test)]
    fn raw_len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
