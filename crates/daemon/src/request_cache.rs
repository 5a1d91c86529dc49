//! Ephemeral selection context between offering a quality menu and the
//! user's choice.
//!
//! Each entry holds the URL lock reserved when the menu was offered; entries
//! that are never confirmed expire after the TTL and must have their lock
//! released by whoever sweeps them.

use crate::formats::{FormatEntry, Quality};
use crate::url_lock::{LockId, UserId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Length of the short key handed to the transport.
const KEY_LEN: usize = 12;

/// A pending selection.
#[derive(Debug, Clone)]
pub struct RequestCacheEntry {
    pub user_id: UserId,
    /// Link the media is downloaded from.
    pub url: String,
    /// Link the user originally sent, when a resolver rewrote it.
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
    pub formats: Vec<FormatEntry>,
    pub menu: Vec<Quality>,
    pub chosen: Option<Quality>,
    pub lock_id: LockId,
    /// Already-resolved audio track to mux in.
    pub external_audio: Option<String>,
    pub created_at: Instant,
}

/// What the transport shows for a pending selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionMenu {
    pub key: String,
    pub title: Option<String>,
    pub options: Vec<Quality>,
}

/// Short-key map of pending selections.
pub struct RequestCache {
    entries: Mutex<HashMap<String, RequestCacheEntry>>,
    ttl: Duration,
}

impl RequestCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, RequestCacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `entry` under a fresh short key.
    pub fn insert(&self, entry: RequestCacheEntry) -> String {
        let mut entries = self.entries();
        loop {
            let key: String = Uuid::new_v4().simple().to_string()[..KEY_LEN].to_string();
            if !entries.contains_key(&key) {
                entries.insert(key.clone(), entry);
                return key;
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<RequestCacheEntry> {
        self.entries().get(key).cloned()
    }

    /// Remove and return the entry if it has not expired.
    ///
    /// An expired entry is left for the sweeper so its lock is released in
    /// one place.
    pub fn take(&self, key: &str, now: Instant) -> Option<RequestCacheEntry> {
        let mut entries = self.entries();
        let fresh = entries
            .get(key)
            .map(|e| now.duration_since(e.created_at) < self.ttl)?;
        if fresh {
            entries.remove(key)
        } else {
            None
        }
    }

    /// Put back an entry taken with [`RequestCache::take`] under its old key.
    pub fn restore(&self, key: &str, entry: RequestCacheEntry) {
        self.entries().insert(key.to_string(), entry);
    }

    /// Remove every entry older than the TTL.
    pub fn sweep_expired(&self, now: Instant) -> Vec<RequestCacheEntry> {
        let mut entries = self.entries();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.created_at) >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| entries.remove(&k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(now: Instant) -> RequestCacheEntry {
        RequestCacheEntry {
            user_id: 1,
            url: "https://example.com/v".into(),
            source_url: None,
            title: Some("T".into()),
            duration_secs: Some(10.0),
            formats: Vec::new(),
            menu: vec![Quality::Height(720), Quality::Audio],
            chosen: None,
            lock_id: Uuid::new_v4(),
            external_audio: None,
            created_at: now,
        }
    }

    #[test]
    fn test_insert_and_take() {
        let cache = RequestCache::new(Duration::from_secs(3600));
        let now = Instant::now();
        let key = cache.insert(entry(now));
        assert_eq!(key.len(), KEY_LEN);
        assert!(cache.get(&key).is_some());

        let taken = cache.take(&key, now + Duration::from_secs(10)).unwrap();
        assert_eq!(taken.menu.len(), 2);
        assert!(cache.is_empty());
        assert!(cache.take(&key, now).is_none());

        cache.restore(&key, taken);
        assert!(cache.take(&key, now).is_some());
    }

    #[test]
    fn test_expired_entries_only_leave_through_sweep() {
        let cache = RequestCache::new(Duration::from_secs(3600));
        let now = Instant::now();
        let old = cache.insert(entry(now));
        let fresh = cache.insert(entry(now + Duration::from_secs(1800)));

        let later = now + Duration::from_secs(3600);
        assert!(cache.take(&old, later).is_none());
        assert_eq!(cache.len(), 2);

        let swept = cache.sweep_expired(later);
        assert_eq!(swept.len(), 1);
        assert!(cache.get(&old).is_none());
        assert!(cache.get(&fresh).is_some());
    }
}
