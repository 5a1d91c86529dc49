//! Per-user URL locks.
//!
//! A lock is reserved the moment a submission is accepted and activated when
//! its job starts executing. Only the holder presenting the matching lock id
//! may activate or release it, so a stale caller can never release a newer
//! lock that reuses the same `(user, url)` key.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use url::{form_urlencoded, Url};
use uuid::Uuid;

/// Chat-platform user identifier.
pub type UserId = i64;

/// Identifier handed to the holder of a URL lock.
pub type LockId = Uuid;

/// Query parameters that never change what a link points to.
const TRACKING_PARAMS: &[&str] = &["si", "fbclid", "gclid", "igshid", "igsh", "feature", "ref"];

/// Lifecycle of a URL lock. Only ever advances Reserved -> Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Reserved,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlLock {
    pub lock_id: LockId,
    pub state: LockState,
}

/// Outcome of [`UrlLockManager::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// A fresh reservation was made.
    Acquired(LockId),
    /// Someone already holds the key; carries the holder's id.
    AlreadyHeld(LockId),
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }

    pub fn lock_id(&self) -> LockId {
        match self {
            LockOutcome::Acquired(id) | LockOutcome::AlreadyHeld(id) => *id,
        }
    }
}

/// Why a submission cannot proceed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ServerBusy,
    AlreadyInProgress,
    TooManyLinks,
}

impl BlockReason {
    pub fn message(&self) -> &'static str {
        match self {
            BlockReason::ServerBusy => "Server is busy, please try again in a few minutes.",
            BlockReason::AlreadyInProgress => "This link is already being processed.",
            BlockReason::TooManyLinks => "Too many links in progress, wait for one to finish.",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Map of user -> normalized URL -> lock.
pub struct UrlLockManager {
    locks: Mutex<HashMap<UserId, HashMap<String, UrlLock>>>,
    max_user_urls: usize,
    max_global_tasks: usize,
}

impl UrlLockManager {
    pub fn new(max_user_urls: usize, max_global_tasks: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            max_user_urls,
            max_global_tasks,
        }
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, HashMap<String, UrlLock>>> {
        // state stays consistent even if a holder panicked mid-update
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a lock on `(user, url)`, or report the existing holder.
    pub fn lock(&self, user: UserId, url: &str) -> LockOutcome {
        let key = normalize_url(url);
        let mut locks = self.locks();
        let user_locks = locks.entry(user).or_default();
        if let Some(existing) = user_locks.get(&key) {
            return LockOutcome::AlreadyHeld(existing.lock_id);
        }
        let lock_id = Uuid::new_v4();
        user_locks.insert(
            key.clone(),
            UrlLock {
                lock_id,
                state: LockState::Reserved,
            },
        );
        debug!(user_id = user, url = %key, %lock_id, "url lock reserved");
        LockOutcome::Acquired(lock_id)
    }

    /// Advance Reserved -> Active. No-op unless `lock_id` holds the key.
    pub fn activate(&self, user: UserId, url: &str, lock_id: LockId) -> bool {
        let key = normalize_url(url);
        let mut locks = self.locks();
        match locks.get_mut(&user).and_then(|m| m.get_mut(&key)) {
            Some(lock) if lock.lock_id == lock_id => {
                lock.state = LockState::Active;
                true
            }
            _ => false,
        }
    }

    /// Release the lock if `lock_id` is absent or matches the holder.
    ///
    /// Returns whether an entry was removed.
    pub fn unlock(&self, user: UserId, url: &str, lock_id: Option<LockId>) -> bool {
        let key = normalize_url(url);
        let mut locks = self.locks();
        let Some(user_locks) = locks.get_mut(&user) else {
            return false;
        };
        let matches = match (user_locks.get(&key), lock_id) {
            (Some(existing), Some(id)) => existing.lock_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            user_locks.remove(&key);
            if user_locks.is_empty() {
                locks.remove(&user);
            }
            debug!(user_id = user, url = %key, "url lock released");
        }
        matches
    }

    pub fn get(&self, user: UserId, url: &str) -> Option<UrlLock> {
        let key = normalize_url(url);
        self.locks().get(&user).and_then(|m| m.get(&key)).copied()
    }

    /// Number of distinct URLs `user` currently holds.
    pub fn user_lock_count(&self, user: UserId) -> usize {
        self.locks().get(&user).map(HashMap::len).unwrap_or(0)
    }

    /// Check the three admission policies in order.
    ///
    /// `registered_jobs` is the current pending + active count of the job
    /// registry; `lock_id` is the caller's reservation, if it has one.
    pub fn block_reason(
        &self,
        user: UserId,
        url: &str,
        lock_id: Option<LockId>,
        registered_jobs: usize,
    ) -> Option<BlockReason> {
        if registered_jobs >= self.max_global_tasks {
            return Some(BlockReason::ServerBusy);
        }

        let key = normalize_url(url);
        let locks = self.locks();
        let user_locks = locks.get(&user);

        if let Some(existing) = user_locks.and_then(|m| m.get(&key)) {
            let owned = lock_id == Some(existing.lock_id);
            if !owned || existing.state == LockState::Active {
                return Some(BlockReason::AlreadyInProgress);
            }
        }

        let other_urls = user_locks
            .map(|m| m.keys().filter(|k| **k != key).count())
            .unwrap_or(0);
        if other_urls >= self.max_user_urls {
            return Some(BlockReason::TooManyLinks);
        }

        None
    }
}

/// Canonical form of a media link used as the lock key.
///
/// Normalizing an already normalized link returns it unchanged, so callers
/// may pass either the submitted or the canonical form. Unparseable input is
/// returned trimmed so that it still locks consistently.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    url.set_fragment(None);
    let Some(host) = url.host_str().filter(|h| !h.is_empty()).map(str::to_lowercase) else {
        return url.to_string();
    };
    let mut host = host.as_str();
    while let Some(rest) = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .filter(|rest| !rest.is_empty())
    {
        host = rest;
    }

    let mut path = url.path().trim_end_matches('/').to_string();
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut host_out = host.to_string();
    if host == "youtu.be" {
        let id = path.trim_start_matches('/').to_string();
        if !id.is_empty() {
            host_out = "youtube.com".to_string();
            path = "/watch".to_string();
            pairs.retain(|(k, _)| k != "v");
            pairs.insert(0, ("v".to_string(), id));
        }
    } else if host == "youtube.com" || host == "music.youtube.com" {
        if let Some(id) = path.strip_prefix("/shorts/").map(str::to_string) {
            path = "/watch".to_string();
            pairs.retain(|(k, _)| k != "v");
            pairs.insert(0, ("v".to_string(), id));
        }
    }

    let mut out = format!("{}://{}", url.scheme(), host_out);
    if let Some(port) = url.port() {
        out.push_str(&format!(":{}", port));
    }
    out.push_str(&path);
    if !pairs.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&pairs)
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    out
}

/// Lower-cased host without `www.`, used for per-host policies.
pub fn host_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Whether `host` is `domain` or one of its subdomains.
pub fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}
