use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Whether a pending writer blocks new readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    WritePreferring,
    ReadPreferring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Read,
    Write,
}

/// Per-key reader/writer lock table.
///
/// Every grant is registered with its acquisition time and a caller tag.
/// A waiter that makes no progress within `stall_check` re-scans the key's
/// grants and force-releases any older than `abandon_after`: a guard that was
/// leaked or whose owner died no longer wedges the whole key. The original
/// acquisition site is logged when that happens; a force-released guard's
/// eventual drop is a no-op.
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<LockShared>,
}

struct LockShared {
    policy: LockPolicy,
    stall_check: Duration,
    abandon_after: Duration,
    next_grant: AtomicU64,
    state: Mutex<LockState>,
}

#[derive(Default)]
struct LockState {
    keys: HashMap<String, KeyState>,
    grants: HashMap<u64, Grant>,
}

struct KeyState {
    readers: Vec<u64>,
    writer: Option<u64>,
    pending_writers: usize,
    notify: Arc<Notify>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            readers: Vec::new(),
            writer: None,
            pending_writers: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn idle(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.pending_writers == 0
    }
}

struct Grant {
    key: String,
    mode: LockMode,
    acquired_at: Instant,
    caller: &'static str,
}

/// RAII handle for a granted lock; dropping it releases the grant.
pub struct LockGuard {
    shared: Arc<LockShared>,
    id: u64,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("id", &self.id).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

/// Keeps the pending-writer count accurate even if the waiting future is
/// dropped mid-acquisition.
struct PendingWriter {
    shared: Arc<LockShared>,
    key: String,
    active: bool,
}

impl PendingWriter {
    fn register(shared: Arc<LockShared>, key: &str) -> Self {
        {
            let mut state = shared.state.lock();
            state
                .keys
                .entry(key.to_string())
                .or_insert_with(KeyState::new)
                .pending_writers += 1;
        }
        Self {
            shared,
            key: key.to_string(),
            active: true,
        }
    }

    fn retire(&mut self, state: &mut LockState) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(ks) = state.keys.get_mut(&self.key) {
            ks.pending_writers = ks.pending_writers.saturating_sub(1);
            ks.notify.notify_waiters();
        }
    }
}

impl Drop for PendingWriter {
    fn drop(&mut self) {
        if self.active {
            let shared = Arc::clone(&self.shared);
            let mut state = shared.state.lock();
            self.retire(&mut state);
            let idle = state.keys.get(&self.key).map(KeyState::idle).unwrap_or(false);
            if idle {
                state.keys.remove(&self.key);
            }
        }
    }
}

impl LockManager {
    pub fn new(policy: LockPolicy, stall_check: Duration, abandon_after: Duration) -> Self {
        Self {
            shared: Arc::new(LockShared {
                policy,
                stall_check,
                abandon_after,
                next_grant: AtomicU64::new(1),
                state: Mutex::new(LockState::default()),
            }),
        }
    }

    /// Block until a read lock on `key` is compatible with current grants.
    pub async fn acquire_read(&self, key: &str, caller: &'static str) -> LockGuard {
        loop {
            let notify = {
                let mut state = self.shared.state.lock();
                let policy = self.shared.policy;
                let ks = state
                    .keys
                    .entry(key.to_string())
                    .or_insert_with(KeyState::new);
                let blocked = ks.writer.is_some()
                    || (policy == LockPolicy::WritePreferring && ks.pending_writers > 0);
                if !blocked {
                    let id = self.shared.next_grant.fetch_add(1, Ordering::Relaxed);
                    ks.readers.push(id);
                    state.grants.insert(
                        id,
                        Grant {
                            key: key.to_string(),
                            mode: LockMode::Read,
                            acquired_at: Instant::now(),
                            caller,
                        },
                    );
                    return LockGuard {
                        shared: self.shared.clone(),
                        id,
                    };
                }
                ks.notify.clone()
            };
            self.wait_or_reclaim(key, notify).await;
        }
    }

    /// Block until a write lock on `key` is exclusive.
    pub async fn acquire_write(&self, key: &str, caller: &'static str) -> LockGuard {
        let mut pending = PendingWriter::register(self.shared.clone(), key);
        loop {
            let notify = {
                let mut state = self.shared.state.lock();
                let ks = state
                    .keys
                    .entry(key.to_string())
                    .or_insert_with(KeyState::new);
                if ks.writer.is_none() && ks.readers.is_empty() {
                    let id = self.shared.next_grant.fetch_add(1, Ordering::Relaxed);
                    ks.writer = Some(id);
                    pending.retire(&mut state);
                    state.grants.insert(
                        id,
                        Grant {
                            key: key.to_string(),
                            mode: LockMode::Write,
                            acquired_at: Instant::now(),
                            caller,
                        },
                    );
                    return LockGuard {
                        shared: self.shared.clone(),
                        id,
                    };
                }
                ks.notify.clone()
            };
            self.wait_or_reclaim(key, notify).await;
        }
    }

    async fn wait_or_reclaim(&self, key: &str, notify: Arc<Notify>) {
        let waited = tokio::time::timeout(self.shared.stall_check, notify.notified()).await;
        if waited.is_err() {
            self.shared.reclaim_abandoned(key);
        }
    }

    /// Whether any grant (read or write) is active on `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        let state = self.shared.state.lock();
        state
            .keys
            .get(key)
            .map(|ks| !ks.readers.is_empty() || ks.writer.is_some())
            .unwrap_or(false)
    }

    pub fn is_write_locked(&self, key: &str) -> bool {
        let state = self.shared.state.lock();
        state
            .keys
            .get(key)
            .map(|ks| ks.writer.is_some())
            .unwrap_or(false)
    }

    /// Whether any grant is active on a key starting with `prefix`. Used for
    /// the eviction in-use veto, where one resource owns a family of keys.
    pub fn is_locked_with_prefix(&self, prefix: &str) -> bool {
        let state = self.shared.state.lock();
        state.keys.iter().any(|(key, ks)| {
            key.starts_with(prefix) && (!ks.readers.is_empty() || ks.writer.is_some())
        })
    }

    #[cfg(test)]
    fn active_grants(&self) -> usize {
        self.shared.state.lock().grants.len()
    }
}

impl LockShared {
    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        let Some(grant) = state.grants.remove(&id) else {
            // Already force-released by the abandoned-lock sweep.
            return;
        };
        let mut idle = false;
        if let Some(ks) = state.keys.get_mut(&grant.key) {
            match grant.mode {
                LockMode::Read => ks.readers.retain(|reader| *reader != id),
                LockMode::Write => {
                    if ks.writer == Some(id) {
                        ks.writer = None;
                    }
                }
            }
            ks.notify.notify_waiters();
            idle = ks.idle();
        }
        if idle {
            state.keys.remove(&grant.key);
        }
    }

    fn reclaim_abandoned(&self, key: &str) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(ks) = state.keys.get(key) else {
            return;
        };
        let mut expired: Vec<u64> = Vec::new();
        for id in ks.readers.iter().chain(ks.writer.iter()) {
            if let Some(grant) = state.grants.get(id)
                && now.duration_since(grant.acquired_at) > self.abandon_after
            {
                expired.push(*id);
            }
        }
        if expired.is_empty() {
            debug!(key, "lock wait stalled; no abandoned grants to reclaim");
            return;
        }
        for id in expired {
            if let Some(grant) = state.grants.remove(&id) {
                warn!(
                    key,
                    caller = grant.caller,
                    held_secs = now.duration_since(grant.acquired_at).as_secs(),
                    "force-releasing abandoned lock"
                );
                if let Some(ks) = state.keys.get_mut(&grant.key) {
                    match grant.mode {
                        LockMode::Read => ks.readers.retain(|reader| *reader != id),
                        LockMode::Write => {
                            if ks.writer == Some(id) {
                                ks.writer = None;
                            }
                        }
                    }
                }
            }
        }
        if let Some(ks) = state.keys.get(key) {
            ks.notify.notify_waiters();
        }
    }
}
