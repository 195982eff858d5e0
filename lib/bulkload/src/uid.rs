use crate::io::hash_to_shard;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

const NUM_SHARDS: usize = 64;

/// Assigns stable numeric ids to node names. Safe to share across mappers;
/// contention is spread over independently locked shards.
pub struct UidMap {
    shards: Vec<Mutex<HashMap<String, u64>>>,
    next: AtomicU64,
}

impl Default for UidMap {
    fn default() -> Self { Self::new() }
}

impl UidMap {
    pub fn new() -> Self {
        Self { shards: (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(), next: AtomicU64::new(1) }
    }

    /// Uid for `name`, allocating the next free one on first sight. Uid 0 is never handed out.
    pub fn assign(&self, name: &str) -> u64 {
        let shard = &self.shards[hash_to_shard(name.as_bytes(), NUM_SHARDS)];
        let mut guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&uid) = guard.get(name) {
            return uid;
        }
        let uid = self.next.fetch_add(1, Ordering::Relaxed);
        guard.insert(name.to_string(), uid);
        uid
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        let shard = &self.shards[hash_to_shard(name.as_bytes(), NUM_SHARDS)];
        shard.lock().unwrap_or_else(PoisonError::into_inner).get(name).copied()
    }

    /// Number of uids handed out so far.
    pub fn len(&self) -> u64 { self.next.load(Ordering::Relaxed) - 1 }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
