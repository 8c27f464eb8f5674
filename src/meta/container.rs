// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The key table: string → object with LRU recency, sharded into 29
// independently locked buckets. 29 is prime on purpose — power-of-two
// modulo would stride badly against aligned key patterns.
//
// Iteration locks one shard at a time and is therefore not a snapshot;
// it is only used at shutdown/unmount and for eviction sweeps.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::{MmcError, Result};
use crate::meta::object::MemObject;

/// Shard count. Prime, see module header.
pub const NUM_BUCKETS: usize = 29;

/// Verdict of a `multi_level_eliminate` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elimination {
    /// The object was demoted in place; keep the entry.
    Keep,
    /// Drop the entry from the table.
    Drop,
    /// Water mark reached; stop visiting candidates.
    Stop,
}

type Shard = LruCache<String, Arc<MemObject>>;

/// LRU-keyed object table.
pub struct MetaContainer {
    shards: Vec<Mutex<Shard>>,
    /// Logical clock stamping objects on insert/promote so candidate
    /// lists from different shards merge in recency order.
    clock: std::sync::atomic::AtomicU64,
}

impl Default for MetaContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaContainer {
    pub fn new() -> MetaContainer {
        let mut shards = Vec::with_capacity(NUM_BUCKETS);
        for _ in 0..NUM_BUCKETS {
            shards.push(Mutex::new(LruCache::unbounded()));
        }
        MetaContainer {
            shards,
            clock: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn tick(&self) -> u64 {
        self.clock
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % NUM_BUCKETS as u64) as usize]
    }

    /// First-write-wins insert.
    pub fn insert(&self, key: &str, obj: Arc<MemObject>) -> Result<()> {
        let mut shard = self.shard(key).lock().unwrap();
        if shard.contains(key) {
            return Err(MmcError::Duplicated);
        }
        obj.touched(self.tick());
        shard.put(key.to_owned(), obj);
        Ok(())
    }

    /// Look up without touching recency.
    pub fn get(&self, key: &str) -> Result<Arc<MemObject>> {
        let shard = self.shard(key).lock().unwrap();
        shard.peek(key).cloned().ok_or(MmcError::UnmatchedKey)
    }

    /// Move the key to MRU.
    pub fn promote(&self, key: &str) -> Result<()> {
        let stamp = self.tick();
        let mut shard = self.shard(key).lock().unwrap();
        match shard.get(key) {
            Some(obj) => {
                obj.touched(stamp);
                Ok(())
            }
            None => Err(MmcError::UnmatchedKey),
        }
    }

    /// Remove the key, popping it from the recency list too.
    pub fn erase(&self, key: &str) -> Result<Arc<MemObject>> {
        let mut shard = self.shard(key).lock().unwrap();
        shard.pop(key).ok_or(MmcError::UnmatchedKey)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).lock().unwrap().contains(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry, shard by shard. Not a snapshot.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<MemObject>)) {
        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            for (key, obj) in shard.iter() {
                f(key, obj);
            }
        }
    }

    /// Remove every entry the predicate accepts. Returns removed pairs.
    pub fn erase_if(
        &self,
        mut pred: impl FnMut(&str, &Arc<MemObject>) -> bool,
    ) -> Vec<(String, Arc<MemObject>)> {
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let victims: Vec<String> = shard
                .iter()
                .filter(|(k, v)| pred(k, v))
                .map(|(k, _)| k.clone())
                .collect();
            for key in victims {
                if let Some(obj) = shard.pop(&key) {
                    removed.push((key, obj));
                }
            }
        }
        removed
    }

    /// LRU-tail candidates sufficient to take occupancy from `high`
    /// percent down to `low` percent. A suggestion, not a commitment:
    /// nothing is removed here.
    pub fn evict_candidates(&self, high: u16, low: u16) -> Vec<String> {
        let mut candidates: Vec<(u64, String)> = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            let len = shard.len();
            if len == 0 {
                continue;
            }
            let want = (len * (high - low) as usize / high.max(1) as usize)
                .min(len)
                .max(1);
            // lru iterates MRU → LRU; the tail is the reverse walk.
            candidates.extend(
                shard
                    .iter()
                    .rev()
                    .take(want)
                    .map(|(k, obj)| (obj.last_touch(), k.clone())),
            );
        }
        // Coldest first across shards.
        candidates.sort_unstable();
        candidates.into_iter().map(|(_, k)| k).collect()
    }

    /// Walk eviction candidates, applying `move_fn` to each. `Drop`
    /// erases the entry, `Stop` ends the sweep early.
    pub fn multi_level_eliminate(
        &self,
        high: u16,
        low: u16,
        mut move_fn: impl FnMut(&str, &Arc<MemObject>) -> Elimination,
    ) {
        for key in self.evict_candidates(high, low) {
            let obj = match self.get(&key) {
                Ok(obj) => obj,
                Err(_) => continue, // raced with a remove
            };
            match move_fn(&key, &obj) {
                Elimination::Keep => {}
                Elimination::Drop => {
                    let _ = self.erase(&key);
                }
                Elimination::Stop => break,
            }
        }
    }

}
