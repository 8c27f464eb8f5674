// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// MetaManager arbitrates Alloc/Get/Update/Remove/Mount/Unmount/Query
// across the allocators and the key table, drives the async remove path
// and the copy-then-demote eviction sweep.
//
// Concurrency is per object: the container hands out Arc'd objects and
// each object serializes its own blob set. Removal never blocks the
// caller — freed space appears once the lease drains or expires.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::alloc::{AllocOptions, GlobalAllocator};
use crate::error::{MmcError, Result};
use crate::meta::backup::{JournalEntry, JournalOp, RebuildJournal};
use crate::meta::blob::{BlobAction, BlobDesc, BlobFilter, MemBlob};
use crate::meta::container::{Elimination, MetaContainer};
use crate::meta::object::MemObject;
use crate::types::{Location, MediaType, OperateId, USAGE_PRINT_SECS};

/// Rank-to-rank side effects the manager needs from the serving layer:
/// descriptor replication and the destination-pull blob copy.
pub trait PeerChannel: Send + Sync {
    fn replicate(&self, entry: &JournalEntry) -> Result<()>;
    fn blob_copy(&self, src: &BlobDesc, dst: &BlobDesc) -> Result<()>;
}

/// Peers that swallow everything; single-process deployments and tests.
pub struct NoopPeers;

impl PeerChannel for NoopPeers {
    fn replicate(&self, _entry: &JournalEntry) -> Result<()> {
        Ok(())
    }

    fn blob_copy(&self, _src: &BlobDesc, _dst: &BlobDesc) -> Result<()> {
        Ok(())
    }
}

/// What a client learns about an object from Alloc/Get.
#[derive(Debug, Clone, Default)]
pub struct ObjectView {
    pub size: u64,
    pub prot: u16,
    pub priority: u8,
    pub lease: u64,
    pub blobs: Vec<BlobDesc>,
}

/// Side-effect-free Query result.
#[derive(Debug, Clone, Default)]
pub struct QueryInfo {
    pub size: u64,
    pub prot: u16,
    pub num_blobs: u16,
    pub placements: Vec<Location>,
    pub valid: bool,
}

struct RemoveQueue {
    items: Vec<(String, Arc<MemObject>)>,
    stop: bool,
}

struct RemoveShared {
    state: Mutex<RemoveQueue>,
    cv: Condvar,
}

/// The authoritative catalog service core.
pub struct MetaManager {
    container: Arc<MetaContainer>,
    global: Arc<GlobalAllocator>,
    journal: Option<Arc<RebuildJournal>>,
    remove_shared: Arc<RemoveShared>,
    remove_thread: Mutex<Option<JoinHandle<()>>>,
    default_ttl_ms: u64,
    evict_high: u16,
    evict_low: u16,
}

impl MetaManager {
    pub fn new(
        global: Arc<GlobalAllocator>,
        default_ttl_ms: u64,
        evict_high: u16,
        evict_low: u16,
        journal: Option<Arc<RebuildJournal>>,
    ) -> Arc<MetaManager> {
        let container = Arc::new(MetaContainer::new());
        let remove_shared = Arc::new(RemoveShared {
            state: Mutex::new(RemoveQueue {
                items: Vec::new(),
                stop: false,
            }),
            cv: Condvar::new(),
        });

        let thread_shared = Arc::clone(&remove_shared);
        let thread_global = Arc::clone(&global);
        let thread_journal = journal.clone();
        let handle = std::thread::Builder::new()
            .name("mmc-remove".into())
            .spawn(move || {
                Self::async_remove_loop(thread_shared, thread_global, thread_journal, default_ttl_ms)
            })
            .expect("spawn remove thread");

        Arc::new(MetaManager {
            container,
            global,
            journal,
            remove_shared,
            remove_thread: Mutex::new(Some(handle)),
            default_ttl_ms,
            evict_high,
            evict_low,
        })
    }

    pub fn ttl_ms(&self) -> u64 {
        self.default_ttl_ms
    }

    pub fn usage_rate(&self) -> u64 {
        self.global.usage_rate()
    }

    /// Join the background remove thread. Further removes leak space
    /// intentionally; call only on the way down.
    pub fn stop(&self) {
        {
            let mut st = self.remove_shared.state.lock().unwrap();
            if st.stop {
                return;
            }
            st.stop = true;
        }
        self.remove_shared.cv.notify_all();
        if let Some(h) = self.remove_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(journal) = &self.journal {
            journal.stop();
        }
    }

    // -----------------------------------------------------------------
    // Alloc
    // -----------------------------------------------------------------

    /// Place `num_blobs` blobs for a new key and publish the object.
    /// Rolls every placement back when the key already exists.
    pub fn alloc(
        &self,
        key: &str,
        opts: &AllocOptions,
        operate_id: OperateId,
        peers: &dyn PeerChannel,
    ) -> Result<ObjectView> {
        let blobs = self.global.alloc(opts)?;
        for blob in &blobs {
            blob.update_state(BlobAction::AllocOk)?;
        }

        let obj = Arc::new(MemObject::new());
        for blob in &blobs {
            if let Err(e) = obj.add_blob(Arc::clone(blob)) {
                let _ = obj.free_blobs(key, &self.global, &BlobFilter::any());
                for leftover in &blobs {
                    if leftover.state() == crate::meta::blob::BlobState::Allocated {
                        let _ = leftover.update_state(BlobAction::RemoveStart);
                        let _ = leftover.update_state(BlobAction::RemoveOk);
                        let _ = self.global.free(&leftover.desc());
                    }
                }
                return Err(e);
            }
        }
        obj.lease().extend(self.default_ttl_ms);

        if let Err(e) = self.container.insert(key, Arc::clone(&obj)) {
            let _ = obj.free_blobs(key, &self.global, &BlobFilter::any());
            if e != MmcError::Duplicated {
                error!("insert of key {key} failed: {e}");
            }
            return Err(e);
        }

        // Install descriptors on ranks other than the caller's so they can
        // answer local queries and contribute to a rebuild.
        let caller = operate_id.rank();
        for blob in &blobs {
            if blob.rank() != caller {
                let entry = JournalEntry {
                    op: JournalOp::Add,
                    key: key.to_owned(),
                    desc: blob.desc(),
                };
                if let Err(e) = peers.replicate(&entry) {
                    warn!("descriptor install on rank {} failed: {e}", blob.rank());
                }
            }
        }

        Ok(self.view_of(&obj))
    }

    // -----------------------------------------------------------------
    // Get
    // -----------------------------------------------------------------

    /// Pick one readable blob, lease it to the caller and park it in
    /// `Copying` until the caller's READ_OK update.
    pub fn get(&self, key: &str, operate_id: OperateId, filter: BlobFilter) -> Result<ObjectView> {
        let obj = self.container.get(key)?;
        self.container.promote(key)?;
        obj.lease().add(operate_id, self.default_ttl_ms);

        let mut filter = filter;
        filter.readable = true;
        for blob in obj.blobs(&filter) {
            if blob.update_state(BlobAction::ReadStart).is_ok() {
                let mut view = self.view_of(&obj);
                view.blobs = vec![blob.desc()];
                return Ok(view);
            }
        }

        obj.lease().remove(operate_id);
        warn!("get {key}: no readable blob");
        Err(MmcError::UnmatchedState)
    }

    pub fn batch_get(
        &self,
        keys: &[String],
        operate_id: OperateId,
        filter: BlobFilter,
    ) -> Vec<Result<ObjectView>> {
        keys.iter().map(|k| self.get(k, operate_id, filter)).collect()
    }

    // -----------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------

    /// Apply `action` to the object's blobs at `loc` (all blobs when
    /// `loc` is `None`). Recency is deliberately left untouched.
    pub fn update_state(
        &self,
        key: &str,
        loc: Option<Location>,
        action: BlobAction,
        operate_id: OperateId,
    ) -> Result<()> {
        let obj = self.container.get(key).map_err(|_| {
            warn!("update of unknown key {key}");
            MmcError::UnmatchedKey
        })?;
        let filter = loc.map(BlobFilter::at).unwrap_or_default();
        let result = obj.update_blobs_state(&filter, action);

        // The read lease ends with the read, successful or not.
        if action == BlobAction::ReadOk {
            obj.lease().remove(operate_id);
        }
        // Completed writes are what the rebuild log records.
        if action == BlobAction::WriteOk && result.is_ok() {
            if let Some(journal) = &self.journal {
                for blob in obj.blobs(&filter) {
                    journal.push(JournalOp::Add, key, blob.desc());
                }
            }
        }
        result
    }

    // -----------------------------------------------------------------
    // Remove
    // -----------------------------------------------------------------

    /// Unpublish the key and queue the object for asynchronous freeing.
    pub fn remove(&self, key: &str) -> Result<()> {
        let obj = self.container.erase(key)?;
        self.push_remove(key, obj);
        Ok(())
    }

    pub fn batch_remove(&self, keys: &[String]) -> Vec<Result<()>> {
        keys.iter().map(|k| self.remove(k)).collect()
    }

    fn push_remove(&self, key: &str, obj: Arc<MemObject>) {
        {
            let mut st = self.remove_shared.state.lock().unwrap();
            st.items.push((key.to_owned(), obj));
        }
        self.remove_shared.cv.notify_all();
    }

    fn async_remove_loop(
        shared: Arc<RemoveShared>,
        global: Arc<GlobalAllocator>,
        journal: Option<Arc<RebuildJournal>>,
        ttl_ms: u64,
    ) {
        let mut last_usage_log = Instant::now();
        loop {
            let items = {
                let mut st = shared.state.lock().unwrap();
                if st.items.is_empty() && !st.stop {
                    let (next, _) = shared
                        .cv
                        .wait_timeout(st, Duration::from_millis(ttl_ms))
                        .unwrap();
                    st = next;
                }
                if st.stop && st.items.is_empty() {
                    return;
                }
                std::mem::take(&mut st.items)
            };

            for (key, obj) in items {
                // Outstanding readers get until the lease deadline.
                obj.lease().wait();
                match obj.free_blobs(&key, &global, &BlobFilter::any()) {
                    Ok(freed) => {
                        if let Some(journal) = &journal {
                            for desc in freed {
                                journal.push(JournalOp::Remove, &key, desc);
                            }
                        }
                    }
                    Err(e) => error!("async free of key {key} failed: {e}"),
                }
            }

            if last_usage_log.elapsed() >= Duration::from_secs(USAGE_PRINT_SECS) {
                debug!("allocator usage rate: {}%", global.usage_rate());
                last_usage_log = Instant::now();
            }
        }
    }

    // -----------------------------------------------------------------
    // Mount / Unmount
    // -----------------------------------------------------------------

    /// Register a segment. `prior_blobs` replays a surviving rank's
    /// journal into the allocator and the key table before serving.
    pub fn mount(
        &self,
        loc: Location,
        base: u64,
        capacity: u64,
        prior_blobs: &[(String, BlobDesc)],
    ) -> Result<()> {
        self.global.mount(loc, base, capacity)?;
        if !prior_blobs.is_empty() {
            let descs: Vec<BlobDesc> = prior_blobs.iter().map(|(_, d)| *d).collect();
            self.global.build_from_blobs(loc, &descs)?;
            self.rebuild_meta(prior_blobs);
        }
        self.global.start(loc)
    }

    fn rebuild_meta(&self, prior_blobs: &[(String, BlobDesc)]) {
        for (key, desc) in prior_blobs {
            let blob = MemBlob::new(
                desc.rank,
                desc.gva,
                desc.size,
                desc.media,
                crate::meta::blob::BlobState::DataReady,
            );
            let attach = |obj: &Arc<MemObject>| {
                if let Err(e) = obj.add_blob(Arc::clone(&blob)) {
                    error!("rebuild: attach of {desc} to key {key} failed: {e}");
                    let _ = self.global.free(desc);
                }
            };

            match self.container.get(key) {
                Ok(obj) => attach(&obj),
                Err(_) => {
                    let obj = Arc::new(MemObject::new());
                    attach(&obj);
                    match self.container.insert(key, Arc::clone(&obj)) {
                        Ok(()) => {}
                        Err(MmcError::Duplicated) => {
                            // Raced with another replay of the same key.
                            if let Ok(existing) = self.container.get(key) {
                                for b in obj.remove_blobs(&BlobFilter::any()) {
                                    if let Err(e) = existing.add_blob(b) {
                                        error!("rebuild: merge of key {key} failed: {e}");
                                        let _ = self.global.free(desc);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!("rebuild: insert of key {key} failed: {e}");
                            let _ = self.global.free(desc);
                        }
                    }
                }
            }
        }
    }

    /// Stop the location's allocator, force-free every blob living
    /// there, drop emptied objects and detach the allocator.
    pub fn unmount(&self, loc: Location) -> Result<()> {
        self.global.stop(loc)?;

        let filter = BlobFilter::at(loc);
        let mut freed_all: Vec<(String, BlobDesc)> = Vec::new();
        self.container.erase_if(|key, obj| {
            match obj.free_blobs(key, &self.global, &filter) {
                Ok(freed) => {
                    for desc in freed {
                        freed_all.push((key.to_owned(), desc));
                    }
                }
                Err(e) => error!("unmount: force free of key {key} failed: {e}"),
            }
            obj.num_blobs() == 0
        });
        if let Some(journal) = &self.journal {
            for (key, desc) in freed_all {
                journal.push(JournalOp::Remove, &key, desc);
            }
        }

        self.global.unmount(loc)
    }

    // -----------------------------------------------------------------
    // Query / Exists
    // -----------------------------------------------------------------

    /// No side effects: no promotion, no lease.
    pub fn query(&self, key: &str) -> Result<QueryInfo> {
        let obj = self.container.get(key)?;
        let blobs = obj.blobs(&BlobFilter::any());
        Ok(QueryInfo {
            size: obj.size(),
            prot: obj.prot(),
            num_blobs: obj.num_blobs(),
            placements: blobs.iter().map(|b| b.location()).collect(),
            valid: true,
        })
    }

    pub fn batch_query(&self, keys: &[String]) -> Vec<Result<QueryInfo>> {
        keys.iter().map(|k| self.query(k)).collect()
    }

    pub fn exists(&self, key: &str) -> Result<()> {
        self.container.get(key).map(|_| ())
    }

    pub fn batch_exists(&self, keys: &[String]) -> Vec<Result<()>> {
        keys.iter().map(|k| self.exists(k)).collect()
    }

    // -----------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------

    /// When a tier reaches the high water mark, demote its cold objects
    /// (copy-then-demote) until that tier falls back to the low water
    /// mark. Objects with no tier below are removed. Hot keys survive:
    /// candidates come from the LRU tail, and promotion on Get keeps a
    /// continuously-read key away from it.
    pub fn check_and_evict(&self, peers: &dyn PeerChannel) {
        let tier = match [MediaType::Hbm, MediaType::Dram]
            .into_iter()
            .find(|m| self.global.usage_rate_of(*m) >= self.evict_high as u64)
        {
            Some(tier) => tier,
            None => return,
        };
        info!(
            "{tier} usage {}% over high water {}%, starting eviction sweep",
            self.global.usage_rate_of(tier),
            self.evict_high
        );

        self.container
            .multi_level_eliminate(self.evict_high, self.evict_low, |key, obj| {
                if self.global.usage_rate_of(tier) <= self.evict_low as u64 {
                    return Elimination::Stop;
                }
                // Objects not occupying the pressured tier are not in the way.
                if obj.blobs(&BlobFilter {
                    rank: None,
                    media: Some(tier),
                    readable: false,
                })
                .is_empty()
                {
                    return Elimination::Keep;
                }
                let target = obj.move_to();
                if target == MediaType::None {
                    self.push_remove(key, Arc::clone(obj));
                    return Elimination::Drop;
                }
                match self.move_blob(peers, key, obj, target) {
                    Ok(()) => Elimination::Keep,
                    Err(e) => {
                        warn!("demotion of key {key} failed ({e}), removing instead");
                        self.push_remove(key, Arc::clone(obj));
                        Elimination::Drop
                    }
                }
            });
    }

    /// Copy-then-demote one object: place a replacement blob at
    /// `target` tier, have the destination rank pull the bytes, then
    /// free the higher-tier placement.
    fn move_blob(
        &self,
        peers: &dyn PeerChannel,
        key: &str,
        obj: &Arc<MemObject>,
        target: MediaType,
    ) -> Result<()> {
        let readable = obj.blobs(&BlobFilter::readable());
        let src = readable.first().ok_or(MmcError::UnmatchedState)?;
        let src_desc = src.desc();

        let opts = AllocOptions::new(src_desc.size, 1, target, src_desc.rank, 0);
        let blobs = self.global.alloc(&opts)?;
        let dst = &blobs[0];
        dst.update_state(BlobAction::AllocOk)?;

        if let Err(e) = peers.blob_copy(&src_desc, &dst.desc()) {
            error!(
                "blob copy {} -> {} failed: {e}",
                src_desc,
                dst.desc()
            );
            let _ = dst.update_state(BlobAction::RemoveStart);
            let _ = dst.update_state(BlobAction::RemoveOk);
            let _ = self.global.free(&dst.desc());
            return Err(e);
        }

        dst.update_state(BlobAction::WriteOk)?;
        if let Some(journal) = &self.journal {
            journal.push(JournalOp::Add, key, dst.desc());
        }
        obj.add_blob(Arc::clone(dst))?;

        let freed = obj.free_blobs(key, &self.global, &BlobFilter::at(src_desc.location()))?;
        if let Some(journal) = &self.journal {
            for desc in freed {
                journal.push(JournalOp::Remove, key, desc);
            }
        }
        debug!("key {key} demoted {} -> {}", src_desc.media, target);
        Ok(())
    }

    // -----------------------------------------------------------------

    fn view_of(&self, obj: &Arc<MemObject>) -> ObjectView {
        let blobs = obj.blobs(&BlobFilter::any());
        ObjectView {
            size: obj.size(),
            prot: obj.prot(),
            priority: obj.priority(),
            lease: obj.lease().deadline(),
            blobs: blobs.iter().map(|b| b.desc()).collect(),
        }
    }
}

impl Drop for MetaManager {
    fn drop(&mut self) {
        self.stop();
    }
}
