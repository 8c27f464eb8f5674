// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The logical value bound to one key: up to MAX_NUM_BLOB_CHAINS head
// slots plus an overflow chain threaded through the blobs themselves.
// All blobs of one object carry the same byte size.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::error;

use crate::alloc::GlobalAllocator;
use crate::error::{MmcError, Result};
use crate::meta::blob::{BlobAction, BlobFilter, MemBlob};
use crate::meta::lease::LeaseManager;
use crate::types::MediaType;

/// Head slots per object; further copies chain off the last slot.
pub const MAX_NUM_BLOB_CHAINS: usize = 5;

#[derive(Debug)]
struct ObjState {
    slots: [Option<Arc<MemBlob>>; MAX_NUM_BLOB_CHAINS],
    num_blobs: u16,
    /// Byte size shared by every blob of this object.
    size: u64,
    prot: u16,
    priority: u8,
}

/// One key's object: blob aggregate plus its lease.
#[derive(Debug)]
pub struct MemObject {
    state: Mutex<ObjState>,
    lease: LeaseManager,
    /// Recency stamp maintained by the container; orders eviction
    /// candidates across shards.
    touch: AtomicU64,
}

impl Default for MemObject {
    fn default() -> Self {
        Self::new()
    }
}

impl MemObject {
    pub fn new() -> MemObject {
        MemObject {
            state: Mutex::new(ObjState {
                slots: Default::default(),
                num_blobs: 0,
                size: 0,
                prot: 0,
                priority: 0,
            }),
            lease: LeaseManager::new(),
            touch: AtomicU64::new(0),
        }
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    pub fn touched(&self, stamp: u64) {
        self.touch.store(stamp, Ordering::Relaxed);
    }

    pub fn last_touch(&self) -> u64 {
        self.touch.load(Ordering::Relaxed)
    }

    pub fn num_blobs(&self) -> u16 {
        self.state.lock().unwrap().num_blobs
    }

    pub fn size(&self) -> u64 {
        self.state.lock().unwrap().size
    }

    pub fn prot(&self) -> u16 {
        self.state.lock().unwrap().prot
    }

    pub fn priority(&self) -> u8 {
        self.state.lock().unwrap().priority
    }

    /// Attach one more blob. Every blob of an object must agree on size.
    pub fn add_blob(&self, blob: Arc<MemBlob>) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.num_blobs != 0 && st.size != blob.size() {
            error!("blob size {} != object size {}", blob.size(), st.size);
            return Err(MmcError::InvalidParam("blob size mismatch".into()));
        }
        st.size = blob.size();

        for slot in st.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(blob);
                st.num_blobs += 1;
                return Ok(());
            }
        }
        // Slots full: append to the chain behind the last slot.
        let mut tail = st.slots[MAX_NUM_BLOB_CHAINS - 1].clone().unwrap();
        loop {
            match tail.next() {
                Some(next) => tail = next,
                None => break,
            }
        }
        tail.set_next(blob)?;
        st.num_blobs += 1;
        Ok(())
    }

    /// Blobs passing `filter`, slots first, then the overflow chain.
    pub fn blobs(&self, filter: &BlobFilter) -> Vec<Arc<MemBlob>> {
        let st = self.state.lock().unwrap();
        let mut out = Vec::new();
        for slot in st.slots.iter().flatten() {
            if filter.matches(slot) {
                out.push(Arc::clone(slot));
            }
        }
        let mut cur = st.slots[MAX_NUM_BLOB_CHAINS - 1]
            .as_ref()
            .and_then(|b| b.next());
        while let Some(blob) = cur {
            if filter.matches(&blob) {
                out.push(Arc::clone(&blob));
            }
            cur = blob.next();
        }
        out
    }

    /// Detach every blob passing `filter` and return them.
    pub fn remove_blobs(&self, filter: &BlobFilter) -> Vec<Arc<MemBlob>> {
        let mut st = self.state.lock().unwrap();
        let mut removed = Vec::new();

        // Chain first, so unlinking cannot orphan survivors behind a
        // removed chain head.
        if let Some(last) = st.slots[MAX_NUM_BLOB_CHAINS - 1].clone() {
            let mut prev = last;
            while let Some(cur) = prev.next() {
                if filter.matches(&cur) {
                    prev.replace_next(cur.take_next());
                    removed.push(cur);
                } else {
                    prev = cur;
                }
            }
        }

        for slot in st.slots.iter_mut() {
            if let Some(blob) = slot {
                if filter.matches(blob) {
                    let blob = slot.take().unwrap();
                    // A removed tail slot hands its chain to the survivor.
                    if let Some(chain) = blob.take_next() {
                        *slot = Some(chain);
                        removed.push(blob);
                        continue;
                    }
                    removed.push(blob);
                }
            }
        }

        st.num_blobs -= removed.len() as u16;
        removed
    }

    /// Apply one state-machine action to every blob passing `filter`.
    /// Fails if any blob rejects the transition; the rest still advance.
    pub fn update_blobs_state(&self, filter: &BlobFilter, action: BlobAction) -> Result<()> {
        let blobs = self.blobs(filter);
        if blobs.is_empty() {
            return Err(MmcError::UnmatchedKey);
        }
        let mut result = Ok(());
        for blob in blobs {
            if let Err(e) = blob.update_state(action) {
                error!("blob {} rejected {:?}", blob.desc(), action);
                result = Err(e);
            }
        }
        result
    }

    /// Detach and free every blob passing `filter`: drive each through
    /// Removing to Final, then hand the extent back to its allocator.
    /// Returns the descriptors freed.
    pub fn free_blobs(
        &self,
        key: &str,
        allocator: &GlobalAllocator,
        filter: &BlobFilter,
    ) -> Result<Vec<crate::meta::blob::BlobDesc>> {
        let blobs = self.remove_blobs(filter);
        let mut freed = Vec::with_capacity(blobs.len());
        let mut result = Ok(());
        for blob in blobs {
            // A blob still mid-write or mid-read is forced through the
            // remove path; the state machine orders Final after Removing.
            if blob.state() == crate::meta::blob::BlobState::Copying {
                let _ = blob.update_state(BlobAction::ReadOk);
            }
            if blob.state() == crate::meta::blob::BlobState::DataWriting {
                let _ = blob.update_state(BlobAction::WriteFail);
            }
            if let Err(e) = blob
                .update_state(BlobAction::RemoveStart)
                .and_then(|_| blob.update_state(BlobAction::RemoveOk))
            {
                error!("key {key}: remove transition failed for {}: {e}", blob.desc());
                result = Err(e);
                continue;
            }
            if let Err(e) = allocator.free(&blob.desc()) {
                error!("key {key}: free failed for {}: {e}", blob.desc());
                result = Err(e);
                continue;
            }
            freed.push(blob.desc());
        }
        result.map(|_| freed)
    }

    /// Tier the object would demote to: one step below its highest
    /// current placement, `None` when there is nothing below.
    pub fn move_to(&self) -> MediaType {
        let blobs = self.blobs(&BlobFilter::any());
        blobs
            .iter()
            .map(|b| b.media())
            .max()
            .map(|m| m.lower())
            .unwrap_or(MediaType::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::blob::BlobState;
    use crate::types::Location;

    fn ready_blob(rank: u32, gva: u64, media: MediaType) -> Arc<MemBlob> {
        MemBlob::new(rank, gva, 4096, media, BlobState::DataReady)
    }

    #[test]
    fn blobs_spill_into_overflow_chain() {
        let obj = MemObject::new();
        for i in 0..8u64 {
            obj.add_blob(ready_blob(i as u32, i * 0x1000, MediaType::Dram)).unwrap();
        }
        assert_eq!(obj.num_blobs(), 8);
        assert_eq!(obj.blobs(&BlobFilter::any()).len(), 8);
    }

    #[test]
    fn size_mismatch_rejected() {
        let obj = MemObject::new();
        obj.add_blob(ready_blob(0, 0, MediaType::Dram)).unwrap();
        let odd = MemBlob::new(0, 0x1000, 8192, MediaType::Dram, BlobState::DataReady);
        assert!(obj.add_blob(odd).is_err());
    }

    #[test]
    fn remove_by_location_keeps_the_rest() {
        let obj = MemObject::new();
        for i in 0..7u32 {
            obj.add_blob(ready_blob(i % 2, (i as u64) * 0x1000, MediaType::Dram)).unwrap();
        }
        let removed = obj.remove_blobs(&BlobFilter::at(Location::new(0, MediaType::Dram)));
        assert_eq!(removed.len(), 4);
        assert_eq!(obj.num_blobs(), 3);
        assert!(obj
            .blobs(&BlobFilter::any())
            .iter()
            .all(|b| b.rank() == 1));
    }

    #[test]
    fn move_to_steps_down_from_highest_tier() {
        let obj = MemObject::new();
        obj.add_blob(ready_blob(0, 0, MediaType::Hbm)).unwrap();
        assert_eq!(obj.move_to(), MediaType::Dram);

        let dram_only = MemObject::new();
        dram_only.add_blob(ready_blob(0, 0x2000, MediaType::Dram)).unwrap();
        assert_eq!(dram_only.move_to(), MediaType::None);
    }
}
