// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Best-fit free-space manager over one (rank, media) segment.
//
// The free set is kept in two views backed by the same ranges:
//   by_offset : offset → size   (merge neighbours on release)
//   by_size   : (size, offset)  (best-fit lookup, lowest offset wins ties)
// All sizes are rounded up to the 4 KiB blob alignment before they touch
// either view, so free ranges and live blobs tile the segment exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::warn;

use crate::error::{MmcError, Result};
use crate::meta::blob::{BlobDesc, BlobState, MemBlob};
use crate::spin_lock::SpinMutex;
use crate::types::{align_up, MediaType};

struct FreeSet {
    by_offset: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
    allocated: u64,
    started: bool,
}

impl FreeSet {
    fn insert(&mut self, offset: u64, size: u64) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
    }

    fn remove(&mut self, offset: u64, size: u64) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
    }

    /// Smallest free range that fits `size`; lowest offset breaks ties.
    fn best_fit(&self, size: u64) -> Option<(u64, u64)> {
        self.by_size
            .range((size, 0)..)
            .next()
            .map(|&(sz, off)| (off, sz))
    }
}

/// Fragmentation-aware allocator for one segment.
///
/// Starts with a single free range `[0, capacity)`. Serves nothing until
/// `start()`; after `stop()` new allocations fail but outstanding blobs
/// may still be released.
pub struct BlobAllocator {
    rank: u32,
    media: MediaType,
    base: u64,
    capacity: u64,
    inner: SpinMutex<FreeSet>,
}

impl BlobAllocator {
    pub fn new(rank: u32, media: MediaType, base: u64, capacity: u64) -> Arc<BlobAllocator> {
        let mut free = FreeSet {
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
            allocated: 0,
            started: false,
        };
        free.insert(0, capacity);
        Arc::new(BlobAllocator {
            rank,
            media,
            base,
            capacity,
            inner: SpinMutex::new(free),
        })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn media(&self) -> MediaType {
        self.media
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn start(&self) {
        self.inner.lock().started = true;
    }

    pub fn stop(&self) {
        self.inner.lock().started = false;
    }

    /// Non-binding hint: does a free range of the aligned size exist?
    pub fn can_alloc(&self, size: u64) -> bool {
        let aligned = align_up(size);
        let inner = self.inner.lock();
        if !inner.started {
            return false;
        }
        inner.best_fit(aligned).is_some()
    }

    /// Carve the best-fit range and hand back a blob in `Init` state with
    /// `gva = base + offset`. A larger range leaves its remainder free.
    pub fn alloc(&self, size: u64) -> Result<Arc<MemBlob>> {
        let aligned = align_up(size);
        let mut inner = self.inner.lock();
        if !inner.started {
            warn!("allocator {}/{} is stopped", self.rank, self.media);
            return Err(MmcError::NotStarted);
        }
        let (offset, range_size) = match inner.best_fit(aligned) {
            Some(r) => r,
            None => {
                warn!(
                    "allocator {}/{} cannot fit {} bytes",
                    self.rank, self.media, size
                );
                return Err(MmcError::OutOfSpace);
            }
        };

        inner.remove(offset, range_size);
        if range_size > aligned {
            inner.insert(offset + aligned, range_size - aligned);
        }
        inner.allocated += aligned;
        drop(inner);

        Ok(MemBlob::new(
            self.rank,
            self.base + offset,
            size,
            self.media,
            BlobState::Init,
        ))
    }

    /// Return a blob's extent to the free set, coalescing with both
    /// neighbours. Releasing a range that is outside the segment or
    /// already free is a program error.
    pub fn release(&self, desc: &BlobDesc) -> Result<()> {
        let aligned = align_up(desc.size);
        if desc.gva < self.base || desc.gva + aligned > self.base + self.capacity {
            return Err(MmcError::InvalidParam(format!(
                "{desc} not inside segment {:#x}+{}",
                self.base, self.capacity
            )));
        }
        let offset = desc.gva - self.base;

        let mut inner = self.inner.lock();

        // A free range at or spanning this offset means a double free.
        if inner.by_offset.contains_key(&offset) {
            return Err(MmcError::InvalidParam(format!("{desc} already free")));
        }
        let mut final_offset = offset;
        let mut final_size = aligned;
        if let Some((&prev_off, &prev_size)) = inner.by_offset.range(..offset).next_back() {
            if prev_off + prev_size > offset {
                return Err(MmcError::InvalidParam(format!("{desc} already free")));
            }
            if prev_off + prev_size == offset {
                inner.remove(prev_off, prev_size);
                final_offset = prev_off;
                final_size += prev_size;
            }
        }
        if let Some(&next_size) = inner.by_offset.get(&(offset + aligned)) {
            inner.remove(offset + aligned, next_size);
            final_size += next_size;
        }

        inner.insert(final_offset, final_size);
        inner.allocated -= aligned;
        Ok(())
    }

    /// Crash-recovery replay: carve every known blob back out of the free
    /// set before the allocator starts serving.
    pub fn build_from_blobs<'a>(&self, blobs: impl IntoIterator<Item = &'a BlobDesc>) -> Result<()> {
        let mut inner = self.inner.lock();
        for desc in blobs {
            let aligned = align_up(desc.size);
            if desc.gva < self.base || desc.gva + aligned > self.base + self.capacity {
                return Err(MmcError::InvalidParam(format!(
                    "{desc} not inside segment {:#x}+{}",
                    self.base, self.capacity
                )));
            }
            let offset = desc.gva - self.base;

            // The free range containing this extent.
            let (&range_off, &range_size) = inner
                .by_offset
                .range(..=offset)
                .next_back()
                .ok_or_else(|| MmcError::InvalidParam(format!("{desc} overlaps a live blob")))?;
            if range_off + range_size < offset + aligned {
                return Err(MmcError::InvalidParam(format!("{desc} overlaps a live blob")));
            }

            inner.remove(range_off, range_size);
            if offset > range_off {
                inner.insert(range_off, offset - range_off);
            }
            if range_off + range_size > offset + aligned {
                inner.insert(offset + aligned, range_off + range_size - offset - aligned);
            }
            inner.allocated += aligned;
        }
        Ok(())
    }

    /// `(capacity, allocated)` in bytes.
    pub fn usage(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (self.capacity, inner.allocated)
    }

    pub fn can_unmount(&self) -> bool {
        self.inner.lock().allocated == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1024;

    fn fresh(capacity: u64) -> Arc<BlobAllocator> {
        let a = BlobAllocator::new(0, MediaType::Dram, 0x10_0000, capacity);
        a.start();
        a
    }

    #[test]
    fn free_accounting_stays_exact() {
        let a = fresh(1024 * KIB);
        let b1 = a.alloc(100 * KIB).unwrap();
        let b2 = a.alloc(50 * KIB).unwrap();
        let (cap, used) = a.usage();
        assert_eq!(cap, 1024 * KIB);
        assert_eq!(used, align_up(100 * KIB) + align_up(50 * KIB));
        a.release(&b1.desc()).unwrap();
        a.release(&b2.desc()).unwrap();
        assert_eq!(a.usage().1, 0);
        assert!(a.can_unmount());
    }

    #[test]
    fn best_fit_reuses_lowest_freed_hole() {
        // Sixteen 64K blobs fill 1 MiB exactly; free the 2nd, 4th, 6th.
        let a = fresh(1024 * KIB);
        let blobs: Vec<_> = (0..16).map(|_| a.alloc(64 * KIB).unwrap()).collect();
        assert!(!a.can_alloc(64 * KIB));

        for idx in [1, 3, 5] {
            a.release(&blobs[idx].desc()).unwrap();
        }

        // Lowest-offset 64K hole is where the 2nd blob sat.
        let again = a.alloc(64 * KIB).unwrap();
        assert_eq!(again.gva(), blobs[1].gva());

        // Two disjoint 64K holes remain; 192K cannot fit.
        assert!(!a.can_alloc(192 * KIB));
        assert_eq!(a.alloc(192 * KIB).unwrap_err(), MmcError::OutOfSpace);
    }

    #[test]
    fn release_coalesces_both_sides() {
        let a = fresh(1024 * KIB);
        let b1 = a.alloc(64 * KIB).unwrap();
        let b2 = a.alloc(64 * KIB).unwrap();
        let b3 = a.alloc(64 * KIB).unwrap();
        // Free outer two, then the middle one: the three ranges and the
        // tail must merge into a single free range covering everything.
        a.release(&b1.desc()).unwrap();
        a.release(&b3.desc()).unwrap();
        a.release(&b2.desc()).unwrap();
        assert!(a.can_alloc(1024 * KIB));
    }

    #[test]
    fn double_free_is_invalid() {
        let a = fresh(256 * KIB);
        let b = a.alloc(64 * KIB).unwrap();
        a.release(&b.desc()).unwrap();
        assert!(matches!(a.release(&b.desc()), Err(MmcError::InvalidParam(_))));
    }

    #[test]
    fn out_of_segment_release_is_invalid() {
        let a = fresh(256 * KIB);
        let foreign = BlobDesc {
            rank: 0,
            media: MediaType::Dram,
            gva: 0x50_0000,
            size: 4 * KIB,
        };
        assert!(matches!(a.release(&foreign), Err(MmcError::InvalidParam(_))));
    }

    #[test]
    fn stopped_allocator_refuses_new_but_frees_old() {
        let a = fresh(256 * KIB);
        let b = a.alloc(64 * KIB).unwrap();
        a.stop();
        assert!(!a.can_alloc(4 * KIB));
        assert!(a.alloc(4 * KIB).is_err());
        a.release(&b.desc()).unwrap();
        assert!(a.can_unmount());
    }

    #[test]
    fn build_from_blobs_carves_live_extents() {
        let a = BlobAllocator::new(2, MediaType::Hbm, 0x2000_0000, 256 * KIB);
        let prior = [
            BlobDesc {
                rank: 2,
                media: MediaType::Hbm,
                gva: 0x2000_0000 + 64 * KIB,
                size: 64 * KIB,
            },
            BlobDesc {
                rank: 2,
                media: MediaType::Hbm,
                gva: 0x2000_0000,
                size: 32 * KIB,
            },
        ];
        a.build_from_blobs(prior.iter()).unwrap();
        a.start();
        assert_eq!(a.usage().1, 96 * KIB);
        // Largest remaining hole is the 128K tail.
        assert!(a.can_alloc(128 * KIB));
        assert!(!a.can_alloc(160 * KIB));
        // Replaying an overlapping blob fails.
        assert!(a.build_from_blobs(prior[..1].iter()).is_err());
    }
}
