// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Registry of Location → BlobAllocator plus the locality policy that
// routes an allocation request to concrete segments. Mount/unmount take
// the registry write lock; every alloc/free path reads.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info, warn};

use crate::error::{MmcError, Result};
use crate::meta::blob::{BlobDesc, MemBlob};
use crate::rw_lock::RwLock;
use crate::types::{Location, MediaType, ALLOC_FORCE_BY_RANK};

use super::blob_alloc::BlobAllocator;

/// One allocation request as routed across the fabric.
#[derive(Debug, Clone, Copy)]
pub struct AllocOptions {
    pub blob_size: u64,
    /// Number of blobs (replicas) to place. One rank may carry several.
    pub num_blobs: u32,
    pub media: MediaType,
    pub preferred_rank: u32,
    pub flags: u32,
}

impl AllocOptions {
    pub fn new(blob_size: u64, num_blobs: u32, media: MediaType, preferred_rank: u32, flags: u32) -> AllocOptions {
        AllocOptions {
            blob_size,
            num_blobs,
            media,
            preferred_rank,
            flags,
        }
    }
}

type Registry = BTreeMap<Location, Arc<BlobAllocator>>;

/// The fabric-wide allocator registry.
#[derive(Default)]
pub struct GlobalAllocator {
    registry: RwLock<Registry>,
}

impl GlobalAllocator {
    pub fn new() -> GlobalAllocator {
        GlobalAllocator {
            registry: RwLock::new(Registry::new()),
        }
    }

    /// Register a new segment's allocator. Mounting an existing location
    /// is a no-op, matching a re-registering rank.
    pub fn mount(&self, loc: Location, base: u64, capacity: u64) -> Result<()> {
        let mut reg = self.registry.write();
        if reg.contains_key(&loc) {
            info!("allocator already mounted at {loc}");
            return Ok(());
        }
        reg.insert(loc, BlobAllocator::new(loc.rank, loc.media, base, capacity));
        Ok(())
    }

    /// Detach a segment's allocator. Refuses while any blob is live.
    pub fn unmount(&self, loc: Location) -> Result<()> {
        let mut reg = self.registry.write();
        let allocator = reg
            .get(&loc)
            .ok_or_else(|| MmcError::InvalidParam(format!("{loc} not mounted")))?;
        if !allocator.can_unmount() {
            error!("cannot unmount {loc}, space is in use");
            return Err(MmcError::InvalidParam(format!("{loc} still in use")));
        }
        reg.remove(&loc);
        Ok(())
    }

    pub fn start(&self, loc: Location) -> Result<()> {
        self.with_allocator(loc, |a| {
            a.start();
            Ok(())
        })
    }

    pub fn stop(&self, loc: Location) -> Result<()> {
        self.with_allocator(loc, |a| {
            a.stop();
            Ok(())
        })
    }

    /// Replay pre-existing blobs into a freshly mounted allocator.
    pub fn build_from_blobs(&self, loc: Location, blobs: &[BlobDesc]) -> Result<()> {
        self.with_allocator(loc, |a| a.build_from_blobs(blobs.iter()))
    }

    /// Place `num_blobs` blobs, walking ranks from the preferred one.
    ///
    /// The walk visits every mounted rank at the requested tier once,
    /// wrapping past the highest rank, unless `ALLOC_FORCE_BY_RANK` pins
    /// the preferred rank. Blobs already placed are rolled back when the
    /// request cannot be completed.
    pub fn alloc(&self, opts: &AllocOptions) -> Result<Vec<Arc<MemBlob>>> {
        let reg = self.registry.read();
        if reg.is_empty() {
            error!("alloc with empty allocator registry");
            return Err(MmcError::OutOfSpace);
        }

        let mut blobs: Vec<Arc<MemBlob>> = Vec::with_capacity(opts.num_blobs as usize);
        let result = self.arrange(&reg, opts, &mut blobs);
        drop(reg);

        if let Err(e) = result {
            for blob in blobs.drain(..) {
                let _ = self.free(&blob.desc());
            }
            warn!("alloc of {}x{} failed: {e}", opts.num_blobs, opts.blob_size);
            return Err(e);
        }
        Ok(blobs)
    }

    fn arrange(&self, reg: &Registry, opts: &AllocOptions, blobs: &mut Vec<Arc<MemBlob>>) -> Result<()> {
        // Mounted ranks at the requested tier, ascending.
        let ranks: Vec<u32> = reg
            .keys()
            .filter(|loc| loc.media == opts.media)
            .map(|loc| loc.rank)
            .collect();
        if ranks.is_empty() {
            return Err(MmcError::OutOfSpace);
        }
        // Rotate so the walk starts at the preferred rank (or the next
        // mounted one above it).
        let pivot = ranks.iter().position(|&r| r >= opts.preferred_rank).unwrap_or(0);

        for _ in 0..opts.num_blobs {
            let mut placed = false;
            for i in 0..ranks.len() {
                let rank = ranks[(pivot + i) % ranks.len()];
                if opts.flags & ALLOC_FORCE_BY_RANK != 0 && rank != opts.preferred_rank {
                    break;
                }
                let loc = Location::new(rank, opts.media);
                let allocator = &reg[&loc];
                if !allocator.can_alloc(opts.blob_size) {
                    continue;
                }
                match allocator.alloc(opts.blob_size) {
                    Ok(blob) => {
                        blobs.push(blob);
                        placed = true;
                        break;
                    }
                    Err(MmcError::OutOfSpace) => continue,
                    Err(e) => return Err(e),
                }
            }
            if !placed {
                return Err(MmcError::OutOfSpace);
            }
        }
        Ok(())
    }

    /// Route a release to the owning allocator.
    pub fn free(&self, desc: &BlobDesc) -> Result<()> {
        self.with_allocator(desc.location(), |a| a.release(desc))
    }

    /// Aggregate `allocated / capacity` across every allocator, percent.
    pub fn usage_rate(&self) -> u64 {
        let reg = self.registry.read();
        let mut total = 0u64;
        let mut used = 0u64;
        for allocator in reg.values() {
            let (cap, alloc) = allocator.usage();
            total += cap;
            used += alloc;
        }
        if total == 0 {
            return 0;
        }
        used * 100 / total
    }

    /// Usage of a single tier across ranks, percent.
    pub fn usage_rate_of(&self, media: MediaType) -> u64 {
        let reg = self.registry.read();
        let mut total = 0u64;
        let mut used = 0u64;
        for (loc, allocator) in reg.iter() {
            if loc.media != media {
                continue;
            }
            let (cap, alloc) = allocator.usage();
            total += cap;
            used += alloc;
        }
        if total == 0 {
            return 0;
        }
        used * 100 / total
    }

    pub fn is_mounted(&self, loc: Location) -> bool {
        self.registry.read().contains_key(&loc)
    }

    fn with_allocator<R>(&self, loc: Location, f: impl FnOnce(&BlobAllocator) -> Result<R>) -> Result<R> {
        let reg = self.registry.read();
        let allocator = reg
            .get(&loc)
            .ok_or_else(|| MmcError::InvalidParam(format!("{loc} not mounted")))?;
        f(allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1024;

    fn pool(ranks: u32, media: MediaType, capacity: u64) -> GlobalAllocator {
        let g = GlobalAllocator::new();
        for rank in 0..ranks {
            let loc = Location::new(rank, media);
            g.mount(loc, ((rank as u64 + 1) << 32) | ((media as u64) << 28), capacity)
                .unwrap();
            g.start(loc).unwrap();
        }
        g
    }

    #[test]
    fn spills_to_next_rank_when_preferred_fills() {
        // Four ranks, 320K DRAM each. Twelve 32K blobs preferring rank 2:
        // ten fill rank 2, the remaining two land on rank 3.
        let g = pool(4, MediaType::Dram, 320 * KIB);
        let opts = AllocOptions::new(32 * KIB, 12, MediaType::Dram, 2, 0);
        let blobs = g.alloc(&opts).unwrap();
        assert_eq!(blobs.len(), 12);
        assert_eq!(blobs.iter().filter(|b| b.rank() == 2).count(), 10);
        assert_eq!(blobs.iter().filter(|b| b.rank() == 3).count(), 2);
    }

    #[test]
    fn walk_wraps_past_highest_rank() {
        let g = pool(3, MediaType::Dram, 64 * KIB);
        // Fill rank 2 completely, then prefer it again: placement wraps to 0.
        let first = g.alloc(&AllocOptions::new(64 * KIB, 1, MediaType::Dram, 2, 0)).unwrap();
        assert_eq!(first[0].rank(), 2);
        let second = g.alloc(&AllocOptions::new(64 * KIB, 1, MediaType::Dram, 2, 0)).unwrap();
        assert_eq!(second[0].rank(), 0);
    }

    #[test]
    fn force_by_rank_fails_instead_of_advancing() {
        let g = pool(2, MediaType::Dram, 64 * KIB);
        g.alloc(&AllocOptions::new(64 * KIB, 1, MediaType::Dram, 0, 0)).unwrap();
        let err = g
            .alloc(&AllocOptions::new(64 * KIB, 1, MediaType::Dram, 0, ALLOC_FORCE_BY_RANK))
            .unwrap_err();
        assert_eq!(err, MmcError::OutOfSpace);
        // Without the flag the same request lands on rank 1.
        let ok = g.alloc(&AllocOptions::new(64 * KIB, 1, MediaType::Dram, 0, 0)).unwrap();
        assert_eq!(ok[0].rank(), 1);
    }

    #[test]
    fn partial_placement_rolls_back() {
        let g = pool(2, MediaType::Dram, 64 * KIB);
        // Three 64K blobs cannot fit in two 64K segments.
        let err = g.alloc(&AllocOptions::new(64 * KIB, 3, MediaType::Dram, 0, 0)).unwrap_err();
        assert_eq!(err, MmcError::OutOfSpace);
        assert_eq!(g.usage_rate(), 0);
    }

    #[test]
    fn wrong_tier_is_out_of_space() {
        let g = pool(2, MediaType::Dram, 64 * KIB);
        let err = g.alloc(&AllocOptions::new(4 * KIB, 1, MediaType::Hbm, 0, 0)).unwrap_err();
        assert_eq!(err, MmcError::OutOfSpace);
    }

    #[test]
    fn unmount_refuses_while_in_use() {
        let g = pool(1, MediaType::Hbm, 64 * KIB);
        let loc = Location::new(0, MediaType::Hbm);
        let blobs = g.alloc(&AllocOptions::new(4 * KIB, 1, MediaType::Hbm, 0, 0)).unwrap();
        assert!(g.unmount(loc).is_err());
        g.free(&blobs[0].desc()).unwrap();
        g.unmount(loc).unwrap();
        assert!(!g.is_mounted(loc));
    }
}
