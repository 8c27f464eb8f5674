// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Copy-then-demote: an over-full HBM tier drains into DRAM, demoted
// keys stay readable with identical bytes, and continuously read keys
// survive the sweep.

use std::sync::Arc;

use mmcache::alloc::{AllocOptions, GlobalAllocator};
use mmcache::fabric::{CopyDir, FabricDriver, HostFabric};
use mmcache::meta::backup::JournalEntry;
use mmcache::meta::blob::{BlobAction, BlobDesc, BlobFilter};
use mmcache::meta::manager::{MetaManager, PeerChannel};
use mmcache::types::{next_operate_id, Location, MediaType};
use mmcache::Result;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Peers that run the destination pull straight on the fabric.
struct FabricPeers {
    driver: Arc<HostFabric>,
}

impl PeerChannel for FabricPeers {
    fn replicate(&self, _entry: &JournalEntry) -> Result<()> {
        Ok(())
    }

    fn blob_copy(&self, src: &BlobDesc, dst: &BlobDesc) -> Result<()> {
        self.driver.copy_gva(src.gva, dst.gva, src.size)
    }
}

fn pattern(seed: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i as u64 * 23 + seed) % 251) as u8).collect()
}

struct Tiering {
    manager: Arc<MetaManager>,
    global: Arc<GlobalAllocator>,
    driver: Arc<HostFabric>,
    peers: FabricPeers,
}

/// One HBM rank and one DRAM rank, segments committed on the fabric.
fn tiered_pool(hbm_rank: u32, dram_rank: u32, capacity: u64) -> Tiering {
    let driver = Arc::new(HostFabric::new());
    let global = Arc::new(GlobalAllocator::new());
    let manager = MetaManager::new(Arc::clone(&global), 2000, 70, 60, None);

    let hbm = Location::new(hbm_rank, MediaType::Hbm);
    let dram = Location::new(dram_rank, MediaType::Dram);
    for (loc, media) in [(hbm, MediaType::Hbm), (dram, MediaType::Dram)] {
        let base = driver.gva_reserve(loc.rank, media, capacity).unwrap();
        driver.gva_alloc(base, capacity).unwrap();
        manager.mount(loc, base, capacity, &[]).unwrap();
    }

    Tiering {
        manager,
        global,
        peers: FabricPeers {
            driver: Arc::clone(&driver),
        },
        driver,
    }
}

fn put_bytes(t: &Tiering, key: &str, bytes: &[u8], media: MediaType, rank: u32) {
    let op = next_operate_id(0);
    let view = t
        .manager
        .alloc(
            key,
            &AllocOptions::new(bytes.len() as u64, 1, media, rank, 0),
            op,
            &t.peers,
        )
        .unwrap();
    t.driver
        .copy(
            CopyDir::H2G,
            bytes.as_ptr() as u64,
            view.blobs[0].gva,
            bytes.len() as u64,
        )
        .unwrap();
    t.manager
        .update_state(key, Some(Location::new(view.blobs[0].rank, media)), BlobAction::WriteOk, op)
        .unwrap();
}

fn get_bytes(t: &Tiering, key: &str, len: usize) -> Vec<u8> {
    let op = next_operate_id(0);
    let view = t.manager.get(key, op, BlobFilter::any()).unwrap();
    let mut out = vec![0u8; len];
    t.driver
        .copy(
            CopyDir::G2H,
            view.blobs[0].gva,
            out.as_mut_ptr() as u64,
            len as u64,
        )
        .unwrap();
    t.manager
        .update_state(key, Some(view.blobs[0].location()), BlobAction::ReadOk, op)
        .unwrap();
    out
}

#[test]
fn overfull_hbm_drains_to_dram_with_identical_bytes() {
    let t = tiered_pool(40, 41, MIB);
    let blob = 64 * KIB;

    // 12 x 64K = 75% of the HBM tier, over the 70% high water mark.
    let keys: Vec<String> = (0..12).map(|i| format!("demote-{i}")).collect();
    for (i, key) in keys.iter().enumerate() {
        put_bytes(&t, key, &pattern(i as u64, blob as usize), MediaType::Hbm, 40);
    }
    assert!(t.global.usage_rate_of(MediaType::Hbm) >= 70);

    t.manager.check_and_evict(&t.peers);

    assert!(t.global.usage_rate_of(MediaType::Hbm) <= 60);
    // Every key is still present and byte-identical, wherever it lives.
    for (i, key) in keys.iter().enumerate() {
        t.manager.exists(key).unwrap();
        assert_eq!(get_bytes(&t, key, blob as usize), pattern(i as u64, blob as usize));
    }
    // Something actually moved down.
    let moved = keys
        .iter()
        .filter(|k| {
            t.manager.query(k).unwrap().placements[0].media == MediaType::Dram
        })
        .count();
    assert!(moved > 0);
}

#[test]
fn promoted_keys_escape_the_sweep() {
    let t = tiered_pool(42, 43, MIB);
    let blob = 64 * KIB;

    let keys: Vec<String> = (0..12).map(|i| format!("hot-cold-{i}")).collect();
    for (i, key) in keys.iter().enumerate() {
        put_bytes(&t, key, &pattern(i as u64, blob as usize), MediaType::Hbm, 42);
    }

    // Keep the last four hot right before the sweep.
    for key in &keys[8..] {
        let _ = get_bytes(&t, key, blob as usize);
    }

    t.manager.check_and_evict(&t.peers);

    // The hot tail is still resident in HBM.
    for key in &keys[8..] {
        let q = t.manager.query(key).unwrap();
        assert!(q.valid);
        assert_eq!(q.placements[0].media, MediaType::Hbm, "key {key} was demoted");
    }
}

#[test]
fn below_high_water_nothing_happens() {
    let t = tiered_pool(44, 45, MIB);
    put_bytes(&t, "only", &pattern(1, 64 * KIB as usize), MediaType::Hbm, 44);

    t.manager.check_and_evict(&t.peers);

    let q = t.manager.query("only").unwrap();
    assert_eq!(q.placements[0].media, MediaType::Hbm);
}
