// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Rebuild path: with the journal enabled, completed writes replicate
// descriptors to the owning rank; after a meta restart the journaled
// pairs remount into a fresh catalog and the data reads back.

use std::sync::Arc;
use std::time::Duration;

use mmcache::config::{ClientConfig, LocalServiceConfig, MetaServiceConfig};
use mmcache::fabric::{FabricDriver, HostFabric};
use mmcache::types::Location;
use mmcache::{LocalService, MediaType, MetaService, MmcBuffer, MmcClient, PutOptions};

const MIB: u64 = 1024 * 1024;

fn pattern(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + seed) % 253) as u8).collect()
}

#[test]
fn journaled_blobs_survive_a_meta_restart() {
    let _ = env_logger::builder().is_test(true).try_init();

    let meta_cfg = MetaServiceConfig {
        meta_service_url: "tcp://127.0.0.1:0".into(),
        meta_rebuild_enable: true,
        ..Default::default()
    };
    let meta1 = MetaService::start("meta-rebuild-1", &meta_cfg).unwrap();
    let url1 = format!("tcp://127.0.0.1:{}", meta1.port());

    let driver = Arc::new(HostFabric::new());
    let local_cfg = LocalServiceConfig {
        meta_service_url: url1.clone(),
        world_size: 64,
        rank_id: 61,
        dram_size: 2 * MIB,
        hbm_size: 0,
        ..Default::default()
    };
    let local = LocalService::start(
        "local-rebuild",
        &local_cfg,
        driver.clone() as Arc<dyn FabricDriver>,
    )
    .unwrap();

    let client1 = MmcClient::connect(
        &ClientConfig {
            meta_service_url: url1,
            rank_id: 61,
            ..Default::default()
        },
        local.proxy(),
        2000,
    )
    .unwrap();

    let payloads: Vec<Vec<u8>> = (0..3).map(|i| pattern(i, 16 * 1024)).collect();
    for (i, bytes) in payloads.iter().enumerate() {
        client1
            .put(&format!("journal-{i}"), &MmcBuffer::host_1d(bytes), PutOptions::default())
            .unwrap();
    }

    // The journal ships descriptors asynchronously; wait for the rank
    // to learn about all three.
    let mut known = Vec::new();
    for _ in 0..100 {
        known = local.known_blobs();
        if known.len() == 3 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(known.len(), 3, "journal never reached the rank");

    // Meta goes away; the rank keeps its segment and its descriptors.
    client1.disconnect();
    meta1.stop();

    // A fresh meta service remounts from the journaled pairs.
    let meta2 = MetaService::start("meta-rebuild-2", &meta_cfg).unwrap();
    meta2
        .manager()
        .mount(
            Location::new(61, MediaType::Dram),
            local.proxy().base(),
            local.proxy().capacity(),
            &known,
        )
        .unwrap();

    let client2 = MmcClient::connect(
        &ClientConfig {
            meta_service_url: format!("tcp://127.0.0.1:{}", meta2.port()),
            rank_id: 61,
            ..Default::default()
        },
        local.proxy(),
        2000,
    )
    .unwrap();

    for (i, bytes) in payloads.iter().enumerate() {
        let mut out = vec![0u8; bytes.len()];
        client2
            .get(&format!("journal-{i}"), &MmcBuffer::host_1d_mut(&mut out))
            .unwrap();
        assert_eq!(&out, bytes, "payload {i} differs after rebuild");
    }

    client2.disconnect();
    local.stop();
    meta2.stop();
}

#[test]
fn removed_keys_leave_the_journal() {
    let _ = env_logger::builder().is_test(true).try_init();

    let meta_cfg = MetaServiceConfig {
        meta_service_url: "tcp://127.0.0.1:0".into(),
        meta_rebuild_enable: true,
        default_ttl_ms: 100,
        ..Default::default()
    };
    let meta = MetaService::start("meta-journal-rm", &meta_cfg).unwrap();
    let url = format!("tcp://127.0.0.1:{}", meta.port());

    let driver = Arc::new(HostFabric::new());
    let local = LocalService::start(
        "local-journal-rm",
        &LocalServiceConfig {
            meta_service_url: url.clone(),
            world_size: 64,
            rank_id: 62,
            dram_size: 2 * MIB,
            hbm_size: 0,
            ..Default::default()
        },
        driver.clone() as Arc<dyn FabricDriver>,
    )
    .unwrap();

    let client = MmcClient::connect(
        &ClientConfig {
            meta_service_url: url,
            rank_id: 62,
            ..Default::default()
        },
        local.proxy(),
        2000,
    )
    .unwrap();

    let bytes = pattern(7, 8 * 1024);
    client
        .put("ephemeral", &MmcBuffer::host_1d(&bytes), PutOptions::default())
        .unwrap();

    for _ in 0..100 {
        if local.known_blobs().len() == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(local.known_blobs().len(), 1);

    client.remove("ephemeral").unwrap();
    // The async remove frees the blob and journals the removal.
    let mut remaining = 1;
    for _ in 0..100 {
        remaining = local.known_blobs().len();
        if remaining == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(remaining, 0, "removal never reached the rank");

    client.disconnect();
    local.stop();
    meta.stop();
}
