// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RPC engine over loopback: round trips, both call directions on one
// link, timeouts and unhandled opcodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mmcache::net::engine::{LinkKey, NetEngine, NetEngineOptions, RequestCtx, ROLE_CLIENT};
use mmcache::net::message::{
    GetRequest, MetaReplicateRequest, OpCode, PingMsg, StatusResponse,
};
use mmcache::meta::blob::BlobDesc;
use mmcache::types::MediaType;
use mmcache::MmcError;

fn listener(name: &str) -> NetEngine {
    NetEngine::start(&NetEngineOptions {
        name: name.into(),
        ip: "127.0.0.1".into(),
        port: 0,
        worker_threads: 2,
        rank_id: 0,
        start_listener: true,
    })
    .expect("start listener")
}

fn dialer(name: &str, rank: u32, port: u16) -> NetEngine {
    let engine = NetEngine::start(&NetEngineOptions {
        name: name.into(),
        worker_threads: 1,
        rank_id: rank,
        start_listener: false,
        ..Default::default()
    })
    .expect("start dialer");
    engine
        .connect("127.0.0.1", port, ROLE_CLIENT, LinkKey::meta())
        .expect("connect");
    engine
}

#[test]
fn ping_round_trip() {
    let server = listener("srv-ping");
    server.register_handler(
        OpCode::Ping,
        Arc::new(|ctx: &RequestCtx| {
            let req: PingMsg = ctx.request().unwrap();
            ctx.reply(&PingMsg::new(req.num + 1)).unwrap();
        }),
    );

    let client = dialer("cli-ping", 1, server.local_port());
    let resp: PingMsg = client
        .sync_call(LinkKey::meta(), &PingMsg::new(41), 5)
        .unwrap();
    assert_eq!(resp.num, 42);

    client.stop();
    server.stop();
}

#[test]
fn many_concurrent_calls_multiplex_one_link() {
    let server = listener("srv-mux");
    server.register_handler(
        OpCode::Ping,
        Arc::new(|ctx: &RequestCtx| {
            let req: PingMsg = ctx.request().unwrap();
            // Answer out of order sometimes.
            if req.num % 3 == 0 {
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            ctx.reply(&PingMsg::new(req.num * 2)).unwrap();
        }),
    );

    let client = Arc::new(dialer("cli-mux", 2, server.local_port()));
    let total = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for t in 0..8u64 {
        let client = Arc::clone(&client);
        let total = Arc::clone(&total);
        handles.push(std::thread::spawn(move || {
            for i in 0..16u64 {
                let n = t * 100 + i;
                let resp: PingMsg = client
                    .sync_call(LinkKey::meta(), &PingMsg::new(n), 5)
                    .unwrap();
                assert_eq!(resp.num, n * 2);
                total.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 128);

    client.stop();
    server.stop();
}

#[test]
fn server_calls_back_over_the_inbound_link() {
    let server = listener("srv-back");
    let client = dialer("cli-back", 9, server.local_port());

    client.register_handler(
        OpCode::MetaReplicate,
        Arc::new(|ctx: &RequestCtx| {
            let req: MetaReplicateRequest = ctx.request().unwrap();
            assert_eq!(req.key, "pushed");
            ctx.reply(&StatusResponse::new(0)).unwrap();
        }),
    );

    // Wait until the accept side registered the link.
    let key = LinkKey {
        rank: 9,
        role: ROLE_CLIENT,
    };
    for _ in 0..50 {
        if server.has_link(key) {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    let req = MetaReplicateRequest::new(
        0,
        "pushed".into(),
        BlobDesc {
            rank: 9,
            media: MediaType::Dram,
            gva: 0x1000,
            size: 4096,
        },
    );
    let resp: StatusResponse = server.sync_call(key, &req, 5).unwrap();
    assert_eq!(resp.ret, 0);

    client.stop();
    server.stop();
}

#[test]
fn missing_reply_times_out() {
    let server = listener("srv-timeout");
    server.register_handler(
        OpCode::Ping,
        Arc::new(|_ctx: &RequestCtx| {
            // Swallow the request.
        }),
    );

    let client = dialer("cli-timeout", 3, server.local_port());
    let err = client
        .sync_call::<_, PingMsg>(LinkKey::meta(), &PingMsg::new(0), 1)
        .unwrap_err();
    assert_eq!(err, MmcError::Timeout);

    client.stop();
    server.stop();
}

#[test]
fn unhandled_opcode_answers_with_error_status() {
    let server = listener("srv-unhandled");
    let client = dialer("cli-unhandled", 4, server.local_port());

    let resp: StatusResponse = client
        .sync_call(LinkKey::meta(), &GetRequest::new("k".into(), 0), 5)
        .unwrap();
    assert_ne!(resp.ret, 0);

    client.stop();
    server.stop();
}

#[test]
fn call_without_link_is_a_transport_error() {
    let engine = NetEngine::start(&NetEngineOptions::default()).unwrap();
    let err = engine
        .sync_call::<_, PingMsg>(LinkKey::meta(), &PingMsg::new(0), 1)
        .unwrap_err();
    assert!(matches!(err, MmcError::Transport(_)));
    engine.stop();
}
