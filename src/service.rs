// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The meta service: wires the manager to the RPC engine. One handler per
// opcode, direct calls into MetaManager — there is no proxy layer in
// between. Rank registration maps to mount/unmount, and a failed alloc
// gets one retry after an eviction sweep.

use std::sync::{Arc, Condvar, Mutex};

use log::{error, info, warn};

use crate::alloc::GlobalAllocator;
use crate::config::{parse_tcp_url, MetaServiceConfig};
use crate::error::{status_of, MmcError, Result};
use crate::meta::backup::{JournalEntry, JournalSink, RebuildJournal};
use crate::meta::blob::{BlobDesc, BlobFilter};
use crate::meta::manager::{MetaManager, ObjectView, PeerChannel, QueryInfo};
use crate::net::engine::{LinkKey, NetEngine, NetEngineOptions, RequestCtx, ROLE_LOCAL};
use crate::net::message::{
    AllocRequest, BatchGetRequest, BatchIsExistRequest, BatchQueryRequest, BatchQueryResponse,
    BatchRemoveRequest, BatchStatusResponse, BatchViewResponse, BlobCopyRequest, BmRegisterRequest,
    BmUnregisterRequest, GetRequest, IsExistRequest, MetaReplicateRequest, OpCode, PingMsg,
    QueryRequest, QueryResponse, RemoveRequest, StatusResponse, UpdateRequest, ViewResponse,
};
use crate::types::{Location, MediaType, OperateId, MAX_KEY_LEN, RPC_TIMEOUT_SECS};

/// Rank-to-rank side effects, carried over the registered local links.
struct EnginePeers {
    engine: NetEngine,
}

impl JournalSink for EnginePeers {
    fn replicate(&self, entry: &JournalEntry) -> Result<()> {
        let req = MetaReplicateRequest::new(entry.op as u8, entry.key.clone(), entry.desc);
        let resp: StatusResponse =
            self.engine
                .sync_call(LinkKey::local(entry.desc.rank), &req, RPC_TIMEOUT_SECS)?;
        match MmcError::from_status_code(resp.ret) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl PeerChannel for EnginePeers {
    fn replicate(&self, entry: &JournalEntry) -> Result<()> {
        JournalSink::replicate(self, entry)
    }

    fn blob_copy(&self, src: &BlobDesc, dst: &BlobDesc) -> Result<()> {
        // The destination side pulls, so the RPC goes to the dst rank.
        let req = BlobCopyRequest::new(*src, *dst);
        let resp: StatusResponse =
            self.engine
                .sync_call(LinkKey::local(dst.rank), &req, RPC_TIMEOUT_SECS)?;
        match MmcError::from_status_code(resp.ret) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Cadence of the background eviction check.
const EVICT_CHECK_MS: u64 = 200;

struct MetaSvcInner {
    name: String,
    manager: Arc<MetaManager>,
    engine: NetEngine,
    peers: Arc<EnginePeers>,
    evict_stop: Mutex<bool>,
    evict_cv: Condvar,
    evict_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// The deployable meta service.
pub struct MetaService {
    inner: Arc<MetaSvcInner>,
}

impl MetaService {
    pub fn start(name: &str, cfg: &MetaServiceConfig) -> Result<MetaService> {
        let errors = cfg.validate();
        if !errors.is_empty() {
            return Err(MmcError::InvalidParam(errors.join("; ")));
        }
        let (ip, port) = parse_tcp_url(&cfg.meta_service_url)
            .ok_or_else(|| MmcError::InvalidParam(format!("bad url {}", cfg.meta_service_url)))?;

        let engine = NetEngine::start(&NetEngineOptions {
            name: format!("{name}-net"),
            ip,
            port,
            worker_threads: cfg.worker_threads,
            rank_id: 0,
            start_listener: true,
        })?;

        let peers = Arc::new(EnginePeers {
            engine: engine.clone(),
        });
        let journal = if cfg.meta_rebuild_enable {
            Some(RebuildJournal::start(
                Arc::clone(&peers) as Arc<dyn JournalSink>
            ))
        } else {
            None
        };

        let manager = MetaManager::new(
            Arc::new(GlobalAllocator::new()),
            cfg.default_ttl_ms,
            cfg.evict_threshold_high,
            cfg.evict_threshold_low,
            journal,
        );

        let inner = Arc::new(MetaSvcInner {
            name: name.to_owned(),
            manager,
            engine: engine.clone(),
            peers,
            evict_stop: Mutex::new(false),
            evict_cv: Condvar::new(),
            evict_thread: Mutex::new(None),
        });
        Self::register_handlers(&inner);

        // Background demotion: tiers over the high water mark drain
        // toward the low water mark without waiting for a failed alloc.
        let for_evict = Arc::clone(&inner);
        let evict_thread = std::thread::Builder::new()
            .name("mmc-evict".into())
            .spawn(move || loop {
                {
                    let stop = for_evict.evict_stop.lock().unwrap();
                    let (stop, _) = for_evict
                        .evict_cv
                        .wait_timeout(stop, std::time::Duration::from_millis(EVICT_CHECK_MS))
                        .unwrap();
                    if *stop {
                        return;
                    }
                }
                for_evict.manager.check_and_evict(for_evict.peers.as_ref());
            })
            .expect("spawn evict thread");
        *inner.evict_thread.lock().unwrap() = Some(evict_thread);

        // A dropped local link takes its segments with it.
        let for_broken = Arc::clone(&inner);
        engine.register_link_broken(move |key: LinkKey| {
            if key.role != ROLE_LOCAL {
                return;
            }
            warn!("local service rank {} vanished, clearing its segments", key.rank);
            for media in [MediaType::Dram, MediaType::Hbm] {
                // Best effort; the rank usually contributed one tier.
                let _ = for_broken.manager.unmount(Location::new(key.rank, media));
            }
        });

        info!("meta service {name} listening on port {}", engine.local_port());
        Ok(MetaService { inner })
    }

    /// Port the listener bound (for port-0 configs).
    pub fn port(&self) -> u16 {
        self.inner.engine.local_port()
    }

    pub fn manager(&self) -> Arc<MetaManager> {
        Arc::clone(&self.inner.manager)
    }

    pub fn usage_rate(&self) -> u64 {
        self.inner.manager.usage_rate()
    }

    pub fn stop(&self) {
        {
            let mut stop = self.inner.evict_stop.lock().unwrap();
            *stop = true;
        }
        self.inner.evict_cv.notify_all();
        if let Some(h) = self.inner.evict_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        self.inner.engine.stop();
        self.inner.manager.stop();
        info!("meta service {} stopped", self.inner.name);
    }

    fn register_handlers(inner: &Arc<MetaSvcInner>) {
        macro_rules! handler {
            ($op:expr, $method:ident) => {{
                let inner = Arc::clone(inner);
                inner.engine.clone().register_handler(
                    $op,
                    Arc::new(move |ctx: &RequestCtx| inner.$method(ctx)),
                );
            }};
        }

        handler!(OpCode::Ping, handle_ping);
        handler!(OpCode::Alloc, handle_alloc);
        handler!(OpCode::Update, handle_update);
        handler!(OpCode::Get, handle_get);
        handler!(OpCode::BatchGet, handle_batch_get);
        handler!(OpCode::Remove, handle_remove);
        handler!(OpCode::BatchRemove, handle_batch_remove);
        handler!(OpCode::IsExist, handle_is_exist);
        handler!(OpCode::BatchIsExist, handle_batch_is_exist);
        handler!(OpCode::Query, handle_query);
        handler!(OpCode::BatchQuery, handle_batch_query);
        handler!(OpCode::BmRegister, handle_bm_register);
        handler!(OpCode::BmUnregister, handle_bm_unregister);
    }
}

fn key_ok(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(MmcError::InvalidParam(format!(
            "key length {} out of range",
            key.len()
        )));
    }
    Ok(())
}

impl MetaSvcInner {
    fn handle_ping(&self, ctx: &RequestCtx) {
        match ctx.request::<PingMsg>() {
            Ok(req) => {
                let _ = ctx.reply(&PingMsg::new(req.num));
            }
            Err(e) => warn!("{}: bad ping: {e}", self.name),
        }
    }

    fn handle_alloc(&self, ctx: &RequestCtx) {
        let result = ctx.request::<AllocRequest>().and_then(|req| {
            key_ok(&req.key)?;
            let operate_id = OperateId(req.operate_id);
            match self
                .manager
                .alloc(&req.key, &req.opts, operate_id, self.peers.as_ref())
            {
                // One retry after eviction when the pool is full.
                Err(MmcError::OutOfSpace) => {
                    self.manager.check_and_evict(self.peers.as_ref());
                    self.manager
                        .alloc(&req.key, &req.opts, operate_id, self.peers.as_ref())
                }
                other => other,
            }
        });
        reply_view(ctx, result);
    }

    fn handle_get(&self, ctx: &RequestCtx) {
        let result = ctx.request::<GetRequest>().and_then(|req| {
            key_ok(&req.key)?;
            self.manager
                .get(&req.key, OperateId(req.operate_id), BlobFilter::any())
        });
        reply_view(ctx, result);
    }

    fn handle_batch_get(&self, ctx: &RequestCtx) {
        match ctx.request::<BatchGetRequest>() {
            Ok(req) => {
                let results =
                    self.manager
                        .batch_get(&req.keys, OperateId(req.operate_id), BlobFilter::any());
                let statuses: Vec<i32> = results.iter().map(status_of).collect();
                let views: Vec<ObjectView> = results
                    .into_iter()
                    .map(|r| r.unwrap_or_default())
                    .collect();
                let _ = ctx.reply(&BatchViewResponse::new(statuses, views));
            }
            Err(e) => warn!("{}: bad batch get: {e}", self.name),
        }
    }

    fn handle_update(&self, ctx: &RequestCtx) {
        let result = ctx.request::<UpdateRequest>().and_then(|req| {
            key_ok(&req.key)?;
            let action = req.blob_action()?;
            let loc = if req.rank == u32::MAX {
                None
            } else {
                Some(Location::new(req.rank, MediaType::from_u8(req.media)))
            };
            self.manager
                .update_state(&req.key, loc, action, OperateId(req.operate_id))
        });
        reply_status(ctx, result);
    }

    fn handle_remove(&self, ctx: &RequestCtx) {
        let result = ctx.request::<RemoveRequest>().and_then(|req| {
            key_ok(&req.key)?;
            self.manager.remove(&req.key)
        });
        reply_status(ctx, result);
    }

    fn handle_batch_remove(&self, ctx: &RequestCtx) {
        match ctx.request::<BatchRemoveRequest>() {
            Ok(req) => {
                let statuses: Vec<i32> =
                    self.manager.batch_remove(&req.keys).iter().map(status_of).collect();
                let _ = ctx.reply(&BatchStatusResponse::new(statuses));
            }
            Err(e) => warn!("{}: bad batch remove: {e}", self.name),
        }
    }

    fn handle_is_exist(&self, ctx: &RequestCtx) {
        let result = ctx.request::<IsExistRequest>().and_then(|req| {
            key_ok(&req.key)?;
            self.manager.exists(&req.key)
        });
        reply_status(ctx, result);
    }

    fn handle_batch_is_exist(&self, ctx: &RequestCtx) {
        match ctx.request::<BatchIsExistRequest>() {
            Ok(req) => {
                let statuses: Vec<i32> =
                    self.manager.batch_exists(&req.keys).iter().map(status_of).collect();
                let _ = ctx.reply(&BatchStatusResponse::new(statuses));
            }
            Err(e) => warn!("{}: bad batch exist: {e}", self.name),
        }
    }

    fn handle_query(&self, ctx: &RequestCtx) {
        let result = ctx.request::<QueryRequest>().and_then(|req| {
            key_ok(&req.key)?;
            self.manager.query(&req.key)
        });
        match result {
            Ok(info) => {
                let _ = ctx.reply(&QueryResponse::new(0, info));
            }
            Err(e) => {
                let _ = ctx.reply(&QueryResponse::new(e.status_code(), QueryInfo::default()));
            }
        }
    }

    fn handle_batch_query(&self, ctx: &RequestCtx) {
        match ctx.request::<BatchQueryRequest>() {
            Ok(req) => {
                let results = self.manager.batch_query(&req.keys);
                let statuses: Vec<i32> = results.iter().map(status_of).collect();
                let infos: Vec<QueryInfo> = results
                    .into_iter()
                    .map(|r| r.unwrap_or_default())
                    .collect();
                let _ = ctx.reply(&BatchQueryResponse::new(statuses, infos));
            }
            Err(e) => warn!("{}: bad batch query: {e}", self.name),
        }
    }

    fn handle_bm_register(&self, ctx: &RequestCtx) {
        let result = ctx.request::<BmRegisterRequest>().and_then(|req| {
            let loc = Location::new(req.rank, MediaType::from_u8(req.media));
            info!(
                "{}: registering {loc}, base {:#x}, capacity {}, {} prior blobs",
                self.name,
                req.base,
                req.capacity,
                req.prior.len()
            );
            self.manager.mount(loc, req.base, req.capacity, &req.prior)
        });
        if let Err(e) = &result {
            error!("{}: bm register failed: {e}", self.name);
        }
        reply_status(ctx, result);
    }

    fn handle_bm_unregister(&self, ctx: &RequestCtx) {
        let result = ctx.request::<BmUnregisterRequest>().and_then(|req| {
            let loc = Location::new(req.rank, MediaType::from_u8(req.media));
            info!("{}: unregistering {loc}", self.name);
            self.manager.unmount(loc)
        });
        reply_status(ctx, result);
    }
}

fn reply_status(ctx: &RequestCtx, result: Result<()>) {
    let _ = ctx.reply(&StatusResponse::new(status_of(&result)));
}

fn reply_view(ctx: &RequestCtx, result: Result<ObjectView>) {
    match result {
        Ok(view) => {
            let _ = ctx.reply(&ViewResponse::new(0, view));
        }
        Err(e) => {
            let _ = ctx.reply(&ViewResponse::new(e.status_code(), ObjectView::default()));
        }
    }
}
