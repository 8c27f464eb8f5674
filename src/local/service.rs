// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-rank local service. Connects out to the meta service, registers
// the rank's segment (shipping journaled descriptors back when rebuild
// is on), and serves the two rank-to-rank RPCs the meta service issues:
// MetaReplicate (descriptor install/remove) and BlobCopy (destination-
// side pull).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use crate::config::{parse_tcp_url, LocalServiceConfig};
use crate::error::{MmcError, Result};
use crate::fabric::FabricDriver;
use crate::meta::backup::JournalOp;
use crate::meta::blob::BlobDesc;
use crate::net::engine::{LinkKey, NetEngine, NetEngineOptions, RequestCtx, ROLE_LOCAL};
use crate::net::message::{
    BlobCopyRequest, BmRegisterRequest, BmUnregisterRequest, MetaReplicateRequest, OpCode,
    StatusResponse,
};
use crate::types::RPC_TIMEOUT_SECS;

use super::bm_proxy::BmProxy;

struct LocalInner {
    name: String,
    cfg: LocalServiceConfig,
    engine: NetEngine,
    proxy: Arc<BmProxy>,
    /// Local descriptor map: what this rank knows it is holding. Fast
    /// query fallback, and the rebuild payload on re-register.
    blob_map: Mutex<HashMap<String, BlobDesc>>,
}

/// One rank's resident service.
pub struct LocalService {
    inner: Arc<LocalInner>,
}

impl LocalService {
    /// Bring the rank online: fabric segment, meta link, registration.
    pub fn start(
        name: &str,
        cfg: &LocalServiceConfig,
        driver: Arc<dyn FabricDriver>,
    ) -> Result<LocalService> {
        info!("starting local service {name}");
        let rank = cfg.rank_id;
        let proxy = BmProxy::init(driver, rank, cfg.media_type(), cfg.segment_size())?;

        let engine = NetEngine::start(&NetEngineOptions {
            name: format!("{name}-net"),
            worker_threads: 2,
            rank_id: rank,
            start_listener: false,
            ..Default::default()
        })?;

        let inner = Arc::new(LocalInner {
            name: name.to_owned(),
            cfg: cfg.clone(),
            engine,
            proxy,
            blob_map: Mutex::new(HashMap::new()),
        });

        Self::register_handlers(&inner);

        let (ip, port) = parse_tcp_url(&cfg.meta_service_url).ok_or_else(|| {
            MmcError::InvalidParam(format!("bad meta url {}", cfg.meta_service_url))
        })?;
        inner.engine.connect(&ip, port, ROLE_LOCAL, LinkKey::meta())?;

        let service = LocalService { inner };
        service.register_bm()?;
        info!("local service {name} started (rank {rank})");
        Ok(service)
    }

    fn register_handlers(inner: &Arc<LocalInner>) {
        let for_replicate = Arc::clone(inner);
        inner.engine.register_handler(
            OpCode::MetaReplicate,
            Arc::new(move |ctx: &RequestCtx| {
                let ret = for_replicate.handle_replicate(ctx);
                let _ = ctx.reply(&StatusResponse::new(status(ret)));
            }),
        );

        let for_copy = Arc::clone(inner);
        inner.engine.register_handler(
            OpCode::BlobCopy,
            Arc::new(move |ctx: &RequestCtx| {
                let ret = for_copy.handle_blob_copy(ctx);
                let _ = ctx.reply(&StatusResponse::new(status(ret)));
            }),
        );
    }

    fn register_bm(&self) -> Result<()> {
        let inner = &self.inner;
        let prior: Vec<(String, BlobDesc)> = inner
            .blob_map
            .lock()
            .unwrap()
            .iter()
            .map(|(k, d)| (k.clone(), *d))
            .collect();

        let req = BmRegisterRequest::new(
            inner.proxy.rank(),
            inner.proxy.media_type() as u8,
            inner.proxy.base(),
            inner.proxy.capacity(),
            prior,
        );
        let resp: StatusResponse = inner
            .engine
            .sync_call(LinkKey::meta(), &req, RPC_TIMEOUT_SECS)?;
        if let Some(e) = MmcError::from_status_code(resp.ret) {
            error!("{}: bm register failed: {e}", inner.name);
            return Err(e);
        }
        Ok(())
    }

    /// Graceful teardown: unregister, drop the link, free the segment.
    pub fn stop(&self) {
        let inner = &self.inner;
        let req = BmUnregisterRequest::new(inner.proxy.rank(), inner.proxy.media_type() as u8);
        match inner
            .engine
            .sync_call::<_, StatusResponse>(LinkKey::meta(), &req, RPC_TIMEOUT_SECS)
        {
            Ok(resp) => {
                if let Some(e) = MmcError::from_status_code(resp.ret) {
                    warn!("{}: bm unregister refused: {e}", inner.name);
                }
            }
            Err(e) => warn!("{}: bm unregister failed: {e}", inner.name),
        }
        inner.engine.stop();
        inner.proxy.destroy();
        info!("local service {} stopped", inner.name);
    }

    pub fn proxy(&self) -> Arc<BmProxy> {
        Arc::clone(&self.inner.proxy)
    }

    pub fn rank(&self) -> u32 {
        self.inner.proxy.rank()
    }

    pub fn config(&self) -> &LocalServiceConfig {
        &self.inner.cfg
    }

    /// Descriptors this rank currently advertises (test/diagnostic view).
    pub fn known_blobs(&self) -> Vec<(String, BlobDesc)> {
        self.inner
            .blob_map
            .lock()
            .unwrap()
            .iter()
            .map(|(k, d)| (k.clone(), *d))
            .collect()
    }
}

impl LocalInner {
    fn handle_replicate(&self, ctx: &RequestCtx) -> Result<()> {
        let req: MetaReplicateRequest = ctx.request()?;
        let mut map = self.blob_map.lock().unwrap();
        match req.journal_op()? {
            JournalOp::Add => {
                map.insert(req.key.clone(), req.desc);
            }
            JournalOp::Remove => {
                map.remove(&req.key);
            }
        }
        Ok(())
    }

    fn handle_blob_copy(&self, ctx: &RequestCtx) -> Result<()> {
        let req: BlobCopyRequest = ctx.request()?;
        if req.dst.rank != self.proxy.rank() {
            warn!(
                "{}: blob copy for rank {} landed on rank {}",
                self.name,
                req.dst.rank,
                self.proxy.rank()
            );
        }
        if req.src.size != req.dst.size {
            return Err(MmcError::InvalidParam("blob copy size mismatch".into()));
        }
        self.proxy.pull_remote(req.src.gva, req.dst.gva, req.src.size)
    }
}

fn status(r: Result<()>) -> i32 {
    match r {
        Ok(()) => 0,
        Err(e) => e.status_code(),
    }
}
