// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client library: each user call is a meta round-trip, a local DMA and a
// closing state update. The control plane is synchronous; the data plane
// moves bytes directly between the caller's buffer and the owning
// rank's segment.

use std::sync::Arc;
use std::time::Instant;

use log::{error, warn};

use crate::alloc::AllocOptions;
use crate::buffer::MmcBuffer;
use crate::config::{parse_tcp_url, ClientConfig};
use crate::error::{set_last_error, status_of, MmcError, Result};
use crate::local::BmProxy;
use crate::meta::blob::{BlobAction, BlobDesc};
use crate::meta::manager::QueryInfo;
use crate::net::engine::{LinkKey, NetEngine, NetEngineOptions, ROLE_CLIENT};
use crate::net::message::{
    AllocRequest, BatchGetRequest, BatchIsExistRequest, BatchQueryRequest, BatchQueryResponse,
    BatchRemoveRequest, BatchStatusResponse, BatchViewResponse, GetRequest, IsExistRequest,
    PingMsg, QueryRequest, QueryResponse, RemoveRequest, StatusResponse, UpdateRequest,
    ViewResponse,
};
use crate::types::{next_operate_id, MediaType, MAX_KEY_LEN};

/// Placement preference for a put.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Tier to place on; `None` lets the local proxy pick its own tier.
    pub media: Option<MediaType>,
    /// Replicas to place.
    pub replica_count: u32,
    /// Alloc flags (`ALLOC_FORCE_BY_RANK`).
    pub flags: u32,
}

/// Handle to the cache from one process.
pub struct MmcClient {
    engine: NetEngine,
    proxy: Arc<BmProxy>,
    rank: u32,
    timeout_secs: u32,
    ttl_ms: u64,
}

impl MmcClient {
    /// Connect to the meta service and bind to the local rank's proxy.
    pub fn connect(cfg: &ClientConfig, proxy: Arc<BmProxy>, ttl_ms: u64) -> Result<MmcClient> {
        let rank = if cfg.auto_ranking == 1 {
            proxy.rank()
        } else {
            cfg.rank_id
        };
        let engine = NetEngine::start(&NetEngineOptions {
            name: format!("mmc-client-{rank}"),
            worker_threads: 1,
            rank_id: rank,
            start_listener: false,
            ..Default::default()
        })?;
        let (ip, port) = parse_tcp_url(&cfg.meta_service_url).ok_or_else(|| {
            MmcError::InvalidParam(format!("bad meta url {}", cfg.meta_service_url))
        })?;
        engine.connect(&ip, port, ROLE_CLIENT, LinkKey::meta())?;
        Ok(MmcClient {
            engine,
            proxy,
            rank,
            timeout_secs: cfg.timeout_seconds,
            ttl_ms,
        })
    }

    pub fn disconnect(&self) {
        self.engine.stop();
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Liveness probe against the meta service.
    pub fn ping(&self) -> Result<()> {
        let _: PingMsg = self
            .engine
            .sync_call(LinkKey::meta(), &PingMsg::new(1), self.timeout_secs)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Put
    // -----------------------------------------------------------------

    /// Write `buf` under `key`. First write wins; a concurrent second
    /// put of the same key observes `Duplicated`.
    pub fn put(&self, key: &str, buf: &MmcBuffer, opts: PutOptions) -> Result<()> {
        validate_key(key)?;
        buf.validate()?;

        let media = opts.media.unwrap_or_else(|| self.proxy.media_type());
        let size = buf.total_len();
        let operate_id = next_operate_id(self.rank);
        let alloc = AllocRequest::new(
            key.to_owned(),
            AllocOptions::new(size, opts.replica_count.max(1), media, self.rank, opts.flags),
            operate_id.0,
        );
        let resp: ViewResponse = self.engine.sync_call(LinkKey::meta(), &alloc, self.timeout_secs)?;
        if let Some(e) = MmcError::from_status_code(resp.ret) {
            if e != MmcError::Duplicated {
                error!("alloc of key {key} failed: {e}");
            }
            return Err(e);
        }
        if resp.view.blobs.is_empty() {
            return Err(MmcError::Internal("alloc returned no blobs".into()));
        }

        for blob in &resp.view.blobs {
            if let Err(e) = self.proxy.put(buf, blob.gva, blob.size) {
                // Compensate so the blob returns to ALLOCATED and a
                // later put can retry into the same extent.
                let undo = UpdateRequest::new(
                    BlobAction::WriteFail as u8,
                    key.to_owned(),
                    blob.rank,
                    blob.media as u8,
                    operate_id.0,
                );
                let _ = self
                    .engine
                    .sync_call::<_, StatusResponse>(LinkKey::meta(), &undo, self.timeout_secs);
                error!("dma put of key {key} failed: {e}");
                set_last_error(format!("put {key}: {e}"));
                return Err(MmcError::Transport(format!("dma put failed: {e}")));
            }
        }

        // Writes start and complete under one update on this path.
        for blob in &resp.view.blobs {
            let done = UpdateRequest::new(
                BlobAction::WriteOk as u8,
                key.to_owned(),
                blob.rank,
                blob.media as u8,
                operate_id.0,
            );
            let ack: StatusResponse =
                self.engine.sync_call(LinkKey::meta(), &done, self.timeout_secs)?;
            if let Some(e) = MmcError::from_status_code(ack.ret) {
                error!("write-ok update of key {key} failed: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Get
    // -----------------------------------------------------------------

    /// Read `key` into `buf`. Enforces the lease deadline: an operation
    /// that outlives the TTL reports `Timeout` even if bytes landed.
    pub fn get(&self, key: &str, buf: &MmcBuffer) -> Result<()> {
        validate_key(key)?;
        buf.validate()?;
        let start = Instant::now();

        let operate_id = next_operate_id(self.rank);
        let req = GetRequest::new(key.to_owned(), operate_id.0);
        let resp: ViewResponse = self.engine.sync_call(LinkKey::meta(), &req, self.timeout_secs)?;
        if let Some(e) = MmcError::from_status_code(resp.ret) {
            return Err(e);
        }
        let blob: &BlobDesc = resp
            .view
            .blobs
            .first()
            .ok_or_else(|| MmcError::Internal("get returned no blob".into()))?;

        let dma = self.proxy.get(buf, blob.gva, blob.size);

        // The read lease ends now, success or not; fire and forget.
        let done = UpdateRequest::new(
            BlobAction::ReadOk as u8,
            key.to_owned(),
            blob.rank,
            blob.media as u8,
            operate_id.0,
        );
        if let Err(e) = self.engine.post(LinkKey::meta(), &done) {
            warn!("read-ok update of key {key} not sent: {e}");
        }

        dma?;
        if start.elapsed().as_millis() as u64 >= self.ttl_ms {
            warn!("get of key {key} outlived its lease");
            return Err(MmcError::Timeout);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Remove / IsExist / Query
    // -----------------------------------------------------------------

    pub fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let req = RemoveRequest::new(key.to_owned());
        let resp: StatusResponse = self.engine.sync_call(LinkKey::meta(), &req, self.timeout_secs)?;
        match MmcError::from_status_code(resp.ret) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    pub fn is_exist(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let req = IsExistRequest::new(key.to_owned());
        let resp: StatusResponse = self.engine.sync_call(LinkKey::meta(), &req, self.timeout_secs)?;
        match MmcError::from_status_code(resp.ret) {
            None => Ok(true),
            Some(MmcError::UnmatchedKey) => Ok(false),
            Some(e) => Err(e),
        }
    }

    pub fn query(&self, key: &str) -> Result<QueryInfo> {
        validate_key(key)?;
        let req = QueryRequest::new(key.to_owned());
        let resp: QueryResponse = self.engine.sync_call(LinkKey::meta(), &req, self.timeout_secs)?;
        match MmcError::from_status_code(resp.ret) {
            None => Ok(resp.info),
            Some(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------
    // Batch forms
    // -----------------------------------------------------------------

    /// Put many keys from parallel buffers; one status per key.
    pub fn batch_put(&self, keys: &[String], bufs: &[MmcBuffer], opts: PutOptions) -> Result<Vec<i32>> {
        validate_keys(keys)?;
        expect_parallel(keys.len(), bufs.len())?;
        Ok(keys
            .iter()
            .zip(bufs)
            .map(|(key, buf)| status_of(&self.put(key, buf, opts)))
            .collect())
    }

    /// Get many keys into parallel buffers; one status per key. The
    /// control plane runs as a single batched round-trip, the DMAs are
    /// issued per element.
    pub fn batch_get(&self, keys: &[String], bufs: &[MmcBuffer]) -> Result<Vec<i32>> {
        validate_keys(keys)?;
        expect_parallel(keys.len(), bufs.len())?;

        let operate_id = next_operate_id(self.rank);
        let req = BatchGetRequest::new(keys.to_vec(), operate_id.0);
        let resp: BatchViewResponse =
            self.engine.sync_call(LinkKey::meta(), &req, self.timeout_secs)?;
        expect_parallel(keys.len(), resp.results.len())?;
        expect_parallel(keys.len(), resp.views.len())?;

        let mut statuses = Vec::with_capacity(keys.len());
        for ((key, buf), (ret, view)) in keys
            .iter()
            .zip(bufs)
            .zip(resp.results.iter().zip(&resp.views))
        {
            if *ret != 0 {
                statuses.push(*ret);
                continue;
            }
            let Some(blob) = view.blobs.first() else {
                statuses.push(MmcError::Internal("get returned no blob".into()).status_code());
                continue;
            };
            let dma = self.proxy.get(buf, blob.gva, blob.size);
            let done = UpdateRequest::new(
                BlobAction::ReadOk as u8,
                key.clone(),
                blob.rank,
                blob.media as u8,
                operate_id.0,
            );
            if let Err(e) = self.engine.post(LinkKey::meta(), &done) {
                warn!("read-ok update of key {key} not sent: {e}");
            }
            statuses.push(status_of(&dma));
        }
        Ok(statuses)
    }

    /// Remove many keys; one status per key, same order.
    pub fn batch_remove(&self, keys: &[String]) -> Result<Vec<i32>> {
        validate_keys(keys)?;
        let req = BatchRemoveRequest::new(keys.to_vec());
        let resp: BatchStatusResponse =
            self.engine.sync_call(LinkKey::meta(), &req, self.timeout_secs)?;
        expect_parallel(keys.len(), resp.results.len())?;
        Ok(resp.results)
    }

    /// Existence checks; one status per key (0 = present).
    pub fn batch_is_exist(&self, keys: &[String]) -> Result<Vec<i32>> {
        validate_keys(keys)?;
        let req = BatchIsExistRequest::new(keys.to_vec());
        let resp: BatchStatusResponse =
            self.engine.sync_call(LinkKey::meta(), &req, self.timeout_secs)?;
        expect_parallel(keys.len(), resp.results.len())?;
        Ok(resp.results)
    }

    /// Query many keys; parallel status and info arrays.
    pub fn batch_query(&self, keys: &[String]) -> Result<(Vec<i32>, Vec<QueryInfo>)> {
        validate_keys(keys)?;
        let req = BatchQueryRequest::new(keys.to_vec());
        let resp: BatchQueryResponse =
            self.engine.sync_call(LinkKey::meta(), &req, self.timeout_secs)?;
        expect_parallel(keys.len(), resp.results.len())?;
        expect_parallel(keys.len(), resp.infos.len())?;
        Ok((resp.results, resp.infos))
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        set_last_error("empty key");
        return Err(MmcError::InvalidParam("empty key".into()));
    }
    if key.len() > MAX_KEY_LEN {
        set_last_error(format!("key length {} over limit", key.len()));
        return Err(MmcError::InvalidParam(format!(
            "key length {} over limit {MAX_KEY_LEN}",
            key.len()
        )));
    }
    Ok(())
}

fn validate_keys(keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Err(MmcError::InvalidParam("empty key list".into()));
    }
    for key in keys {
        validate_key(key)?;
    }
    Ok(())
}

fn expect_parallel(want: usize, got: usize) -> Result<()> {
    if want != got {
        return Err(MmcError::Internal(format!(
            "batch reply carries {got} results for {want} keys"
        )));
    }
    Ok(())
}
