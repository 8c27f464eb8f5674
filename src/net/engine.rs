// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Length-prefixed RPC over TCP.
//
// Frame:     [len: u32][seq: u32][body]    (all little-endian)
// Preamble:  [rank: u32][role: u32]        once, right after connect
//
// The seq's top bit marks replies; requests dispatch to the registered
// handler on the worker pool, replies wake the parked caller through the
// context store. One reader thread per link, writes serialized by a
// per-link mutex.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{MmcError, Result};
use crate::net::codec::Wire;
use crate::net::ctx_store::{ContextStore, SeqNo};
use crate::net::message::{MsgHead, OpCode, StatusResponse};
use crate::thread_pool::ThreadPool;

/// Largest accepted frame body.
const MAX_FRAME: u32 = 64 * 1024 * 1024;
/// Poll interval for reader/accept threads checking for shutdown.
const POLL_MS: u64 = 100;

/// Who a link belongs to, from the preamble.
pub const ROLE_CLIENT: u32 = 0;
pub const ROLE_LOCAL: u32 = 1;
pub const ROLE_META: u32 = 2;

/// Identity of a link in the engine's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub rank: u32,
    pub role: u32,
}

impl LinkKey {
    /// The single outbound link to the meta service.
    pub fn meta() -> LinkKey {
        LinkKey {
            rank: 0,
            role: ROLE_META,
        }
    }

    pub fn local(rank: u32) -> LinkKey {
        LinkKey {
            rank,
            role: ROLE_LOCAL,
        }
    }
}

/// Engine startup parameters.
#[derive(Debug, Clone)]
pub struct NetEngineOptions {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub worker_threads: u16,
    pub rank_id: u32,
    pub start_listener: bool,
}

impl Default for NetEngineOptions {
    fn default() -> Self {
        NetEngineOptions {
            name: "mmc-net".into(),
            ip: "127.0.0.1".into(),
            port: 0,
            worker_threads: 2,
            rank_id: 0,
            start_listener: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Wait handle
// ---------------------------------------------------------------------------

struct WaitState {
    notified: bool,
    body: Vec<u8>,
}

/// Parks one caller until its reply lands or the deadline passes.
pub struct WaitHandle {
    state: Mutex<WaitState>,
    cv: Condvar,
}

impl WaitHandle {
    fn new() -> WaitHandle {
        WaitHandle {
            state: Mutex::new(WaitState {
                notified: false,
                body: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    fn notify(&self, body: Vec<u8>) {
        let mut st = self.state.lock().unwrap();
        if st.notified {
            return;
        }
        st.body = body;
        st.notified = true;
        self.cv.notify_all();
    }

    fn timed_wait(&self, timeout: Duration) -> Result<Vec<u8>> {
        let start = std::time::Instant::now();
        let mut st = self.state.lock().unwrap();
        while !st.notified {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(MmcError::Timeout);
            }
            let (next, _) = self.cv.wait_timeout(st, timeout - elapsed).unwrap();
            st = next;
        }
        Ok(std::mem::take(&mut st.body))
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// One TCP connection to a peer.
pub struct NetLink {
    key: LinkKey,
    writer: Mutex<TcpStream>,
    peer_addr: SocketAddr,
}

impl NetLink {
    pub fn key(&self) -> LinkKey {
        self.key
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn write_frame(&self, seq: SeqNo, body: &[u8]) -> Result<()> {
        let mut stream = self.writer.lock().unwrap();
        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&seq.0.to_le_bytes());
        frame.extend_from_slice(body);
        stream.write_all(&frame)?;
        stream.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request context handed to handlers
// ---------------------------------------------------------------------------

/// One inbound request as seen by a handler.
pub struct RequestCtx {
    link: Arc<NetLink>,
    seq: SeqNo,
    body: Vec<u8>,
}

impl RequestCtx {
    /// Raw request body (starts with the message head).
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the request into its typed form.
    pub fn request<M: Wire>(&self) -> Result<M> {
        M::from_bytes(&self.body)
    }

    /// Rank/role of the sending link.
    pub fn peer(&self) -> LinkKey {
        self.link.key()
    }

    /// Send the reply for this request.
    pub fn reply<M: Wire>(&self, msg: &M) -> Result<()> {
        self.link.write_frame(self.seq.as_resp(), &msg.to_bytes())
    }
}

pub type RpcHandler = Arc<dyn Fn(&RequestCtx) + Send + Sync>;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner {
    name: String,
    rank_id: u32,
    started: AtomicBool,
    links: Mutex<HashMap<LinkKey, Arc<NetLink>>>,
    handlers: RwLock<HashMap<i16, RpcHandler>>,
    ctx_store: ContextStore<WaitHandle>,
    pool: Mutex<Option<ThreadPool>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    link_broken: Mutex<Option<Box<dyn Fn(LinkKey) + Send + Sync>>>,
    local_port: Mutex<u16>,
}

/// The RPC engine: listener and/or outbound links plus dispatch.
#[derive(Clone)]
pub struct NetEngine {
    inner: Arc<EngineInner>,
}

impl NetEngine {
    pub fn new() -> NetEngine {
        NetEngine {
            inner: Arc::new(EngineInner {
                name: String::new(),
                rank_id: 0,
                started: AtomicBool::new(false),
                links: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                ctx_store: ContextStore::new(8192),
                pool: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
                link_broken: Mutex::new(None),
                local_port: Mutex::new(0),
            }),
        }
    }

    /// Build and start in one step.
    pub fn start(options: &NetEngineOptions) -> Result<NetEngine> {
        let engine = NetEngine {
            inner: Arc::new(EngineInner {
                name: options.name.clone(),
                rank_id: options.rank_id,
                started: AtomicBool::new(true),
                links: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                ctx_store: ContextStore::new(8192),
                pool: Mutex::new(Some(ThreadPool::new(
                    &options.name,
                    options.worker_threads.max(1) as usize,
                ))),
                threads: Mutex::new(Vec::new()),
                link_broken: Mutex::new(None),
                local_port: Mutex::new(0),
            }),
        };

        if options.start_listener {
            engine.start_listener(&options.ip, options.port)?;
        }
        info!(
            "net engine {} started (rank {}, listener {})",
            options.name, options.rank_id, options.start_listener
        );
        Ok(engine)
    }

    /// Port actually bound; useful when the options asked for port 0.
    pub fn local_port(&self) -> u16 {
        *self.inner.local_port.lock().unwrap()
    }

    pub fn register_handler(&self, op: OpCode, handler: RpcHandler) {
        self.inner.handlers.write().unwrap().insert(op as i16, handler);
    }

    pub fn register_link_broken(&self, f: impl Fn(LinkKey) + Send + Sync + 'static) {
        *self.inner.link_broken.lock().unwrap() = Some(Box::new(f));
    }

    /// Connect out to a listening engine and preamble our identity.
    pub fn connect(&self, ip: &str, port: u16, role: u32, peer: LinkKey) -> Result<()> {
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|e| MmcError::InvalidParam(format!("bad address {ip}:{port}: {e}")))?;
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
        stream.set_nodelay(true)?;

        let mut preamble = [0u8; 8];
        preamble[..4].copy_from_slice(&self.inner.rank_id.to_le_bytes());
        preamble[4..].copy_from_slice(&role.to_le_bytes());
        (&stream).write_all(&preamble)?;

        self.install_link(stream, peer)?;
        Ok(())
    }

    fn start_listener(&self, ip: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((ip, port))?;
        *self.inner.local_port.lock().unwrap() = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let inner = Arc::clone(&self.inner);
        let engine = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-accept", inner.name))
            .spawn(move || loop {
                if !inner.started.load(Ordering::Acquire) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, addr)) => {
                        if let Err(e) = engine.accept_link(stream) {
                            warn!("rejecting link from {addr}: {e}");
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(POLL_MS));
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        std::thread::sleep(Duration::from_millis(POLL_MS));
                    }
                }
            })
            .expect("spawn accept thread");
        self.inner.threads.lock().unwrap().push(handle);
        Ok(())
    }

    fn accept_link(&self, stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        let mut preamble = [0u8; 8];
        (&stream).read_exact(&mut preamble)?;
        let rank = u32::from_le_bytes(preamble[..4].try_into().unwrap());
        let role = u32::from_le_bytes(preamble[4..].try_into().unwrap());

        self.install_link(stream, LinkKey { rank, role })
    }

    fn install_link(&self, stream: TcpStream, key: LinkKey) -> Result<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(MmcError::NotStarted);
        }
        stream.set_read_timeout(Some(Duration::from_millis(POLL_MS)))?;
        let reader = stream.try_clone()?;
        let link = Arc::new(NetLink {
            key,
            peer_addr: stream.peer_addr()?,
            writer: Mutex::new(stream),
        });

        self.inner.links.lock().unwrap().insert(key, Arc::clone(&link));
        info!(
            "{}: link up rank {} role {} ({})",
            self.inner.name, key.rank, key.role, link.peer_addr
        );

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name(format!("{}-rd-{}", inner.name, key.rank))
            .spawn(move || Self::reader_loop(inner, link, reader))
            .expect("spawn link reader");
        self.inner.threads.lock().unwrap().push(handle);
        Ok(())
    }

    fn reader_loop(inner: Arc<EngineInner>, link: Arc<NetLink>, mut stream: TcpStream) {
        let mut header = [0u8; 8];
        loop {
            match Self::read_full(&inner, &mut stream, &mut header) {
                Ok(true) => {}
                Ok(false) | Err(_) => break,
            }
            let len = u32::from_le_bytes(header[..4].try_into().unwrap());
            let seq = SeqNo(u32::from_le_bytes(header[4..].try_into().unwrap()));
            if len > MAX_FRAME {
                error!("{}: oversized frame ({len} bytes), dropping link", inner.name);
                break;
            }

            let mut body = vec![0u8; len as usize];
            match Self::read_full(&inner, &mut stream, &mut body) {
                Ok(true) => {}
                Ok(false) | Err(_) => break,
            }

            if seq.is_resp() {
                match inner.ctx_store.take(seq) {
                    Some(handle) => handle.notify(body),
                    // Fire-and-forget reply, or the caller timed out.
                    None => debug!("{}: dropping unmatched reply seq {:#x}", inner.name, seq.0),
                }
                continue;
            }

            Self::dispatch(&inner, Arc::clone(&link), seq, body);
        }

        inner.links.lock().unwrap().remove(&link.key());
        if inner.started.load(Ordering::Acquire) {
            info!(
                "{}: link down rank {} role {}",
                inner.name,
                link.key().rank,
                link.key().role
            );
            if let Some(f) = inner.link_broken.lock().unwrap().as_ref() {
                f(link.key());
            }
        }
    }

    /// Fill `buf` completely, tolerating read timeouts so shutdown can
    /// interleave. `Ok(false)` is a clean close before the first byte.
    fn read_full(inner: &EngineInner, stream: &mut TcpStream, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0usize;
        while filled < buf.len() {
            if !inner.started.load(Ordering::Acquire) {
                return Err(MmcError::NotStarted);
            }
            match stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    if filled == 0 {
                        return Ok(false);
                    }
                    return Err(MmcError::Transport("peer closed mid-frame".into()));
                }
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn dispatch(inner: &Arc<EngineInner>, link: Arc<NetLink>, seq: SeqNo, body: Vec<u8>) {
        let op = match MsgHead::peek(&body) {
            Ok(head) => head.op,
            Err(e) => {
                warn!("{}: undecodable request head: {e}", inner.name);
                return;
            }
        };
        let handler = inner.handlers.read().unwrap().get(&(op as i16)).cloned();
        let ctx = RequestCtx { link, seq, body };
        match handler {
            Some(handler) => {
                let pool = inner.pool.lock().unwrap();
                if let Some(pool) = pool.as_ref() {
                    pool.execute(move || handler(&ctx));
                }
            }
            None => {
                warn!("{}: no handler for {:?}", inner.name, op);
                let _ = ctx.reply(&StatusResponse::new(
                    MmcError::Internal("unhandled opcode".into()).status_code(),
                ));
            }
        }
    }

    // -----------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------

    fn link(&self, key: LinkKey) -> Result<Arc<NetLink>> {
        self.inner
            .links
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| MmcError::Transport(format!("no link to rank {} role {}", key.rank, key.role)))
    }

    /// Synchronous call: send, park on the context store, wake on reply.
    pub fn sync_call_raw(&self, key: LinkKey, body: &[u8], timeout_secs: u32) -> Result<Vec<u8>> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(MmcError::NotStarted);
        }
        let link = self.link(key)?;
        let handle = Arc::new(WaitHandle::new());
        let seq = self.inner.ctx_store.put(Arc::clone(&handle))?;

        if let Err(e) = link.write_frame(seq, body) {
            let _ = self.inner.ctx_store.take(seq);
            return Err(e);
        }
        match handle.timed_wait(Duration::from_secs(timeout_secs as u64)) {
            Ok(body) => Ok(body),
            Err(e) => {
                // Reclaim the slot; a late reply will fail its CAS.
                let _ = self.inner.ctx_store.take(seq);
                Err(e)
            }
        }
    }

    /// Typed synchronous call.
    pub fn sync_call<Req: Wire, Resp: Wire>(
        &self,
        key: LinkKey,
        req: &Req,
        timeout_secs: u32,
    ) -> Result<Resp> {
        let body = self.sync_call_raw(key, &req.to_bytes(), timeout_secs)?;
        Resp::from_bytes(&body)
    }

    /// Fire-and-forget: no context slot, the reply (if any) is dropped.
    pub fn post<Req: Wire>(&self, key: LinkKey, req: &Req) -> Result<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(MmcError::NotStarted);
        }
        self.link(key)?.write_frame(SeqNo(0), &req.to_bytes())
    }

    pub fn has_link(&self, key: LinkKey) -> bool {
        self.inner.links.lock().unwrap().contains_key(&key)
    }

    /// Ranks with a live local-service link.
    pub fn local_ranks(&self) -> Vec<u32> {
        self.inner
            .links
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.role == ROLE_LOCAL)
            .map(|k| k.rank)
            .collect()
    }

    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        // Close writers so blocked peers notice promptly.
        for link in self.inner.links.lock().unwrap().values() {
            let _ = link.writer.lock().unwrap().shutdown(std::net::Shutdown::Both);
        }
        // Drain under the lock, join outside it: a late accept may still
        // want to push its reader handle.
        let handles: Vec<JoinHandle<()>> = self.inner.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(mut pool) = self.inner.pool.lock().unwrap().take() {
            pool.shutdown();
        }
        self.inner.links.lock().unwrap().clear();
        info!("net engine {} stopped", self.inner.name);
    }
}

impl Default for NetEngine {
    fn default() -> Self {
        NetEngine::new()
    }
}
