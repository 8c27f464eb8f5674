// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The driver primitives the core consumes, as a trait. Addresses on the
// "global" side of a copy are GVAs — fabric-wide virtual addresses at
// which each rank's segment sits at a fixed base.

use crate::error::Result;
use crate::types::MediaType;

/// Direction tag of a DMA copy.
///
/// `H`/`L` are the caller's host / local-device memory, `G` is global
/// fabric memory addressed by GVA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDir {
    /// Host buffer → global memory.
    H2G,
    /// Local device buffer → global memory.
    L2G,
    /// Global memory → host buffer.
    G2H,
    /// Global memory → local device buffer.
    G2L,
}

impl CopyDir {
    /// Whether the global side is the destination.
    pub fn writes_global(self) -> bool {
        matches!(self, CopyDir::H2G | CopyDir::L2G)
    }
}

/// Accelerator-driver surface the cache depends on.
///
/// One implementation per transport; all of them agree on the GVA
/// address model. 2D copies are a single strided engine call — an
/// implementation must not emulate them with a loop of 1D transfers.
pub trait FabricDriver: Send + Sync {
    /// Reserve a device-shared virtual range for `(rank, media)`.
    /// Returns the base GVA of the reservation.
    fn gva_reserve(&self, rank: u32, media: MediaType, size: u64) -> Result<u64>;

    /// Commit backing memory for `[gva, gva+size)`.
    fn gva_alloc(&self, gva: u64, size: u64) -> Result<()>;

    /// Release backing memory for `[gva, gva+size)`.
    fn gva_free(&self, gva: u64, size: u64) -> Result<()>;

    /// Map a named shared segment from a remote rank into the local range.
    fn gva_open(&self, gva: u64, shm_name: &str, size: u64) -> Result<()>;

    /// Unmap a previously opened remote segment.
    fn gva_close(&self, gva: u64) -> Result<()>;

    /// Publish a shared name for an extent so remote ranks can open it.
    fn set_ipc_mem_name(&self, gva: u64, size: u64) -> Result<String>;

    /// Allow DMA between this device and `remote_device`.
    fn enable_peer_access(&self, remote_device: u32) -> Result<()>;

    /// 1D copy of `len` bytes. The global-side address is a GVA; the
    /// host/local-side address is a raw pointer in the caller's space.
    fn copy(&self, dir: CopyDir, src: u64, dst: u64, len: u64) -> Result<()>;

    /// Strided copy: `layer_num` rows of `width` bytes, rows `src_pitch`
    /// / `dst_pitch` bytes apart on their respective sides.
    #[allow(clippy::too_many_arguments)]
    fn copy_2d(
        &self,
        dir: CopyDir,
        src: u64,
        src_pitch: u64,
        dst: u64,
        dst_pitch: u64,
        width: u64,
        layer_num: u32,
    ) -> Result<()>;

    /// Cross-rank engine copy: both sides are GVAs. This is the pull a
    /// destination rank performs for replication and migration; it
    /// requires peer access between the owning devices.
    fn copy_gva(&self, src: u64, dst: u64, len: u64) -> Result<()>;

    /// Barrier for async copies issued so far.
    fn drain(&self) -> Result<()>;
}
