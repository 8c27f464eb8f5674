// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The rank's window into the memory fabric. Owns the contributed
// segment, publishes its name for remote ranks and executes the DMA
// primitives the client calls: 1D, 2D-strided and batched, with the
// direction inferred from whether data flows into or out of global
// memory.

use std::sync::Arc;

use log::{error, info};

use crate::buffer::{BufLayout, MmcBuffer};
use crate::error::{MmcError, Result};
use crate::fabric::{CopyDir, FabricDriver};
use crate::types::MediaType;

/// Segment owner plus DMA entry points for one rank.
pub struct BmProxy {
    driver: Arc<dyn FabricDriver>,
    rank: u32,
    media: MediaType,
    base: u64,
    capacity: u64,
}

impl BmProxy {
    /// Reserve and commit this rank's segment and publish its IPC name.
    pub fn init(
        driver: Arc<dyn FabricDriver>,
        rank: u32,
        media: MediaType,
        capacity: u64,
    ) -> Result<Arc<BmProxy>> {
        let base = driver.gva_reserve(rank, media, capacity)?;
        driver.gva_alloc(base, capacity)?;
        let name = driver.set_ipc_mem_name(base, capacity)?;
        info!(
            "bm proxy up: rank {rank}, media {media}, base {base:#x}, capacity {capacity}, name {name}"
        );
        Ok(Arc::new(BmProxy {
            driver,
            rank,
            media,
            base,
            capacity,
        }))
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Tier this rank contributes; the write path picks it top-down.
    pub fn media_type(&self) -> MediaType {
        self.media
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Transfer caller memory into global memory at `gva`.
    pub fn put(&self, buf: &MmcBuffer, gva: u64, size: u64) -> Result<()> {
        buf.validate()?;
        let dir = match buf.kind {
            crate::buffer::MemKind::Host => CopyDir::H2G,
            crate::buffer::MemKind::Device => CopyDir::L2G,
        };
        match buf.layout {
            BufLayout::OneDim { offset, len } => {
                if len > size {
                    error!("put of {len} bytes into a {size}-byte blob");
                    return Err(MmcError::InvalidParam("buffer larger than blob".into()));
                }
                self.driver.copy(dir, buf.addr + offset, gva, len)?;
            }
            BufLayout::TwoDim {
                dpitch,
                layer_offset,
                width,
                layer_num,
            } => {
                let len = width * layer_num as u64;
                if len > size {
                    error!("2d put of {len} bytes into a {size}-byte blob");
                    return Err(MmcError::InvalidParam("buffer larger than blob".into()));
                }
                // Packed on the global side: dst pitch == width.
                self.driver.copy_2d(
                    dir,
                    buf.addr + dpitch * layer_offset,
                    dpitch,
                    gva,
                    width,
                    width,
                    layer_num,
                )?;
            }
        }
        self.driver.drain()
    }

    /// Transfer global memory at `gva` into caller memory.
    pub fn get(&self, buf: &MmcBuffer, gva: u64, size: u64) -> Result<()> {
        buf.validate()?;
        let dir = match buf.kind {
            crate::buffer::MemKind::Host => CopyDir::G2H,
            crate::buffer::MemKind::Device => CopyDir::G2L,
        };
        match buf.layout {
            BufLayout::OneDim { offset, len } => {
                if len > size {
                    error!("get of {len} bytes from a {size}-byte blob");
                    return Err(MmcError::InvalidParam("buffer larger than blob".into()));
                }
                self.driver.copy(dir, gva, buf.addr + offset, len)?;
            }
            BufLayout::TwoDim {
                dpitch,
                layer_offset,
                width,
                layer_num,
            } => {
                let len = width * layer_num as u64;
                if len != size {
                    error!("2d get of {len} bytes from a {size}-byte blob");
                    return Err(MmcError::InvalidParam(
                        "2d buffer length must equal blob size".into(),
                    ));
                }
                self.driver.copy_2d(
                    dir,
                    gva,
                    width,
                    buf.addr + dpitch * layer_offset,
                    dpitch,
                    width,
                    layer_num,
                )?;
            }
        }
        self.driver.drain()
    }

    /// Batched put over parallel arrays. Per-element statuses.
    pub fn batch_put(&self, bufs: &[MmcBuffer], gvas: &[u64], sizes: &[u64]) -> Vec<Result<()>> {
        bufs.iter()
            .zip(gvas.iter().zip(sizes))
            .map(|(buf, (gva, size))| self.put(buf, *gva, *size))
            .collect()
    }

    /// Batched get over parallel arrays. Per-element statuses.
    pub fn batch_get(&self, bufs: &[MmcBuffer], gvas: &[u64], sizes: &[u64]) -> Vec<Result<()>> {
        bufs.iter()
            .zip(gvas.iter().zip(sizes))
            .map(|(buf, (gva, size))| self.get(buf, *gva, *size))
            .collect()
    }

    /// Destination-side pull for replication/migration: copy `len`
    /// bytes from a remote rank's extent into one of ours.
    pub fn pull_remote(&self, src_gva: u64, dst_gva: u64, len: u64) -> Result<()> {
        self.driver.copy_gva(src_gva, dst_gva, len)?;
        self.driver.drain()
    }

    /// Release the segment on the way down.
    pub fn destroy(&self) {
        if let Err(e) = self.driver.gva_free(self.base, self.capacity) {
            error!("segment release failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::HostFabric;

    fn proxy(rank: u32) -> Arc<BmProxy> {
        BmProxy::init(Arc::new(HostFabric::new()), rank, MediaType::Dram, 1 << 20).unwrap()
    }

    #[test]
    fn put_rejects_oversized_buffer() {
        let p = proxy(33);
        let data = vec![1u8; 8192];
        let buf = MmcBuffer::host_1d(&data);
        assert!(p.put(&buf, p.base(), 4096).is_err());
        assert!(p.put(&buf, p.base(), 8192).is_ok());
        p.destroy();
    }

    #[test]
    fn batch_moves_each_element() {
        let p = proxy(34);
        let a = vec![0x11u8; 4096];
        let b = vec![0x22u8; 4096];
        let gvas = [p.base(), p.base() + 4096];
        let sizes = [4096u64, 4096];

        let puts = p.batch_put(
            &[MmcBuffer::host_1d(&a), MmcBuffer::host_1d(&b)],
            &gvas,
            &sizes,
        );
        assert!(puts.iter().all(|r| r.is_ok()));

        let mut ra = vec![0u8; 4096];
        let mut rb = vec![0u8; 4096];
        let gets = p.batch_get(
            &[MmcBuffer::host_1d_mut(&mut ra), MmcBuffer::host_1d_mut(&mut rb)],
            &gvas,
            &sizes,
        );
        assert!(gets.iter().all(|r| r.is_ok()));
        assert_eq!(ra, a);
        assert_eq!(rb, b);
        p.destroy();
    }
}
