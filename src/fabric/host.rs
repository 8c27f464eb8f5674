// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Host-memory fabric backend. Every registered segment is a heap
// allocation entered into a process-global window registry, so all ranks
// living in one process (tests, `protocol = "tcp"` deployments) share one
// GVA space and cross-rank pulls are plain memory copies.
//
// GVA windows: rank r, media m owns [(r+1)<<40 | m<<36, ... + 64 GiB).

use std::collections::BTreeMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::error::{MmcError, Result};
use crate::types::MediaType;

use super::driver::{CopyDir, FabricDriver};

const RANK_SHIFT: u32 = 40;
const MEDIA_SHIFT: u32 = 36;

/// Base GVA of the window owned by `(rank, media)`.
pub fn window_base(rank: u32, media: MediaType) -> u64 {
    ((rank as u64 + 1) << RANK_SHIFT) | ((media as u64) << MEDIA_SHIFT)
}

/// One committed segment: base GVA plus its backing bytes.
///
/// The backing store is held as a raw allocation; copies touch it through
/// raw pointers the way a DMA engine would, concurrently with other
/// engines working the same segment.
struct Segment {
    len: u64,
    mem: *mut u8,
}

unsafe impl Send for Segment {}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                self.mem,
                self.len as usize,
            )));
        }
    }
}

/// Registry of committed segments keyed by base GVA.
///
/// The mutex only guards the map; copies read the segment base pointer
/// under the lock and run outside it, like an engine working a posted
/// descriptor.
static SEGMENTS: Lazy<Mutex<BTreeMap<u64, Segment>>> = Lazy::new(|| Mutex::new(BTreeMap::new()));

/// Resolve `gva` to a raw pointer inside a committed segment.
fn resolve(gva: u64, len: u64) -> Result<*mut u8> {
    let map = SEGMENTS.lock().unwrap();
    let (base, seg) = map
        .range(..=gva)
        .next_back()
        .ok_or_else(|| MmcError::Transport(format!("gva {gva:#x} not mapped")))?;
    let off = gva - base;
    if off + len > seg.len {
        return Err(MmcError::Transport(format!(
            "gva range {gva:#x}+{len} escapes segment {base:#x}+{}",
            seg.len
        )));
    }
    Ok(unsafe { seg.mem.add(off as usize) })
}

/// The host-memory implementation of [`FabricDriver`].
#[derive(Debug, Default)]
pub struct HostFabric;

impl HostFabric {
    pub fn new() -> HostFabric {
        HostFabric
    }

    /// Drop every segment in the process registry. Test teardown helper.
    pub fn clear_registry() {
        SEGMENTS.lock().unwrap().clear();
    }
}

impl FabricDriver for HostFabric {
    fn gva_reserve(&self, rank: u32, media: MediaType, _size: u64) -> Result<u64> {
        Ok(window_base(rank, media))
    }

    fn gva_alloc(&self, gva: u64, size: u64) -> Result<()> {
        let mut map = SEGMENTS.lock().unwrap();
        if map.contains_key(&gva) {
            return Err(MmcError::Transport(format!("gva {gva:#x} already committed")));
        }
        let mem = Box::into_raw(vec![0u8; size as usize].into_boxed_slice()) as *mut u8;
        map.insert(gva, Segment { len: size, mem });
        Ok(())
    }

    fn gva_free(&self, gva: u64, _size: u64) -> Result<()> {
        let mut map = SEGMENTS.lock().unwrap();
        map.remove(&gva)
            .map(|_| ())
            .ok_or_else(|| MmcError::Transport(format!("gva {gva:#x} not committed")))
    }

    fn gva_open(&self, _gva: u64, _shm_name: &str, _size: u64) -> Result<()> {
        // One shared registry per process; remote windows are already visible.
        Ok(())
    }

    fn gva_close(&self, _gva: u64) -> Result<()> {
        Ok(())
    }

    fn set_ipc_mem_name(&self, gva: u64, size: u64) -> Result<String> {
        Ok(format!("mmc_seg_{gva:x}_{size:x}"))
    }

    fn enable_peer_access(&self, _remote_device: u32) -> Result<()> {
        Ok(())
    }

    fn copy(&self, dir: CopyDir, src: u64, dst: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let (src_ptr, dst_ptr) = if dir.writes_global() {
            (src as *const u8, resolve(dst, len)?)
        } else {
            (resolve(src, len)? as *const u8, dst as *mut u8)
        };
        unsafe { std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, len as usize) };
        Ok(())
    }

    fn copy_2d(
        &self,
        dir: CopyDir,
        src: u64,
        src_pitch: u64,
        dst: u64,
        dst_pitch: u64,
        width: u64,
        layer_num: u32,
    ) -> Result<()> {
        if width == 0 || layer_num == 0 {
            return Ok(());
        }
        let src_span = src_pitch * (layer_num as u64 - 1) + width;
        let dst_span = dst_pitch * (layer_num as u64 - 1) + width;
        let (src_ptr, dst_ptr) = if dir.writes_global() {
            (src as *const u8, resolve(dst, dst_span)?)
        } else {
            (resolve(src, src_span)? as *const u8, dst as *mut u8)
        };
        // One strided descriptor, walked row by row inside the engine.
        for layer in 0..layer_num as u64 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_ptr.add((layer * src_pitch) as usize),
                    dst_ptr.add((layer * dst_pitch) as usize),
                    width as usize,
                );
            }
        }
        Ok(())
    }

    fn copy_gva(&self, src: u64, dst: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let src_ptr = resolve(src, len)? as *const u8;
        let dst_ptr = resolve(dst, len)?;
        unsafe { std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, len as usize) };
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        // Host copies complete synchronously.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_window() {
        let f = HostFabric::new();
        let gva = f.gva_reserve(31, MediaType::Dram, 8192).unwrap();
        f.gva_alloc(gva, 8192).unwrap();

        let src = vec![0xA5u8; 4096];
        let mut dst = vec![0u8; 4096];
        f.copy(CopyDir::H2G, src.as_ptr() as u64, gva, 4096).unwrap();
        f.copy(CopyDir::G2H, gva, dst.as_mut_ptr() as u64, 4096).unwrap();
        assert_eq!(src, dst);

        f.gva_free(gva, 8192).unwrap();
        assert!(f.copy(CopyDir::G2H, gva, dst.as_mut_ptr() as u64, 1).is_err());
    }

    #[test]
    fn strided_copy_packs_layers() {
        let f = HostFabric::new();
        let gva = f.gva_reserve(32, MediaType::Dram, 4096).unwrap();
        f.gva_alloc(gva, 4096).unwrap();

        // 4 layers of 8 bytes, 16 bytes apart on the host side.
        let mut src = vec![0u8; 64];
        for (i, b) in src.iter_mut().enumerate() {
            *b = i as u8;
        }
        f.copy_2d(CopyDir::H2G, src.as_ptr() as u64, 16, gva, 8, 8, 4).unwrap();

        let mut packed = vec![0u8; 32];
        f.copy(CopyDir::G2H, gva, packed.as_mut_ptr() as u64, 32).unwrap();
        for layer in 0..4usize {
            assert_eq!(&packed[layer * 8..(layer + 1) * 8], &src[layer * 16..layer * 16 + 8]);
        }

        f.gva_free(gva, 4096).unwrap();
    }
}
