// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transfer buffer descriptor handed to the data plane.
// Describes caller memory (host or device) as either a flat 1D span or a
// 2D strided layout of layers; the DMA engine consumes it as-is.

use crate::error::{MmcError, Result};

/// Where the caller's buffer lives; decides the copy direction tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemKind {
    Host = 0,
    Device = 1,
}

/// Shape of the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufLayout {
    /// Flat span: `len` bytes starting `offset` bytes into the buffer.
    OneDim { offset: u64, len: u64 },
    /// Strided layers: `layer_num` rows of `width` bytes, each row
    /// `dpitch` bytes apart, starting at row `layer_offset`.
    TwoDim {
        dpitch: u64,
        layer_offset: u64,
        width: u64,
        layer_num: u32,
    },
}

/// A caller-provided transfer buffer.
///
/// `addr` is the base address of the caller's memory; the layout selects
/// the bytes actually moved. 2D buffers are transferred with a single
/// strided DMA call, never a loop of 1D copies.
#[derive(Debug, Clone, Copy)]
pub struct MmcBuffer {
    pub addr: u64,
    pub kind: MemKind,
    pub layout: BufLayout,
}

impl MmcBuffer {
    /// Flat host buffer over `data`.
    pub fn host_1d(data: &[u8]) -> MmcBuffer {
        MmcBuffer {
            addr: data.as_ptr() as u64,
            kind: MemKind::Host,
            layout: BufLayout::OneDim {
                offset: 0,
                len: data.len() as u64,
            },
        }
    }

    /// Flat mutable host buffer over `data`.
    pub fn host_1d_mut(data: &mut [u8]) -> MmcBuffer {
        MmcBuffer {
            addr: data.as_mut_ptr() as u64,
            kind: MemKind::Host,
            layout: BufLayout::OneDim {
                offset: 0,
                len: data.len() as u64,
            },
        }
    }

    /// 2D strided host buffer over `data`.
    pub fn host_2d(data: &[u8], dpitch: u64, width: u64, layer_num: u32) -> MmcBuffer {
        MmcBuffer {
            addr: data.as_ptr() as u64,
            kind: MemKind::Host,
            layout: BufLayout::TwoDim {
                dpitch,
                layer_offset: 0,
                width,
                layer_num,
            },
        }
    }

    /// Total payload bytes this descriptor moves.
    pub fn total_len(&self) -> u64 {
        match self.layout {
            BufLayout::OneDim { len, .. } => len,
            BufLayout::TwoDim {
                width, layer_num, ..
            } => width * layer_num as u64,
        }
    }

    /// Entry-point contract checks: non-null address, non-zero payload,
    /// `dpitch >= width` for strided layouts.
    pub fn validate(&self) -> Result<()> {
        if self.addr == 0 {
            return Err(MmcError::InvalidParam("buffer addr is null".into()));
        }
        match self.layout {
            BufLayout::OneDim { len, .. } => {
                if len == 0 {
                    return Err(MmcError::InvalidParam("buffer len is zero".into()));
                }
            }
            BufLayout::TwoDim {
                dpitch,
                width,
                layer_num,
                ..
            } => {
                if width == 0 || layer_num == 0 {
                    return Err(MmcError::InvalidParam("2d buffer has zero extent".into()));
                }
                if dpitch < width {
                    return Err(MmcError::InvalidParam(format!(
                        "dpitch {dpitch} smaller than width {width}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_dim_total_len() {
        let data = vec![0u8; 64];
        let buf = MmcBuffer::host_1d(&data);
        assert_eq!(buf.total_len(), 64);
        assert!(buf.validate().is_ok());
    }

    #[test]
    fn two_dim_rejects_pitch_smaller_than_width() {
        let data = vec![0u8; 256];
        let buf = MmcBuffer::host_2d(&data, 8, 16, 4);
        assert!(buf.validate().is_err());
    }

    #[test]
    fn two_dim_total_len_is_width_times_layers() {
        let data = vec![0u8; 256];
        let buf = MmcBuffer::host_2d(&data, 32, 16, 8);
        assert_eq!(buf.total_len(), 128);
        assert!(buf.validate().is_ok());
    }
}
