// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Blobs: an allocated extent within one segment, its wire descriptor, and
// the per-blob state machine that is the source of truth for correctness
// of concurrent put/get/remove/migrate.

use std::fmt;
use std::sync::Arc;

use crate::error::{MmcError, Result};
use crate::spin_lock::SpinMutex;
use crate::types::{Location, MediaType};

/// States of one blob. Terminal state is `Final`; a blob may only be
/// handed back to its allocator after reaching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobState {
    Init = 0,
    Allocated = 1,
    DataWriting = 2,
    DataReady = 3,
    Copying = 4,
    Removing = 5,
    Final = 6,
}

impl BlobState {
    pub fn from_u8(v: u8) -> BlobState {
        match v {
            0 => BlobState::Init,
            1 => BlobState::Allocated,
            2 => BlobState::DataWriting,
            3 => BlobState::DataReady,
            4 => BlobState::Copying,
            5 => BlobState::Removing,
            _ => BlobState::Final,
        }
    }
}

/// Actions a blob can be driven by. Reads are copies out of global
/// memory, so a read in flight parks the blob in `Copying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobAction {
    AllocOk = 0,
    AllocFail = 1,
    WriteStart = 2,
    WriteOk = 3,
    WriteFail = 4,
    ReadStart = 5,
    ReadOk = 6,
    RemoveStart = 7,
    RemoveOk = 8,
}

impl BlobAction {
    pub fn from_u8(v: u8) -> Option<BlobAction> {
        Some(match v {
            0 => BlobAction::AllocOk,
            1 => BlobAction::AllocFail,
            2 => BlobAction::WriteStart,
            3 => BlobAction::WriteOk,
            4 => BlobAction::WriteFail,
            5 => BlobAction::ReadStart,
            6 => BlobAction::ReadOk,
            7 => BlobAction::RemoveStart,
            8 => BlobAction::RemoveOk,
            _ => return None,
        })
    }
}

/// The transition table. Every pair not listed rejects with
/// `UnmatchedState`.
fn transition(state: BlobState, action: BlobAction) -> Option<BlobState> {
    use BlobAction::*;
    use BlobState::*;
    Some(match (state, action) {
        (Init, AllocOk) => Allocated,
        (Init, AllocFail) => Final,
        (Allocated, WriteStart) => DataWriting,
        (Allocated, WriteOk) => DataReady,
        (Allocated, RemoveStart) => Removing,
        (DataWriting, WriteOk) => DataReady,
        (DataWriting, WriteFail) => Allocated,
        (DataReady, ReadStart) => Copying,
        (DataReady, RemoveStart) => Removing,
        (Copying, ReadOk) => DataReady,
        (Removing, RemoveOk) => Final,
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Wire descriptor
// ---------------------------------------------------------------------------

/// Placement identity of a blob as it crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobDesc {
    pub rank: u32,
    pub media: MediaType,
    pub gva: u64,
    pub size: u64,
}

impl BlobDesc {
    pub fn location(&self) -> Location {
        Location::new(self.rank, self.media)
    }
}

impl Default for BlobDesc {
    fn default() -> Self {
        BlobDesc {
            rank: u32::MAX,
            media: MediaType::None,
            gva: u64::MAX,
            size: 0,
        }
    }
}

impl fmt::Display for BlobDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blob{{rank:{},media:{},gva:{:#x},size:{}}}",
            self.rank, self.media, self.gva, self.size
        )
    }
}

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

struct BlobMut {
    state: BlobState,
    next: Option<Arc<MemBlob>>,
}

/// An allocated extent within one segment.
///
/// Identity (rank, gva, size, media) is immutable; the state word and the
/// replica chain pointer sit behind a spin lock. `size` is the payload
/// size as requested; the allocator accounts the aligned size.
pub struct MemBlob {
    rank: u32,
    gva: u64,
    size: u64,
    media: MediaType,
    prot: u16,
    inner: SpinMutex<BlobMut>,
}

impl MemBlob {
    pub fn new(rank: u32, gva: u64, size: u64, media: MediaType, state: BlobState) -> Arc<MemBlob> {
        Arc::new(MemBlob {
            rank,
            gva,
            size,
            media,
            prot: 0,
            inner: SpinMutex::new(BlobMut { state, next: None }),
        })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn gva(&self) -> u64 {
        self.gva
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn media(&self) -> MediaType {
        self.media
    }

    pub fn prot(&self) -> u16 {
        self.prot
    }

    pub fn state(&self) -> BlobState {
        self.inner.lock().state
    }

    pub fn location(&self) -> Location {
        Location::new(self.rank, self.media)
    }

    pub fn desc(&self) -> BlobDesc {
        BlobDesc {
            rank: self.rank,
            media: self.media,
            gva: self.gva,
            size: self.size,
        }
    }

    /// Drive the state machine by one action.
    ///
    /// Returns the new state, or `UnmatchedState` if the table rejects
    /// the pair; the state is left untouched in that case.
    pub fn update_state(&self, action: BlobAction) -> Result<BlobState> {
        let mut inner = self.inner.lock();
        match transition(inner.state, action) {
            Some(next) => {
                log::debug!(
                    "blob {:#x} state {:?} -> {:?} on {:?}",
                    self.gva,
                    inner.state,
                    next,
                    action
                );
                inner.state = next;
                Ok(next)
            }
            None => {
                log::warn!(
                    "blob {:#x} rejected {:?} in state {:?}",
                    self.gva,
                    action,
                    inner.state
                );
                Err(MmcError::UnmatchedState)
            }
        }
    }

    /// Chain a further copy of the same object behind this blob.
    /// Fails if the link is already taken.
    pub fn set_next(&self, next: Arc<MemBlob>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.next.is_some() {
            return Err(MmcError::Internal("blob next link already set".into()));
        }
        inner.next = Some(next);
        Ok(())
    }

    pub fn next(&self) -> Option<Arc<MemBlob>> {
        self.inner.lock().next.clone()
    }

    pub fn take_next(&self) -> Option<Arc<MemBlob>> {
        self.inner.lock().next.take()
    }

    /// Replace the chain link. Used when unlinking an interior blob.
    pub fn replace_next(&self, next: Option<Arc<MemBlob>>) {
        self.inner.lock().next = next;
    }
}

impl fmt::Debug for MemBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlob")
            .field("rank", &self.rank)
            .field("gva", &self.gva)
            .field("size", &self.size)
            .field("media", &self.media)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Selects blobs by placement and/or readability. `None` fields match
/// everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobFilter {
    pub rank: Option<u32>,
    pub media: Option<MediaType>,
    pub readable: bool,
}

impl BlobFilter {
    /// Match every blob.
    pub fn any() -> BlobFilter {
        BlobFilter::default()
    }

    /// Match blobs at one location.
    pub fn at(loc: Location) -> BlobFilter {
        BlobFilter {
            rank: Some(loc.rank),
            media: Some(loc.media),
            readable: false,
        }
    }

    /// Match blobs whose data can be read right now.
    pub fn readable() -> BlobFilter {
        BlobFilter {
            rank: None,
            media: None,
            readable: true,
        }
    }

    pub fn matches(&self, blob: &MemBlob) -> bool {
        if let Some(rank) = self.rank {
            if blob.rank() != rank {
                return false;
            }
        }
        if let Some(media) = self.media {
            if blob.media() != media {
                return false;
            }
        }
        if self.readable && blob.state() != BlobState::DataReady {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_write_path() {
        let b = MemBlob::new(0, 0x1000, 4096, MediaType::Dram, BlobState::Init);
        assert_eq!(b.update_state(BlobAction::AllocOk).unwrap(), BlobState::Allocated);
        assert_eq!(b.update_state(BlobAction::WriteStart).unwrap(), BlobState::DataWriting);
        assert_eq!(b.update_state(BlobAction::WriteOk).unwrap(), BlobState::DataReady);
        assert_eq!(b.update_state(BlobAction::ReadStart).unwrap(), BlobState::Copying);
        assert_eq!(b.update_state(BlobAction::ReadOk).unwrap(), BlobState::DataReady);
        assert_eq!(b.update_state(BlobAction::RemoveStart).unwrap(), BlobState::Removing);
        assert_eq!(b.update_state(BlobAction::RemoveOk).unwrap(), BlobState::Final);
    }

    #[test]
    fn write_fail_returns_to_allocated() {
        let b = MemBlob::new(0, 0, 4096, MediaType::Dram, BlobState::Allocated);
        b.update_state(BlobAction::WriteStart).unwrap();
        assert_eq!(b.update_state(BlobAction::WriteFail).unwrap(), BlobState::Allocated);
        // Retry succeeds.
        b.update_state(BlobAction::WriteStart).unwrap();
        assert_eq!(b.update_state(BlobAction::WriteOk).unwrap(), BlobState::DataReady);
    }

    #[test]
    fn illegal_pairs_rejected_without_change() {
        let b = MemBlob::new(0, 0, 4096, MediaType::Hbm, BlobState::Init);
        assert_eq!(b.update_state(BlobAction::WriteOk), Err(MmcError::UnmatchedState));
        assert_eq!(b.state(), BlobState::Init);
        assert_eq!(b.update_state(BlobAction::RemoveOk), Err(MmcError::UnmatchedState));
        assert_eq!(b.state(), BlobState::Init);
    }

    #[test]
    fn final_only_through_removing() {
        // Direct writes toward Final from live states all reject.
        for state in [BlobState::Allocated, BlobState::DataReady, BlobState::Copying] {
            let b = MemBlob::new(0, 0, 4096, MediaType::Dram, state);
            assert!(b.update_state(BlobAction::RemoveOk).is_err());
        }
    }

    #[test]
    fn filter_matches_placement_and_state() {
        let b = MemBlob::new(3, 0, 4096, MediaType::Hbm, BlobState::DataReady);
        assert!(BlobFilter::any().matches(&b));
        assert!(BlobFilter::at(Location::new(3, MediaType::Hbm)).matches(&b));
        assert!(!BlobFilter::at(Location::new(2, MediaType::Hbm)).matches(&b));
        assert!(BlobFilter::readable().matches(&b));
        b.update_state(BlobAction::ReadStart).unwrap();
        assert!(!BlobFilter::readable().matches(&b));
    }
}
