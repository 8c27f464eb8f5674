// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Context store for in-flight RPC calls, keyed by sequence number.
//
// Fast path: a flat array of CAS slots (capacity rounded to a power of
// two). Each slot packs a 6-bit version into the top bits of the stored
// pointer; the version rides along inside the sequence number, so a
// late reply for a recycled slot fails its CAS instead of waking the
// wrong caller. Overflow goes to small mutex-guarded hash maps.
//
// Sequence number layout (32 bits):
//   realSeq : 24   slot index (or overflow key)
//   version :  6   ABA guard
//   fromFlat:  1   allocated from the flat array or the hash maps
//   isResp  :  1   request/reply direction, owned by the framing layer

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{MmcError, Result};

const TRY_GET_FLAT: usize = 3;
const VERSION_MASK: u32 = 0x3F;
const VERSION_VALUE_SHIFT: u32 = 58;
const PTR_MASK: u64 = 0x03FF_FFFF_FFFF_FFFF;
const HASH_COUNT: usize = 4;

const SEQ_BITS: u32 = 24;
const FROM_FLAT_BIT: u32 = 1 << 30;
/// Reply-direction bit; set and cleared by the framing layer.
pub const IS_RESP_BIT: u32 = 1 << 31;

const MIN_FLAT: u32 = 128;
const MAX_FLAT: u32 = 1 << SEQ_BITS;

/// Packed sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqNo(pub u32);

impl SeqNo {
    fn make(from_flat: bool, version: u32, real_seq: u32) -> SeqNo {
        let mut v = real_seq & (MAX_FLAT - 1);
        v |= (version & VERSION_MASK) << SEQ_BITS;
        if from_flat {
            v |= FROM_FLAT_BIT;
        }
        SeqNo(v)
    }

    pub fn real_seq(self) -> u32 {
        self.0 & (MAX_FLAT - 1)
    }

    pub fn version(self) -> u32 {
        (self.0 >> SEQ_BITS) & VERSION_MASK
    }

    pub fn from_flat(self) -> bool {
        self.0 & FROM_FLAT_BIT != 0
    }

    pub fn is_resp(self) -> bool {
        self.0 & IS_RESP_BIT != 0
    }

    pub fn as_resp(self) -> SeqNo {
        SeqNo(self.0 | IS_RESP_BIT)
    }

    pub fn as_req(self) -> SeqNo {
        SeqNo(self.0 & !IS_RESP_BIT)
    }
}

/// Lock-free-on-the-fast-path store of reply contexts.
pub struct ContextStore<T> {
    flat: Box<[AtomicU64]>,
    seq_mask: u32,
    version_shift: u32,
    counter: AtomicU32,
    overflow: [Mutex<HashMap<u32, u64>>; HASH_COUNT],
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> ContextStore<T> {
    pub fn new(flat_capacity: u32) -> ContextStore<T> {
        let clamped = flat_capacity.clamp(MIN_FLAT, MAX_FLAT);
        // Round down to a power of two so the slot index is a mask.
        let capacity = 1u32 << (31 - clamped.leading_zeros());
        let seq_mask = capacity - 1;

        let mut flat = Vec::with_capacity(capacity as usize);
        flat.resize_with(capacity as usize, || AtomicU64::new(0));

        ContextStore {
            flat: flat.into_boxed_slice(),
            seq_mask,
            version_shift: seq_mask.count_ones(),
            counter: AtomicU32::new(1),
            overflow: Default::default(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.flat.len()
    }

    /// Park `ctx` and mint the sequence number a reply must quote.
    pub fn put(&self, ctx: Arc<T>) -> Result<SeqNo> {
        let raw = Arc::into_raw(ctx) as u64;
        debug_assert_eq!(raw & !PTR_MASK, 0, "pointer exceeds 58 bits");

        let mut version = 0u32;
        let mut seq = 0u32;
        for _ in 0..TRY_GET_FLAT {
            let mut sv = self.counter.fetch_add(1, Ordering::Relaxed);
            if sv & self.seq_mask == 0 {
                // Slot 0 is reserved for fire-and-forget frames.
                sv = self.counter.fetch_add(1, Ordering::Relaxed);
            }
            seq = sv & self.seq_mask;
            version = (sv >> self.version_shift) & VERSION_MASK;
            let value = ((version as u64) << VERSION_VALUE_SHIFT) | raw;
            if self.flat[seq as usize]
                .compare_exchange(0, value, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(SeqNo::make(true, version, seq));
            }
        }

        // No free flat slot after three probes; park in the hash maps.
        let key = SeqNo::make(false, version, seq);
        let mut map = self.overflow[seq as usize % HASH_COUNT].lock().unwrap();
        if map.insert(key.0, raw).is_some() {
            // Rewind the leak before reporting the duplicate.
            drop(map);
            unsafe { drop(Arc::from_raw(raw as *const T)) };
            return Err(MmcError::Internal("duplicate rpc sequence".into()));
        }
        Ok(key)
    }

    /// Claim the context for `seq` exactly once. A second caller (reply
    /// racing a timeout sweep) observes `None`.
    pub fn take(&self, seq: SeqNo) -> Option<Arc<T>> {
        let seq = seq.as_req();
        if seq.from_flat() {
            let slot = &self.flat[seq.real_seq() as usize];
            let cur = slot.load(Ordering::Acquire);
            let ptr = cur & PTR_MASK;
            let expect = ((seq.version() as u64) << VERSION_VALUE_SHIFT) | ptr;
            if slot
                .compare_exchange(expect, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if ptr == 0 {
                    return None;
                }
                return Some(unsafe { Arc::from_raw(ptr as *const T) });
            }
            return None;
        }

        let mut map = self.overflow[seq.real_seq() as usize % HASH_COUNT].lock().unwrap();
        map.remove(&seq.0)
            .map(|raw| unsafe { Arc::from_raw(raw as *const T) })
    }
}

impl<T> Drop for ContextStore<T> {
    fn drop(&mut self) {
        for slot in self.flat.iter() {
            let raw = slot.swap(0, Ordering::AcqRel) & PTR_MASK;
            if raw != 0 {
                unsafe { drop(Arc::from_raw(raw as *const T)) };
            }
        }
        for map in &self.overflow {
            for (_, raw) in map.lock().unwrap().drain() {
                unsafe { drop(Arc::from_raw(raw as *const T)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_take_round_trip() {
        let store: ContextStore<String> = ContextStore::new(128);
        let seq = store.put(Arc::new("ctx".to_owned())).unwrap();
        assert!(seq.from_flat());
        let back = store.take(seq).unwrap();
        assert_eq!(*back, "ctx");
        // Second take (late reply after timeout sweep) sees nothing.
        assert!(store.take(seq).is_none());
    }

    #[test]
    fn resp_bit_is_transparent() {
        let store: ContextStore<u32> = ContextStore::new(128);
        let seq = store.put(Arc::new(7)).unwrap();
        assert!(!seq.is_resp());
        let resp = seq.as_resp();
        assert!(resp.is_resp());
        assert_eq!(*store.take(resp).unwrap(), 7);
    }

    #[test]
    fn stale_version_cannot_claim_recycled_slot() {
        let store: ContextStore<u32> = ContextStore::new(128);
        let first = store.put(Arc::new(1)).unwrap();
        let _ = store.take(first).unwrap();

        // Drive the counter one full lap so the slot index repeats with
        // a different version.
        let mut second = store.put(Arc::new(2)).unwrap();
        while second.real_seq() != first.real_seq() {
            let _ = store.take(second).unwrap();
            second = store.put(Arc::new(2)).unwrap();
        }
        assert_ne!(second.version(), first.version());

        // The stale seq no must not steal the new occupant.
        assert!(store.take(first).is_none());
        assert_eq!(*store.take(second).unwrap(), 2);
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let store: ContextStore<u32> = ContextStore::new(300);
        assert_eq!(store.capacity(), 256);
        let store: ContextStore<u32> = ContextStore::new(1);
        assert_eq!(store.capacity(), 128);
    }

    #[test]
    fn many_outstanding_contexts_spill_and_return() {
        let store: ContextStore<u32> = ContextStore::new(128);
        let seqs: Vec<SeqNo> = (0..500).map(|i| store.put(Arc::new(i)).unwrap()).collect();
        // More outstanding than flat slots: some came from the overflow maps.
        assert!(seqs.iter().any(|s| !s.from_flat()));
        for (i, seq) in seqs.into_iter().enumerate() {
            assert_eq!(*store.take(seq).unwrap(), i as u32);
        }
    }
}
