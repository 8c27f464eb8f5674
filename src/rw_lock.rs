// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-word atomic read-write lock.
// - High bit (w_flag) marks exclusive/write lock.
// - Low 31 bits count concurrent shared/read locks.
// The global allocator registry is the main customer: mount/unmount write,
// every alloc/free path reads.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::spin_lock::adaptive_yield;

const W_MASK: u32 = i32::MAX as u32; // 0x7FFF_FFFF — reader count mask
const W_FLAG: u32 = W_MASK + 1; // 0x8000_0000 — writer flag

/// A single-word atomic read-write lock guarding a value of type `T`.
///
/// Writers get exclusive access, multiple readers hold the lock
/// concurrently. Guards release on drop.
pub struct RwLock<T> {
    lc: AtomicU32,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lc: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire an exclusive (write) lock.
    pub fn write(&self) -> RwWriteGuard<'_, T> {
        let mut k = 0u32;
        loop {
            let old = self.lc.fetch_or(W_FLAG, Ordering::AcqRel);
            if old == 0 {
                return RwWriteGuard { lock: self }; // got w-lock, no readers
            }
            if old & W_FLAG == 0 {
                break; // readers present but no other writer — wait for them
            }
            // another writer holds the lock, spin
            adaptive_yield(&mut k);
        }
        // Wait for all readers to finish
        let mut k = 0u32;
        while self.lc.load(Ordering::Acquire) & W_MASK != 0 {
            adaptive_yield(&mut k);
        }
        RwWriteGuard { lock: self }
    }

    /// Acquire a shared (read) lock.
    pub fn read(&self) -> RwReadGuard<'_, T> {
        let mut old = self.lc.load(Ordering::Acquire);
        let mut k = 0u32;
        loop {
            if old & W_FLAG != 0 {
                // writer is active, spin
                adaptive_yield(&mut k);
                old = self.lc.load(Ordering::Acquire);
            } else if self
                .lc
                .compare_exchange_weak(old, old + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return RwReadGuard { lock: self };
            } else {
                // CAS failed, reload
                old = self.lc.load(Ordering::Acquire);
            }
        }
    }

    /// Access the value without locking. Requires exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Shared guard; decrements the reader count on drop.
pub struct RwReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lc.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive guard; clears the writer flag on drop.
pub struct RwWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lc.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn readers_share_writers_exclude() {
        let l = Arc::new(RwLock::new(Vec::<u32>::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let l = Arc::clone(&l);
            handles.push(std::thread::spawn(move || {
                for j in 0..1000 {
                    l.write().push(i * 1000 + j);
                    let _ = l.read().len();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(l.read().len(), 4000);
    }
}
