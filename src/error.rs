// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy shared by every subsystem, plus the signed status codes
// exposed through the batch/status-array surface and a thread-local
// last-error message scratch.

use std::cell::RefCell;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, MmcError>;

/// Every failure kind a public API can surface.
///
/// Each variant maps to a stable negative `i32` status code; `0` is success.
/// Batch APIs report one code per element in a parallel array.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MmcError {
    /// Caller-side contract violated: null/empty key, oversized key,
    /// zero size, bad buffer descriptor, mismatched batch array lengths.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Key not present in the catalog.
    #[error("key not found")]
    UnmatchedKey,

    /// First-write-wins: the key already exists.
    #[error("key already exists")]
    Duplicated,

    /// The blob state machine rejected the requested transition.
    #[error("blob state rejected transition")]
    UnmatchedState,

    /// No allocator can satisfy the request at the requested tier.
    #[error("out of space")]
    OutOfSpace,

    /// An RPC or lease wait exceeded its deadline.
    #[error("timed out")]
    Timeout,

    /// The DMA engine or an RPC socket failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Lifecycle misuse: the component has not been started.
    #[error("not started")]
    NotStarted,

    /// Lifecycle misuse: the component has not been initialized.
    #[error("not initialized")]
    NotInitialized,

    /// Readers still outstanding and the deadline has not passed.
    #[error("lease not expired")]
    LeaseNotExpired,

    /// Catch-all internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MmcError {
    /// Stable status code for the C-style integer surface. Always negative.
    pub fn status_code(&self) -> i32 {
        match self {
            MmcError::InvalidParam(_) => -3000,
            MmcError::UnmatchedKey => -3102,
            MmcError::Duplicated => -3006,
            MmcError::UnmatchedState => -3101,
            MmcError::OutOfSpace => -3016,
            MmcError::Timeout => -3004,
            MmcError::Transport(_) => -3014,
            MmcError::NotStarted => -3003,
            MmcError::NotInitialized => -3008,
            MmcError::LeaseNotExpired => -3104,
            MmcError::Internal(_) => -1,
        }
    }

    /// Reverse mapping used when a status code crosses the wire.
    /// Unknown negative codes collapse to `Internal`.
    pub fn from_status_code(code: i32) -> Option<MmcError> {
        match code {
            0 => None,
            -3000 => Some(MmcError::InvalidParam(String::new())),
            -3102 => Some(MmcError::UnmatchedKey),
            -3006 => Some(MmcError::Duplicated),
            -3101 => Some(MmcError::UnmatchedState),
            -3016 => Some(MmcError::OutOfSpace),
            -3004 => Some(MmcError::Timeout),
            -3014 => Some(MmcError::Transport(String::new())),
            -3003 => Some(MmcError::NotStarted),
            -3008 => Some(MmcError::NotInitialized),
            -3104 => Some(MmcError::LeaseNotExpired),
            c => Some(MmcError::Internal(format!("status {c}"))),
        }
    }
}

/// Status code of a `Result` for the parallel status arrays of batch APIs.
pub fn status_of<T>(r: &Result<T>) -> i32 {
    match r {
        Ok(_) => 0,
        Err(e) => e.status_code(),
    }
}

impl From<std::io::Error> for MmcError {
    fn from(e: std::io::Error) -> Self {
        MmcError::Transport(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Last-error scratch
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Record a message retrievable by [`last_error`] on this thread.
pub fn set_last_error(msg: impl Into<String>) {
    LAST_ERROR.with(|e| *e.borrow_mut() = msg.into());
}

/// The most recent error message recorded on this thread, if any.
pub fn last_error() -> String {
    LAST_ERROR.with(|e| e.borrow().clone())
}
