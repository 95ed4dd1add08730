//! Closed error type returned from the public [`crate::manager::ChunkManager`] surface.
//!
//! Internally most helpers return `anyhow::Result`, mirroring the split already present in the
//! upstream workspace (`anyhow` almost everywhere, `thiserror` for the few closed, structurally
//! matched error enums). `ChunkManagerError` is that closed enum for this crate; it is mapped to
//! from `anyhow::Error` only at entry points that intentionally lose the backtrace-rich internal
//! error in favor of a stable, matchable kind.

use thiserror::Error;

/// Every error a [`crate::manager::ChunkManager`] method can return.
#[derive(Error, Debug)]
pub enum ChunkManagerError {
    #[error("store directory is locked by another process")]
    DirectoryLocked,

    #[error("manager is closed")]
    ManagerClosed,

    #[error("chunk not found: {0}")]
    ChunkNotFound(crate::chunk_id::ChunkId),

    #[error("operation not permitted on the active chunk")]
    ActiveChunk,

    #[error("chunk is not sealed")]
    ChunkNotSealed,

    #[error("encoded attributes exceed 65535 bytes")]
    AttrTooLarge,

    #[error("AppendPreserved requires a nonzero WriteTS")]
    MissingWriteTS,

    #[error("file signature mismatch")]
    SignatureMismatch,

    #[error("file type mismatch")]
    TypeMismatch,

    #[error("unknown file format version")]
    VersionMismatch,

    #[error("short write ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Internal helper result type, matching `chunk_store.rs`/`fixed_index.rs`'s own `anyhow::Result`
/// return convention for non-boundary functions.
pub type Result<T> = anyhow::Result<T>;

/// Map an internal `anyhow::Error` to the public error kind set at a `ChunkManager` boundary.
///
/// Internal helpers construct `ChunkManagerError` variants (signature/type/version mismatches,
/// `AttrTooLarge`, ...) and fold them into `anyhow::Error` via `anyhow::anyhow!` / `?` as they
/// propagate; this recovers the original structured variant via downcast instead of flattening
/// everything to `IOError`.
pub fn from_anyhow(err: anyhow::Error) -> ChunkManagerError {
    match err.downcast::<ChunkManagerError>() {
        Ok(err) => err,
        Err(err) => ChunkManagerError::IOError(std::io::Error::other(err.to_string())),
    }
}
