//! A time-ordered, append-only log storage engine core.
//!
//! A [`manager::ChunkManager`] owns a single store directory on a local filesystem and writes
//! immutable records into rotating on-disk chunks: three parallel files per chunk (raw payload
//! log, fixed-width index, dictionary-compressed attribute log) plus a small per-chunk key
//! dictionary. It serves forward, reverse, and seek-to-record reads over both sealed chunks
//! (zero-copy via `mmap`) and the currently-growing active chunk (via positional reads), and
//! recovers from an unclean shutdown on reopen: directory lock, orphan-chunk sealing, torn-write
//! truncation.
//!
//! Everything above the `ChunkManager` boundary - store configuration, ingestion scheduling,
//! retention policy *selection*, query planning - is a collaborator, not part of this crate.

pub mod attrs;
pub mod chunk;
pub mod chunk_id;
pub mod compression;
pub mod cursor;
pub mod cursor_mmap;
pub mod cursor_streaming;
pub mod dictionary;
pub mod error;
pub mod file_header;
pub mod manager;
pub mod record;
pub mod rotation;

pub use chunk::ChunkMeta;
pub use chunk_id::ChunkId;
pub use cursor::Cursor;
pub use cursor_mmap::MmapCursor;
pub use cursor_streaming::StreamingCursor;
pub use error::ChunkManagerError;
pub use manager::{ChunkManager, FsyncLevel, ManagerConfig};
pub use record::{Attrs, Record, RecordRef};
pub use rotation::{AgePolicy, CompositePolicy, HardLimitPolicy, RotationPolicy, RotationReason, SizePolicy};
