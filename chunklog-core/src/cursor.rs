//! The `Cursor` contract: `Next`/`Prev`/`Seek` over one chunk's records.
//!
//! A single `pos` field serves both directions: `Next` returns the record at `pos` then
//! increments it, `Prev` decrements `pos` then returns the record at the new value. So
//! `Seek(p); Next()` yields record `p` and `Seek(p); Prev()` yields record `p-1`, matching the
//! independent-forward/reverse-position requirement without tracking two counters.

use crate::error::ChunkManagerError;
use crate::record::{Record, RecordRef};

pub trait Cursor {
    /// Record count this cursor was opened with.
    fn len(&self) -> u64;

    /// Return the record at the current position and advance it by one, or `None` past the end.
    fn next(&mut self) -> Result<Option<(Record, RecordRef)>, ChunkManagerError>;

    /// Step the position back by one and return the record there, or `None` at the start.
    fn prev(&mut self) -> Result<Option<(Record, RecordRef)>, ChunkManagerError>;

    /// Move the cursor to record index `pos`. `pos == len()` is valid (positions a subsequent
    /// `Prev` at the last record); anything past that is `InvalidEntry`.
    fn seek(&mut self, pos: u64) -> Result<(), ChunkManagerError>;
}
