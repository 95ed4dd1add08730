//! Rotation policy: pure decision functions over [`ActiveChunkState`] and the next [`Record`].
//!
//! Modeled on `prune.rs`'s style of small, pure, composable functions over plain data rather than
//! trait objects with internal state - a rotation policy never touches the filesystem, it only
//! answers "should the active chunk seal before this record is appended, and why".

use std::time::Duration;

use crate::chunk_id::ChunkId;
use crate::record::{IndexEntry, Record};

/// Snapshot of the active chunk fed to a rotation policy ahead of the next append.
#[derive(Clone, Debug)]
pub struct ActiveChunkState {
    pub chunk_id: ChunkId,
    pub start_ts: i64,
    pub last_write_ts: i64,
    pub created_at: std::time::SystemTime,
    pub bytes: u64,
    pub records: u64,
}

/// Why the active chunk is being rotated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationReason {
    HardLimit,
    Size,
    Age,
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RotationReason::HardLimit => "hard-limit",
            RotationReason::Size => "size",
            RotationReason::Age => "age",
        })
    }
}

/// A pure rotation decision function.
pub trait RotationPolicy: Send + Sync {
    fn should_rotate(&self, state: &ActiveChunkState, next: &Record) -> Option<RotationReason>;
}

/// Always included first by the manager: guarantees the `u32` raw/attr offsets in the index can
/// always address the file, regardless of what other policies are configured.
pub struct HardLimitPolicy {
    pub max_raw_bytes: u64,
    pub max_attr_bytes: u64,
}

impl Default for HardLimitPolicy {
    fn default() -> Self {
        Self {
            max_raw_bytes: u32::MAX as u64,
            max_attr_bytes: u32::MAX as u64,
        }
    }
}

impl HardLimitPolicy {
    /// Decide using already-known offsets, rather than recomputing attribute encoding - this is
    /// what the manager actually calls on the append path, since it has the real encoded length in
    /// hand already.
    pub fn should_rotate_with_sizes(
        &self,
        raw_offset: u64,
        next_raw_len: u64,
        attr_offset: u64,
        next_attr_len: u64,
    ) -> Option<RotationReason> {
        if raw_offset + next_raw_len > self.max_raw_bytes {
            return Some(RotationReason::HardLimit);
        }
        if attr_offset + next_attr_len > self.max_attr_bytes {
            return Some(RotationReason::HardLimit);
        }
        None
    }
}

impl RotationPolicy for HardLimitPolicy {
    fn should_rotate(&self, state: &ActiveChunkState, next: &Record) -> Option<RotationReason> {
        // `state.bytes` is an upper bound on both the raw and attr offsets individually, since
        // both are sub-components of the chunk's total byte count - a conservative stand-in for
        // the generic trait entry point. `manager.rs::append` calls `should_rotate_with_sizes`
        // directly with the real offsets instead of going through this approximation.
        let attr_estimate: u64 = next
            .attrs
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>() as u64;
        self.should_rotate_with_sizes(state.bytes, next.raw.len() as u64, state.bytes, attr_estimate)
    }
}

pub struct SizePolicy {
    pub max_chunk_bytes: u64,
}

impl RotationPolicy for SizePolicy {
    fn should_rotate(&self, state: &ActiveChunkState, next: &Record) -> Option<RotationReason> {
        let attr_estimate: u64 = next
            .attrs
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>() as u64;
        let projected =
            state.bytes + next.raw.len() as u64 + attr_estimate + IndexEntry::default().encode().len() as u64;
        if projected > self.max_chunk_bytes {
            Some(RotationReason::Size)
        } else {
            None
        }
    }
}

pub struct AgePolicy {
    pub max_age: Duration,
}

impl RotationPolicy for AgePolicy {
    fn should_rotate(&self, state: &ActiveChunkState, _next: &Record) -> Option<RotationReason> {
        if state.records == 0 {
            return None;
        }
        match state.created_at.elapsed() {
            Ok(elapsed) if elapsed >= self.max_age => Some(RotationReason::Age),
            _ => None,
        }
    }
}

/// Runs its children in order, returning the first non-`None` reason.
pub struct CompositePolicy {
    children: Vec<Box<dyn RotationPolicy>>,
}

impl CompositePolicy {
    pub fn new(children: Vec<Box<dyn RotationPolicy>>) -> Self {
        Self { children }
    }

    /// The manager's unconditional default: a hard-limit policy first, nothing else.
    pub fn default_with_hard_limit() -> Self {
        Self::new(vec![Box::new(HardLimitPolicy::default())])
    }
}

impl RotationPolicy for CompositePolicy {
    fn should_rotate(&self, state: &ActiveChunkState, next: &Record) -> Option<RotationReason> {
        self.children
            .iter()
            .find_map(|policy| policy.should_rotate(state, next))
    }
}
