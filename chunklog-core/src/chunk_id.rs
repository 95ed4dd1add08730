//! Time-ordered chunk identifiers.
//!
//! `proxmox_uuid::Uuid::generate()` only produces random (v4-style) identifiers. This engine needs
//! lexicographic order to equal creation order, so chunk identifiers are minted as UUID v7 via the
//! `uuid` crate instead, with the `v7` feature enabled rather than `v4`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use uuid::Uuid;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(Uuid);

impl ChunkId {
    /// Mint a fresh, time-ordered chunk id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Directory name for this chunk: canonical hyphenated hex.
    pub fn dir_name(&self) -> String {
        self.0.hyphenated().to_string()
    }

    /// Parse a chunk directory's base name back into an id; returns `None` for anything that is
    /// not a canonical UUID (used to skip unrelated entries while scanning the store directory).
    pub fn parse_dir_name(name: &str) -> Option<Self> {
        Uuid::parse_str(name).ok().map(Self)
    }

    /// `true` if `path`'s file name parses as a chunk id.
    pub fn looks_like_chunk_dir(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(Self::parse_dir_name)
            .is_some()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.dir_name())
    }
}

impl FromStr for ChunkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_sort_by_creation_order() {
        let a = ChunkId::generate();
        let b = ChunkId::generate();
        assert!(a <= b);
    }

    #[test]
    fn dir_name_round_trips() {
        let id = ChunkId::generate();
        let parsed = ChunkId::parse_dir_name(&id.dir_name()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_non_uuid_names() {
        assert!(ChunkId::parse_dir_name("not-a-uuid").is_none());
        assert!(ChunkId::parse_dir_name(".lock").is_none());
    }
}
