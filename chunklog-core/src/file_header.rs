//! The 4-byte header stamped at the start of every on-disk file.
//!
//! `signature(1) | type(1) | version(1) | flags(1)`. Unlike the upstream blob formats (8-byte sha256
//! derived magics, see `file_formats.rs`), chunklog's files are identified by a single fixed magic
//! byte plus a file-type byte, since every file in a chunk directory already lives at a well-known
//! name (`raw.log`, `idx.log`, ...) and does not need to be told apart from unrelated blobs on disk.

use crate::error::ChunkManagerError;

pub const HEADER_SIZE: usize = 4;

/// Fixed magic identifying a chunklog file. Chosen arbitrarily; do not change without a format
/// version bump.
pub const SIGNATURE: u8 = 0xc7;

pub const CURRENT_VERSION: u8 = 0x01;

pub const FLAG_SEALED: u8 = 0x01;
pub const FLAG_COMPRESSED: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Raw = b'r',
    Index = b'i',
    Attr = b'a',
    Dict = b'd',
}

impl FileType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'r' => Some(FileType::Raw),
            b'i' => Some(FileType::Index),
            b'a' => Some(FileType::Attr),
            b'd' => Some(FileType::Dict),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    pub file_type: FileType,
    pub version: u8,
    pub flags: u8,
}

impl FileHeader {
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            version: CURRENT_VERSION,
            flags: 0,
        }
    }

    pub fn sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        [SIGNATURE, self.file_type as u8, self.version, self.flags]
    }

    pub fn decode(buf: &[u8; HEADER_SIZE], expected: FileType) -> Result<Self, ChunkManagerError> {
        if buf[0] != SIGNATURE {
            return Err(ChunkManagerError::SignatureMismatch);
        }

        let file_type = FileType::from_byte(buf[1]).ok_or(ChunkManagerError::TypeMismatch)?;
        if file_type != expected {
            return Err(ChunkManagerError::TypeMismatch);
        }

        if buf[2] != CURRENT_VERSION {
            return Err(ChunkManagerError::VersionMismatch);
        }

        Ok(Self {
            file_type,
            version: buf[2],
            flags: buf[3],
        })
    }
}

/// Offset of the flags byte within an encoded header; used by `seal` to flip the `Sealed` bit with
/// a single-byte read-modify-write instead of rewriting the whole header.
pub const FLAGS_OFFSET: u64 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = FileHeader::new(FileType::Raw);
        let encoded = header.encode();
        let decoded = FileHeader::decode(&encoded, FileType::Raw).unwrap();
        assert_eq!(decoded.version, CURRENT_VERSION);
        assert!(!decoded.sealed());
        assert!(!decoded.compressed());
    }

    #[test]
    fn rejects_wrong_type() {
        let header = FileHeader::new(FileType::Raw);
        let encoded = header.encode();
        assert!(matches!(
            FileHeader::decode(&encoded, FileType::Index),
            Err(ChunkManagerError::TypeMismatch)
        ));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut encoded = FileHeader::new(FileType::Raw).encode();
        encoded[0] = 0x00;
        assert!(matches!(
            FileHeader::decode(&encoded, FileType::Raw),
            Err(ChunkManagerError::SignatureMismatch)
        ));
    }

    #[test]
    fn flags_roundtrip_through_offset() {
        let mut encoded = FileHeader::new(FileType::Index).encode();
        encoded[FLAGS_OFFSET as usize] |= FLAG_SEALED;
        let decoded = FileHeader::decode(&encoded, FileType::Index).unwrap();
        assert!(decoded.sealed());
        assert!(!decoded.compressed());
    }
}
