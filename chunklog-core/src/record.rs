//! The 38-byte index entry, and the in-memory [`Record`] callers append.
//!
//! `Encode`/`Decode` are pure and infallible on well-formed input, mirroring the `FixedIndexHeader`
//! encode/decode style in `fixed_index.rs` (fixed-size `#[repr(C)]`-shaped records addressed by
//! byte offset) but kept as plain little-endian byte slicing rather than `#[repr(C)]` plus
//! `static_assert_size!`, since index entries are read one-at-a-time out of an mmap rather than
//! cast wholesale - a hand-rolled codec keeps that unsafe surface to a single `decode`/`encode`
//! pair instead of spreading `#[repr(C)]` assumptions across the cursor code.

pub const INDEX_ENTRY_SIZE: usize = 38;

/// One ordered key/value pair of attributes. Encoded/decoded via [`crate::attrs`].
pub type Attrs = Vec<(String, String)>;

/// A single append-worthy log record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    /// Nanosecond wall clock at the source; `0` means unknown.
    pub source_ts: i64,
    /// Nanosecond wall clock at ingest; required.
    pub ingest_ts: i64,
    /// Nanosecond wall clock assigned by the manager at append time (or preserved by
    /// `append_preserved`).
    pub write_ts: i64,
    pub attrs: Attrs,
    pub raw: Vec<u8>,
}

/// The fixed 38-byte entry stored in `idx.log`, one per record, in append order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub source_ts: i64,
    pub ingest_ts: i64,
    pub write_ts: i64,
    pub raw_offset: u32,
    pub raw_size: u32,
    pub attr_offset: u32,
    pub attr_size: u16,
}

impl IndexEntry {
    pub fn encode(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.source_ts.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ingest_ts.to_le_bytes());
        buf[16..24].copy_from_slice(&self.write_ts.to_le_bytes());
        buf[24..28].copy_from_slice(&self.raw_offset.to_le_bytes());
        buf[28..32].copy_from_slice(&self.raw_size.to_le_bytes());
        buf[32..36].copy_from_slice(&self.attr_offset.to_le_bytes());
        buf[36..38].copy_from_slice(&self.attr_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; INDEX_ENTRY_SIZE]) -> Self {
        Self {
            source_ts: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            ingest_ts: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            write_ts: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            raw_offset: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            raw_size: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            attr_offset: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            attr_size: u16::from_le_bytes(buf[36..38].try_into().unwrap()),
        }
    }

    /// Byte range of this entry's raw payload within the raw data section.
    pub fn raw_range(&self) -> std::ops::Range<usize> {
        self.raw_offset as usize..(self.raw_offset as usize + self.raw_size as usize)
    }

    /// Byte range of this entry's attribute blob within the attr data section.
    pub fn attr_range(&self) -> std::ops::Range<usize> {
        self.attr_offset as usize..(self.attr_offset as usize + self.attr_size as usize)
    }
}

/// A location within a chunk: a 0-based record index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordRef {
    pub chunk_id: crate::chunk_id::ChunkId,
    pub pos: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn round_trip_is_lossless(
            source_ts in any::<i64>(),
            ingest_ts in any::<i64>(),
            write_ts in any::<i64>(),
            raw_offset in any::<u32>(),
            raw_size in any::<u32>(),
            attr_offset in any::<u32>(),
            attr_size in any::<u16>(),
        ) {
            let entry = IndexEntry {
                source_ts,
                ingest_ts,
                write_ts,
                raw_offset,
                raw_size,
                attr_offset,
                attr_size,
            };
            prop_assert_eq!(IndexEntry::decode(&entry.encode()), entry);
        }
    }

    #[test]
    fn round_trips() {
        let entry = IndexEntry {
            source_ts: -1,
            ingest_ts: 1_700_000_000_000_000_000,
            write_ts: 1_700_000_000_000_000_001,
            raw_offset: 12,
            raw_size: 34,
            attr_offset: 56,
            attr_size: 78,
        };
        let encoded = entry.encode();
        assert_eq!(IndexEntry::decode(&encoded), entry);
    }

    #[test]
    fn negative_source_ts_round_trips() {
        let entry = IndexEntry {
            source_ts: i64::MIN,
            ..Default::default()
        };
        assert_eq!(IndexEntry::decode(&entry.encode()), entry);
    }

    #[test]
    fn ranges_match_offsets() {
        let entry = IndexEntry {
            raw_offset: 10,
            raw_size: 5,
            attr_offset: 20,
            attr_size: 3,
            ..Default::default()
        };
        assert_eq!(entry.raw_range(), 10..15);
        assert_eq!(entry.attr_range(), 20..23);
    }
}
