//! Read-only random-access cursor over a sealed chunk, via memory mapping.
//!
//! Grounded on `fixed_index.rs`'s `FixedIndexReader`: a raw `mmap(2)` call stashed as a bare
//! pointer + length behind `unsafe impl Send + Sync`, with slice access recovered through a
//! `&self`-borrowed accessor rather than a stored `&'a [u8]` field (avoids a self-referential
//! struct). Three files are mapped here instead of `fixed_index.rs`'s one, and the raw/attr
//! mappings may additionally be seekable-zstd compressed, in which case a read decompresses the
//! covering frame(s) into an owned buffer instead of slicing the mapping directly.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::attrs;
use crate::chunk::{ATTR_FILE, DICT_FILE, IDX_FILE, RAW_FILE};
use crate::chunk_id::ChunkId;
use crate::compression::SeekTable;
use crate::cursor::Cursor;
use crate::dictionary::Dictionary;
use crate::error::ChunkManagerError;
use crate::file_header::{FileHeader, FileType, HEADER_SIZE};
use crate::record::{Attrs, IndexEntry, Record, RecordRef, INDEX_ENTRY_SIZE};

const IDX_HEADER_SIZE: usize = HEADER_SIZE + 8;

/// A single read-only `mmap(2)` mapping of a whole file, including its header.
struct MmapRegion {
    ptr: *mut u8,
    len: usize,
    _file: File,
}

// The mapping is read-only and the file handle that backs it is kept alive for as long as the
// region is, so sharing `&MmapRegion` across threads is sound.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("unable to open {path:?}"))?;
        let len = file.metadata()?.len() as usize;

        // `mmap` rejects a zero-length mapping; every chunklog file has at least a header, so this
        // only matters for pathologically truncated files, which header validation catches first.
        let map_len = len.max(HEADER_SIZE);
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(map_len).unwrap(),
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        }
        .with_context(|| format!("mmap failed for {path:?}"))? as *mut u8;

        Ok(Self {
            ptr,
            len,
            _file: file,
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr as *mut std::ffi::c_void, self.len.max(HEADER_SIZE)) } {
            log::error!("component=chunk-manager failed to unmap chunk file - {err}");
        }
    }
}

/// Bytes for one record's payload or attribute blob: either borrowed straight out of an
/// uncompressed mapping, or owned because they came out of zstd decompression.
pub enum RecordBytes<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl<'a> RecordBytes<'a> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            RecordBytes::Borrowed(s) => s,
            RecordBytes::Owned(v) => v,
        }
    }

    pub fn into_owned(self) -> Vec<u8> {
        match self {
            RecordBytes::Borrowed(s) => s.to_vec(),
            RecordBytes::Owned(v) => v,
        }
    }
}

/// A record read from the mmap cursor, whose raw payload may still alias the mapping.
///
/// Attribute values are always owned (decoding already copies them into `String`s), but the raw
/// payload - typically the dominant share of a record's bytes - is only copied on demand via
/// [`BorrowedRecord::build_record_copy`].
pub struct BorrowedRecord<'a> {
    pub source_ts: i64,
    pub ingest_ts: i64,
    pub write_ts: i64,
    pub attrs: Attrs,
    pub raw: RecordBytes<'a>,
}

impl<'a> BorrowedRecord<'a> {
    pub fn build_record_copy(&self) -> Record {
        Record {
            source_ts: self.source_ts,
            ingest_ts: self.ingest_ts,
            write_ts: self.write_ts,
            attrs: self.attrs.clone(),
            raw: self.raw.as_slice().to_vec(),
        }
    }

    fn into_owned_record(self) -> Record {
        Record {
            source_ts: self.source_ts,
            ingest_ts: self.ingest_ts,
            write_ts: self.write_ts,
            attrs: self.attrs,
            raw: self.raw.into_owned(),
        }
    }
}

/// Memory-mapped cursor over a single sealed chunk.
pub struct MmapCursor {
    chunk_id: ChunkId,
    raw: MmapRegion,
    attr: MmapRegion,
    idx: MmapRegion,
    raw_header: FileHeader,
    attr_header: FileHeader,
    dict: Dictionary,
    record_count: u64,
    pos: u64,
}

impl MmapCursor {
    pub fn open(dir: &Path, chunk_id: ChunkId) -> Result<Self> {
        let raw = MmapRegion::open(&dir.join(RAW_FILE))?;
        let attr = MmapRegion::open(&dir.join(ATTR_FILE))?;
        let idx = MmapRegion::open(&dir.join(IDX_FILE))?;

        let raw_header = decode_header(raw.as_slice(), FileType::Raw)?;
        let attr_header = decode_header(attr.as_slice(), FileType::Attr)?;
        decode_header(idx.as_slice(), FileType::Index)?;

        let dict_data = std::fs::read(dir.join(DICT_FILE))
            .with_context(|| format!("unable to read {:?}", dir.join(DICT_FILE)))?;
        let dict = Dictionary::decode_all(&dict_data[HEADER_SIZE..])?;

        let idx_data = idx.as_slice();
        let data_len = idx_data.len().saturating_sub(IDX_HEADER_SIZE);
        let record_count = (data_len / INDEX_ENTRY_SIZE) as u64;

        Ok(Self {
            chunk_id,
            raw,
            attr,
            idx,
            raw_header,
            attr_header,
            dict,
            record_count,
            pos: 0,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    fn entry(&self, pos: u64) -> IndexEntry {
        let offset = IDX_HEADER_SIZE + pos as usize * INDEX_ENTRY_SIZE;
        let buf: [u8; INDEX_ENTRY_SIZE] = self.idx.as_slice()[offset..offset + INDEX_ENTRY_SIZE]
            .try_into()
            .unwrap();
        IndexEntry::decode(&buf)
    }

    fn raw_bytes(&self, entry: &IndexEntry) -> Result<RecordBytes<'_>> {
        let range = entry.raw_range();
        let data = &self.raw.as_slice()[HEADER_SIZE..];
        if self.raw_header.compressed() {
            let uncompressed_len = self.uncompressed_raw_len();
            let table = SeekTable::parse(data, uncompressed_len)?;
            let bytes = table.read_at(range.start as u64, (range.end - range.start) as u64)?;
            Ok(RecordBytes::Owned(bytes))
        } else {
            Ok(RecordBytes::Borrowed(&data[range]))
        }
    }

    fn attr_bytes(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let range = entry.attr_range();
        let data = &self.attr.as_slice()[HEADER_SIZE..];
        if self.attr_header.compressed() {
            let uncompressed_len = self.uncompressed_attr_len();
            let table = SeekTable::parse(data, uncompressed_len)?;
            table.read_at(range.start as u64, (range.end - range.start) as u64)
        } else {
            Ok(data[range].to_vec())
        }
    }

    fn uncompressed_raw_len(&self) -> u64 {
        if self.record_count == 0 {
            return 0;
        }
        self.entry(self.record_count - 1).raw_range().end as u64
    }

    fn uncompressed_attr_len(&self) -> u64 {
        if self.record_count == 0 {
            return 0;
        }
        self.entry(self.record_count - 1).attr_range().end as u64
    }

    fn build(&self, pos: u64) -> Result<BorrowedRecord<'_>> {
        let entry = self.entry(pos);
        let raw = self.raw_bytes(&entry)?;
        let attr_blob = self.attr_bytes(&entry)?;
        let attrs = attrs::decode(&attr_blob, &self.dict)?;
        Ok(BorrowedRecord {
            source_ts: entry.source_ts,
            ingest_ts: entry.ingest_ts,
            write_ts: entry.write_ts,
            attrs,
            raw,
        })
    }

    fn record_ref(&self, pos: u64) -> RecordRef {
        RecordRef {
            chunk_id: self.chunk_id,
            pos,
        }
    }

    /// Zero-copy variant of [`Cursor::next`]: the returned record's raw payload may alias the
    /// mapping and is only valid until the next call that touches `self`.
    pub fn next_borrowed(&mut self) -> Result<Option<(BorrowedRecord<'_>, RecordRef)>> {
        if self.pos >= self.record_count {
            return Ok(None);
        }
        let pos = self.pos;
        let record = self.build(pos)?;
        self.pos += 1;
        Ok(Some((record, self.record_ref(pos))))
    }

    /// Zero-copy variant of [`Cursor::prev`].
    pub fn prev_borrowed(&mut self) -> Result<Option<(BorrowedRecord<'_>, RecordRef)>> {
        if self.pos == 0 {
            return Ok(None);
        }
        self.pos -= 1;
        let record = self.build(self.pos)?;
        Ok(Some((record, self.record_ref(self.pos))))
    }
}

fn decode_header(mapped: &[u8], expected: FileType) -> Result<FileHeader> {
    if mapped.len() < HEADER_SIZE {
        bail!("{}", ChunkManagerError::InvalidEntry("file shorter than header".into()));
    }
    let buf: [u8; HEADER_SIZE] = mapped[..HEADER_SIZE].try_into().unwrap();
    FileHeader::decode(&buf, expected).map_err(|e| anyhow::anyhow!(e))
}

impl Cursor for MmapCursor {
    fn len(&self) -> u64 {
        self.record_count
    }

    fn next(&mut self) -> Result<Option<(Record, RecordRef)>, ChunkManagerError> {
        self.next_borrowed()
            .map(|opt| opt.map(|(r, rr)| (r.into_owned_record(), rr)))
            .map_err(crate::error::from_anyhow)
    }

    fn prev(&mut self) -> Result<Option<(Record, RecordRef)>, ChunkManagerError> {
        self.prev_borrowed()
            .map(|opt| opt.map(|(r, rr)| (r.into_owned_record(), rr)))
            .map_err(crate::error::from_anyhow)
    }

    fn seek(&mut self, pos: u64) -> Result<(), ChunkManagerError> {
        if pos > self.record_count {
            return Err(ChunkManagerError::InvalidEntry(format!(
                "position {pos} past record count {}",
                self.record_count
            )));
        }
        self.pos = pos;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ActiveChunk;
    use crate::record::Record;

    fn seal_with_records(raws: &[&[u8]]) -> (tempfile::TempDir, ChunkId) {
        let tmp = tempfile::tempdir().unwrap();
        let mut chunk = ActiveChunk::create(tmp.path()).unwrap();
        let id = chunk.id;
        for (i, raw) in raws.iter().enumerate() {
            let record = Record {
                ingest_ts: 1,
                attrs: vec![("src".to_owned(), "test".to_owned())],
                raw: raw.to_vec(),
                ..Default::default()
            };
            chunk.append(record, 1000 + i as i64).unwrap();
        }
        chunk.seal().unwrap();
        (tmp, id)
    }

    #[test]
    fn forward_iteration_yields_all_records_then_none() {
        let (tmp, id) = seal_with_records(&[b"alpha"]);
        let dir = crate::chunk::chunk_dir(tmp.path(), id);
        let mut cursor = MmapCursor::open(&dir, id).unwrap();

        let (record, rref) = cursor.next().unwrap().unwrap();
        assert_eq!(record.raw, b"alpha");
        assert_eq!(record.attrs, vec![("src".to_owned(), "test".to_owned())]);
        assert_eq!(rref.pos, 0);

        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn reverse_iteration_yields_records_in_reverse() {
        let (tmp, id) = seal_with_records(&[b"first", b"second", b"third"]);
        let dir = crate::chunk::chunk_dir(tmp.path(), id);
        let mut cursor = MmapCursor::open(&dir, id).unwrap();
        cursor.seek(cursor.len()).unwrap();

        let mut seen = Vec::new();
        while let Some((record, _)) = cursor.prev().unwrap() {
            seen.push(record.raw);
        }
        assert_eq!(seen, vec![b"third".to_vec(), b"second".to_vec(), b"first".to_vec()]);
        assert!(cursor.prev().unwrap().is_none());
    }

    #[test]
    fn seek_then_next_and_prev_agree_with_pos() {
        let (tmp, id) = seal_with_records(&[b"a", b"b", b"c"]);
        let dir = crate::chunk::chunk_dir(tmp.path(), id);
        let mut cursor = MmapCursor::open(&dir, id).unwrap();

        cursor.seek(1).unwrap();
        let (record, rref) = cursor.next().unwrap().unwrap();
        assert_eq!(record.raw, b"b");
        assert_eq!(rref.pos, 1);

        cursor.seek(1).unwrap();
        let (record, rref) = cursor.prev().unwrap().unwrap();
        assert_eq!(record.raw, b"a");
        assert_eq!(rref.pos, 0);
    }

    #[test]
    fn empty_chunk_is_immediately_exhausted() {
        let (tmp, id) = seal_with_records(&[]);
        let dir = crate::chunk::chunk_dir(tmp.path(), id);
        let mut cursor = MmapCursor::open(&dir, id).unwrap();
        assert!(cursor.next().unwrap().is_none());
        assert!(cursor.prev().unwrap().is_none());
    }

    #[test]
    fn seek_past_record_count_is_rejected() {
        let (tmp, id) = seal_with_records(&[b"a"]);
        let dir = crate::chunk::chunk_dir(tmp.path(), id);
        let mut cursor = MmapCursor::open(&dir, id).unwrap();
        assert!(matches!(cursor.seek(2), Err(ChunkManagerError::InvalidEntry(_))));
    }
}
