//! Read cursor over the active chunk: plain file descriptors plus `pread`, since the
//! three files may still be growing underneath concurrent appends.
//!
//! Grounded on `data_blob_reader.rs`'s preference for positional reads over a shared seek head,
//! generalized from "read this blob once, start to end" to "re-stat the index on every `Next` so
//! newly appended entries become visible, then `pread` exactly the bytes this record needs".
//! Always returns owned copies, the safe alternative to mmap aliasing.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{Context, Result};

use crate::attrs;
use crate::chunk::{ATTR_FILE, DICT_FILE, IDX_FILE, RAW_FILE};
use crate::chunk_id::ChunkId;
use crate::cursor::Cursor;
use crate::dictionary::Dictionary;
use crate::error::ChunkManagerError;
use crate::file_header::{FileType, HEADER_SIZE};
use crate::record::{IndexEntry, Record, RecordRef, INDEX_ENTRY_SIZE};

const IDX_HEADER_SIZE: usize = HEADER_SIZE + 8;

pub struct StreamingCursor {
    chunk_id: ChunkId,
    raw_file: File,
    attr_file: File,
    idx_file: File,
    dict_file: File,
    dict: Dictionary,
    pos: u64,
}

impl StreamingCursor {
    pub fn open(dir: &Path, chunk_id: ChunkId) -> Result<Self> {
        let raw_file = File::open(dir.join(RAW_FILE))?;
        let attr_file = File::open(dir.join(ATTR_FILE))?;
        let idx_file = File::open(dir.join(IDX_FILE))?;
        let dict_file = File::open(dir.join(DICT_FILE))?;

        check_header(&raw_file, FileType::Raw)?;
        check_header(&attr_file, FileType::Attr)?;
        check_header(&idx_file, FileType::Index)?;
        check_header(&dict_file, FileType::Dict)?;

        let dict = load_dict(&dict_file)?;

        Ok(Self {
            chunk_id,
            raw_file,
            attr_file,
            idx_file,
            dict_file,
            dict,
            pos: 0,
        })
    }

    fn record_count(&self) -> Result<u64> {
        let len = self.idx_file.metadata()?.len();
        Ok(len.saturating_sub(IDX_HEADER_SIZE as u64) / INDEX_ENTRY_SIZE as u64)
    }

    fn read_entry(&self, pos: u64) -> Result<IndexEntry> {
        let offset = IDX_HEADER_SIZE as u64 + pos * INDEX_ENTRY_SIZE as u64;
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        self.idx_file.read_exact_at(&mut buf, offset)?;
        Ok(IndexEntry::decode(&buf))
    }

    fn read_raw(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; entry.raw_size as usize];
        self.raw_file
            .read_exact_at(&mut buf, HEADER_SIZE as u64 + entry.raw_offset as u64)?;
        Ok(buf)
    }

    fn read_attr_blob(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; entry.attr_size as usize];
        self.attr_file
            .read_exact_at(&mut buf, HEADER_SIZE as u64 + entry.attr_offset as u64)?;
        Ok(buf)
    }

    /// Decode the attribute blob, transparently reloading the dictionary once if it references a
    /// key id assigned after this cursor was opened (the dictionary grows monotonically alongside
    /// the active chunk).
    fn decode_attrs(&mut self, blob: &[u8]) -> Result<crate::record::Attrs> {
        match attrs::decode(blob, &self.dict) {
            Ok(attrs) => Ok(attrs),
            Err(_) => {
                self.dict = load_dict(&self.dict_file)?;
                attrs::decode(blob, &self.dict)
            }
        }
    }

    fn build(&mut self, pos: u64) -> Result<Record> {
        let entry = self.read_entry(pos)?;
        let raw = self.read_raw(&entry)?;
        let attr_blob = self.read_attr_blob(&entry)?;
        let attrs = self.decode_attrs(&attr_blob)?;
        Ok(Record {
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
}

fn check_header(file: &File, expected: FileType) -> Result<()> {
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut buf, 0)?;
    crate::file_header::FileHeader::decode(&buf, expected).map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn load_dict(dict_file: &File) -> Result<Dictionary> {
    let len = dict_file.metadata()?.len();
    let data_len = len.saturating_sub(HEADER_SIZE as u64) as usize;
    let mut buf = vec![0u8; data_len];
    dict_file.read_exact_at(&mut buf, HEADER_SIZE as u64)?;
    Dictionary::decode_all(&buf).with_context(|| "unable to decode attribute dictionary")
}

impl Cursor for StreamingCursor {
    fn len(&self) -> u64 {
        self.record_count().unwrap_or(0)
    }

    fn next(&mut self) -> Result<Option<(Record, RecordRef)>, ChunkManagerError> {
        (|| -> Result<Option<(Record, RecordRef)>> {
            let count = self.record_count()?;
            if self.pos >= count {
                return Ok(None);
            }
            let pos = self.pos;
            let record = self.build(pos)?;
            self.pos += 1;
            Ok(Some((record, self.record_ref(pos))))
        })()
        .map_err(crate::error::from_anyhow)
    }

    fn prev(&mut self) -> Result<Option<(Record, RecordRef)>, ChunkManagerError> {
        (|| -> Result<Option<(Record, RecordRef)>> {
            if self.pos == 0 {
                return Ok(None);
            }
            self.pos -= 1;
            let record = self.build(self.pos)?;
            Ok(Some((record, self.record_ref(self.pos))))
        })()
        .map_err(crate::error::from_anyhow)
    }

    fn seek(&mut self, pos: u64) -> Result<(), ChunkManagerError> {
        let count = self.record_count().map_err(crate::error::from_anyhow)?;
        if pos > count {
            return Err(ChunkManagerError::InvalidEntry(format!(
                "position {pos} past record count {count}"
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
    use crate::record::Record as ChunkRecord;

    #[test]
    fn sees_records_appended_after_cursor_open() {
        let tmp = tempfile::tempdir().unwrap();
        let mut chunk = ActiveChunk::create(tmp.path()).unwrap();
        let id = chunk.id;
        let dir = crate::chunk::chunk_dir(tmp.path(), id);

        chunk
            .append(
                ChunkRecord {
                    ingest_ts: 1,
                    raw: b"first".to_vec(),
                    ..Default::default()
                },
                1,
            )
            .unwrap();

        let mut cursor = StreamingCursor::open(&dir, id).unwrap();
        let (record, _) = cursor.next().unwrap().unwrap();
        assert_eq!(record.raw, b"first");
        assert!(cursor.next().unwrap().is_none());

        chunk
            .append(
                ChunkRecord {
                    ingest_ts: 2,
                    attrs: vec![("k".to_owned(), "v".to_owned())],
                    raw: b"second".to_vec(),
                    ..Default::default()
                },
                2,
            )
            .unwrap();

        let (record, rref) = cursor.next().unwrap().unwrap();
        assert_eq!(record.raw, b"second");
        assert_eq!(record.attrs, vec![("k".to_owned(), "v".to_owned())]);
        assert_eq!(rref.pos, 1);
        assert!(cursor.next().unwrap().is_none());
    }
}
