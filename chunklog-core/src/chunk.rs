//! A single chunk's four on-disk files, and the append/seal algorithms.
//!
//! Grounded on `fixed_index.rs`'s `FixedIndexWriter` (create tmp/real file, mmap-free here since
//! appends are sequential, header stamped up front) and `chunk_store.rs`'s directory-per-unit
//! layout, generalized from "one index file" to the raw/index/attr/dict quartet this format needs.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};

use crate::attrs;
use crate::chunk_id::ChunkId;
use crate::dictionary::Dictionary;
use crate::error::ChunkManagerError;
use crate::file_header::{FileHeader, FileType, FLAGS_OFFSET, FLAG_SEALED, HEADER_SIZE};
use crate::record::{IndexEntry, Record, INDEX_ENTRY_SIZE};
use crate::rotation::ActiveChunkState;

pub const RAW_FILE: &str = "raw.log";
pub const IDX_FILE: &str = "idx.log";
pub const ATTR_FILE: &str = "attr.log";
pub const DICT_FILE: &str = "attr_dict.log";

/// Index file header: 4-byte file header + 8-byte `createdAt` timestamp.
pub const IDX_HEADER_SIZE: usize = HEADER_SIZE + 8;

/// In-memory metadata derived from a chunk's index file; never persisted separately.
#[derive(Clone, Debug)]
pub struct ChunkMeta {
    pub id: ChunkId,
    pub sealed: bool,
    pub compressed: bool,
    pub record_count: u64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub ingest_start: i64,
    pub ingest_end: i64,
    pub source_start: Option<i64>,
    pub source_end: Option<i64>,
    pub logical_data_bytes: u64,
    pub bytes: u64,
    pub disk_bytes: u64,
}

pub fn chunk_dir(store_dir: &Path, id: ChunkId) -> PathBuf {
    store_dir.join(id.dir_name())
}

fn write_full(file: &mut File, buf: &[u8]) -> Result<()> {
    let written = file.write(buf)?;
    if written != buf.len() {
        bail!(
            "{}",
            ChunkManagerError::ShortWrite {
                written,
                expected: buf.len(),
            }
        );
    }
    Ok(())
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as i64
}

/// The single unsealed chunk a manager appends to.
pub struct ActiveChunk {
    pub id: ChunkId,
    dir: PathBuf,
    raw_file: File,
    idx_file: File,
    attr_file: File,
    dict_file: File,
    dict: Dictionary,

    raw_offset: u64,
    attr_offset: u64,
    record_count: u64,

    start_ts: i64,
    end_ts: i64,
    ingest_start: i64,
    ingest_end: i64,
    source_start: Option<i64>,
    source_end: Option<i64>,

    created_at: SystemTime,
}

impl ActiveChunk {
    /// `openLocked`: mint a fresh chunk id, create its directory and four files, stamp headers.
    pub fn create(store_dir: &Path) -> Result<Self> {
        let id = ChunkId::generate();
        let dir = chunk_dir(store_dir, id);
        std::fs::create_dir(&dir).with_context(|| format!("unable to create chunk dir {dir:?}"))?;

        let mut raw_file = create_file(&dir.join(RAW_FILE))?;
        let mut idx_file = create_file(&dir.join(IDX_FILE))?;
        let mut attr_file = create_file(&dir.join(ATTR_FILE))?;
        let mut dict_file = create_file(&dir.join(DICT_FILE))?;

        write_full(&mut raw_file, &FileHeader::new(FileType::Raw).encode())?;
        write_full(&mut attr_file, &FileHeader::new(FileType::Attr).encode())?;
        write_full(&mut dict_file, &FileHeader::new(FileType::Dict).encode())?;

        let created_at_ns = now_ns();
        let mut idx_header = FileHeader::new(FileType::Index).encode().to_vec();
        idx_header.extend_from_slice(&created_at_ns.to_le_bytes());
        write_full(&mut idx_file, &idx_header)?;

        raw_file.sync_all()?;
        idx_file.sync_all()?;
        attr_file.sync_all()?;
        dict_file.sync_all()?;

        Ok(Self {
            id,
            dir,
            raw_file,
            idx_file,
            attr_file,
            dict_file,
            dict: Dictionary::new(),
            raw_offset: 0,
            attr_offset: 0,
            record_count: 0,
            start_ts: 0,
            end_ts: 0,
            ingest_start: 0,
            ingest_end: 0,
            source_start: None,
            source_end: None,
            created_at: SystemTime::now(),
        })
    }

    /// Reopen an existing chunk directory as the active chunk (open-time recovery step 4/5):
    /// validate headers, recover the in-memory offsets/bounds from the index file's entries
    /// (truncating torn raw/attr writes first), and rebuild the dictionary by linear scan.
    pub fn open_existing(dir: PathBuf, id: ChunkId) -> Result<Self> {
        let mut raw_file = open_rw(&dir.join(RAW_FILE))?;
        let mut idx_file = open_rw(&dir.join(IDX_FILE))?;
        let mut attr_file = open_rw(&dir.join(ATTR_FILE))?;
        let mut dict_file = open_rw(&dir.join(DICT_FILE))?;

        check_header(&mut raw_file, FileType::Raw)?;
        check_header(&mut idx_file, FileType::Index)?;
        check_header(&mut attr_file, FileType::Attr)?;
        check_header(&mut dict_file, FileType::Dict)?;

        let created_at_ns = read_index_created_at(&mut idx_file)?;
        let created_at = UNIX_EPOCH + Duration::from_nanos(created_at_ns.max(0) as u64);

        let last_entry = read_last_index_entry(&mut idx_file)?;
        let (expected_raw, expected_attr) = match last_entry {
            Some(entry) => (entry.raw_range().end as u64, entry.attr_range().end as u64),
            None => (0, 0),
        };

        let raw_len = raw_file.metadata()?.len() - HEADER_SIZE as u64;
        if raw_len > expected_raw {
            raw_file.set_len(HEADER_SIZE as u64 + expected_raw)?;
        }
        let attr_len = attr_file.metadata()?.len() - HEADER_SIZE as u64;
        if attr_len > expected_attr {
            attr_file.set_len(HEADER_SIZE as u64 + expected_attr)?;
        }

        let mut dict_data = Vec::new();
        dict_file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        dict_file.read_to_end(&mut dict_data)?;
        let dict = Dictionary::decode_all(&dict_data)?;

        let record_count = index_record_count(&idx_file)?;
        let first_entry = read_first_index_entry(&mut idx_file)?;

        let (start_ts, ingest_start, source_start) = first_entry
            .map(|e| (e.write_ts, e.ingest_ts, (e.source_ts != 0).then_some(e.source_ts)))
            .unwrap_or((0, 0, None));
        let (end_ts, ingest_end, source_end) = last_entry
            .map(|e| (e.write_ts, e.ingest_ts, (e.source_ts != 0).then_some(e.source_ts)))
            .unwrap_or((0, 0, None));

        for f in [&mut raw_file, &mut idx_file, &mut attr_file, &mut dict_file] {
            f.seek(SeekFrom::End(0))?;
        }

        Ok(Self {
            id,
            dir,
            raw_file,
            idx_file,
            attr_file,
            dict_file,
            dict,
            raw_offset: expected_raw,
            attr_offset: expected_attr,
            record_count,
            start_ts,
            end_ts,
            ingest_start,
            ingest_end,
            source_start,
            source_end,
            created_at,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_snapshot(&self) -> ActiveChunkState {
        ActiveChunkState {
            chunk_id: self.id,
            start_ts: self.start_ts,
            last_write_ts: self.end_ts,
            created_at: self.created_at,
            bytes: self.bytes(),
            records: self.record_count,
        }
    }

    fn bytes(&self) -> u64 {
        self.raw_offset + self.attr_offset + self.record_count * INDEX_ENTRY_SIZE as u64
    }

    pub fn projected_sizes(&self, encoded_attr_len: usize, raw_len: usize) -> (u64, u64, u64, u64) {
        (self.raw_offset, raw_len as u64, self.attr_offset, encoded_attr_len as u64)
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn end_ts(&self) -> i64 {
        self.end_ts
    }

    /// Force the index file's durability past the write() call already made for this record; used
    /// when the manager is configured for `FsyncLevel::Always`.
    pub fn sync_idx(&self) -> Result<()> {
        self.idx_file.sync_all()?;
        Ok(())
    }

    /// Append algorithm step 2/4/5/6 (rotation check and WriteTS assignment happen in
    /// `manager.rs`, which calls this once the decision has been made).
    pub fn append(&mut self, mut record: Record, write_ts: i64) -> Result<u64> {
        record.write_ts = write_ts;

        let (attr_blob, new_keys) = attrs::encode(&record.attrs, &mut self.dict)
            .map_err(|e| anyhow::anyhow!(e))?;

        for key in &new_keys {
            let entry = Dictionary::encode_entry(key);
            write_full(&mut self.dict_file, &entry)?;
        }
        if !new_keys.is_empty() {
            self.dict_file.sync_all()?;
        }

        write_full(&mut self.raw_file, &record.raw)?;
        write_full(&mut self.attr_file, &attr_blob)?;

        let entry = IndexEntry {
            source_ts: record.source_ts,
            ingest_ts: record.ingest_ts,
            write_ts,
            raw_offset: self
                .raw_offset
                .try_into()
                .context("raw offset exceeds u32 range")?,
            raw_size: record
                .raw
                .len()
                .try_into()
                .context("raw size exceeds u32 range")?,
            attr_offset: self
                .attr_offset
                .try_into()
                .context("attr offset exceeds u32 range")?,
            attr_size: attr_blob
                .len()
                .try_into()
                .context("attr size exceeds u16 range")?,
        };
        write_full(&mut self.idx_file, &entry.encode())?;

        self.raw_offset += record.raw.len() as u64;
        self.attr_offset += attr_blob.len() as u64;

        let pos = self.record_count;
        self.record_count += 1;

        if self.record_count == 1 {
            self.start_ts = write_ts;
            self.ingest_start = record.ingest_ts;
            self.ingest_end = record.ingest_ts;
            if record.source_ts != 0 {
                self.source_start = Some(record.source_ts);
                self.source_end = Some(record.source_ts);
            }
        } else {
            self.ingest_start = self.ingest_start.min(record.ingest_ts);
            self.ingest_end = self.ingest_end.max(record.ingest_ts);
            if record.source_ts != 0 {
                self.source_start = Some(self.source_start.map_or(record.source_ts, |v| v.min(record.source_ts)));
                self.source_end = Some(self.source_end.map_or(record.source_ts, |v| v.max(record.source_ts)));
            }
        }
        self.end_ts = write_ts;

        Ok(pos)
    }

    /// Seal algorithm: OR the Sealed flag into each header, fsync, close.
    pub fn seal(mut self) -> Result<ChunkMeta> {
        for file in [&mut self.raw_file, &mut self.idx_file, &mut self.attr_file, &mut self.dict_file] {
            seal_file(file)?;
        }

        let disk_bytes = directory_disk_bytes(&self.dir)?;
        let dict_bytes = dict_data_len(&self.dict_file)?;
        let logical_data_bytes =
            self.raw_offset + self.attr_offset + self.record_count * INDEX_ENTRY_SIZE as u64;

        Ok(ChunkMeta {
            id: self.id,
            sealed: true,
            compressed: false,
            record_count: self.record_count,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            ingest_start: self.ingest_start,
            ingest_end: self.ingest_end,
            source_start: self.source_start,
            source_end: self.source_end,
            logical_data_bytes,
            bytes: logical_data_bytes + dict_bytes,
            disk_bytes,
        })
    }

    pub fn meta_snapshot(&self) -> ChunkMeta {
        let logical_data_bytes = self.bytes();
        let dict_bytes = dict_data_len(&self.dict_file).unwrap_or(0);
        ChunkMeta {
            id: self.id,
            sealed: false,
            compressed: false,
            record_count: self.record_count,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            ingest_start: self.ingest_start,
            ingest_end: self.ingest_end,
            source_start: self.source_start,
            source_end: self.source_end,
            logical_data_bytes,
            bytes: logical_data_bytes + dict_bytes,
            disk_bytes: 0,
        }
    }

    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

}

fn create_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("unable to create {path:?}"))
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("unable to open {path:?}"))
}

fn check_header(file: &mut File, expected: FileType) -> Result<FileHeader> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut buf)?;
    FileHeader::decode(&buf, expected).map_err(|e| anyhow::anyhow!(e))
}

fn seal_file(file: &mut File) -> Result<()> {
    let mut flags = [0u8; 1];
    file.seek(SeekFrom::Start(FLAGS_OFFSET))?;
    file.read_exact(&mut flags)?;
    flags[0] |= FLAG_SEALED;
    file.seek(SeekFrom::Start(FLAGS_OFFSET))?;
    file.write_all(&flags)?;
    file.sync_all()?;
    Ok(())
}

fn dict_data_len(dict_file: &File) -> Result<u64> {
    Ok(dict_file.metadata()?.len().saturating_sub(HEADER_SIZE as u64))
}

fn directory_disk_bytes(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        total += entry.metadata()?.len();
    }
    Ok(total)
}

/// Read the index file's 8-byte `createdAt` timestamp (immediately after the 4-byte header).
pub fn read_index_created_at(idx_file: &mut File) -> Result<i64> {
    let mut buf = [0u8; 8];
    idx_file.read_exact_at(&mut buf, HEADER_SIZE as u64)?;
    Ok(i64::from_le_bytes(buf))
}

/// Read the last 38-byte index entry, if the index has any records past its 12-byte header.
pub fn read_last_index_entry(idx_file: &mut File) -> Result<Option<IndexEntry>> {
    let len = idx_file.metadata()?.len();
    let data_len = len.saturating_sub(IDX_HEADER_SIZE as u64);
    let count = data_len / INDEX_ENTRY_SIZE as u64;
    if count == 0 {
        return Ok(None);
    }
    let offset = IDX_HEADER_SIZE as u64 + (count - 1) * INDEX_ENTRY_SIZE as u64;
    let mut buf = [0u8; INDEX_ENTRY_SIZE];
    idx_file.read_exact_at(&mut buf, offset)?;
    Ok(Some(IndexEntry::decode(&buf)))
}

/// Read the first 38-byte index entry, if any.
pub fn read_first_index_entry(idx_file: &mut File) -> Result<Option<IndexEntry>> {
    let len = idx_file.metadata()?.len();
    if len < (IDX_HEADER_SIZE + INDEX_ENTRY_SIZE) as u64 {
        return Ok(None);
    }
    let mut buf = [0u8; INDEX_ENTRY_SIZE];
    idx_file.read_exact_at(&mut buf, IDX_HEADER_SIZE as u64)?;
    Ok(Some(IndexEntry::decode(&buf)))
}

pub fn index_record_count(idx_file: &File) -> Result<u64> {
    let len = idx_file.metadata()?.len();
    Ok(len.saturating_sub(IDX_HEADER_SIZE as u64) / INDEX_ENTRY_SIZE as u64)
}

/// Load a sealed (or not-yet-sealed) chunk's metadata by reading only its headers and index file
/// - no write access needed. Used both to adopt an external chunk directory and to re-scan every
/// chunk found in the store directory during open-time recovery.
pub fn load_sealed_meta(dir: &Path, id: ChunkId) -> Result<ChunkMeta> {
    let mut raw_file = open_rw(&dir.join(RAW_FILE))?;
    let mut idx_file = open_rw(&dir.join(IDX_FILE))?;
    let mut attr_file = open_rw(&dir.join(ATTR_FILE))?;
    let mut dict_file = open_rw(&dir.join(DICT_FILE))?;

    let raw_header = check_header(&mut raw_file, FileType::Raw)?;
    let idx_header = check_header(&mut idx_file, FileType::Index)?;
    let attr_header = check_header(&mut attr_file, FileType::Attr)?;
    let dict_header = check_header(&mut dict_file, FileType::Dict)?;

    let sealed =
        raw_header.sealed() && idx_header.sealed() && attr_header.sealed() && dict_header.sealed();

    let record_count = index_record_count(&idx_file)?;
    let first = read_first_index_entry(&mut idx_file)?;
    let last = read_last_index_entry(&mut idx_file)?;

    let (start_ts, ingest_start, source_start) = first
        .map(|e| (e.write_ts, e.ingest_ts, (e.source_ts != 0).then_some(e.source_ts)))
        .unwrap_or((0, 0, None));
    let (end_ts, ingest_end, source_end) = last
        .map(|e| (e.write_ts, e.ingest_ts, (e.source_ts != 0).then_some(e.source_ts)))
        .unwrap_or((0, 0, None));

    let disk_bytes = directory_disk_bytes(dir)?;
    let dict_bytes = dict_data_len(&dict_file)?;
    let logical_data_bytes = last
        .map(|e| e.raw_range().end as u64 + e.attr_range().end as u64)
        .unwrap_or(0)
        + record_count * INDEX_ENTRY_SIZE as u64;

    Ok(ChunkMeta {
        id,
        sealed,
        compressed: raw_header.compressed(),
        record_count,
        start_ts,
        end_ts,
        ingest_start,
        ingest_end,
        source_start,
        source_end,
        logical_data_bytes,
        bytes: logical_data_bytes + dict_bytes,
        disk_bytes,
    })
}

/// Seal a chunk directory found unsealed on disk but not owned as this process's active chunk
/// (an "orphan" left behind by an unclean shutdown).
pub fn seal_orphan(dir: &Path, id: ChunkId) -> Result<ChunkMeta> {
    let mut raw_file = open_rw(&dir.join(RAW_FILE))?;
    let mut idx_file = open_rw(&dir.join(IDX_FILE))?;
    let mut attr_file = open_rw(&dir.join(ATTR_FILE))?;
    let mut dict_file = open_rw(&dir.join(DICT_FILE))?;

    for f in [&mut raw_file, &mut idx_file, &mut attr_file, &mut dict_file] {
        seal_file(f)?;
    }
    drop((raw_file, idx_file, attr_file, dict_file));

    load_sealed_meta(dir, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Every attribute blob referenced by a surviving index entry decodes
        /// successfully after recovery, regardless of how much torn garbage trails the raw/attr
        /// files beyond the last committed index entry.
        #[test]
        fn recovers_regardless_of_torn_write_length(
            raw_garbage in 0usize..40,
            attr_garbage in 0usize..40,
        ) {
            let tmp = tempfile::tempdir().unwrap();
            let mut chunk = ActiveChunk::create(tmp.path()).unwrap();
            let id = chunk.id;
            let dir = chunk.dir().to_path_buf();

            for i in 0..5i64 {
                let record = Record {
                    ingest_ts: 1,
                    attrs: vec![(format!("k{i}"), format!("v{i}"))],
                    raw: vec![b'a' + i as u8; 10],
                    ..Default::default()
                };
                chunk.append(record, 1000 + i).unwrap();
            }
            let expected_raw_len = HEADER_SIZE as u64 + chunk.raw_offset;
            let expected_attr_len = HEADER_SIZE as u64 + chunk.attr_offset;
            drop(chunk);

            if raw_garbage > 0 {
                let mut f = OpenOptions::new().append(true).open(dir.join(RAW_FILE)).unwrap();
                f.write_all(&vec![0xffu8; raw_garbage]).unwrap();
            }
            if attr_garbage > 0 {
                let mut f = OpenOptions::new().append(true).open(dir.join(ATTR_FILE)).unwrap();
                f.write_all(&vec![0xffu8; attr_garbage]).unwrap();
            }

            let recovered = ActiveChunk::open_existing(dir.clone(), id).unwrap();
            prop_assert_eq!(recovered.record_count, 5);
            prop_assert_eq!(std::fs::metadata(dir.join(RAW_FILE)).unwrap().len(), expected_raw_len);
            prop_assert_eq!(std::fs::metadata(dir.join(ATTR_FILE)).unwrap().len(), expected_attr_len);

            for i in 0..5usize {
                let entry_offset = IDX_HEADER_SIZE as u64 + i as u64 * INDEX_ENTRY_SIZE as u64;
                let mut buf = [0u8; INDEX_ENTRY_SIZE];
                recovered.idx_file.read_exact_at(&mut buf, entry_offset).unwrap();
                let entry = IndexEntry::decode(&buf);

                let mut attr_blob = vec![0u8; entry.attr_size as usize];
                recovered
                    .attr_file
                    .read_exact_at(&mut attr_blob, HEADER_SIZE as u64 + entry.attr_offset as u64)
                    .unwrap();
                prop_assert!(attrs::decode(&attr_blob, &recovered.dict).is_ok());
            }
        }
    }

    #[test]
    fn create_append_seal_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut chunk = ActiveChunk::create(tmp.path()).unwrap();

        let record = Record {
            source_ts: 0,
            ingest_ts: 1000,
            write_ts: 0,
            attrs: vec![("src".to_owned(), "test".to_owned())],
            raw: b"alpha".to_vec(),
        };
        let pos = chunk.append(record, 5000).unwrap();
        assert_eq!(pos, 0);

        let meta = chunk.seal().unwrap();
        assert_eq!(meta.record_count, 1);
        assert_eq!(meta.start_ts, 5000);
        assert_eq!(meta.end_ts, 5000);
        assert!(meta.sealed);
    }

    #[test]
    fn open_existing_truncates_torn_raw_write() {
        let tmp = tempfile::tempdir().unwrap();
        let mut chunk = ActiveChunk::create(tmp.path()).unwrap();
        let id = chunk.id;
        let dir = chunk.dir().to_path_buf();

        for raw in [b"first".to_vec(), b"second".to_vec(), b"third".to_vec()] {
            let record = Record {
                ingest_ts: 1,
                raw,
                ..Default::default()
            };
            chunk.append(record, 1).unwrap();
        }
        let expected_len = HEADER_SIZE as u64 + chunk.raw_offset;
        drop(chunk);

        let raw_path = dir.join(RAW_FILE);
        let mut raw_file = OpenOptions::new().append(true).open(&raw_path).unwrap();
        raw_file.write_all(&[0xffu8; 24]).unwrap();
        drop(raw_file);

        let recovered = ActiveChunk::open_existing(dir, id).unwrap();
        assert_eq!(
            std::fs::metadata(&raw_path).unwrap().len(),
            expected_len
        );
        assert_eq!(recovered.record_count, 3);
    }
}
