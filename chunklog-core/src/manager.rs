//! The `ChunkManager` public contract: directory lock, chunk lifecycle, crash recovery,
//! and coordination of every other module in this crate.
//!
//! Grounded on `chunk_store.rs`'s `ChunkStore` (a single `Mutex<()>`-guarded directory owner with
//! a `ProcessLocker`), generalized from "lock + insert chunk files" to "lock + own exactly one
//! active chunk, a map of sealed ones, and a rotation/compression policy".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result as AResult};
use chunklog_tools::{DirLock, DirLockGuard};

use crate::chunk::{self, ActiveChunk, ChunkMeta};
use crate::chunk_id::ChunkId;
use crate::cursor::Cursor;
use crate::cursor_mmap::MmapCursor;
use crate::cursor_streaming::StreamingCursor;
use crate::error::{from_anyhow, ChunkManagerError};
use crate::record::{IndexEntry, Record, INDEX_ENTRY_SIZE};
use crate::rotation::{CompositePolicy, HardLimitPolicy, RotationPolicy, RotationReason};

const LOCK_FILE: &str = ".lock";

/// How aggressively the manager forces index writes to stable storage, mirrored on
/// `pbs-api-types::DatastoreFSyncLevel`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsyncLevel {
    /// `fsync` the index file after every append. Safest, slowest.
    Always,
    /// Rely on the OS to flush in its own time; `fsync` only at seal and compression boundaries.
    Batch,
    /// Never `fsync` outside of seal. Only appropriate for disposable or replicated stores.
    None,
}

/// Construction-time configuration for a [`ChunkManager`].
pub struct ManagerConfig {
    pub store_dir: PathBuf,
    /// If `true` and `store_dir` does not exist yet, `NewManager` logs a warning before creating
    /// it empty rather than treating a missing directory as the expected fresh-store case.
    pub expect_existing: bool,
    /// Composed after the always-on [`HardLimitPolicy`] (first-match-wins).
    pub rotation_policy: Box<dyn RotationPolicy>,
    pub fsync_level: FsyncLevel,
    pub compression_enabled: bool,
}

impl ManagerConfig {
    /// Sensible defaults for everything but the store directory: no extra rotation policy beyond
    /// the mandatory hard limit, batched fsync, compression off.
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            expect_existing: false,
            rotation_policy: Box::new(CompositePolicy::new(Vec::new())),
            fsync_level: FsyncLevel::Batch,
            compression_enabled: false,
        }
    }
}

struct Inner {
    active: Option<ActiveChunk>,
    /// Every chunk this manager knows about *except* the active one.
    metas: BTreeMap<ChunkId, ChunkMeta>,
    hard_limit: HardLimitPolicy,
    rotation_policy: Box<dyn RotationPolicy>,
    fsync_level: FsyncLevel,
    compression_enabled: bool,
    closed: bool,
    /// Held for as long as the manager is open; `close()` takes and drops it to release the lock.
    dir_lock: Option<DirLockGuard>,
}

/// Owns a single store directory: the active chunk, the sealed-chunk map, and the directory lock
/// for the manager's whole lifetime. All mutating operations serialize on one mutex.
pub struct ChunkManager {
    store_dir: PathBuf,
    inner: std::sync::Mutex<Inner>,
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as i64
}

fn is_orphan_temp_name(name: &str) -> bool {
    name.contains(".compress-") || name.contains(".tmp.")
}

impl ChunkManager {
    /// Open-time recovery: acquire the directory lock, seal orphaned active chunks, and
    /// reopen the single remaining unsealed chunk (if any) as active.
    pub fn new(cfg: ManagerConfig) -> Result<Self, ChunkManagerError> {
        (|| -> AResult<Self> {
            let store_dir = cfg.store_dir.clone();

            if !store_dir.exists() {
                if cfg.expect_existing {
                    log::warn!(
                        "component=chunk-manager store directory {store_dir:?} was missing and has been recreated empty"
                    );
                }
                chunklog_tools::ensure_dir(&store_dir)?;
            }

            let lock_path = store_dir.join(LOCK_FILE);
            let lock = DirLock::open(&lock_path)?
                .try_exclusive()?
                .ok_or_else(|| anyhow::anyhow!(ChunkManagerError::DirectoryLocked))?;

            let mut metas = BTreeMap::new();
            let mut unsealed: Vec<ChunkId> = Vec::new();

            for entry in std::fs::read_dir(&store_dir)
                .with_context(|| format!("unable to read store directory {store_dir:?}"))?
            {
                let entry = entry?;
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name,
                    None => continue,
                };
                let id = match ChunkId::parse_dir_name(name) {
                    Some(id) => id,
                    None => continue,
                };

                chunklog_tools::sweep_orphan_temp_files(&path, is_orphan_temp_name)
                    .with_context(|| format!("unable to sweep orphan temp files in {path:?}"))?;

                let meta = chunk::load_sealed_meta(&path, id)
                    .with_context(|| format!("unable to load metadata for chunk {id}"))?;

                if meta.sealed {
                    metas.insert(id, meta);
                } else {
                    unsealed.push(id);
                }
            }

            unsealed.sort();

            let mut active = None;
            if let Some((newest, orphans)) = unsealed.split_last() {
                for &orphan_id in orphans {
                    log::info!(
                        "component=chunk-manager sealing orphaned active chunk {orphan_id}"
                    );
                    let dir = chunk::chunk_dir(&store_dir, orphan_id);
                    let meta = chunk::seal_orphan(&dir, orphan_id)
                        .with_context(|| format!("unable to seal orphaned chunk {orphan_id}"))?;
                    metas.insert(orphan_id, meta);
                }

                let dir = chunk::chunk_dir(&store_dir, *newest);
                active = Some(
                    ActiveChunk::open_existing(dir, *newest)
                        .with_context(|| format!("unable to reopen active chunk {newest}"))?,
                );
            }

            log::info!("component=chunk-manager opened store directory {store_dir:?}");

            Ok(Self {
                store_dir,
                inner: std::sync::Mutex::new(Inner {
                    active,
                    metas,
                    hard_limit: HardLimitPolicy::default(),
                    rotation_policy: cfg.rotation_policy,
                    fsync_level: cfg.fsync_level,
                    compression_enabled: cfg.compression_enabled,
                    closed: false,
                    dir_lock: Some(lock),
                }),
            })
        })()
        .map_err(from_anyhow)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, record: Record) -> Result<(ChunkId, u64), ChunkManagerError> {
        self.append_internal(record, None)
    }

    /// `AppendPreserved`: bypasses the clock, keeping `record.write_ts` as given. Rejects a write
    /// whose `WriteTS` would go backwards relative to the active chunk (recorded Open Question
    /// decision) rather than silently reordering or rotating.
    pub fn append_preserved(&self, record: Record) -> Result<(ChunkId, u64), ChunkManagerError> {
        if record.write_ts == 0 {
            return Err(ChunkManagerError::MissingWriteTS);
        }
        let write_ts = record.write_ts;
        self.append_internal(record, Some(write_ts))
    }

    fn append_internal(
        &self,
        mut record: Record,
        preserved_ts: Option<i64>,
    ) -> Result<(ChunkId, u64), ChunkManagerError> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(ChunkManagerError::ManagerClosed);
        }

        let attr_len = crate::attrs::encoded_len(&record.attrs);
        if attr_len > crate::attrs::MAX_ENCODED_LEN {
            return Err(ChunkManagerError::AttrTooLarge);
        }

        if inner.active.is_none() {
            let active = ActiveChunk::create(&self.store_dir).map_err(from_anyhow)?;
            inner.active = Some(active);
        }

        if let Some(ts) = preserved_ts {
            let active = inner.active.as_ref().unwrap();
            if active.record_count() > 0 && ts < active.end_ts() {
                return Err(ChunkManagerError::InvalidEntry(format!(
                    "AppendPreserved write_ts {ts} precedes active chunk end_ts {}",
                    active.end_ts()
                )));
            }
        }

        let reason = {
            let active = inner.active.as_ref().unwrap();
            let (raw_offset, raw_len, attr_offset, attr_len) =
                active.projected_sizes(attr_len, record.raw.len());
            let state = active.state_snapshot();

            inner
                .hard_limit
                .should_rotate_with_sizes(raw_offset, raw_len, attr_offset, attr_len)
                .or_else(|| inner.rotation_policy.should_rotate(&state, &record))
        };

        if let Some(reason) = reason {
            self.rotate_locked(&mut inner, reason)?;
        }

        let write_ts = preserved_ts.unwrap_or_else(now_ns);
        record.write_ts = write_ts;

        let active = inner.active.as_mut().unwrap();
        let pos = active.append(record, write_ts).map_err(from_anyhow)?;

        if inner.fsync_level == FsyncLevel::Always {
            inner.active.as_ref().unwrap().sync_idx().map_err(from_anyhow)?;
        }

        Ok((inner.active.as_ref().unwrap().id, pos))
    }

    /// Seal and log the outgoing chunk, install a fresh active chunk. Caller must already hold
    /// `inner.active.is_some()`.
    fn rotate_locked(&self, inner: &mut Inner, reason: RotationReason) -> Result<(), ChunkManagerError> {
        let active = inner.active.take().unwrap();
        let id = active.id;
        let state = active.state_snapshot();
        let age = state.created_at.elapsed().unwrap_or(Duration::ZERO);

        log::info!(
            "component=chunk-manager rotating chunk {id} reason={reason} bytes={} records={} age_ms={}",
            state.bytes,
            state.records,
            age.as_millis()
        );

        let meta = active.seal().map_err(from_anyhow)?;
        inner.metas.insert(id, meta);

        let fresh = ActiveChunk::create(&self.store_dir).map_err(from_anyhow)?;
        inner.active = Some(fresh);
        Ok(())
    }

    /// `Seal`: idempotent no-op if there is no active chunk, or it has no records.
    pub fn seal(&self) -> Result<(), ChunkManagerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ChunkManagerError::ManagerClosed);
        }
        let should_seal = matches!(&inner.active, Some(a) if a.record_count() > 0);
        if !should_seal {
            return Ok(());
        }
        let active = inner.active.take().unwrap();
        let id = active.id;
        let meta = active.seal().map_err(from_anyhow)?;
        inner.metas.insert(id, meta);
        Ok(())
    }

    pub fn active(&self) -> Option<ChunkMeta> {
        self.lock().active.as_ref().map(|a| a.meta_snapshot())
    }

    pub fn meta(&self, id: ChunkId) -> Result<ChunkMeta, ChunkManagerError> {
        let inner = self.lock();
        if let Some(active) = &inner.active {
            if active.id == id {
                return Ok(active.meta_snapshot());
            }
        }
        inner.metas.get(&id).cloned().ok_or(ChunkManagerError::ChunkNotFound(id))
    }

    /// `List`: every known chunk, sorted by `start_ts` ascending.
    pub fn list(&self) -> Vec<ChunkMeta> {
        let inner = self.lock();
        let mut metas: Vec<ChunkMeta> = inner.metas.values().cloned().collect();
        if let Some(active) = &inner.active {
            metas.push(active.meta_snapshot());
        }
        metas.sort_by_key(|m| m.start_ts);
        metas
    }

    pub fn chunk_dir(&self, id: ChunkId) -> PathBuf {
        chunk::chunk_dir(&self.store_dir, id)
    }

    /// `OpenCursor`: mmap cursor for any chunk this manager knows as sealed, streaming cursor for
    /// the current active chunk.
    pub fn open_cursor(&self, id: ChunkId) -> Result<Box<dyn Cursor>, ChunkManagerError> {
        let inner = self.lock();

        if let Some(active) = &inner.active {
            if active.id == id {
                let dir = chunk::chunk_dir(&self.store_dir, id);
                let cursor = StreamingCursor::open(&dir, id).map_err(from_anyhow)?;
                return Ok(Box::new(cursor));
            }
        }

        if !inner.metas.contains_key(&id) {
            return Err(ChunkManagerError::ChunkNotFound(id));
        }
        let dir = chunk::chunk_dir(&self.store_dir, id);
        let cursor = MmapCursor::open(&dir, id).map_err(from_anyhow)?;
        Ok(Box::new(cursor))
    }

    /// `FindStartPosition`: binary search the index file for the rightmost entry with
    /// `writeTS <= ts`.
    pub fn find_start_position(&self, id: ChunkId, ts: i64) -> Result<(u64, bool), ChunkManagerError> {
        let idx_path = self.index_path_for(id)?;
        let file = std::fs::File::open(&idx_path).map_err(ChunkManagerError::IOError)?;
        let count = chunk::index_record_count(&file).map_err(from_anyhow)?;

        if count == 0 {
            return Ok((0, false));
        }

        let read_write_ts = |pos: u64| -> Result<i64, ChunkManagerError> {
            use std::os::unix::fs::FileExt;
            let offset = chunk::IDX_HEADER_SIZE as u64 + pos * INDEX_ENTRY_SIZE as u64;
            let mut buf = [0u8; INDEX_ENTRY_SIZE];
            file.read_exact_at(&mut buf, offset).map_err(ChunkManagerError::IOError)?;
            Ok(IndexEntry::decode(&buf).write_ts)
        };

        if read_write_ts(0)? > ts {
            return Ok((0, false));
        }

        let (mut lo, mut hi) = (0u64, count - 1);
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if read_write_ts(mid)? <= ts {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        Ok((lo, true))
    }

    /// `ReadWriteTimestamps`: one index file open, one positional 8-byte... (well, one positional
    /// 38-byte entry) read per requested position, in input order.
    pub fn read_write_timestamps(
        &self,
        id: ChunkId,
        positions: &[u64],
    ) -> Result<Vec<i64>, ChunkManagerError> {
        use std::os::unix::fs::FileExt;

        let idx_path = self.index_path_for(id)?;
        let file = std::fs::File::open(&idx_path).map_err(ChunkManagerError::IOError)?;

        positions
            .iter()
            .map(|&pos| {
                let offset = chunk::IDX_HEADER_SIZE as u64 + pos * INDEX_ENTRY_SIZE as u64;
                let mut buf = [0u8; INDEX_ENTRY_SIZE];
                file.read_exact_at(&mut buf, offset).map_err(ChunkManagerError::IOError)?;
                Ok(IndexEntry::decode(&buf).write_ts)
            })
            .collect()
    }

    fn index_path_for(&self, id: ChunkId) -> Result<PathBuf, ChunkManagerError> {
        let inner = self.lock();
        let known = inner.metas.contains_key(&id)
            || matches!(&inner.active, Some(a) if a.id == id);
        if !known {
            return Err(ChunkManagerError::ChunkNotFound(id));
        }
        Ok(chunk::chunk_dir(&self.store_dir, id).join(chunk::IDX_FILE))
    }

    pub fn delete(&self, id: ChunkId) -> Result<(), ChunkManagerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ChunkManagerError::ManagerClosed);
        }
        if matches!(&inner.active, Some(a) if a.id == id) {
            return Err(ChunkManagerError::ActiveChunk);
        }
        if inner.metas.remove(&id).is_none() {
            return Err(ChunkManagerError::ChunkNotFound(id));
        }
        let dir = chunk::chunk_dir(&self.store_dir, id);
        std::fs::remove_dir_all(&dir).map_err(ChunkManagerError::IOError)?;
        Ok(())
    }

    /// `Disown`: stop tracking a sealed chunk without touching its files on disk.
    pub fn disown(&self, id: ChunkId) -> Result<(), ChunkManagerError> {
        let mut inner = self.lock();
        if matches!(&inner.active, Some(a) if a.id == id) {
            return Err(ChunkManagerError::ActiveChunk);
        }
        if inner.metas.remove(&id).is_none() {
            return Err(ChunkManagerError::ChunkNotFound(id));
        }
        Ok(())
    }

    /// `Adopt`: the opposite of [`Self::disown`] - start tracking a sealed chunk directory already
    /// present on disk but not yet known to this manager.
    pub fn adopt(&self, id: ChunkId) -> Result<ChunkMeta, ChunkManagerError> {
        let mut inner = self.lock();

        let already_tracked =
            inner.metas.contains_key(&id) || matches!(&inner.active, Some(a) if a.id == id);
        if already_tracked {
            return Err(ChunkManagerError::InvalidEntry(format!(
                "chunk {id} is already tracked by this manager"
            )));
        }

        let dir = chunk::chunk_dir(&self.store_dir, id);
        let meta = chunk::load_sealed_meta(&dir, id).map_err(from_anyhow)?;
        if !meta.sealed {
            return Err(ChunkManagerError::ChunkNotSealed);
        }

        inner.metas.insert(id, meta.clone());
        Ok(meta)
    }

    /// `CompressChunk`: no-op if compression is disabled or the chunk is not sealed; otherwise
    /// rewrites `raw.log` and `attr.log` as seekable zstd via atomic temp-file-plus-rename.
    /// Targets Unix/POSIX `rename(2)` atomicity; non-POSIX platforms would need a different swap primitive.
    pub fn compress_chunk(&self, id: ChunkId) -> Result<(), ChunkManagerError> {
        let (compression_enabled, meta) = {
            let inner = self.lock();
            let meta = if matches!(&inner.active, Some(a) if a.id == id) {
                None
            } else {
                inner.metas.get(&id).cloned()
            };
            (inner.compression_enabled, meta)
        };

        let meta = match meta {
            Some(meta) => meta,
            None => {
                let inner = self.lock();
                if matches!(&inner.active, Some(a) if a.id == id) {
                    return Ok(());
                }
                return Err(ChunkManagerError::ChunkNotFound(id));
            }
        };

        if !compression_enabled || !meta.sealed || meta.compressed {
            return Ok(());
        }

        let dir = chunk::chunk_dir(&self.store_dir, id);
        let new_meta = self.compress_chunk_files(&dir, id, &meta).map_err(from_anyhow)?;

        let mut inner = self.lock();
        inner.metas.insert(id, new_meta);
        Ok(())
    }

    fn compress_chunk_files(&self, dir: &Path, id: ChunkId, meta: &ChunkMeta) -> AResult<ChunkMeta> {
        use crate::compression::compress_seekable;
        use crate::file_header::{FileHeader, FileType, FLAG_COMPRESSED, HEADER_SIZE};

        for (name, file_type) in [
            (chunk::RAW_FILE, FileType::Raw),
            (chunk::ATTR_FILE, FileType::Attr),
        ] {
            let path = dir.join(name);
            let contents = std::fs::read(&path).with_context(|| format!("unable to read {path:?}"))?;
            if contents.len() < HEADER_SIZE {
                anyhow::bail!("{path:?} shorter than its header");
            }
            let mut header = FileHeader::decode(
                &contents[..HEADER_SIZE].try_into().unwrap(),
                file_type,
            )
            .map_err(|e| anyhow::anyhow!(e))?;

            let compressed = compress_seekable(&contents[HEADER_SIZE..])?;
            header.flags |= FLAG_COMPRESSED;

            let mut new_contents = header.encode().to_vec();
            new_contents.extend_from_slice(&compressed);

            let tmp_suffix = format!(".compress-{id}");
            chunklog_tools::replace_file(&path, &new_contents, &tmp_suffix)?;
            chunklog_tools::fsync_parent_dir(&path)?;
        }

        let disk_bytes = crate::chunk::load_sealed_meta(dir, id)?.disk_bytes;
        Ok(ChunkMeta {
            compressed: true,
            disk_bytes,
            ..meta.clone()
        })
    }

    pub fn set_rotation_policy(&self, policy: Box<dyn RotationPolicy>) -> Result<(), ChunkManagerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ChunkManagerError::ManagerClosed);
        }
        inner.rotation_policy = policy;
        Ok(())
    }

    pub fn set_compression_enabled(&self, enabled: bool) -> Result<(), ChunkManagerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ChunkManagerError::ManagerClosed);
        }
        inner.compression_enabled = enabled;
        Ok(())
    }

    /// `CheckRotation`: background-driven equivalent of the append-path rotation check, evaluated
    /// against no particular incoming record. A no-op on an empty or absent active chunk.
    pub fn check_rotation(&self) -> Result<Option<RotationReason>, ChunkManagerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ChunkManagerError::ManagerClosed);
        }

        let reason = match &inner.active {
            Some(active) if active.record_count() > 0 => {
                let state = active.state_snapshot();
                let probe = Record::default();
                inner
                    .hard_limit
                    .should_rotate(&state, &probe)
                    .or_else(|| inner.rotation_policy.should_rotate(&state, &probe))
            }
            _ => None,
        };

        if let Some(reason) = reason {
            self.rotate_locked(&mut inner, reason)?;
        }
        Ok(reason)
    }

    /// `RefreshDiskSizes`: recompute `disk_bytes` for a known sealed chunk from the directory
    /// listing (used after out-of-band changes, e.g. an external indexer adding files).
    pub fn refresh_disk_sizes(&self, id: ChunkId) -> Result<ChunkMeta, ChunkManagerError> {
        let mut inner = self.lock();
        if !inner.metas.contains_key(&id) {
            return Err(ChunkManagerError::ChunkNotFound(id));
        }
        let dir = chunk::chunk_dir(&self.store_dir, id);
        let meta = chunk::load_sealed_meta(&dir, id).map_err(from_anyhow)?;
        inner.metas.insert(id, meta.clone());
        Ok(meta)
    }

    /// `Close`: reject all further operations with `ManagerClosed` and release the directory lock,
    /// so a new manager can be opened on the same store directory immediately afterward.
    pub fn close(&self) -> Result<(), ChunkManagerError> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.dir_lock.take();
        Ok(())
    }
}
