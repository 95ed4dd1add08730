//! Small filesystem helpers shared by the chunk manager.
//!
//! These are deliberately narrow: create a directory if missing, replace a file
//! atomically via a temp-file-plus-rename dance, and sweep leftover temp files
//! after an unclean shutdown. No directory-iterator combinator zoo here; the
//! engine only ever needs to list a handful of well-known file name patterns.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};

/// Create `path` as a directory if it does not already exist. Does not fail if
/// it's already there (unlike plain `create_dir`), matching the idempotent
/// "open or initialize a store" entry points in the chunk manager.
pub fn ensure_dir(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err).with_context(|| format!("unable to create directory {path:?}")),
    }
}

/// Write `contents` to a temp file beside `target`, fsync it, then rename it
/// onto `target`. The rename is atomic on the same filesystem, so a reader
/// opening `target` never observes a partially written file.
///
/// Mirrors `FixedIndexWriter::close()`'s tmp-file-then-`rename` sequence, and
/// is reused by the compression shim to replace a sealed chunk file with its
/// compressed form under a `.compress-<uuid>` working name.
pub fn replace_file(target: &Path, contents: &[u8], tmp_suffix: &str) -> Result<(), Error> {
    let tmp_path = tmp_path_for(target, tmp_suffix);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .with_context(|| format!("unable to create temp file {tmp_path:?}"))?;

    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("unable to write temp file {tmp_path:?}"))?;
    drop(file);

    fs::rename(&tmp_path, target)
        .with_context(|| format!("unable to rename {tmp_path:?} to {target:?}"))?;

    Ok(())
}

/// Open `target`'s parent directory and fsync it, so that the rename itself
/// (not just the file's contents) is durable. Needed after [`replace_file`]
/// when the caller's fsync level calls for directory-entry durability.
pub fn fsync_parent_dir(target: &Path) -> Result<(), Error> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let dir = File::open(parent)
        .with_context(|| format!("unable to open directory {parent:?} for fsync"))?;
    dir.sync_all()
        .with_context(|| format!("unable to fsync directory {parent:?}"))?;
    Ok(())
}

fn tmp_path_for(target: &Path, tmp_suffix: &str) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(tmp_suffix);
    target.with_file_name(name)
}

/// Remove stray temp files left behind by a crash mid-[`replace_file`] or
/// mid-compression. `is_orphan` matches a file name against the caller's
/// notion of "this is a temp marker, not a real chunk file" (e.g. containing
/// `.compress-` or ending in `.tmp`).
pub fn sweep_orphan_temp_files(
    dir: &Path,
    is_orphan: impl Fn(&str) -> bool,
) -> Result<Vec<PathBuf>, Error> {
    let mut removed = Vec::new();

    let entries =
        fs::read_dir(dir).with_context(|| format!("unable to read directory {dir:?}"))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("unable to read entry in {dir:?}"))?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if !is_orphan(name) {
            continue;
        }

        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => bail!("unable to remove orphan temp file {path:?} - {err}"),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dir_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("store");
        ensure_dir(&sub).unwrap();
        ensure_dir(&sub).unwrap();
        assert!(sub.is_dir());
    }

    #[test]
    fn replace_file_is_atomic_and_visible() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("chunk.raw");

        replace_file(&target, b"first", ".tmp").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"first");

        replace_file(&target, b"second", ".tmp").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");

        // no leftover temp file survives a successful replace
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn sweep_orphan_temp_files_removes_matches_only() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("chunk-0001.raw"), b"data").unwrap();
        fs::write(tmp.path().join("chunk-0002.raw.compress-abc"), b"partial").unwrap();
        fs::write(tmp.path().join("chunk-0003.raw.tmp"), b"partial").unwrap();

        let removed = sweep_orphan_temp_files(tmp.path(), |name| {
            name.contains(".compress-") || name.ends_with(".tmp")
        })
        .unwrap();

        assert_eq!(removed.len(), 2);
        assert!(tmp.path().join("chunk-0001.raw").exists());
        assert!(!tmp.path().join("chunk-0002.raw.compress-abc").exists());
        assert!(!tmp.path().join("chunk-0003.raw.tmp").exists());
    }
}
