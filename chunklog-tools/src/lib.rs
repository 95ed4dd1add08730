pub mod dirlock;
pub mod fs;

pub use dirlock::{DirLock, DirLockGuard};
pub use fs::{ensure_dir, fsync_parent_dir, replace_file, sweep_orphan_temp_files};
