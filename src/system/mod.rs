//! System integration - LED signalling, time sync, storage tuning and the
//! singleton process lock.

mod led;
mod timesync;
mod tuning;

pub use led::{LedMode, StatusLed};
pub use timesync::sync_time;
pub use tuning::apply_tuning;

use crate::error::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Default lockfile location
pub const LOCK_FILE: &str = "/var/run/teslausb.lock";

/// Acquire the advisory exclusive process lock.
///
/// The returned handle must be kept alive for the lifetime of the daemon;
/// dropping it releases the lock. Failure means another instance holds it.
pub fn acquire_process_lock(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.try_lock_exclusive()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teslausb.lock");
        let held = acquire_process_lock(&path).unwrap();
        assert!(acquire_process_lock(&path).is_err());
        drop(held);
        assert!(acquire_process_lock(&path).is_ok());
    }
}
