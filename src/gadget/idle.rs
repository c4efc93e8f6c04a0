//! USB write-idle detection.
//!
//! Unbinding the gadget while the car is mid-write corrupts the exFAT
//! image. The kernel's `file-storage` thread does the writing, so sampling
//! its `/proc/<pid>/io` write counter is the cheapest signal that the car
//! has finished flushing.

use super::Gadget;
use crate::error::{Error, Result};
use std::path::Path;

/// An interval is idle when fewer bytes than this were written during it
pub(crate) const IDLE_WRITE_THRESHOLD: i64 = 500_000;
/// Consecutive idle intervals required
const IDLE_SAMPLES_REQUIRED: u32 = 5;
/// Sampling budget (one sample per second in production)
pub(crate) const IDLE_MAX_SAMPLES: u32 = 90;

/// Pure decision core of the idle wait: feed it one `write_bytes` reading
/// per interval, it reports when enough consecutive quiet intervals passed.
#[derive(Debug, Default)]
pub struct IdleDetector {
    prev: Option<i64>,
    idle_count: u32,
}

impl IdleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one `write_bytes` sample; `true` once idle is confirmed.
    pub fn observe(&mut self, write_bytes: i64, threshold: i64) -> bool {
        let Some(prev) = self.prev.replace(write_bytes) else {
            // First sample only establishes the baseline
            return false;
        };
        if write_bytes - prev < threshold {
            self.idle_count += 1;
            self.idle_count >= IDLE_SAMPLES_REQUIRED
        } else {
            self.idle_count = 0;
            false
        }
    }
}

impl Gadget {
    /// Wait until the mass-storage writer has been idle for five
    /// consecutive sampling intervals.
    ///
    /// Success when no `file-storage` thread exists (nothing to flush) or
    /// when it disappears mid-wait; `Error::Timeout` after the sampling
    /// budget is exhausted.
    pub async fn wait_for_idle(&self) -> Result<()> {
        let Some(pid) = find_mass_storage_pid(&self.proc_root).await else {
            tracing::info!("Mass storage writer not active, OK to proceed");
            return Ok(());
        };

        tracing::info!(pid = pid, "Waiting for USB write idle");
        let mut detector = IdleDetector::new();
        for _ in 0..self.idle_max_samples {
            tokio::time::sleep(self.idle_sample_interval).await;
            let Some(written) = read_write_bytes(&self.proc_root, pid).await else {
                // Writer gone, nothing left to flush
                return Ok(());
            };
            if detector.observe(written, self.idle_write_threshold) {
                tracing::info!("USB write idle detected");
                return Ok(());
            }
        }
        Err(Error::Timeout(format!(
            "USB writes still active after {} samples",
            self.idle_max_samples
        )))
    }
}

/// PID of the kernel `file-storage` thread, if one is running
async fn find_mass_storage_pid(proc_root: &Path) -> Option<u32> {
    let mut entries = tokio::fs::read_dir(proc_root).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if let Ok(comm) = tokio::fs::read_to_string(entry.path().join("comm")).await {
            if comm.trim() == "file-storage" {
                return Some(pid);
            }
        }
    }
    None
}

async fn read_write_bytes(proc_root: &Path, pid: u32) -> Option<i64> {
    let io = tokio::fs::read_to_string(proc_root.join(pid.to_string()).join("io"))
        .await
        .ok()?;
    io.lines()
        .find_map(|line| line.strip_prefix("write_bytes:"))
        .and_then(|value| value.trim().parse().ok())
}
