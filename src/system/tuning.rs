//! Storage and CPU tuning applied once at startup.
//!
//! The car streams writes continuously; small dirty-page limits keep the SD
//! card flushing steadily instead of stalling in large bursts. All writes
//! are best-effort (containers and non-Pi hosts lack some of these knobs).

use std::path::Path;

const TUNINGS: [(&str, &str); 2] = [
    ("proc/sys/vm/dirty_background_bytes", "65536"),
    ("proc/sys/vm/dirty_ratio", "80"),
];

const GOVERNOR_PATH: &str = "sys/devices/system/cpu/cpufreq/policy0/scaling_governor";

/// Apply VM dirty-page limits and the conservative CPU governor under
/// `root` (`/` in production).
pub async fn apply_tuning(root: &Path) {
    for (path, value) in TUNINGS {
        let path = root.join(path);
        if let Err(e) = tokio::fs::write(&path, value).await {
            tracing::warn!(path = %path.display(), error = %e, "Tuning write failed");
        }
    }
    let governor = root.join(GOVERNOR_PATH);
    if let Err(e) = tokio::fs::write(&governor, "conservative").await {
        tracing::warn!(error = %e, "CPU governor not applied");
    }
    tracing::info!("System tuning applied");
}
