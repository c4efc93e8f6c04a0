//! Free-space management on the cam filesystem.
//!
//! When free space falls below the reserve, the oldest clips across all
//! three clip directories are deleted until the reserve is satisfied. The
//! car overwrites RecentClips on its own, but Saved/Sentry events would
//! otherwise accumulate until the drive fills and recording stops.

use super::ArchiveTransport;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

const MIN_RESERVE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

const CLIP_DIRS: [&str; 3] = [
    "TeslaCam/RecentClips",
    "TeslaCam/SavedClips",
    "TeslaCam/SentryClips",
];

#[derive(Debug, Clone)]
pub(crate) struct ClipFile {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

impl ArchiveTransport {
    /// Delete oldest clips until free space reaches the reserve. Runs after
    /// every archive pass; a no-op while free space is healthy.
    pub async fn manage_free_space(&self) {
        let Ok(free) = fs2::available_space(&self.cam_mount) else {
            return;
        };
        let total = fs2::total_space(&self.cam_mount).unwrap_or(0);
        let reserve = reserve_bytes(total);
        if free >= reserve {
            return;
        }

        let needed = reserve - free;
        tracing::info!(
            free_mb = free / (1024 * 1024),
            needed_mb = needed / (1024 * 1024),
            "Free space below reserve, deleting oldest clips"
        );

        let clips = collect_clips(&self.cam_mount);
        let mut freed = 0u64;
        for clip in plan_deletions(clips, needed) {
            if tokio::fs::remove_file(&clip.path).await.is_ok() {
                freed += clip.size;
                tracing::info!(
                    file = %clip.path.display(),
                    size_kb = clip.size / 1024,
                    "Freed clip"
                );
            }
        }
        tracing::info!(freed_mb = freed / (1024 * 1024), "Free-space pass done");
    }
}

/// Reserve to keep free: the greater of 2 GiB and 10% of the filesystem.
fn reserve_bytes(total: u64) -> u64 {
    MIN_RESERVE_BYTES.max(total / 10)
}

fn collect_clips(cam_mount: &Path) -> Vec<ClipFile> {
    let mut clips = Vec::new();
    for dir in CLIP_DIRS {
        for entry in WalkDir::new(cam_mount.join(dir))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(meta) = entry.metadata() else { continue };
            clips.push(ClipFile {
                path: entry.into_path(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
            });
        }
    }
    clips
}

/// Oldest-first deletion plan releasing at least `needed` bytes.
fn plan_deletions(mut clips: Vec<ClipFile>, needed: u64) -> Vec<ClipFile> {
    clips.sort_by_key(|c| c.modified);
    let mut freed = 0u64;
    let mut doomed = Vec::new();
    for clip in clips {
        if freed >= needed {
            break;
        }
        freed += clip.size;
        doomed.push(clip);
    }
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    fn clip(name: &str, age_secs: u64, size: u64) -> ClipFile {
        ClipFile {
            path: PathBuf::from(name),
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 - age_secs),
            size,
        }
    }

    #[test]
    fn test_reserve_is_at_least_two_gib() {
        assert_eq!(reserve_bytes(0), 2 * GIB);
        assert_eq!(reserve_bytes(10 * GIB), 2 * GIB);
        assert_eq!(reserve_bytes(100 * GIB), 10 * GIB);
    }

    #[test]
    fn test_no_deletions_when_nothing_needed() {
        let clips = vec![clip("a", 100, MIB), clip("b", 50, MIB)];
        assert!(plan_deletions(clips, 0).is_empty());
    }

    #[test]
    fn test_deletes_oldest_first_until_satisfied() {
        let clips = vec![
            clip("new", 10, 100 * MIB),
            clip("oldest", 1000, 100 * MIB),
            clip("older", 500, 100 * MIB),
        ];
        let doomed = plan_deletions(clips, 150 * MIB);
        let names: Vec<_> = doomed
            .iter()
            .map(|c| c.path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["oldest", "older"]);
    }

    #[test]
    fn test_exact_pressure_scenario() {
        // Free = 500 MB against a 2 GiB reserve; the ten oldest 155 MiB
        // clips cover the shortfall, the fresh one survives
        let needed = 2 * GIB - 500 * MIB;
        let mut clips: Vec<ClipFile> =
            (0..10).map(|i| clip(&format!("old{i}"), 10_000 - i, 155 * MIB)).collect();
        clips.push(clip("fresh", 1, 155 * MIB));
        let doomed = plan_deletions(clips, needed);
        assert_eq!(doomed.len(), 10);
        assert!(doomed.iter().all(|c| c.path.to_string_lossy().starts_with("old")));
    }

    #[test]
    fn test_plan_takes_everything_when_not_enough() {
        let clips = vec![clip("a", 10, MIB), clip("b", 20, MIB)];
        assert_eq!(plan_deletions(clips, 10 * MIB).len(), 2);
    }
}
