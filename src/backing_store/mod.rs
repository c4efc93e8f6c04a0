//! Backing store - the exFAT image presented to the car.
//!
//! ## Responsibilities
//!
//! - One-time creation of the sparse image (partition table, exFAT format,
//!   `TeslaCam/` seed directories)
//! - Loop-mounting the image locally for archiving, with a best-effort fsck
//! - Cleaning fsck artifacts and truncated clips before archiving
//!
//! The image is exclusively held by either the USB gadget function or the
//! local loop mount; the orchestrator sequences the hand-over.

use crate::error::{Error, Result};
use crate::exec::Exec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Default image and mount locations
pub const BACKING_DIR: &str = "/backingfiles";
pub const BACKING_FILE: &str = "/backingfiles/cam_disk.bin";
pub const CAM_MOUNT: &str = "/mnt/cam";

/// Headroom left on the hosting filesystem when sizing the image
const CREATE_RESERVE_BYTES: u64 = 500 * 1024 * 1024;
/// Smallest image worth creating
const MIN_IMAGE_BYTES: u64 = 1024 * 1024 * 1024;
/// Clips below this size are write-aborted garbage
const TRUNCATED_CLIP_BYTES: u64 = 100_000;

const CLIP_SUBDIRS: [&str; 3] = ["RecentClips", "SavedClips", "SentryClips"];

/// BackingStore instance
pub struct BackingStore {
    exec: Arc<dyn Exec>,
    backing_dir: PathBuf,
    backing_file: PathBuf,
    mount_point: PathBuf,
}

impl BackingStore {
    pub fn new(
        exec: Arc<dyn Exec>,
        backing_dir: impl Into<PathBuf>,
        backing_file: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exec,
            backing_dir: backing_dir.into(),
            backing_file: backing_file.into(),
            mount_point: mount_point.into(),
        }
    }

    pub fn backing_file(&self) -> &Path {
        &self.backing_file
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn exists(&self) -> bool {
        self.backing_file.exists()
    }

    /// Create the cam disk image sized to the hosting filesystem.
    ///
    /// Any failure after the sparse file exists removes it again, so a
    /// retry starts clean.
    pub async fn create(&self) -> Result<()> {
        if self.exists() {
            tracing::info!(file = %self.backing_file.display(), "Backing image already exists");
            return Ok(());
        }

        let available = fs2::available_space(&self.backing_dir).map_err(Error::Io)?;
        let size = image_size(available)?;
        tracing::info!(
            size_gb = size / (1024 * 1024 * 1024),
            "Creating cam disk image"
        );

        let file = tokio::fs::File::create(&self.backing_file).await?;
        file.set_len(size).await?;
        drop(file);

        if let Err(e) = self.partition_and_format().await {
            let _ = tokio::fs::remove_file(&self.backing_file).await;
            return Err(e);
        }

        tracing::info!(
            size_gb = size / (1024 * 1024 * 1024),
            "Cam disk image created and formatted"
        );
        Ok(())
    }

    async fn partition_and_format(&self) -> Result<()> {
        let image = self.backing_file.to_string_lossy();
        let out = self
            .exec
            .run_with_stdin("sfdisk", &[image.as_ref()], "type=7\n")
            .await?;
        if !out.success() {
            return Err(Error::Disk(format!("sfdisk: {}", out.combined())));
        }

        let loop_dev = self.attach_loop().await?;
        let result = self.format_and_seed(&loop_dev).await;
        let _ = self.exec.run("losetup", &["-d", &loop_dev]).await;
        result
    }

    async fn format_and_seed(&self, loop_dev: &str) -> Result<()> {
        let part_dev = format!("{loop_dev}p1");
        let out = self
            .exec
            .run("mkfs.exfat", &["-L", "CAM", &part_dev])
            .await?;
        if !out.success() {
            return Err(Error::Disk(format!("mkfs.exfat: {}", out.combined())));
        }

        tokio::fs::create_dir_all(&self.mount_point).await?;
        let mount_point = self.mount_point.to_string_lossy();
        let out = self
            .exec
            .run("mount", &[&part_dev, mount_point.as_ref()])
            .await?;
        if !out.success() {
            return Err(Error::Disk(format!("mount: {}", out.combined())));
        }

        let seed = async {
            for dir in CLIP_SUBDIRS {
                tokio::fs::create_dir_all(self.mount_point.join("TeslaCam").join(dir)).await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        let _ = self.exec.run("umount", &[mount_point.as_ref()]).await;
        seed
    }

    async fn attach_loop(&self) -> Result<String> {
        let image = self.backing_file.to_string_lossy();
        let out = self
            .exec
            .run("losetup", &["--find", "--show", "--partscan", image.as_ref()])
            .await?;
        if !out.success() {
            return Err(Error::Disk(format!("losetup: {}", out.combined())));
        }
        let dev = out.stdout.trim().to_string();
        if dev.is_empty() {
            return Err(Error::Disk("losetup returned no device".to_string()));
        }
        Ok(dev)
    }

    /// Loop-mount the image at the cam mount point after a repair-mode fsck.
    pub async fn mount_local(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.mount_point).await?;

        let loop_dev = self.attach_loop().await?;
        let part_dev = format!("{loop_dev}p1");

        // Best-effort repair; the car yanks power mid-write all the time
        tracing::info!(dev = %part_dev, "Running fsck.exfat on cam image");
        let _ = self.exec.run("fsck.exfat", &["-p", &part_dev]).await;

        let mount_point = self.mount_point.to_string_lossy();
        let out = self
            .exec
            .run("mount", &["-o", "umask=000", &part_dev, mount_point.as_ref()])
            .await?;
        if !out.success() {
            let _ = self.exec.run("losetup", &["-d", &loop_dev]).await;
            return Err(Error::Disk(format!("mount: {}", out.combined())));
        }

        tracing::info!(mount = %self.mount_point.display(), "Cam image mounted");
        Ok(())
    }

    /// Unmount the cam image and detach every loop device backed by it.
    /// Idempotent and best-effort.
    pub async fn unmount_local(&self) {
        let mount_point = self.mount_point.to_string_lossy();
        let _ = self.exec.run("umount", &[mount_point.as_ref()]).await;

        let image = self.backing_file.to_string_lossy();
        if let Ok(out) = self.exec.run("losetup", &["-j", image.as_ref()]).await {
            for dev in parse_loop_devices(&out.stdout) {
                let _ = self.exec.run("losetup", &["-d", &dev]).await;
            }
        }
        tracing::info!("Cam image unmounted");
    }

    /// Remove fsck recovery files, renamed duplicates and truncated clips.
    /// Called after a local mount, before archiving.
    pub async fn clean_artifacts(&self) {
        if let Ok(mut entries) = tokio::fs::read_dir(&self.mount_point).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_fsck_artifact(&name) || is_renamed_clip(&name) {
                    if tokio::fs::remove_file(entry.path()).await.is_ok() {
                        tracing::info!(file = %name, "Cleaned artifact");
                    }
                }
            }
        }

        for entry in WalkDir::new(&self.mount_point)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy();
            if !name.to_lowercase().ends_with(".mp4") {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
            if size < TRUNCATED_CLIP_BYTES {
                if std::fs::remove_file(entry.path()).is_ok() {
                    tracing::info!(file = %name, size = size, "Cleaned truncated clip");
                }
            }
        }
    }
}

/// Image size for a filesystem with `available` free bytes.
fn image_size(available: u64) -> Result<u64> {
    let size = available.saturating_sub(CREATE_RESERVE_BYTES);
    if size < MIN_IMAGE_BYTES {
        return Err(Error::Disk(format!(
            "not enough space: {available} bytes available"
        )));
    }
    Ok(size)
}

/// `FSCK0000.REC` style recovery files left by fsck.exfat
fn is_fsck_artifact(name: &str) -> bool {
    name.starts_with("FSCK") && name.ends_with(".REC")
}

/// `clip~1.MP4` style duplicates the car leaves after rename collisions
fn is_renamed_clip(name: &str) -> bool {
    let stem = match name
        .strip_suffix(".MP4")
        .or_else(|| name.strip_suffix(".mp4"))
    {
        Some(stem) => stem,
        None => return false,
    };
    let mut chars = stem.chars().rev();
    matches!(
        (chars.next(), chars.next()),
        (Some(digit), Some('~')) if digit.is_ascii_digit()
    )
}

/// Loop devices from `losetup -j` output (`/dev/loop0: []: (/path)` lines)
fn parse_loop_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .filter(|dev| !dev.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::script::ScriptedExec;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_image_size_reserves_headroom() {
        let size = image_size(4 * GIB).unwrap();
        assert_eq!(size, 4 * GIB - CREATE_RESERVE_BYTES);
    }

    #[test]
    fn test_image_size_rejects_small_filesystems() {
        assert!(image_size(GIB).is_err());
        assert!(image_size(0).is_err());
        assert!(image_size(GIB + CREATE_RESERVE_BYTES).is_ok());
    }

    #[test]
    fn test_fsck_artifact_names() {
        assert!(is_fsck_artifact("FSCK0000.REC"));
        assert!(is_fsck_artifact("FSCK0013.REC"));
        assert!(!is_fsck_artifact("clip.REC"));
        assert!(!is_fsck_artifact("FSCK0000.MP4"));
    }

    #[test]
    fn test_renamed_clip_names() {
        assert!(is_renamed_clip("front~1.MP4"));
        assert!(is_renamed_clip("rear~9.mp4"));
        assert!(!is_renamed_clip("front.MP4"));
        assert!(!is_renamed_clip("front~x.MP4"));
        assert!(!is_renamed_clip("front~12.txt"));
    }

    #[test]
    fn test_parse_loop_devices() {
        let out = "/dev/loop0: []: (/backingfiles/cam_disk.bin)\n/dev/loop3: []: (/backingfiles/cam_disk.bin)\n";
        assert_eq!(parse_loop_devices(out), vec!["/dev/loop0", "/dev/loop3"]);
        assert!(parse_loop_devices("").is_empty());
    }

    #[tokio::test]
    async fn test_clean_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackingStore::new(
            Arc::new(ScriptedExec::new()),
            dir.path(),
            dir.path().join("cam_disk.bin"),
            dir.path(),
        );

        let clips = dir.path().join("TeslaCam/RecentClips");
        tokio::fs::create_dir_all(&clips).await.unwrap();
        tokio::fs::write(dir.path().join("FSCK0000.REC"), b"junk")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("front~1.MP4"), b"junk")
            .await
            .unwrap();
        tokio::fs::write(clips.join("tiny.mp4"), vec![0u8; 512])
            .await
            .unwrap();
        let big = clips.join("full.mp4");
        let file = tokio::fs::File::create(&big).await.unwrap();
        file.set_len(2 * TRUNCATED_CLIP_BYTES).await.unwrap();

        store.clean_artifacts().await;

        assert!(!dir.path().join("FSCK0000.REC").exists());
        assert!(!dir.path().join("front~1.MP4").exists());
        assert!(!clips.join("tiny.mp4").exists());
        assert!(big.exists());
    }

    #[tokio::test]
    async fn test_mount_local_detaches_loop_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExec::new());
        exec.on_stdout("losetup", "/dev/loop5");
        exec.on_failure("mount", 32, "mount: wrong fs type");

        let store = BackingStore::new(
            exec.clone(),
            dir.path(),
            dir.path().join("cam_disk.bin"),
            dir.path().join("mnt"),
        );
        let err = store.mount_local().await.unwrap_err();
        assert!(matches!(err, Error::Disk(_)));

        let detach = exec
            .invocations_of("losetup")
            .into_iter()
            .find(|i| i.args.first().map(String::as_str) == Some("-d"));
        assert_eq!(detach.unwrap().args, vec!["-d", "/dev/loop5"]);
    }

    #[tokio::test]
    async fn test_create_failure_removes_image() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExec::new());
        exec.on_failure("sfdisk", 1, "sfdisk: cannot open");

        let file = dir.path().join("cam_disk.bin");
        let store = BackingStore::new(exec.clone(), dir.path(), &file, dir.path().join("mnt"));
        // Sized from the real tempdir filesystem; skip when the build host
        // is too full to create any image at all.
        match store.create().await {
            Err(Error::Disk(msg)) if msg.starts_with("not enough space") => return,
            Err(Error::Disk(msg)) => assert!(msg.contains("sfdisk")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!file.exists());

        // One MBR entry, partition type 7
        let sfdisk = &exec.invocations_of("sfdisk")[0];
        assert_eq!(sfdisk.stdin.as_deref(), Some("type=7\n"));
    }
}
