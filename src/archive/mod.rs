//! Archive transport - moving clips to the network share.
//!
//! ## Responsibilities
//!
//! - Probe whether the share's server is reachable (the "car is home"
//!   signal the orchestrator polls)
//! - Mount the NFS export or SMB share
//! - Copy clip directories with rsync, removing sources on success
//! - Keep local free space above the reserve (freespace.rs)
//!
//! rsync exit 24 (source files vanished) is tolerated: the car rotates
//! RecentClips while we copy.

mod freespace;

use crate::config::{ArchiveMethod, ConfigStore};
use crate::error::{Error, Result};
use crate::exec::Exec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use walkdir::WalkDir;

/// Default archive mount point
pub const ARCHIVE_MOUNT: &str = "/mnt/archive";

const NFS_PORT: u16 = 2049;
const SMB_PORT: u16 = 445;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// SMB dialects tried in order until one mounts
const SMB_VERSIONS: [&str; 3] = ["3.0", "2.1", "2.0"];

/// rsync: "some source files vanished before they could be transferred"
const RSYNC_VANISHED: i32 = 24;

const SAVED_CLIPS: &str = "TeslaCam/SavedClips";
const SENTRY_CLIPS: &str = "TeslaCam/SentryClips";
const RECENT_CLIPS: &str = "TeslaCam/RecentClips";

/// Result of one archive pass
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveRun {
    pub clips: u64,
    pub bytes: u64,
}

/// ArchiveTransport instance
pub struct ArchiveTransport {
    exec: Arc<dyn Exec>,
    config: Arc<ConfigStore>,
    cam_mount: PathBuf,
    archive_mount: PathBuf,
    pub(crate) nfs_port: u16,
    pub(crate) smb_port: u16,
    probe_timeout: Duration,
}

impl ArchiveTransport {
    pub fn new(
        exec: Arc<dyn Exec>,
        config: Arc<ConfigStore>,
        cam_mount: impl Into<PathBuf>,
        archive_mount: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exec,
            config,
            cam_mount: cam_mount.into(),
            archive_mount: archive_mount.into(),
            nfs_port: NFS_PORT,
            smb_port: SMB_PORT,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    /// TCP-probe the configured share server. `false` when no server is
    /// configured, unresolvable, or the port does not answer in time.
    pub async fn is_reachable(&self) -> bool {
        let cfg = self.config.get().await;
        let (server, port) = match cfg.archive.method {
            ArchiveMethod::Nfs => (cfg.nfs.server.clone(), self.nfs_port),
            ArchiveMethod::Cifs => (cfg.cifs.server.clone(), self.smb_port),
        };
        if server.is_empty() {
            return false;
        }
        let addr = format!("{server}:{port}");
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    /// Mount the configured share at the archive mount point.
    pub async fn mount_archive(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.archive_mount).await?;
        let cfg = self.config.get().await;
        match cfg.archive.method {
            ArchiveMethod::Nfs => self.mount_nfs(&cfg.nfs.server, &cfg.nfs.share).await,
            ArchiveMethod::Cifs => {
                self.mount_cifs(
                    &cfg.cifs.server,
                    &cfg.cifs.share,
                    &cfg.cifs.username,
                    &cfg.cifs.password,
                )
                .await
            }
        }
    }

    async fn mount_nfs(&self, server: &str, share: &str) -> Result<()> {
        if server.is_empty() {
            return Err(Error::Archive("NFS server not configured".to_string()));
        }
        let source = format!("{server}:{share}");
        let target = self.archive_mount.to_string_lossy();
        let out = self
            .exec
            .run(
                "mount",
                &[
                    "-t",
                    "nfs",
                    &source,
                    target.as_ref(),
                    "-o",
                    "rw,noauto,nolock,proto=tcp,vers=3",
                ],
            )
            .await?;
        if !out.success() {
            return Err(Error::Archive(format!("mount NFS {source}: {}", out.combined())));
        }
        tracing::info!(source = %source, "NFS mounted");
        Ok(())
    }

    /// SMB servers differ in dialect support; walk down from 3.0 until one
    /// mounts.
    async fn mount_cifs(
        &self,
        server: &str,
        share: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        if server.is_empty() {
            return Err(Error::Archive("SMB server not configured".to_string()));
        }
        let source = format!("//{server}/{share}");
        let target = self.archive_mount.to_string_lossy();
        for version in SMB_VERSIONS {
            let options = format!(
                "username={username},password={password},iocharset=utf8,file_mode=0777,dir_mode=0777,vers={version}"
            );
            let out = self
                .exec
                .run("mount", &["-t", "cifs", &source, target.as_ref(), "-o", &options])
                .await?;
            if out.success() {
                tracing::info!(source = %source, version = %version, "SMB mounted");
                return Ok(());
            }
            tracing::warn!(
                source = %source,
                version = %version,
                output = %out.combined(),
                "SMB mount failed, trying older dialect"
            );
        }
        Err(Error::Archive(format!(
            "mount SMB {source}: no dialect accepted"
        )))
    }

    /// Force-lazy unmount of the share; best-effort.
    pub async fn unmount_archive(&self) {
        let target = self.archive_mount.to_string_lossy();
        let _ = self.exec.run("umount", &["-f", "-l", target.as_ref()]).await;
        tracing::info!("Archive share unmounted");
    }

    /// Copy clip directories to the share with rsync, removing sources on
    /// success, and prune now-empty source subdirectories.
    pub async fn archive_clips(&self) -> Result<ArchiveRun> {
        let cfg = self.config.get().await;
        let mut clip_dirs = vec![SAVED_CLIPS, SENTRY_CLIPS];
        if cfg.archive.recent_clips {
            clip_dirs.push(RECENT_CLIPS);
        }

        let mut totals = ArchiveRun::default();
        for dir in &clip_dirs {
            let src = self.cam_mount.join(dir);
            if !has_entries(&src).await {
                continue;
            }

            let dst = self.archive_mount.join(dir);
            tokio::fs::create_dir_all(&dst).await?;
            tracing::info!(dir = %dir, "Archiving clips");

            let src_arg = format!("{}/", src.display());
            let dst_arg = format!("{}/", dst.display());
            let out = self
                .exec
                .run(
                    "rsync",
                    &[
                        "-avhL",
                        "--no-o",
                        "--no-g",
                        "--no-perms",
                        "--omit-dir-times",
                        "--remove-source-files",
                        &src_arg,
                        &dst_arg,
                    ],
                )
                .await?;
            match out.code {
                Some(0) => {}
                Some(RSYNC_VANISHED) => {
                    tracing::warn!(dir = %dir, "rsync: some source files vanished mid-copy")
                }
                code => {
                    return Err(Error::Archive(format!(
                        "rsync {dir}: exit {code:?}: {}",
                        out.combined()
                    )));
                }
            }

            let (clips, bytes) = count_clips(&dst);
            totals.clips += clips;
            totals.bytes += bytes;
        }

        for dir in &clip_dirs {
            remove_empty_dirs(&self.cam_mount.join(dir));
        }

        Ok(totals)
    }
}

async fn has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

/// Regular files and their total bytes under `dir`, recursively.
fn count_clips(dir: &Path) -> (u64, u64) {
    let mut clips = 0;
    let mut bytes = 0;
    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        clips += 1;
        bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
    }
    (clips, bytes)
}

/// Remove empty subdirectories bottom-up; `root` itself stays.
fn remove_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.path() != root)
    {
        // Fails on non-empty directories, which is exactly the filter we want
        let _ = std::fs::remove_dir(entry.path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CifsConfig, Config, NfsConfig};
    use crate::exec::script::ScriptedExec;

    async fn store_with(config: Config) -> Arc<ConfigStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.yaml"));
        store.save(config).await.unwrap();
        Arc::new(store)
    }

    fn transport(
        exec: Arc<ScriptedExec>,
        config: Arc<ConfigStore>,
        cam: &Path,
        archive: &Path,
    ) -> ArchiveTransport {
        ArchiveTransport::new(exec, config, cam, archive)
    }

    #[tokio::test]
    async fn test_unreachable_without_server() {
        let dir = tempfile::tempdir().unwrap();
        let config = store_with(Config::default()).await;
        let t = transport(
            Arc::new(ScriptedExec::new()),
            config,
            dir.path(),
            dir.path(),
        );
        assert!(!t.is_reachable().await);
    }

    #[tokio::test]
    async fn test_reachable_probes_configured_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.nfs = NfsConfig {
            server: "127.0.0.1".into(),
            share: "/export".into(),
        };
        let config = store_with(cfg).await;
        let mut t = transport(
            Arc::new(ScriptedExec::new()),
            config,
            dir.path(),
            dir.path(),
        );
        t.nfs_port = port;
        assert!(t.is_reachable().await);

        drop(listener);
        assert!(!t.is_reachable().await);
    }

    #[tokio::test]
    async fn test_cifs_mount_negotiates_versions() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.archive.method = ArchiveMethod::Cifs;
        cfg.cifs = CifsConfig {
            server: "nas.local".into(),
            share: "tesla".into(),
            username: "cam".into(),
            password: "pw".into(),
        };
        let config = store_with(cfg).await;

        let exec = Arc::new(ScriptedExec::new());
        exec.on_failure("mount", 32, "mount error(95)");
        exec.on_failure("mount", 32, "mount error(95)");
        exec.on_stdout("mount", "");

        let t = transport(exec.clone(), config, dir.path(), &dir.path().join("archive"));
        t.mount_archive().await.unwrap();

        let mounts = exec.invocations_of("mount");
        assert_eq!(mounts.len(), 3);
        assert!(mounts[0].arg_line().contains("vers=3.0"));
        assert!(mounts[1].arg_line().contains("vers=2.1"));
        assert!(mounts[2].arg_line().contains("vers=2.0"));
        assert!(mounts[0].arg_line().contains("//nas.local/tesla"));
        assert!(mounts[0].arg_line().contains("username=cam,password=pw"));
    }

    #[tokio::test]
    async fn test_cifs_mount_fails_when_no_dialect_works() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.archive.method = ArchiveMethod::Cifs;
        cfg.cifs.server = "nas.local".into();
        let config = store_with(cfg).await;

        let exec = Arc::new(ScriptedExec::new());
        for _ in 0..3 {
            exec.on_failure("mount", 32, "mount error(95)");
        }
        let t = transport(exec, config, dir.path(), &dir.path().join("archive"));
        assert!(matches!(
            t.mount_archive().await,
            Err(Error::Archive(msg)) if msg.contains("no dialect")
        ));
    }

    #[tokio::test]
    async fn test_nfs_mount_options() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.nfs = NfsConfig {
            server: "10.0.0.5".into(),
            share: "/export/tesla".into(),
        };
        let config = store_with(cfg).await;

        let exec = Arc::new(ScriptedExec::new());
        let t = transport(exec.clone(), config, dir.path(), &dir.path().join("archive"));
        t.mount_archive().await.unwrap();

        let mount = &exec.invocations_of("mount")[0];
        assert!(mount.args.contains(&"10.0.0.5:/export/tesla".to_string()));
        assert!(mount
            .args
            .contains(&"rw,noauto,nolock,proto=tcp,vers=3".to_string()));
    }

    #[tokio::test]
    async fn test_archive_skips_absent_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cam = dir.path().join("cam");
        tokio::fs::create_dir_all(cam.join(SENTRY_CLIPS)).await.unwrap();

        let mut cfg = Config::default();
        cfg.nfs.server = "10.0.0.5".into();
        let config = store_with(cfg).await;

        let exec = Arc::new(ScriptedExec::new());
        let t = transport(exec.clone(), config, &cam, &dir.path().join("archive"));
        let run = t.archive_clips().await.unwrap();

        assert_eq!(run.clips, 0);
        assert!(exec.invocations_of("rsync").is_empty());
    }

    #[tokio::test]
    async fn test_archive_tolerates_vanished_sources() {
        let dir = tempfile::tempdir().unwrap();
        let cam = dir.path().join("cam");
        let saved = cam.join(SAVED_CLIPS);
        tokio::fs::create_dir_all(&saved).await.unwrap();
        tokio::fs::write(saved.join("a.mp4"), b"x").await.unwrap();

        let config = store_with(Config::default()).await;
        let exec = Arc::new(ScriptedExec::new());
        exec.on_failure("rsync", RSYNC_VANISHED, "file has vanished");

        let t = transport(exec.clone(), config, &cam, &dir.path().join("archive"));
        t.archive_clips().await.unwrap();

        let rsync = &exec.invocations_of("rsync")[0];
        assert!(rsync.args.contains(&"--remove-source-files".to_string()));
        assert!(rsync.args.contains(&"-avhL".to_string()));
    }

    #[tokio::test]
    async fn test_archive_aborts_on_real_rsync_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cam = dir.path().join("cam");
        let saved = cam.join(SAVED_CLIPS);
        tokio::fs::create_dir_all(&saved).await.unwrap();
        tokio::fs::write(saved.join("a.mp4"), b"x").await.unwrap();

        let config = store_with(Config::default()).await;
        let exec = Arc::new(ScriptedExec::new());
        exec.on_failure("rsync", 1, "rsync: connection unexpectedly closed");

        let t = transport(exec, config, &cam, &dir.path().join("archive"));
        assert!(matches!(
            t.archive_clips().await,
            Err(Error::Archive(msg)) if msg.contains("exit Some(1)")
        ));
    }

    #[tokio::test]
    async fn test_archive_surfaces_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let cam = dir.path().join("cam");
        let saved = cam.join(SAVED_CLIPS);
        tokio::fs::create_dir_all(&saved).await.unwrap();
        tokio::fs::write(saved.join("a.mp4"), b"x").await.unwrap();

        let config = store_with(Config::default()).await;
        let exec = Arc::new(ScriptedExec::new());
        exec.on("rsync", Err(Error::Cancelled));

        let t = transport(exec, config, &cam, &dir.path().join("archive"));
        assert!(matches!(t.archive_clips().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_archive_counts_destination_files() {
        let dir = tempfile::tempdir().unwrap();
        let cam = dir.path().join("cam");
        let archive = dir.path().join("archive");
        tokio::fs::create_dir_all(cam.join(SAVED_CLIPS)).await.unwrap();
        tokio::fs::write(cam.join(SAVED_CLIPS).join("a.mp4"), b"x")
            .await
            .unwrap();
        // Pre-seeded destination stands in for what rsync copied over
        let dst = archive.join(SAVED_CLIPS).join("2024-05-01_12-00");
        tokio::fs::create_dir_all(&dst).await.unwrap();
        tokio::fs::write(dst.join("front.mp4"), vec![0u8; 1000]).await.unwrap();
        tokio::fs::write(dst.join("rear.mp4"), vec![0u8; 2000]).await.unwrap();

        let config = store_with(Config::default()).await;
        let t = transport(Arc::new(ScriptedExec::new()), config, &cam, &archive);
        let run = t.archive_clips().await.unwrap();
        assert_eq!(run.clips, 2);
        assert_eq!(run.bytes, 3000);
    }

    #[tokio::test]
    async fn test_empty_source_subdirs_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let cam = dir.path().join("cam");
        let saved = cam.join(SAVED_CLIPS);
        let event = saved.join("2024-05-01_12-00");
        tokio::fs::create_dir_all(&event).await.unwrap();
        let keep = saved.join("2024-05-02_09-30");
        tokio::fs::create_dir_all(&keep).await.unwrap();
        tokio::fs::write(keep.join("left.mp4"), b"x").await.unwrap();

        let config = store_with(Config::default()).await;
        let t = transport(
            Arc::new(ScriptedExec::new()),
            config,
            &cam,
            &dir.path().join("archive"),
        );
        t.archive_clips().await.unwrap();

        assert!(!event.exists());
        assert!(keep.exists());
        assert!(saved.exists());
    }

    #[tokio::test]
    async fn test_recent_clips_follow_config_flag() {
        let dir = tempfile::tempdir().unwrap();
        let cam = dir.path().join("cam");
        let recent = cam.join(RECENT_CLIPS);
        tokio::fs::create_dir_all(&recent).await.unwrap();
        tokio::fs::write(recent.join("r.mp4"), b"x").await.unwrap();

        let mut cfg = Config::default();
        cfg.archive.recent_clips = true;
        let config = store_with(cfg).await;
        let exec = Arc::new(ScriptedExec::new());
        let t = transport(exec.clone(), config, &cam, &dir.path().join("archive"));
        t.archive_clips().await.unwrap();
        assert_eq!(exec.invocations_of("rsync").len(), 1);
    }
}
