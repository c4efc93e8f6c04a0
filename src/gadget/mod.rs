//! USB mass-storage gadget lifecycle over configfs.
//!
//! ## Responsibilities
//!
//! - Compose the gadget descriptor tree and bind it to the UDC so the car
//!   sees a USB drive backed by the cam image
//! - Tear the descriptor down again before the image is mounted locally
//! - Detect write-idle so the unbind never races the car mid-flush
//!
//! The descriptor exists exactly while the function is bound; enable and
//! disable are inverses and disable is safe to call on a half-built tree.

mod idle;

pub use idle::IdleDetector;

use crate::error::{Error, Result};
use crate::exec::Exec;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const GADGET_NAME: &str = "teslausb";
const CONFIGFS_FALLBACK: &str = "/sys/kernel/config";

/// Fixed composite-device identity (Linux Foundation multifunction gadget)
const USB_IDS: [(&str, &str); 4] = [
    ("idVendor", "0x1d6b"),
    ("idProduct", "0x0104"),
    ("bcdDevice", "0x0100"),
    ("bcdUSB", "0x0200"),
];

/// Gadget instance
pub struct Gadget {
    exec: Arc<dyn Exec>,
    configfs: RwLock<Option<PathBuf>>,
    udc_dir: PathBuf,
    machine_id_path: PathBuf,
    device_model_path: PathBuf,
    pub(crate) proc_root: PathBuf,
    pub(crate) idle_sample_interval: Duration,
    pub(crate) idle_write_threshold: i64,
    pub(crate) idle_max_samples: u32,
}

impl Gadget {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Self {
            exec,
            configfs: RwLock::new(None),
            udc_dir: PathBuf::from("/sys/class/udc"),
            machine_id_path: PathBuf::from("/etc/machine-id"),
            device_model_path: PathBuf::from("/proc/device-tree/model"),
            proc_root: PathBuf::from("/proc"),
            idle_sample_interval: Duration::from_secs(1),
            idle_write_threshold: idle::IDLE_WRITE_THRESHOLD,
            idle_max_samples: idle::IDLE_MAX_SAMPLES,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_sys_roots(
        exec: Arc<dyn Exec>,
        udc_dir: impl Into<PathBuf>,
        machine_id_path: impl Into<PathBuf>,
        device_model_path: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
    ) -> Self {
        let mut gadget = Self::new(exec);
        gadget.udc_dir = udc_dir.into();
        gadget.machine_id_path = machine_id_path.into();
        gadget.device_model_path = device_model_path.into();
        gadget.proc_root = proc_root.into();
        gadget
    }

    /// Build the descriptor tree pointing at `backing_file` and bind it to
    /// the first available UDC.
    pub async fn enable(&self, backing_file: &Path) -> Result<()> {
        // A distro g_ether placeholder would hold the UDC
        let _ = self.exec.run("modprobe", &["-r", "g_ether"]).await;

        let out = self.exec.run("modprobe", &["libcomposite"]).await?;
        if !out.success() {
            return Err(Error::Gadget(format!(
                "modprobe libcomposite: {}",
                out.combined()
            )));
        }

        let root = self.gadget_root().await?;
        // The kernel pre-creates lun.0 under the function; create_dir_all
        // tolerates that
        for dir in [
            root.clone(),
            root.join("strings/0x409"),
            root.join("configs/c.1"),
            root.join("configs/c.1/strings/0x409"),
            root.join("functions/mass_storage.0"),
            root.join("functions/mass_storage.0/lun.0"),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::Gadget(format!("mkdir {}: {e}", dir.display())))?;
        }

        for (attr, value) in USB_IDS {
            write_attr(&root.join(attr), value).await?;
        }

        let serial = serial_number(&self.machine_id_path).await;
        write_attr(&root.join("strings/0x409/serialnumber"), &serial).await?;
        write_attr(&root.join("strings/0x409/manufacturer"), "teslausb").await?;
        write_attr(
            &root.join("strings/0x409/product"),
            "TeslaUSB Composite Gadget",
        )
        .await?;
        write_attr(
            &root.join("configs/c.1/strings/0x409/configuration"),
            "TeslaUSB Config",
        )
        .await?;

        let max_power = max_power(&self.device_model_path).await;
        write_attr(&root.join("configs/c.1/MaxPower"), max_power).await?;

        write_attr(
            &root.join("functions/mass_storage.0/lun.0/file"),
            &backing_file.to_string_lossy(),
        )
        .await?;

        let link = root.join("configs/c.1/mass_storage.0");
        let _ = tokio::fs::remove_file(&link).await;
        tokio::fs::symlink(root.join("functions/mass_storage.0"), &link)
            .await
            .map_err(|e| Error::Gadget(format!("function symlink: {e}")))?;

        let udc = self
            .first_udc()
            .await
            .ok_or_else(|| Error::Gadget("no UDC found".to_string()))?;
        write_attr(&root.join("UDC"), &udc).await?;

        tracing::info!(
            backing_file = %backing_file.display(),
            udc = %udc,
            "USB gadget enabled"
        );
        Ok(())
    }

    /// Unbind from the UDC and remove the descriptor tree. Safe on a
    /// half-built or already-removed gadget.
    pub async fn disable(&self) -> Result<()> {
        let root = self.gadget_root().await?;

        let _ = tokio::fs::write(root.join("UDC"), "").await;
        let _ = tokio::fs::remove_file(root.join("configs/c.1/mass_storage.0")).await;

        for dir in [
            root.join("configs/c.1/strings/0x409"),
            root.join("configs/c.1"),
            root.join("functions/mass_storage.0"),
            root.join("strings/0x409"),
            root,
        ] {
            let _ = tokio::fs::remove_dir(dir).await;
        }

        for module in ["usb_f_mass_storage", "libcomposite"] {
            let _ = self.exec.run("modprobe", &["-r", module]).await;
        }

        tracing::info!("USB gadget disabled");
        Ok(())
    }

    async fn gadget_root(&self) -> Result<PathBuf> {
        if let Some(root) = self.configfs.read().await.clone() {
            return Ok(root.join("usb_gadget").join(GADGET_NAME));
        }
        let configfs = match self
            .exec
            .run("findmnt", &["-o", "TARGET", "-n", "configfs"])
            .await
        {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
                PathBuf::from(out.stdout.trim())
            }
            _ => PathBuf::from(CONFIGFS_FALLBACK),
        };
        *self.configfs.write().await = Some(configfs.clone());
        Ok(configfs.join("usb_gadget").join(GADGET_NAME))
    }

    async fn first_udc(&self) -> Option<String> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.udc_dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names.into_iter().next()
    }
}

async fn write_attr(path: &Path, value: &str) -> Result<()> {
    tokio::fs::write(path, value)
        .await
        .map_err(|e| Error::Gadget(format!("write {}: {e}", path.display())))
}

/// `TeslaUSB-<first 8 bytes of SHA-256(machine-id)>`
async fn serial_number(machine_id_path: &Path) -> String {
    match tokio::fs::read(machine_id_path).await {
        Ok(data) => {
            let digest = Sha256::digest(&data);
            let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
            format!("TeslaUSB-{hex}")
        }
        Err(_) => "TeslaUSB-unknown".to_string(),
    }
}

/// Bus power request in mA, derived from the host board model
async fn max_power(model_path: &Path) -> &'static str {
    let model = tokio::fs::read_to_string(model_path)
        .await
        .unwrap_or_default();
    if model.contains("Pi 5") {
        "600"
    } else if model.contains("Pi 4") {
        "500"
    } else if model.contains("Pi Zero 2") {
        "200"
    } else {
        "100"
    }
}
