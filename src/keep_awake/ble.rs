//! BLE driver for direct vehicle commands via `tesla-control`.
//!
//! The vehicle command SDK needs exclusive HCI access, which bluetoothd
//! normally holds, so every command runs inside a scoped acquisition:
//! bluetoothd is stopped on entry and restarted on every exit path.
//!
//! Commands retry up to three times with a backoff. One failure is special:
//! the car refuses BLE commands while a USB cable is connected, which is
//! exactly the condition under which keep-awake is unnecessary, so "cable
//! connected" output short-circuits to success.

use crate::error::{Error, Result};
use crate::exec::Exec;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Key pair location; the directory is private to the daemon
pub const KEY_DIR: &str = "/mutable/ble";
pub const PRIVATE_KEY: &str = "/mutable/ble/key_private.pem";
pub const PUBLIC_KEY: &str = "/mutable/ble/key_public.pem";

const BLE_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// BleDriver instance
pub struct BleDriver {
    exec: Arc<dyn Exec>,
    key_dir: PathBuf,
    private_key: PathBuf,
    public_key: PathBuf,
    pub(crate) retry_delay: Duration,
}

impl BleDriver {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Self {
            exec,
            key_dir: PathBuf::from(KEY_DIR),
            private_key: PathBuf::from(PRIVATE_KEY),
            public_key: PathBuf::from(PUBLIC_KEY),
            retry_delay: RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_key_dir(exec: Arc<dyn Exec>, key_dir: impl Into<PathBuf>) -> Self {
        let key_dir = key_dir.into();
        let mut driver = Self::new(exec);
        driver.private_key = key_dir.join("key_private.pem");
        driver.public_key = key_dir.join("key_public.pem");
        driver.key_dir = key_dir;
        driver.retry_delay = Duration::from_millis(1);
        driver
    }

    pub fn keys_exist(&self) -> bool {
        self.private_key.exists() && self.public_key.exists()
    }

    /// Generate the long-lived key pair with `tesla-keygen`.
    pub async fn generate_keys(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.key_dir).await?;
        set_mode(&self.key_dir, 0o700)?;

        let private = self.private_key.to_string_lossy();
        let public = self.public_key.to_string_lossy();
        let out = self
            .exec
            .run(
                "tesla-keygen",
                &["-key-file", private.as_ref(), "-output", public.as_ref(), "create"],
            )
            .await?;
        if !out.success() {
            return Err(Error::Ble(format!("keygen: {}", out.combined())));
        }
        set_mode(&self.private_key, 0o600)?;
        set_mode(&self.public_key, 0o644)?;
        tracing::info!("BLE key pair generated");
        Ok(())
    }

    /// Send the pairing request; the user must tap their NFC card on the
    /// center console to approve it.
    pub async fn pair(&self, vin: &str) -> Result<()> {
        if !self.keys_exist() {
            self.generate_keys().await?;
        }

        self.acquire_hci().await;
        let public = self.public_key.to_string_lossy();
        let result = self
            .exec
            .run(
                "tesla-control",
                &[
                    "-ble",
                    "-vin",
                    &vin.to_uppercase(),
                    "add-key-request",
                    public.as_ref(),
                    "owner",
                    "cloud_key",
                ],
            )
            .await;
        self.release_hci().await;

        let out = result?;
        if !out.success() {
            return Err(Error::Ble(format!("pair: {}", out.combined())));
        }
        tracing::info!("BLE pairing request sent, tap NFC card on center console");
        Ok(())
    }

    /// Whether the car accepts our key (body-controller-state probe).
    pub async fn is_paired(&self, vin: &str) -> bool {
        self.acquire_hci().await;
        let private = self.private_key.to_string_lossy();
        let result = self
            .exec
            .run(
                "tesla-control",
                &[
                    "-ble",
                    "-key-file",
                    private.as_ref(),
                    "-vin",
                    &vin.to_uppercase(),
                    "body-controller-state",
                ],
            )
            .await;
        self.release_hci().await;
        matches!(result, Ok(out) if out.success())
    }

    /// Wake the car with a harmless command.
    pub async fn keep_awake(&self, vin: &str) -> Result<()> {
        self.run_command(vin, &["charge-port-close"]).await
    }

    pub async fn sentry_on(&self, vin: &str) -> Result<()> {
        self.run_command(vin, &["sentry-mode", "on"]).await
    }

    pub async fn sentry_off(&self, vin: &str) -> Result<()> {
        self.run_command(vin, &["sentry-mode", "off"]).await
    }

    async fn run_command(&self, vin: &str, args: &[&str]) -> Result<()> {
        self.acquire_hci().await;
        let result = self.attempt_command(vin, args).await;
        self.release_hci().await;
        result
    }

    async fn attempt_command(&self, vin: &str, args: &[&str]) -> Result<()> {
        let private = self.private_key.to_string_lossy();
        let vin = vin.to_uppercase();
        let mut full_args: Vec<&str> = vec!["-ble", "-key-file", private.as_ref(), "-vin", &vin];
        full_args.extend_from_slice(args);

        for attempt in 1..=BLE_ATTEMPTS {
            match self.exec.run("tesla-control", &full_args).await {
                Ok(out) if out.success() => return Ok(()),
                Ok(out) => {
                    let combined = out.combined();
                    if combined.contains("cable connected") {
                        tracing::info!(
                            "BLE skipped: car has USB cable connected, keep-awake not needed"
                        );
                        return Ok(());
                    }
                    tracing::warn!(
                        attempt = attempt,
                        attempts = BLE_ATTEMPTS,
                        output = %combined,
                        "BLE command failed"
                    );
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "BLE command failed");
                }
            }
            if attempt < BLE_ATTEMPTS {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(Error::Ble(format!(
            "command failed after {BLE_ATTEMPTS} attempts: {args:?}"
        )))
    }

    /// Stop bluetoothd so tesla-control gets exclusive HCI access.
    async fn acquire_hci(&self) {
        let _ = self.exec.run("systemctl", &["stop", "bluetooth"]).await;
        let _ = self.exec.run("rfkill", &["unblock", "bluetooth"]).await;
        let _ = self.exec.run("hciconfig", &["hci0", "up"]).await;
    }

    async fn release_hci(&self) {
        let _ = self.exec.run("systemctl", &["start", "bluetooth"]).await;
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}
