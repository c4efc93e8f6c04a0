//! Status LED driver over sysfs.
//!
//! The LED mirrors the orchestrator state so the device is debuggable
//! without a console: slow blink away, fast blink while arriving/archiving,
//! heartbeat when idle, off on shutdown. All writes are best-effort; a
//! headless board without LEDs must not affect the lifecycle.

use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Preferred LED names, probed in order; any LED is used as a fallback.
const LED_CANDIDATES: [&str; 3] = ["led0", "ACT", "status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    SlowBlink,
    FastBlink,
    Heartbeat,
    Off,
}

/// StatusLed instance
pub struct StatusLed {
    leds_dir: PathBuf,
    selected: RwLock<Option<PathBuf>>,
}

impl StatusLed {
    /// `leds_dir` is `/sys/class/leds` in production.
    pub fn new(leds_dir: impl Into<PathBuf>) -> Self {
        Self {
            leds_dir: leds_dir.into(),
            selected: RwLock::new(None),
        }
    }

    /// Apply `mode` to the board LED. Never fails; missing LEDs are logged
    /// once and ignored.
    pub async fn set(&self, mode: LedMode) {
        let Some(led) = self.led_path().await else {
            return;
        };
        let trigger = led.join("trigger");
        match mode {
            LedMode::SlowBlink => {
                sys_write(&trigger, "timer").await;
                sys_write(&led.join("delay_off"), "900").await;
                sys_write(&led.join("delay_on"), "100").await;
            }
            LedMode::FastBlink => {
                sys_write(&trigger, "timer").await;
                sys_write(&led.join("delay_off"), "150").await;
                sys_write(&led.join("delay_on"), "50").await;
            }
            LedMode::Heartbeat => {
                sys_write(&trigger, "heartbeat").await;
            }
            LedMode::Off => {
                sys_write(&trigger, "none").await;
                sys_write(&led.join("brightness"), "0").await;
            }
        }
    }

    async fn led_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.selected.read().await.clone() {
            return Some(path);
        }
        let discovered = self.discover().await;
        if let Some(ref path) = discovered {
            tracing::info!(led = %path.display(), "Using status LED");
            *self.selected.write().await = Some(path.clone());
        }
        discovered
    }

    async fn discover(&self) -> Option<PathBuf> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.leds_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "No LEDs found");
                return None;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        for candidate in LED_CANDIDATES {
            if let Some(name) = names.iter().find(|n| n.contains(candidate)) {
                return Some(self.leds_dir.join(name));
            }
        }
        names.first().map(|n| self.leds_dir.join(n))
    }
}

async fn sys_write(path: &Path, value: &str) {
    if let Err(e) = tokio::fs::write(path, value).await {
        tracing::debug!(path = %path.display(), error = %e, "LED sysfs write failed");
    }
}
