//! CPU temperature watchdog.
//!
//! The Pi sits in a parked car; dashboards have hit 80 °C+ in summer.
//! Rising-edge one-shot alerts with falling hysteresis so a temperature
//! hovering at the threshold does not spam the webhook.

use crate::config::ConfigStore;
use crate::notifier::{Event, Notifier};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(60);
const HYSTERESIS_CELSIUS: f64 = 5.0;

/// Rising-edge one-shot trigger with falling hysteresis.
///
/// Fires on the first sample at or above the threshold, then stays quiet
/// until a sample falls below threshold − hysteresis.
#[derive(Debug, Default)]
pub struct EdgeTrigger {
    fired: bool,
}

impl EdgeTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one sample; `true` exactly on a rising edge.
    pub fn observe(&mut self, value: f64, threshold: f64) -> bool {
        if value >= threshold {
            if !self.fired {
                self.fired = true;
                return true;
            }
        } else if value < threshold - HYSTERESIS_CELSIUS {
            self.fired = false;
        }
        false
    }
}

/// TemperatureMonitor instance
pub struct TemperatureMonitor {
    config: Arc<ConfigStore>,
    notifier: Arc<Notifier>,
    thermal_path: PathBuf,
    poll_interval: Duration,
}

impl TemperatureMonitor {
    pub fn new(config: Arc<ConfigStore>, notifier: Arc<Notifier>) -> Self {
        Self {
            config,
            notifier,
            thermal_path: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Poll the thermal zone until shutdown, firing `temperature_warning`
    /// and `temperature_caution` events on rising edges.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut warning = EdgeTrigger::new();
        let mut caution = EdgeTrigger::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let Some(celsius) = read_celsius(&self.thermal_path).await else {
                continue;
            };
            let cfg = self.config.get().await;

            if warning.observe(celsius, cfg.temperature.warning_celsius) {
                self.notifier
                    .send(
                        Event::new("temperature_warning", format!("{celsius:.1}C"))
                            .with_data(json!({ "celsius": celsius })),
                    )
                    .await;
            }
            if caution.observe(celsius, cfg.temperature.caution_celsius) {
                self.notifier
                    .send(
                        Event::new("temperature_caution", format!("{celsius:.1}C"))
                            .with_data(json!({ "celsius": celsius })),
                    )
                    .await;
            }
        }
    }
}

/// Current temperature in Celsius from a millidegree thermal zone file.
pub async fn read_celsius(path: &Path) -> Option<f64> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let millidegrees: i64 = raw.trim().parse().ok()?;
    Some(millidegrees as f64 / 1000.0)
}
