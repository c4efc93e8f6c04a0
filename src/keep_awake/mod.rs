//! Keep-awake signalling to the car.
//!
//! A long archive pass dies half-way if the car falls asleep and cuts USB
//! power. Two drivers, chosen by configuration: BLE talks to the vehicle
//! directly via `tesla-control`, the webhook driver posts to an external
//! integration (e.g. a TeslaMate bridge).
//!
//! Keep-awake is advisory: failures are logged, never propagated, and the
//! archive pass continues regardless.

mod ble;

pub use ble::BleDriver;

use crate::config::{ConfigStore, KeepAwakeMethod};
use crate::notifier;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Commands understood by both drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwakeCommand {
    /// Archive pass begins, keep the car awake
    Start,
    /// Periodic refresh during a long pass
    Nudge,
    /// Archive done; for BLE this also turns Sentry off to cut drain
    Stop,
}

impl AwakeCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            AwakeCommand::Start => "start",
            AwakeCommand::Nudge => "nudge",
            AwakeCommand::Stop => "stop",
        }
    }
}

/// KeepAwake dispatcher
pub struct KeepAwake {
    config: Arc<ConfigStore>,
    ble: BleDriver,
    client: reqwest::Client,
}

impl KeepAwake {
    pub fn new(config: Arc<ConfigStore>, ble: BleDriver) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            config,
            ble,
            client,
        }
    }

    /// Route `command` to the configured driver. No-op when keep-awake is
    /// not configured.
    pub async fn send(&self, command: AwakeCommand) {
        let cfg = self.config.get().await;
        match cfg.keep_awake.method {
            Some(KeepAwakeMethod::Ble) if !cfg.keep_awake.vin.is_empty() => {
                let result = match command {
                    AwakeCommand::Stop => self.ble.sentry_off(&cfg.keep_awake.vin).await,
                    _ => self.ble.keep_awake(&cfg.keep_awake.vin).await,
                };
                if let Err(e) = result {
                    tracing::warn!(command = %command.as_str(), error = %e, "BLE keep-awake failed");
                }
            }
            Some(KeepAwakeMethod::Webhook) if !cfg.keep_awake.webhook_url.is_empty() => {
                let payload = json!({ "awake_command": command.as_str() });
                if let Err(e) = notifier::post_json(
                    &self.client,
                    &cfg.keep_awake.webhook_url,
                    &payload,
                )
                .await
                {
                    tracing::warn!(command = %command.as_str(), error = %e, "Keep-awake webhook failed");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, KeepAwakeConfig};
    use crate::exec::script::ScriptedExec;

    async fn store_with(keep_awake: KeepAwakeConfig) -> Arc<ConfigStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.yaml"));
        store
            .save(Config {
                keep_awake,
                ..Config::default()
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_unconfigured_is_noop() {
        let exec = Arc::new(ScriptedExec::new());
        let config = store_with(KeepAwakeConfig::default()).await;
        let ka = KeepAwake::new(config, BleDriver::new(exec.clone()));
        ka.send(AwakeCommand::Start).await;
        assert!(exec.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_ble_start_wakes_and_stop_disables_sentry() {
        let exec = Arc::new(ScriptedExec::new());
        let config = store_with(KeepAwakeConfig {
            method: Some(KeepAwakeMethod::Ble),
            vin: "5yj3e1ea7kf000000".into(),
            webhook_url: String::new(),
        })
        .await;
        let ka = KeepAwake::new(config, BleDriver::new(exec.clone()));

        ka.send(AwakeCommand::Start).await;
        let wake = &exec.invocations_of("tesla-control")[0];
        assert!(wake.args.contains(&"charge-port-close".to_string()));
        // VIN is normalized to upper case for the vehicle command SDK
        assert!(wake.args.contains(&"5YJ3E1EA7KF000000".to_string()));

        ka.send(AwakeCommand::Stop).await;
        let stop = exec.invocations_of("tesla-control").pop().unwrap();
        assert!(stop.arg_line().contains("sentry-mode off"));
    }
}
