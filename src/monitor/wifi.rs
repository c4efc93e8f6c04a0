//! WiFi driver watchdog.
//!
//! The Pi's brcmfmac driver occasionally wedges after power glitches and
//! only a module reload brings the interface back. The watchdog tails the
//! kernel log and reloads the module when the known failure signatures
//! appear. Messages already buffered when tailing begins are skipped so a
//! crash from a previous boot does not trigger a spurious reload.

use crate::exec::Exec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const BOOT_GRACE: Duration = Duration::from_secs(30);
const REPLAY_SKIP: Duration = Duration::from_secs(5);

const FAULT_SIGNATURES: [&str; 2] = ["failed to enable fw supplicant", "brcmf_fw_alloc_request"];

/// `true` for kernel log lines indicating a wedged brcmfmac driver
pub fn is_wifi_fault_line(line: &str) -> bool {
    FAULT_SIGNATURES.iter().any(|sig| line.contains(sig))
}

/// WifiMonitor instance
pub struct WifiMonitor {
    exec: Arc<dyn Exec>,
    boot_grace: Duration,
    replay_skip: Duration,
}

impl WifiMonitor {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Self {
            exec,
            boot_grace: BOOT_GRACE,
            replay_skip: REPLAY_SKIP,
        }
    }

    #[cfg(test)]
    pub(crate) fn without_grace(exec: Arc<dyn Exec>) -> Self {
        Self {
            exec,
            boot_grace: Duration::ZERO,
            replay_skip: Duration::ZERO,
        }
    }

    /// Tail `dmesg -w` until shutdown, reloading brcmfmac on fault lines.
    pub async fn run(&self, shutdown: CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.boot_grace) => {}
        }

        let mut stream = match self.exec.stream_lines("dmesg", &["-w"]).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "WiFi monitor could not tail kernel log");
                return;
            }
        };

        // dmesg -w replays the existing buffer first
        let started = Instant::now();

        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => return,
                line = stream.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if started.elapsed() < self.replay_skip {
                        continue;
                    }
                    if is_wifi_fault_line(&line) {
                        tracing::warn!(line = %line, "WiFi driver crash detected, reloading brcmfmac");
                        self.reload_driver().await;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "Kernel log tail ended");
                    return;
                }
            }
        }
    }

    async fn reload_driver(&self) {
        let _ = self.exec.run("modprobe", &["-r", "brcmfmac"]).await;
        let _ = self.exec.run("modprobe", &["brcmfmac"]).await;
        tracing::info!("brcmfmac reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::script::ScriptedExec;

    #[test]
    fn test_fault_line_signatures() {
        assert!(is_wifi_fault_line(
            "[  42.1] brcmfmac: brcmf_cfg80211_attach: failed to enable fw supplicant"
        ));
        assert!(is_wifi_fault_line("[ 9.8] brcmf_fw_alloc_request: unable to load"));
        assert!(!is_wifi_fault_line("[ 1.0] brcmfmac: firmware loaded"));
        assert!(!is_wifi_fault_line("random kernel chatter"));
    }

    #[tokio::test]
    async fn test_fault_line_triggers_reload() {
        let exec = Arc::new(ScriptedExec::new());
        exec.set_lines(
            "dmesg",
            vec![
                "[ 50.0] usb 1-1: new high-speed USB device",
                "[ 51.2] brcmfmac: failed to enable fw supplicant",
            ],
        );

        WifiMonitor::without_grace(exec.clone())
            .run(CancellationToken::new())
            .await;

        let modprobes: Vec<_> = exec
            .invocations_of("modprobe")
            .iter()
            .map(|i| i.arg_line())
            .collect();
        assert_eq!(modprobes, vec!["-r brcmfmac", "brcmfmac"]);
    }

    #[tokio::test]
    async fn test_quiet_log_never_reloads() {
        let exec = Arc::new(ScriptedExec::new());
        exec.set_lines("dmesg", vec!["[ 50.0] wlan0: associated"]);
        WifiMonitor::without_grace(exec.clone())
            .run(CancellationToken::new())
            .await;
        assert!(exec.invocations_of("modprobe").is_empty());
    }

    #[tokio::test]
    async fn test_missing_dmesg_is_tolerated() {
        let exec = Arc::new(ScriptedExec::new());
        WifiMonitor::without_grace(exec)
            .run(CancellationToken::new())
            .await;
    }
}
