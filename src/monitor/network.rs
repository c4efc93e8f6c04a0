//! WiFi network status for state snapshots.

use crate::exec::Exec;
use serde::Serialize;
use std::path::Path;

/// Kernel WiFi statistics table
pub const PROC_WIRELESS: &str = "/proc/net/wireless";

/// Current WiFi association, signal and address
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkInfo {
    pub wifi_ssid: String,
    pub wifi_signal_dbm: i32,
    pub wifi_ip: String,
}

/// Gather WiFi status from `iwgetid`, `/proc/net/wireless` and `ip`.
/// Everything is best-effort; absent tools leave fields empty.
pub async fn network_info(exec: &dyn Exec, proc_wireless: &Path) -> NetworkInfo {
    let mut info = NetworkInfo::default();

    if let Ok(out) = exec.run("iwgetid", &["-r"]).await {
        if out.success() {
            info.wifi_ssid = out.stdout.trim().to_string();
        }
    }

    if let Ok(contents) = tokio::fs::read_to_string(proc_wireless).await {
        if let Some(dbm) = parse_wireless_signal(&contents) {
            info.wifi_signal_dbm = dbm;
        }
    }

    if let Ok(out) = exec.run("ip", &["-4", "-o", "addr", "show", "wlan0"]).await {
        if out.success() {
            if let Some(ip) = parse_wlan_ip(&out.stdout) {
                info.wifi_ip = ip;
            }
        }
    }

    info
}

/// Signal level (dBm) from `/proc/net/wireless`: two header lines, then
/// `wlan0: 0000   54.  -56.  -256 ...` where field 4 is the level.
fn parse_wireless_signal(contents: &str) -> Option<i32> {
    let line = contents.lines().nth(2)?;
    let field = line.split_whitespace().nth(3)?;
    field.trim_end_matches('.').parse().ok()
}

/// Address from `ip -4 -o addr show wlan0`:
/// `3: wlan0    inet 192.168.1.5/24 brd ...`
fn parse_wlan_ip(output: &str) -> Option<String> {
    let fields: Vec<&str> = output.split_whitespace().collect();
    let inet = fields.iter().position(|f| *f == "inet")?;
    let cidr = fields.get(inet + 1)?;
    Some(cidr.split('/').next().unwrap_or(cidr).to_string())
}
