//! Best-effort wall clock sync.
//!
//! The Pi has no RTC; after weeks parked the clock can be far enough off to
//! break TLS to the notification webhook. Before archiving we try whichever
//! SNTP client is installed. Failure is never fatal.

use crate::exec::Exec;

const NTP_SERVER: &str = "time.google.com";
const SYNC_ROUNDS: u32 = 5;

/// Try `sntp`, `ntpdig`, then `ntpdate` against [`NTP_SERVER`], up to
/// [`SYNC_ROUNDS`] rounds. Returns whether any client succeeded.
pub async fn sync_time(exec: &dyn Exec) -> bool {
    for _ in 0..SYNC_ROUNDS {
        for client in ["sntp", "ntpdig", "ntpdate"] {
            let args: &[&str] = if client == "ntpdate" {
                &[NTP_SERVER]
            } else {
                &["-S", NTP_SERVER]
            };
            match exec.run(client, args).await {
                Ok(out) if out.success() => {
                    tracing::info!(client = %client, output = %out.stdout.trim(), "Time synced");
                    return true;
                }
                // Not installed or transient failure, try the next client
                _ => {}
            }
        }
    }
    tracing::warn!(rounds = SYNC_ROUNDS, "Time sync failed");
    false
}
