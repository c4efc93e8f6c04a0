//! Background observers.
//!
//! Observers watch, they never drive the state machine: the temperature
//! watchdog fires one-shot notifications, the WiFi watchdog heals the
//! brcmfmac driver, and the network probe feeds status snapshots. Failures
//! here are logged and never propagate.

mod network;
mod temperature;
mod wifi;

pub use network::{network_info, NetworkInfo, PROC_WIRELESS};
pub use temperature::{EdgeTrigger, TemperatureMonitor};
pub use wifi::WifiMonitor;
