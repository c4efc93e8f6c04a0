//! teslausb - Tesla dashcam archiver daemon
//!
//! Turns a single-board computer into a dual-purpose storage device: a USB
//! mass-storage gadget holding dashcam and Sentry recordings while the car
//! is out, and an archiver that moves new clips to a network share once the
//! car is back home.
//!
//! ## Components
//!
//! 1. BackingStore - create/fsck/mount the exFAT cam image
//! 2. Gadget - configfs mass-storage gadget lifecycle and write-idle
//! 3. ArchiveTransport - share reachability, NFS/SMB mount, rsync pass,
//!    free-space management
//! 4. KeepAwake - BLE or webhook "stay awake" signalling to the car
//! 5. Notifier - structured lifecycle events over a webhook
//! 6. Machine - the orchestrator state machine (booting/away/arriving/
//!    archiving/idle)
//! 7. Monitors - temperature and WiFi watchdogs (observe only)
//! 8. System - LED signalling, time sync, storage tuning, process lock
//!
//! ## Design principles
//!
//! - The dependency graph is a tree: the machine knows every leaf, leaves
//!   know none of each other
//! - Kernel resources (loop device, gadget, mounts, HCI) are scoped: one
//!   holder at a time, released on every exit path
//! - Subprocesses run through the `Exec` capability so every lifecycle
//!   scenario is testable without touching the OS

pub mod archive;
pub mod backing_store;
pub mod config;
pub mod error;
pub mod exec;
pub mod gadget;
pub mod keep_awake;
pub mod machine;
pub mod monitor;
pub mod notifier;
pub mod system;

pub use error::{Error, Result};
