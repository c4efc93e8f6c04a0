//! Orchestrator state machine.
//!
//! ## States
//!
//! booting → away → arriving → archiving → idle → away → ...
//!
//! Transitions happen only on this task; every side effect (gadget swap,
//! mounts, keep-awake session, LED) hangs off a transition edge. The
//! backing image is exclusively held by either the gadget or the local
//! mount, and the arriving/idle edges are the only places the hand-over
//! happens.
//!
//! ## Shared state
//!
//! One mutex guards state, last-error, counters and the listener list.
//! Listeners are invoked synchronously after the mutex is released and must
//! not block (the web layer enqueues a broadcast and returns).

use crate::archive::ArchiveTransport;
use crate::backing_store::BackingStore;
use crate::error::{Error, Result};
use crate::exec::Exec;
use crate::gadget::Gadget;
use crate::keep_awake::{AwakeCommand, KeepAwake};
use crate::monitor::{network_info, NetworkInfo, PROC_WIRELESS};
use crate::notifier::{Event, Notifier};
use crate::system::{self, LedMode, StatusLed};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default persistence locations
pub const STATS_FILE: &str = "/mutable/teslausb/stats.json";
pub const LAST_ARCHIVE_FILE: &str = "/mutable/teslausb/last_archive";

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Booting,
    Away,
    Arriving,
    Archiving,
    Idle,
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Booting => "booting",
            State::Away => "away",
            State::Arriving => "arriving",
            State::Archiving => "archiving",
            State::Idle => "idle",
            State::Error => "error",
        };
        f.write_str(s)
    }
}

/// Lifetime totals, persisted across restarts. Counters only grow and
/// `last_archive` is never rewound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CumulativeStats {
    pub total_clips: u64,
    pub total_bytes: u64,
    pub archive_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_archive: Option<DateTime<Utc>>,
}

/// Read-only view of the orchestrator for status surfaces
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: State,
    pub last_archive: Option<DateTime<Utc>>,
    pub last_error: String,
    pub archive_clips: u64,
    pub archive_bytes: u64,
    pub total_archive_clips: u64,
    pub total_archive_bytes: u64,
    pub archive_count: u64,
    pub gadget_enabled: bool,
    #[serde(flatten)]
    pub network: NetworkInfo,
}

/// Delay and poll knobs, production values by default. Scenario tests
/// compress them.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Wait after the share becomes reachable, for WiFi to settle
    pub settle_wait: Duration,
    /// Reachability poll period in away and idle
    pub poll_interval: Duration,
    /// Keep-awake refresh period while archiving
    pub nudge_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle_wait: Duration::from_secs(20),
            poll_interval: Duration::from_secs(30),
            nudge_interval: Duration::from_secs(300),
        }
    }
}

type Listener = Arc<dyn Fn(State) + Send + Sync>;

struct Inner {
    state: State,
    last_archive: Option<DateTime<Utc>>,
    last_error: String,
    archive_clips: u64,
    archive_bytes: u64,
    cumulative: CumulativeStats,
    gadget_enabled: bool,
    listeners: Vec<Listener>,
}

/// Machine instance
pub struct Machine {
    inner: Mutex<Inner>,
    backing: BackingStore,
    gadget: Gadget,
    archive: ArchiveTransport,
    keep_awake: Arc<KeepAwake>,
    notifier: Arc<Notifier>,
    led: StatusLed,
    exec: Arc<dyn Exec>,
    stats_path: PathBuf,
    last_archive_path: PathBuf,
    timings: Timings,
}

impl Machine {
    pub fn new(
        backing: BackingStore,
        gadget: Gadget,
        archive: ArchiveTransport,
        keep_awake: Arc<KeepAwake>,
        notifier: Arc<Notifier>,
        led: StatusLed,
        exec: Arc<dyn Exec>,
        stats_path: impl Into<PathBuf>,
        last_archive_path: impl Into<PathBuf>,
        timings: Timings,
    ) -> Self {
        let stats_path = stats_path.into();
        let last_archive_path = last_archive_path.into();

        let inner = Inner {
            state: State::Booting,
            cumulative: load_stats(&stats_path),
            last_archive: load_last_archive(&last_archive_path),
            last_error: String::new(),
            archive_clips: 0,
            archive_bytes: 0,
            gadget_enabled: false,
            listeners: Vec::new(),
        };

        Self {
            inner: Mutex::new(inner),
            backing,
            gadget,
            archive,
            keep_awake,
            notifier,
            led,
            exec,
            stats_path,
            last_archive_path,
            timings,
        }
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    /// Status snapshot for observers, including best-effort WiFi status.
    /// The subprocess probes run first; the state lock is held only while
    /// the orchestrator fields are copied.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let network = network_info(self.exec.as_ref(), Path::new(PROC_WIRELESS)).await;
        let inner = self.inner.lock().await;
        StatusSnapshot {
            state: inner.state,
            last_archive: inner.last_archive,
            last_error: inner.last_error.clone(),
            archive_clips: inner.archive_clips,
            archive_bytes: inner.archive_bytes,
            total_archive_clips: inner.cumulative.total_clips,
            total_archive_bytes: inner.cumulative.total_bytes,
            archive_count: inner.cumulative.archive_count,
            gadget_enabled: inner.gadget_enabled,
            network,
        }
    }

    /// Register a state-change listener. Invoked synchronously after the
    /// state lock is released; must not block.
    pub async fn on_state_change(&self, listener: impl Fn(State) + Send + Sync + 'static) {
        self.inner.lock().await.listeners.push(Arc::new(listener));
    }

    /// Force a transition to arriving. Allowed only from idle; any other
    /// state rejects the trigger.
    pub async fn trigger_archive(&self) -> bool {
        let listeners = {
            let mut inner = self.inner.lock().await;
            if inner.state != State::Idle {
                return false;
            }
            inner.state = State::Arriving;
            inner.listeners.clone()
        };
        tracing::info!("Manual archive trigger accepted");
        for listener in listeners {
            listener(State::Arriving);
        }
        true
    }

    async fn set_state(&self, state: State) {
        let (old, listeners) = {
            let mut inner = self.inner.lock().await;
            let old = std::mem::replace(&mut inner.state, state);
            (old, inner.listeners.clone())
        };
        if old != state {
            tracing::info!(from = %old, to = %state, "State transition");
            for listener in listeners {
                listener(state);
            }
        }
    }

    async fn record_error(&self, error: &Error) {
        self.inner.lock().await.last_error = error.to_string();
    }

    async fn gadget_enabled(&self) -> bool {
        self.inner.lock().await.gadget_enabled
    }

    async fn set_gadget_enabled(&self, enabled: bool) {
        self.inner.lock().await.gadget_enabled = enabled;
    }

    /// Run the lifecycle until `shutdown` is cancelled. Creating the
    /// backing image on first run is the only fatal initialization step.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.backing.exists() {
            tracing::info!("First run: creating cam disk image");
            self.backing.create().await?;
        }

        // Non-fatal: boards without a UDC retry from the away and idle loops
        match self.gadget.enable(self.backing.backing_file()).await {
            Ok(()) => self.set_gadget_enabled(true).await,
            Err(e) => {
                tracing::warn!(error = %e, "USB gadget not enabled yet, will retry");
                self.record_error(&e).await;
            }
        }

        self.set_state(State::Away).await;
        self.led.set(LedMode::SlowBlink).await;

        while !shutdown.is_cancelled() {
            match self.state().await {
                State::Away => self.run_away(&shutdown).await,
                State::Arriving => self.run_arriving(&shutdown).await,
                State::Archiving => self.run_archiving(&shutdown).await,
                State::Idle => self.run_idle(&shutdown).await,
                State::Booting | State::Error => {
                    tokio::time::sleep(self.timings.poll_interval).await
                }
            }
        }

        // Graceful shutdown owns the gadget teardown; running it on this
        // task serializes it against any in-flight transition.
        let _ = self.gadget.disable().await;
        self.led.set(LedMode::Off).await;
        tracing::info!("Orchestrator stopped");
        Ok(())
    }

    async fn run_away(&self, shutdown: &CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.timings.poll_interval) => {}
            }
            self.retry_gadget_enable(false).await;
            if self.archive.is_reachable().await {
                self.set_state(State::Arriving).await;
                return;
            }
        }
    }

    /// Hand the backing image from the gadget to the local mount and bring
    /// up the archive mount. Any failure rolls back in reverse order.
    async fn run_arriving(&self, shutdown: &CancellationToken) {
        self.led.set(LedMode::FastBlink).await;

        tracing::info!(
            settle_secs = self.timings.settle_wait.as_secs(),
            "Archive server reachable, waiting for network to stabilize"
        );
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.timings.settle_wait) => {}
        }

        system::sync_time(self.exec.as_ref()).await;

        if let Err(e) = self.gadget.wait_for_idle().await {
            tracing::warn!(error = %e, "Wait for USB idle failed, proceeding anyway");
        }

        if let Err(e) = self.gadget.disable().await {
            tracing::warn!(error = %e, "Gadget disable failed");
            self.record_error(&e).await;
            self.set_gadget_enabled(false).await;
            self.rollback_to_away(false, false).await;
            return;
        }
        self.set_gadget_enabled(false).await;

        self.notifier
            .send(Event::new(
                "usb_disconnected",
                "USB gadget disabled for archiving",
            ))
            .await;

        if let Err(e) = self.backing.mount_local().await {
            tracing::warn!(error = %e, "Cam mount failed");
            self.record_error(&e).await;
            self.rollback_to_away(false, false).await;
            return;
        }

        self.backing.clean_artifacts().await;

        if let Err(e) = self.archive.mount_archive().await {
            tracing::warn!(error = %e, "Archive mount failed");
            self.record_error(&e).await;
            self.rollback_to_away(false, true).await;
            return;
        }

        self.set_state(State::Archiving).await;
    }

    async fn rollback_to_away(&self, unmount_archive: bool, unmount_local: bool) {
        if unmount_archive {
            self.archive.unmount_archive().await;
        }
        if unmount_local {
            self.backing.unmount_local().await;
        }
        if self.gadget.enable(self.backing.backing_file()).await.is_ok() {
            self.set_gadget_enabled(true).await;
        }
        self.set_state(State::Away).await;
        self.led.set(LedMode::SlowBlink).await;
    }

    async fn run_archiving(&self, shutdown: &CancellationToken) {
        self.keep_awake.send(AwakeCommand::Start).await;

        // Nudge the car every few minutes so it stays awake for long passes
        let nudge_token = shutdown.child_token();
        let nudge_stop = nudge_token.clone();
        let keep_awake = self.keep_awake.clone();
        let nudge_interval = self.timings.nudge_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = nudge_token.cancelled() => return,
                    _ = tokio::time::sleep(nudge_interval) => {
                        keep_awake.send(AwakeCommand::Nudge).await;
                    }
                }
            }
        });

        self.notifier
            .send(Event::new("archive_started", "Archiving dashcam clips"))
            .await;

        let started = Instant::now();
        let result = self.archive.archive_clips().await;
        let duration = started.elapsed();
        nudge_stop.cancel();

        match result {
            Err(Error::Cancelled) => {
                tracing::info!("Archive pass cancelled by shutdown");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Archive pass failed");
                self.record_error(&e).await;
                self.notifier
                    .send(Event::new("archive_error", e.to_string()))
                    .await;
            }
            Ok(run) => {
                let now = Utc::now();
                let cumulative = {
                    let mut inner = self.inner.lock().await;
                    inner.last_archive = Some(now);
                    inner.archive_clips = run.clips;
                    inner.archive_bytes = run.bytes;
                    inner.cumulative.total_clips += run.clips;
                    inner.cumulative.total_bytes += run.bytes;
                    inner.cumulative.archive_count += 1;
                    inner.cumulative.last_archive = Some(now);
                    inner.cumulative.clone()
                };
                self.persist_stats(&cumulative, now).await;
                self.notifier
                    .send(
                        Event::new(
                            "archive_complete",
                            format!("Archived {} clips in {}s", run.clips, duration.as_secs()),
                        )
                        .with_data(json!({
                            "clips": run.clips,
                            "bytes": run.bytes,
                            "duration_seconds": duration.as_secs(),
                        })),
                    )
                    .await;
            }
        }

        self.archive.manage_free_space().await;
        self.set_state(State::Idle).await;
    }

    async fn run_idle(&self, shutdown: &CancellationToken) {
        self.led.set(LedMode::Heartbeat).await;

        // Sentry off while parked at home to cut battery drain
        self.keep_awake.send(AwakeCommand::Stop).await;

        self.archive.unmount_archive().await;
        self.backing.unmount_local().await;
        self.reenable_gadget().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.timings.poll_interval) => {}
            }
            // A manual trigger may have switched us to arriving
            if self.state().await != State::Idle {
                return;
            }
            self.retry_gadget_enable(true).await;
            if !self.archive.is_reachable().await {
                tracing::info!("Archive server unreachable, vehicle left home");
                self.set_state(State::Away).await;
                self.led.set(LedMode::SlowBlink).await;
                return;
            }
        }
    }

    async fn reenable_gadget(&self) {
        match self.gadget.enable(self.backing.backing_file()).await {
            Ok(()) => {
                self.set_gadget_enabled(true).await;
                self.notifier
                    .send(Event::new("usb_connected", "USB gadget re-enabled"))
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Gadget re-enable failed");
                self.record_error(&e).await;
                self.set_gadget_enabled(false).await;
            }
        }
    }

    async fn retry_gadget_enable(&self, notify: bool) {
        if self.gadget_enabled().await {
            return;
        }
        if self.gadget.enable(self.backing.backing_file()).await.is_ok() {
            self.set_gadget_enabled(true).await;
            tracing::info!("USB gadget enabled (delayed)");
            if notify {
                self.notifier
                    .send(Event::new("usb_connected", "USB gadget re-enabled"))
                    .await;
            }
        }
    }

    async fn persist_stats(&self, cumulative: &CumulativeStats, now: DateTime<Utc>) {
        if let Err(e) = write_atomic(&self.last_archive_path, now.to_rfc3339().as_bytes()).await {
            tracing::warn!(error = %e, "Could not persist last-archive timestamp");
        }
        match serde_json::to_vec(cumulative) {
            Ok(data) => {
                if let Err(e) = write_atomic(&self.stats_path, &data).await {
                    tracing::warn!(error = %e, "Could not persist stats");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Could not serialize stats"),
        }
    }
}

fn load_stats(path: &Path) -> CumulativeStats {
    std::fs::read(path)
        .ok()
        .and_then(|data| serde_json::from_slice(&data).ok())
        .unwrap_or_default()
}

fn load_last_archive(path: &Path) -> Option<DateTime<Utc>> {
    let raw = std::fs::read_to_string(path).ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Write then rename, so readers never observe a torn file.
async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmp".to_string());
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}
