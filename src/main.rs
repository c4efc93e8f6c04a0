//! teslausb daemon entry point.

use std::path::Path;
use std::sync::Arc;
use teslausb::archive::{ArchiveTransport, ARCHIVE_MOUNT};
use teslausb::backing_store::{BackingStore, BACKING_DIR, BACKING_FILE, CAM_MOUNT};
use teslausb::config::{ConfigStore, CONFIG_FILE};
use teslausb::exec::{Exec, SystemExec};
use teslausb::gadget::Gadget;
use teslausb::keep_awake::{BleDriver, KeepAwake};
use teslausb::machine::{Machine, Timings, LAST_ARCHIVE_FILE, STATS_FILE};
use teslausb::monitor::{TemperatureMonitor, WifiMonitor};
use teslausb::notifier::Notifier;
use teslausb::system;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "teslausb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting teslausb v{}", env!("CARGO_PKG_VERSION"));

    // Singleton: one process owns the gadget and the backing image
    let _lock = system::acquire_process_lock(Path::new(system::LOCK_FILE))
        .map_err(|_| anyhow::anyhow!("another instance is running"))?;

    let config_path =
        std::env::var("TESLAUSB_CONFIG").unwrap_or_else(|_| CONFIG_FILE.to_string());
    let config = Arc::new(ConfigStore::new(&config_path));
    if let Err(e) = config.load_or_init().await {
        tracing::warn!(path = %config_path, error = %e, "Configuration not loaded");
    }

    system::apply_tuning(Path::new("/")).await;

    // Root cancellation token, cancelled on SIGINT/SIGTERM
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        });
    }

    let exec: Arc<dyn Exec> = Arc::new(SystemExec::new(shutdown.clone()));
    let notifier = Arc::new(Notifier::new(config.clone()));

    // Observers: they watch and log, they never drive the state machine
    let temperature = TemperatureMonitor::new(config.clone(), notifier.clone());
    let temperature_token = shutdown.clone();
    tokio::spawn(async move { temperature.run(temperature_token).await });

    let wifi = WifiMonitor::new(exec.clone());
    let wifi_token = shutdown.clone();
    tokio::spawn(async move { wifi.run(wifi_token).await });

    let machine = Arc::new(Machine::new(
        BackingStore::new(exec.clone(), BACKING_DIR, BACKING_FILE, CAM_MOUNT),
        Gadget::new(exec.clone()),
        ArchiveTransport::new(exec.clone(), config.clone(), CAM_MOUNT, ARCHIVE_MOUNT),
        Arc::new(KeepAwake::new(config.clone(), BleDriver::new(exec.clone()))),
        notifier,
        system::StatusLed::new("/sys/class/leds"),
        exec,
        STATS_FILE,
        LAST_ARCHIVE_FILE,
        Timings::default(),
    ));

    machine.run(shutdown).await?;
    Ok(())
}
