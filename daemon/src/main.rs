mod controller;
mod ipc_server;
mod pipeline;
mod settings;

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use controller::{Controller, ControllerEvent};
use pipeline::GstPipelineFactory;
use settings::SettingsStore;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!(
        "Starting Video Wallpaper Daemon v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load persisted settings
    let settings_path = SettingsStore::default_path()?;
    log::info!("Looking for settings at: {}", settings_path.display());

    let store = SettingsStore::load(&settings_path)?;
    let initial = store.settings();
    log::info!("  Enabled: {}", initial.enabled);
    log::info!(
        "  Video: {}",
        if initial.uri.is_empty() {
            "(none)"
        } else {
            initial.uri.as_str()
        }
    );
    log::info!("  Loop: {}", initial.loop_enabled);
    log::info!("  Volume: {:.2}", initial.volume);

    // Every state mutation funnels through this one channel.
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    // Watch the settings file; dropping the watcher stops notifications.
    let _settings_watcher = settings::watch(&settings_path, event_tx.clone())?;

    let should_exit = Arc::new(AtomicBool::new(false));

    // Start IPC server
    let ipc_exit = should_exit.clone();
    let ipc_tx = event_tx.clone();
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server::start(ipc_exit, ipc_tx).await {
            log::error!("IPC server error: {}", e);
        }
    });

    // Start controller loop
    let factory = GstPipelineFactory::new(event_tx.clone());
    let controller = Controller::new(store, factory);
    let controller_handle = tokio::spawn(controller.run(event_rx));

    // Set up signal handlers
    let signal_exit = should_exit.clone();
    let signal_tx = event_tx.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
            }
        }

        signal_exit.store(true, Ordering::Relaxed);
        let _ = signal_tx.send(ControllerEvent::Shutdown);
    });

    // The controller owns the pipeline; let it wind down first so the
    // pipeline is released before the process exits.
    let _ = controller_handle.await;
    should_exit.store(true, Ordering::Relaxed);
    let _ = ipc_handle.await;

    log::info!("Daemon shutting down");
    Ok(())
}
