use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{LevelFilter, debug, info};
use tokio::sync::mpsc;

use camera_gps_bridge::AppState;
use camera_gps_bridge::core::bluetooth::constants::{
    LOCATION_UPDATE_INTERVAL_MS, SHUTDOWN_GRACE_MS,
};
use camera_gps_bridge::core::bluetooth::pairing;
use camera_gps_bridge::core::bluetooth::types::DeviceIdentity;
use camera_gps_bridge::core::location::provider::{StaticLocationSource, spawn_location_pump};
use camera_gps_bridge::core::presence::{LifecycleController, PresenceWatcher};
use camera_gps_bridge::core::service::{LocationSenderService, ServiceCommand};
use camera_gps_bridge::logging::{self, BridgeLogger};

#[derive(Parser)]
#[command(name = "camera-gps-bridge", version)]
#[command(about = "Streams GPS fixes to Sony cameras over Bluetooth LE")]
struct Cli {
    /// Log at debug level
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge daemon (the default)
    Run,
    /// Scan for nearby cameras and print them
    Scan {
        /// How long to scan, in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
    /// Scan for a camera, pair with it and remember it
    Associate {
        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// List remembered cameras
    Devices,
    /// Forget a remembered camera
    Disassociate { address: String },
    /// Change settings
    Configure {
        /// Camera address for the per-camera flags
        address: Option<String>,
        /// Allow or forbid sessions for this camera
        #[arg(long)]
        enabled: Option<bool>,
        /// Hold the session open regardless of presence events
        #[arg(long)]
        keep_alive: Option<bool>,
        /// Master switch for the whole bridge
        #[arg(long)]
        app_enabled: Option<bool>,
        /// IANA timezone used in the packets, e.g. Europe/Berlin
        #[arg(long)]
        timezone: Option<String>,
    },
}

fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .context("Cannot determine config directory")
        .map(|dir| dir.join("camera-gps-bridge"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dir = config_dir()?;

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if BridgeLogger::init(level, Some(&dir.join("logs").join("bridge.log"))).is_err() {
        // fall back to env_logger if our logger cannot be installed
        env_logger::builder().filter_level(level).init();
    }
    logging::install_panic_hook();

    let state = AppState::new(&dir).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(state).await,
        Command::Scan { duration } => scan(state, duration).await,
        Command::Associate { timeout } => associate(state, timeout).await,
        Command::Devices => devices(state).await,
        Command::Disassociate { address } => disassociate(state, address).await,
        Command::Configure {
            address,
            enabled,
            keep_alive,
            app_enabled,
            timezone,
        } => configure(state, address, enabled, keep_alive, app_enabled, timezone).await,
    }
}

async fn run_daemon(state: AppState) -> Result<()> {
    let settings = state.settings.clone();
    let snapshot = settings.snapshot().await;

    let source = match snapshot.static_location {
        Some(location) => {
            StaticLocationSource::new(location.latitude, location.longitude, location.accuracy_m)
        }
        None => bail!(
            "No location source configured; set static_location in settings.json \
             or wire a provider into the library"
        ),
    };

    let (location_ctl_tx, location_ctl_rx) = mpsc::unbounded_channel();
    let (fixes_tx, fixes_rx) = mpsc::unbounded_channel();
    let _pump = spawn_location_pump(
        source,
        Duration::from_millis(LOCATION_UPDATE_INTERVAL_MS),
        location_ctl_rx,
        fixes_tx,
    );

    let (service, control) = LocationSenderService::new(
        state.link_factory(),
        settings.clone(),
        location_ctl_tx,
        fixes_rx,
    );
    let service_task = tokio::spawn(service.run());

    let (presence_tx, presence_rx) = mpsc::unbounded_channel();
    let watcher = PresenceWatcher::new(
        state.adapter.clone(),
        state.associations.clone(),
        state.capabilities,
        state.devices.clone(),
    );
    let watcher_cancel = watcher.cancel_token();
    let watcher_task = watcher.spawn(presence_tx);

    let controller = LifecycleController::new(
        settings.clone(),
        state.associations.clone(),
        control.clone(),
    );
    controller.start_keep_alive_sessions().await;
    let controller_task = tokio::spawn(controller.run(presence_rx));

    info!("Bridge running, press Ctrl-C to shut down");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = control.send(ServiceCommand::RequestShutdown);

    // a second Ctrl-C skips the grace period
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Forcing stop"),
        _ = tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS + 1000)) => {}
    }
    let _ = control.send(ServiceCommand::Stop);
    let _ = service_task.await;

    watcher_cancel.cancel();
    let _ = watcher_task.await;
    controller_task.abort();
    Ok(())
}

async fn scan(state: AppState, duration: u64) -> Result<()> {
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let mut scanner = state.scanner();
    scanner.start_scan(found_tx).await?;

    println!("Scanning for cameras for {duration}s...");
    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(camera) = found_rx.recv() => {
                println!(
                    "  {}  {}  (RSSI {})",
                    camera.address.as_deref().unwrap_or("<no address>"),
                    camera.name.as_deref().unwrap_or("<unnamed>"),
                    camera.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".to_string()),
                );
            }
            _ = &mut deadline => break,
        }
    }
    scanner.stop_scan().await?;
    Ok(())
}

async fn associate(state: AppState, timeout: u64) -> Result<()> {
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let mut scanner = state.scanner();
    scanner.start_scan(found_tx).await?;

    println!("Scanning for a camera to associate...");
    let camera = tokio::time::timeout(Duration::from_secs(timeout), async {
        while let Some(camera) = found_rx.recv().await {
            if camera.address.is_some() {
                return Some(camera);
            }
            debug!("Skipping camera without a resolvable address: {}", camera.platform_id);
        }
        None
    })
    .await;
    scanner.stop_scan().await?;

    let Ok(Some(camera)) = camera else {
        bail!("No camera found within {timeout}s");
    };
    let address = camera.address.expect("filtered above");
    let name = camera.name.unwrap_or_else(|| "N/A".to_string());

    let device = {
        let devices = state.devices.lock().expect("device map poisoned");
        devices.get(&address).cloned()
    }
    .context("Discovered camera lost its device handle")?;

    println!("Pairing with {name} ({address}); confirm on the camera if asked");
    let pairing_state = pairing::ensure_paired(&device).await;

    let mut identity = DeviceIdentity::new(address, name);
    identity.pairing = pairing_state;
    let stored = state.associations.associate(identity).await?;

    println!(
        "Associated {} ({}), pairing: {:?}",
        stored.name, stored.address, stored.pairing
    );
    Ok(())
}

async fn devices(state: AppState) -> Result<()> {
    let devices = state.associations.list().await;
    if devices.is_empty() {
        println!("No cameras associated yet; run `camera-gps-bridge associate`");
        return Ok(());
    }

    for device in devices {
        let settings = state.settings.device(&device.address).await;
        println!(
            "  {}  {}  pairing: {:?}  enabled: {}  keep-alive: {}",
            device.address, device.name, device.pairing, settings.enabled, settings.keep_alive,
        );
    }
    Ok(())
}

async fn disassociate(state: AppState, address: String) -> Result<()> {
    if state.associations.disassociate(&address).await? {
        state.settings.remove_device(&address).await?;
        println!("Forgot {address}");
    } else {
        println!("{address} was not associated");
    }
    Ok(())
}

async fn configure(
    state: AppState,
    address: Option<String>,
    enabled: Option<bool>,
    keep_alive: Option<bool>,
    app_enabled: Option<bool>,
    timezone: Option<String>,
) -> Result<()> {
    if let Some(app_enabled) = app_enabled {
        state.settings.set_app_enabled(app_enabled).await?;
        println!("app_enabled = {app_enabled}");
    }

    if let Some(timezone) = timezone {
        let timezone: chrono_tz::Tz = timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid timezone: {e}"))?;
        state.settings.set_timezone(timezone).await?;
        println!("timezone = {}", timezone.name());
    }

    if enabled.is_some() || keep_alive.is_some() {
        let address = address.context("Per-camera flags need a camera address")?;
        state
            .settings
            .update_device(&address, |device| {
                if let Some(enabled) = enabled {
                    device.enabled = enabled;
                }
                if let Some(keep_alive) = keep_alive {
                    device.keep_alive = keep_alive;
                }
            })
            .await?;
        println!("Updated settings for {address}");
    }
    Ok(())
}
