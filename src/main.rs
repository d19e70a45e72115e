mod commands;
mod logging;

use std::fs;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use colored::*;
use commands::Cli;
use dotenv::dotenv;
use tether_sync::device::mounted::MountedConnector;
use tether_sync::{
    config, ConnectionSupervisor, EventLoop, Settings, ThreadSleeper, TransferTracker,
};
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = Cli::parse();

    let _guard = logging::init_logger();

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    fs::create_dir_all(&settings.target_dir).with_context(|| {
        format!(
            "creating target directory {}",
            settings.target_dir.display()
        )
    })?;

    let tracker = if settings.track_transfers {
        TransferTracker::open(&settings.state_path)
    } else {
        warn!("Transfer tracking is disabled, files are deleted right after download");
        TransferTracker::disabled()
    };

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = stop.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down...");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    info!(
        "Syncing {} into {} (Press Ctrl+C to stop)",
        settings.device_root.display().to_string().cyan(),
        settings.target_dir.display().to_string().green(),
    );

    let mut event_loop = EventLoop::new(&settings, tracker, stop.clone());
    let mut supervisor = ConnectionSupervisor::new(
        MountedConnector::new(&settings.device_root),
        ThreadSleeper::new(stop.clone()),
        settings.reconnect_backoff,
        stop,
    );
    supervisor.run(|device| event_loop.run(device))?;

    info!(
        "{} ({} transferred files on record)",
        "Stopped".yellow(),
        event_loop.tracker().record().len()
    );
    Ok(())
}

fn load_settings(args: &Cli) -> Result<Settings, tether_sync::Error> {
    let config = config::load_configuration()?;
    Settings::resolve(&config, &args.target_dir)
}
