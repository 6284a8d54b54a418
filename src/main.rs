//! CapyDash - Headless dashboard host for panels talking over capy-bus
//!
//! Single dispatch thread (main), one worker thread per producing panel.

mod config;
mod event_bus;
mod panel_manager;
mod panels;
mod services;

use capy_bus::Bus;
use clap::Parser;
use event_bus::{EVENT_POLL_INTERVAL_MS, FailureLedger, SHUTDOWN_GRACE_MS};
use log::{debug, error, info, warn};
use panel_manager::PanelManager;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "capydash")]
#[command(version, about = "CapyDash - panels wired through an inter-panel message bus")]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/CapyDash/config.json)
    #[arg(short, long, env = "CAPYDASH_CONFIG")]
    config: Option<PathBuf>,

    /// Shut down automatically after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let path = cli.config.unwrap_or_else(config::default_config_path);
    info!("Starting CapyDash with {}", path.display());
    let config = config::load(&path)?;

    let bus = Bus::new();
    event_bus::create_channels(&bus, &config.channels)?;
    let dispatcher = bus
        .dispatcher()?
        .with_idle_interval(Duration::from_millis(EVENT_POLL_INTERVAL_MS))
        .with_grace(Duration::from_millis(SHUTDOWN_GRACE_MS));
    let ledger = FailureLedger::install(&dispatcher);

    let manager = PanelManager::new(&dispatcher, config.constants)?;
    panels::register_builtin(&manager);
    if let Err(e) = manager.start(&config.panels) {
        error!("Failed to start panels: {}", e);
        manager.teardown();
        dispatcher.shutdown(Duration::ZERO);
        return Err(e.into());
    }

    for name in manager.panel_names() {
        debug!("Panel '{}' subscribes to {:?}", name, manager.subscriptions(&name));
    }

    services::shutdown::start_listener(bus.clone(), cli.duration.map(Duration::from_secs))?;
    info!(
        "CapyDash running with {} panel(s) on {} channel(s)",
        manager.panel_names().len(),
        bus.channel_names().len()
    );

    let report = dispatcher.run();
    manager.teardown();

    let stats = dispatcher.stats();
    info!(
        "Dispatched {} message(s): {} deliveries, {} failures",
        stats.messages, stats.deliveries, stats.failures
    );
    if report.total_dropped() > 0 {
        warn!("Dropped at shutdown: {:?}", report.dropped);
    }
    if ledger.total() > 0 {
        warn!("{} subscriber failure(s) during this run", ledger.total());
        for line in ledger.summary() {
            warn!("  {}", line);
        }
    }

    info!("CapyDash stopped");
    Ok(())
}
