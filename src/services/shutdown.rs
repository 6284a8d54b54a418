//! Shutdown listener.
//!
//! Waits for Ctrl-C (or an optional run duration) on a background thread
//! and asks the bus to stop. The dispatch loop then finishes on its own
//! thread with its grace period.

use capy_bus::Bus;
use log::{error, info, warn};
use std::io;
use std::thread;
use tokio::signal;
use tokio::time::{Duration, sleep};

pub fn start_listener(bus: Bus, duration: Option<Duration>) -> io::Result<()> {
    thread::Builder::new()
        .name("shutdown-listener".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Shutdown listener could not create a runtime: {}", e);
                    return;
                }
            };

            let reason = rt.block_on(async {
                match duration {
                    Some(limit) => tokio::select! {
                        _ = wait_for_ctrl_c() => "Ctrl-C received",
                        _ = sleep(limit) => "run duration elapsed",
                    },
                    None => {
                        wait_for_ctrl_c().await;
                        "Ctrl-C received"
                    }
                }
            });

            info!("{}, shutting down", reason);
            bus.request_shutdown();
        })?;
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}
