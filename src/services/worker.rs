//! Periodic background workers for panels.
//!
//! Each worker owns one thread with a current-thread tokio runtime. The tick
//! closure runs on that thread and may block in `Publisher::publish`; it
//! returns `ControlFlow::Break` to end the worker early.

use capy_bus::{BusError, BusResult};
use log::{debug, error, warn};
use std::io;
use std::ops::ControlFlow;
use std::thread::{self, JoinHandle};
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior, interval};

pub struct Worker {
    name: String,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker that calls `tick` every `period`, starting immediately.
    pub fn spawn_periodic<F>(name: &str, period: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let (stop, mut stop_rx) = watch::channel(false);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("worker-{name}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Worker '{}' could not create a runtime: {}", thread_name, e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if tick().is_break() {
                                    break;
                                }
                            }
                            changed = stop_rx.changed() => {
                                if changed.is_err() || *stop_rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                });
                debug!("Worker '{}' exited", thread_name);
            })?;

        debug!("Worker '{}' started ({:?} period)", name, period);
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the worker and wait for its thread. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Worker '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map a worker's publish result to whether it should keep going.
///
/// A closed bus ends the worker. Backpressure and other errors skip one tick.
pub fn publish_step(source: &str, result: BusResult<u64>) -> ControlFlow<()> {
    match result {
        Ok(_) => ControlFlow::Continue(()),
        Err(BusError::BusClosed) => {
            debug!("'{}' stops publishing, bus closed", source);
            ControlFlow::Break(())
        }
        Err(e) if e.is_backpressure() => {
            warn!("'{}' skipped a tick: {}", source, e);
            ControlFlow::Continue(())
        }
        Err(e) => {
            error!("'{}' failed to publish: {}", source, e);
            ControlFlow::Continue(())
        }
    }
}
