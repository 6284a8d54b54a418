//! Dispatch loop: the only place subscriber code runs.
//!
//! `Dispatcher` is `!Send`. It is created on the thread that owns UI state
//! and every callback is invoked there, one message at a time:
//!
//! - Per message: `Idle -> Dispatching -> Idle`.
//! - Per loop: `Running -> Stopping -> Stopped`.
//!
//! Each pass takes at most one message from every channel, starting at a
//! rotating cursor, so a burst on one channel cannot starve another.

use crate::error::{BusError, BusResult};
use crate::message::{Message, SubscriberId};
use crate::registry::{Bus, LoopState};
use crate::router::{CallbackResult, Router};
use log::{debug, error, info, trace, warn};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// How long an idle loop sleeps before re-checking for shutdown.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(50);

/// How long shutdown keeps delivering already-enqueued messages.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    Dispatching,
}

/// A subscriber callback that returned an error or panicked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub channel: String,
    pub sequence: u64,
    pub subscriber: SubscriberId,
    pub reason: String,
}

impl DeliveryFailure {
    pub fn to_error(&self) -> BusError {
        BusError::SubscriberCallbackFailed {
            channel: self.channel.clone(),
            sequence: self.sequence,
            subscriber: self.subscriber.to_string(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages taken off a queue.
    pub messages: u64,
    /// Successful callback invocations.
    pub deliveries: u64,
    /// Failed callback invocations.
    pub failures: u64,
}

/// Outcome of shutting the loop down.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Messages dispatched during the grace period.
    pub delivered: usize,
    /// Messages discarded per channel after the grace period.
    pub dropped: BTreeMap<String, usize>,
}

impl ShutdownReport {
    pub fn total_dropped(&self) -> usize {
        self.dropped.values().sum()
    }
}

type FailureSink = Rc<dyn Fn(&DeliveryFailure)>;

/// Subscription handle for the dispatch thread.
///
/// Clones share the dispatcher's routing table, so a callback may hold one
/// and subscribe or unsubscribe while a fan-out is running. The running
/// fan-out works on a snapshot and is not affected.
#[derive(Clone)]
pub struct Registrar {
    bus: Bus,
    router: Rc<RefCell<Router>>,
}

impl Registrar {
    /// Register `callback` for `channel`. Subscribing twice replaces the
    /// callback and keeps the original position in the fan-out.
    pub fn subscribe<F>(
        &self,
        channel: &str,
        subscriber: impl Into<SubscriberId>,
        callback: F,
    ) -> BusResult<()>
    where
        F: Fn(&Message) -> CallbackResult + 'static,
    {
        if !self.bus.has_channel(channel) {
            return Err(BusError::UnknownChannel(channel.to_string()));
        }
        if self.bus.state() != LoopState::Running {
            return Err(BusError::BusClosed);
        }

        let subscriber = subscriber.into();
        let is_new = self
            .router
            .borrow_mut()
            .subscribe(channel, subscriber.clone(), Rc::new(callback));
        if is_new {
            info!("'{}' now subscribes to '{}'", subscriber, channel);
        } else {
            warn!(
                "'{}' already subscribes to '{}', callback replaced",
                subscriber, channel
            );
        }
        Ok(())
    }

    /// Cancel future delivery. Returns false if there was no subscription.
    pub fn unsubscribe(&self, channel: &str, subscriber: impl Into<SubscriberId>) -> bool {
        let subscriber = subscriber.into();
        let removed = self.router.borrow_mut().unsubscribe(channel, &subscriber);
        if removed {
            info!("'{}' unsubscribed from '{}'", subscriber, channel);
        } else {
            debug!(
                "'{}' tried to unsubscribe from '{}' without a subscription",
                subscriber, channel
            );
        }
        removed
    }

    /// Remove every subscription of `subscriber`, e.g. on panel teardown.
    pub fn unsubscribe_all(&self, subscriber: impl Into<SubscriberId>) -> Vec<String> {
        let subscriber = subscriber.into();
        let channels = self.router.borrow_mut().unsubscribe_all(&subscriber);
        if !channels.is_empty() {
            info!("'{}' unsubscribed from {:?}", subscriber, channels);
        }
        channels
    }

    pub fn subscribers(&self, channel: &str) -> Vec<SubscriberId> {
        self.router.borrow().subscribers(channel)
    }

    pub fn channels_of(&self, subscriber: impl Into<SubscriberId>) -> Vec<String> {
        self.router.borrow().channels_of(&subscriber.into())
    }
}

pub struct Dispatcher {
    bus: Bus,
    registrar: Registrar,
    cursor: Cell<usize>,
    phase: Cell<DispatchPhase>,
    stats: Cell<DispatchStats>,
    failure_sink: RefCell<Option<FailureSink>>,
    idle_interval: Duration,
    grace: Duration,
}

impl Dispatcher {
    pub(crate) fn new(bus: Bus) -> Self {
        let registrar = Registrar {
            bus: bus.clone(),
            router: Rc::new(RefCell::new(Router::new())),
        };
        Self {
            bus,
            registrar,
            cursor: Cell::new(0),
            phase: Cell::new(DispatchPhase::Idle),
            stats: Cell::new(DispatchStats::default()),
            failure_sink: RefCell::new(None),
            idle_interval: DEFAULT_IDLE_INTERVAL,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Grace period used when `run` observes a shutdown request.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn registrar(&self) -> Registrar {
        self.registrar.clone()
    }

    pub fn subscribe<F>(
        &self,
        channel: &str,
        subscriber: impl Into<SubscriberId>,
        callback: F,
    ) -> BusResult<()>
    where
        F: Fn(&Message) -> CallbackResult + 'static,
    {
        self.registrar.subscribe(channel, subscriber, callback)
    }

    pub fn unsubscribe(&self, channel: &str, subscriber: impl Into<SubscriberId>) -> bool {
        self.registrar.unsubscribe(channel, subscriber)
    }

    pub fn unsubscribe_all(&self, subscriber: impl Into<SubscriberId>) -> Vec<String> {
        self.registrar.unsubscribe_all(subscriber)
    }

    pub fn subscribers(&self, channel: &str) -> Vec<SubscriberId> {
        self.registrar.subscribers(channel)
    }

    /// Receive every callback failure in addition to the error log.
    pub fn on_failure<F>(&self, sink: F)
    where
        F: Fn(&DeliveryFailure) + 'static,
    {
        *self.failure_sink.borrow_mut() = Some(Rc::new(sink));
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.get()
    }

    pub fn phase(&self) -> DispatchPhase {
        self.phase.get()
    }

    /// Run one fair pass over all channels. Returns the number of messages
    /// dispatched. Does nothing unless the bus is running.
    ///
    /// Hosts that drive dispatch from their own timer call this on every
    /// tick, and call `shutdown` once `bus().state()` leaves `Running`.
    pub fn poll(&self) -> usize {
        if self.phase.get() == DispatchPhase::Dispatching {
            warn!("Ignoring poll from inside a subscriber callback");
            return 0;
        }
        if self.bus.state() != LoopState::Running {
            return 0;
        }
        self.dispatch_pass()
    }

    /// Dispatch until shutdown is requested, then finish with the configured
    /// grace period. Sleeps while idle; any publish wakes it.
    pub fn run(&self) -> ShutdownReport {
        if self.phase.get() == DispatchPhase::Dispatching {
            warn!("Ignoring run from inside a subscriber callback");
            return ShutdownReport::default();
        }

        info!(
            "Dispatch loop running over {} channel(s)",
            self.bus.channel_names().len()
        );
        while self.bus.state() == LoopState::Running {
            if self.poll() == 0 {
                let _ = self.bus.doorbell().recv_timeout(self.idle_interval);
            }
        }
        self.finish(self.grace)
    }

    /// Stop the loop from the dispatch thread. Messages already enqueued are
    /// delivered for at most `grace`; the rest are dropped and reported.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.bus.request_shutdown();
        if self.phase.get() == DispatchPhase::Dispatching {
            // The enclosing run() finishes once this callback returns.
            return ShutdownReport::default();
        }
        self.finish(grace)
    }

    fn finish(&self, grace: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.bus.state() == LoopState::Stopped {
            return report;
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            let dispatched = self.dispatch_pass();
            if dispatched == 0 {
                break;
            }
            report.delivered += dispatched;
        }

        for channel in self.bus.channels() {
            let dropped = channel.drain();
            if dropped > 0 {
                warn!(
                    "Dropped {} undelivered message(s) on '{}' at shutdown",
                    dropped,
                    channel.name()
                );
                report.dropped.insert(channel.name().to_string(), dropped);
            }
        }

        self.bus.mark_stopped();
        info!(
            "Dispatch loop stopped ({} delivered during grace, {} dropped)",
            report.delivered,
            report.total_dropped()
        );
        report
    }

    fn dispatch_pass(&self) -> usize {
        let channels = self.bus.channels();
        if channels.is_empty() {
            return 0;
        }

        let start = self.cursor.get() % channels.len();
        self.cursor.set(start.wrapping_add(1));

        let mut dispatched = 0;
        for offset in 0..channels.len() {
            let channel = &channels[(start + offset) % channels.len()];
            if let Some(message) = channel.dequeue() {
                self.deliver(&message);
                dispatched += 1;
            }
        }
        dispatched
    }

    fn deliver(&self, message: &Message) {
        // Resolved right after dequeue: later unsubscribes do not affect it.
        let routes = self.registrar.router.borrow().resolve(message.channel());
        self.update_stats(|s| s.messages += 1);

        if routes.is_empty() {
            trace!(
                "No subscribers for '{}' #{}",
                message.channel(),
                message.sequence()
            );
            return;
        }

        self.phase.set(DispatchPhase::Dispatching);
        for route in &routes {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (route.callback)(message)));
            let reason = match outcome {
                Ok(Ok(())) => {
                    self.update_stats(|s| s.deliveries += 1);
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(payload) => format!("panicked: {}", panic_reason(payload.as_ref())),
            };
            self.report_failure(DeliveryFailure {
                channel: message.channel().to_string(),
                sequence: message.sequence(),
                subscriber: route.subscriber.clone(),
                reason,
            });
        }
        self.phase.set(DispatchPhase::Idle);
    }

    fn report_failure(&self, failure: DeliveryFailure) {
        error!("{}", failure.to_error());
        self.update_stats(|s| s.failures += 1);

        let sink = self.failure_sink.borrow().clone();
        if let Some(sink) = sink {
            sink(&failure);
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut DispatchStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.bus.state() != LoopState::Stopped {
            self.bus.request_shutdown();
            self.finish(Duration::ZERO);
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
