//! Bus registry: the process-scoped set of channels.
//!
//! `Bus` is cheap to clone and `Send + Sync`; hand clones (or `Publisher`s)
//! to worker threads. The dispatch side is taken once with
//! [`Bus::dispatcher`] and stays on the thread that owns UI state.

use crate::channel::{Channel, ChannelOptions};
use crate::dispatch::Dispatcher;
use crate::error::{BusError, BusResult};
use crate::message::{Payload, SubscriberId};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Lifecycle of the dispatch loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Running => write!(f, "Running"),
            LoopState::Stopping => write!(f, "Stopping"),
            LoopState::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Default)]
struct ChannelTable {
    /// Creation order, used for round-robin dispatch.
    ordered: Vec<Arc<Channel>>,
    by_name: HashMap<String, Arc<Channel>>,
}

struct BusInner {
    channels: RwLock<ChannelTable>,
    state: Mutex<LoopState>,
    state_changed: Condvar,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
    dispatcher_taken: AtomicBool,
}

#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        let (doorbell_tx, doorbell_rx) = bounded(1);
        Self {
            inner: Arc::new(BusInner {
                channels: RwLock::new(ChannelTable::default()),
                state: Mutex::new(LoopState::Running),
                state_changed: Condvar::new(),
                doorbell_tx,
                doorbell_rx,
                dispatcher_taken: AtomicBool::new(false),
            }),
        }
    }

    /// Create a named channel. Called once per name during startup wiring.
    pub fn create_channel(&self, name: &str, options: ChannelOptions) -> BusResult<()> {
        // Lock order is state, then table. Holding the state lock keeps a
        // concurrent shutdown from missing the new channel.
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *state != LoopState::Running {
            return Err(BusError::BusClosed);
        }
        let mut table = self
            .inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if table.by_name.contains_key(name) {
            return Err(BusError::DuplicateChannel(name.to_string()));
        }

        let channel = Arc::new(Channel::new(
            name,
            options,
            self.inner.doorbell_tx.clone(),
        )?);
        table.ordered.push(Arc::clone(&channel));
        table.by_name.insert(name.to_string(), channel);

        info!(
            "Created channel '{}' (capacity: {}, timeout: {:?})",
            name,
            options
                .capacity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unbounded".to_string()),
            options.timeout
        );
        Ok(())
    }

    /// Publish a payload, blocking up to the channel timeout when it is full.
    /// Returns the sequence number assigned to the message.
    pub fn publish(&self, channel: &str, payload: Payload) -> BusResult<u64> {
        let target = self.channel(channel)?;
        let sequence = target.enqueue(payload)?;
        debug!("Published '{}' #{}", channel, sequence);
        Ok(sequence)
    }

    /// Publish without waiting for space. Use this from the dispatch thread.
    pub fn try_publish(&self, channel: &str, payload: Payload) -> BusResult<u64> {
        let target = self.channel(channel)?;
        let sequence = target.try_enqueue(payload)?;
        debug!("Published '{}' #{}", channel, sequence);
        Ok(sequence)
    }

    /// Serialize a value to JSON and publish it.
    pub fn publish_json<T: Serialize>(&self, channel: &str, value: &T) -> BusResult<u64> {
        let target = self.channel(channel)?;
        let payload = serde_json::to_value(value)?;
        target.enqueue(payload)
    }

    /// A publish capability bound to a panel identity.
    pub fn publisher(&self, source: impl Into<SubscriberId>) -> Publisher {
        Publisher {
            bus: self.clone(),
            source: source.into(),
        }
    }

    /// Take the dispatch side of this bus. Only one dispatcher may exist.
    pub fn dispatcher(&self) -> BusResult<Dispatcher> {
        if self.inner.dispatcher_taken.swap(true, Ordering::AcqRel) {
            return Err(BusError::DispatcherTaken);
        }
        Ok(Dispatcher::new(self.clone()))
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channel(name).is_ok()
    }

    /// Channel names in creation order.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Number of pending messages on a channel.
    pub fn pending(&self, channel: &str) -> BusResult<usize> {
        Ok(self.channel(channel)?.len())
    }

    pub fn state(&self) -> LoopState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin shutdown without waiting. Publishes fail with `BusClosed` from
    /// here on, blocked publishers are released, and the dispatcher wakes.
    pub fn request_shutdown(&self) {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state != LoopState::Running {
                return;
            }
            // Every channel is closed before anyone can observe `Stopping`.
            for channel in self.channels() {
                channel.close();
            }
            *state = LoopState::Stopping;
            self.inner.state_changed.notify_all();
        }

        info!("Bus shutdown requested");
        let _ = self.inner.doorbell_tx.try_send(());
    }

    /// Request shutdown and wait until the dispatcher has stopped.
    /// Returns false if it did not stop within `wait`.
    ///
    /// Must not be called from the dispatch thread while it is inside
    /// `Dispatcher::run`, use `Dispatcher::shutdown` there.
    pub fn shutdown(&self, wait: Duration) -> bool {
        self.request_shutdown();
        self.wait_stopped(wait)
    }

    /// Block until the loop reaches `Stopped` or `timeout` elapses.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .inner
            .state_changed
            .wait_timeout_while(state, timeout, |s| *s != LoopState::Stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *state == LoopState::Stopped
    }

    pub(crate) fn mark_stopped(&self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *state = LoopState::Stopped;
        self.inner.state_changed.notify_all();
    }

    pub(crate) fn channels(&self) -> Vec<Arc<Channel>> {
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .clone()
    }

    pub(crate) fn doorbell(&self) -> &Receiver<()> {
        &self.inner.doorbell_rx
    }

    fn channel(&self, name: &str) -> BusResult<Arc<Channel>> {
        // Clone the Arc out so no registry lock is held while a publish blocks.
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::UnknownChannel(name.to_string()))
    }
}

/// Publish-target handed to a panel. Carries the panel identity for logging.
#[derive(Clone)]
pub struct Publisher {
    bus: Bus,
    source: SubscriberId,
}

impl Publisher {
    pub fn source(&self) -> &SubscriberId {
        &self.source
    }

    pub fn publish(&self, channel: &str, payload: Payload) -> BusResult<u64> {
        debug!("'{}' publishing to '{}'", self.source, channel);
        self.bus.publish(channel, payload)
    }

    pub fn try_publish(&self, channel: &str, payload: Payload) -> BusResult<u64> {
        debug!("'{}' publishing to '{}' (no wait)", self.source, channel);
        self.bus.try_publish(channel, payload)
    }

    /// Serialize `content` to JSON and publish it.
    pub fn broadcast<T: Serialize>(&self, channel: &str, content: &T) -> BusResult<u64> {
        debug!("'{}' broadcasting to '{}'", self.source, channel);
        self.bus.publish_json(channel, content)
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.bus.has_channel(channel)
    }

    pub fn is_closed(&self) -> bool {
        self.bus.state() != LoopState::Running
    }
}
