//! Channel: an ordered, bounded mailbox for one named topic.
//!
//! Any thread may enqueue. Only the dispatcher dequeues.
//! Sequence numbers are assigned under the same lock that appends to the
//! queue, so sequence order is always queue order.

use crate::error::{BusError, BusResult};
use crate::message::{Message, Payload};
use crossbeam_channel::Sender;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default time a publish may wait for queue space.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Depth at which an unbounded channel starts warning about growth.
pub const ADVISORY_DEPTH: usize = 1024;

/// Queuing policy of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Maximum number of pending messages. `None` means unbounded.
    pub capacity: Option<usize>,
    /// Maximum time a publish blocks waiting for space.
    pub timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            capacity: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ChannelOptions {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct QueueState {
    queue: VecDeque<Message>,
    next_sequence: u64,
    closed: bool,
    above_advisory: bool,
}

pub struct Channel {
    name: Arc<str>,
    options: ChannelOptions,
    state: Mutex<QueueState>,
    not_full: Condvar,
    /// Rung after every enqueue so an idle dispatcher wakes up.
    doorbell: Sender<()>,
}

impl Channel {
    pub(crate) fn new(name: &str, options: ChannelOptions, doorbell: Sender<()>) -> BusResult<Self> {
        if name.trim().is_empty() {
            return Err(BusError::InvalidChannel {
                name: name.to_string(),
                reason: "name must not be empty".to_string(),
            });
        }
        if options.capacity == Some(0) {
            return Err(BusError::InvalidChannel {
                name: name.to_string(),
                reason: "capacity must be at least 1".to_string(),
            });
        }

        Ok(Self {
            name: Arc::from(name),
            options,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                next_sequence: 1,
                closed: false,
                above_advisory: false,
            }),
            not_full: Condvar::new(),
            doorbell,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> ChannelOptions {
        self.options
    }

    /// Number of pending messages.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append a message, waiting up to the channel timeout for space.
    /// Returns the sequence number assigned to the message.
    pub(crate) fn enqueue(&self, payload: Payload) -> BusResult<u64> {
        self.enqueue_within(payload, self.options.timeout)
    }

    /// Append a message without waiting for space.
    pub(crate) fn try_enqueue(&self, payload: Payload) -> BusResult<u64> {
        self.enqueue_within(payload, Duration::ZERO)
    }

    fn enqueue_within(&self, payload: Payload, timeout: Duration) -> BusResult<u64> {
        let mut state = self.lock();
        if state.closed {
            return Err(BusError::BusClosed);
        }

        if let Some(capacity) = self.options.capacity {
            let deadline = Instant::now() + timeout;
            while state.queue.len() >= capacity {
                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        "Channel '{}' full ({} pending), publish rejected after {:?}",
                        self.name, capacity, timeout
                    );
                    return Err(BusError::ChannelFull {
                        channel: self.name.to_string(),
                        timeout,
                    });
                }
                let (guard, _) = self
                    .not_full
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                if state.closed {
                    return Err(BusError::BusClosed);
                }
            }
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state
            .queue
            .push_back(Message::new(Arc::clone(&self.name), sequence, payload));

        let depth = state.queue.len();
        if self.options.capacity.is_none() {
            if depth >= ADVISORY_DEPTH && !state.above_advisory {
                state.above_advisory = true;
                warn!(
                    "Channel '{}' has {} pending messages, dispatcher is falling behind",
                    self.name, depth
                );
            } else if depth < ADVISORY_DEPTH {
                state.above_advisory = false;
            }
        }
        drop(state);

        // Full doorbell means a wake-up is already pending.
        let _ = self.doorbell.try_send(());
        Ok(sequence)
    }

    /// Remove and return the head of the queue.
    pub(crate) fn dequeue(&self) -> Option<Message> {
        let mut state = self.lock();
        let message = state.queue.pop_front();
        if message.is_some() {
            self.not_full.notify_all();
        }
        message
    }

    /// Reject further publishes and wake every blocked publisher.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.not_full.notify_all();
    }

    /// Discard every pending message. Returns how many were dropped.
    pub(crate) fn drain(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.queue.len();
        if let (Some(first), Some(last)) = (state.queue.front(), state.queue.back()) {
            debug!(
                "Draining channel '{}': dropping #{}..=#{}",
                self.name,
                first.sequence(),
                last.sequence()
            );
        }
        state.queue.clear();
        self.not_full.notify_all();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}
