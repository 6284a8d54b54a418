//! capy-bus - Inter-panel message bus
//!
//! Features:
//! - Named channels with per-channel FIFO order and sequence numbers
//! - Bounded queues with blocking publish and timeout (backpressure)
//! - Single dispatch thread: subscriber callbacks never need to be `Send`
//! - Failing or panicking subscribers are isolated and reported
//! - Graceful shutdown with a bounded grace period

pub mod channel;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod registry;
pub mod router;

pub use channel::{Channel, ChannelOptions, DEFAULT_TIMEOUT};
pub use dispatch::{
    DEFAULT_GRACE, DEFAULT_IDLE_INTERVAL, DeliveryFailure, DispatchPhase, DispatchStats,
    Dispatcher, Registrar, ShutdownReport,
};
pub use error::{BusError, BusResult};
pub use message::{Message, Payload, SubscriberId};
pub use registry::{Bus, LoopState, Publisher};
pub use router::{Callback, CallbackResult, Route, Router};
