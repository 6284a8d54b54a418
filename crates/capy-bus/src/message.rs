//! Message and subscriber identity types.

use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

/// Opaque application payload carried by a message.
pub type Payload = serde_json::Value;

/// A message published on a channel.
///
/// Cloning is cheap: the payload is shared read-only between the queue and
/// every subscriber of the fan-out.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    channel: Arc<str>,
    sequence: u64,
    payload: Arc<Payload>,
}

impl Message {
    /// Build a message outside the bus, e.g. to drive a subscriber in tests.
    pub fn new(channel: impl Into<Arc<str>>, sequence: u64, payload: Payload) -> Self {
        Self {
            channel: channel.into(),
            sequence,
            payload: Arc::new(payload),
        }
    }

    /// Name of the channel the message was published on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Per-channel sequence number, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Deserialize the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.payload.as_ref())
    }
}

/// Identity of a subscriber, usually the panel name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(Arc<str>);

impl SubscriberId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for SubscriberId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&SubscriberId> for SubscriberId {
    fn from(value: &SubscriberId) -> Self {
        value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reading {
        x: i32,
    }

    #[test]
    fn test_decode_typed_payload() {
        let msg = Message::new("events", 1, json!({"x": 1}));
        assert_eq!(msg.decode::<Reading>().unwrap(), Reading { x: 1 });
        assert!(msg.decode::<Vec<u8>>().is_err());
    }

    #[test]
    fn test_clone_shares_payload() {
        let msg = Message::new("events", 7, json!("hello"));
        let copy = msg.clone();
        assert!(std::ptr::eq(msg.payload(), copy.payload()));
        assert_eq!(copy.channel(), "events");
        assert_eq!(copy.sequence(), 7);
    }
}
