//! Host calls: requests a panel sends to the panel manager at runtime.
//!
//! A request travels over the reserved [`HOST_CALL_CHANNEL`] like any other
//! message, so it is handled on the dispatch thread in publish order. The
//! manager answers through `PanelInstance::on_host_result` on the sender.

use crate::config::PanelDef;
use capy_bus::{BusResult, Publisher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bus channel carrying host call requests. Created by the panel manager.
pub const HOST_CALL_CHANNEL: &str = "capydash.host";

/// Subscriber id the manager uses on [`HOST_CALL_CHANNEL`].
pub const HOST_SUBSCRIBER: &str = "capydash";

/// Wire form of a request, as published on [`HOST_CALL_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRequest {
    pub sender: String,
    pub call: String,
    #[serde(default)]
    pub args: Value,
}

/// Public operations a panel may ask the host for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", content = "args", rename_all = "snake_case")]
pub enum HostCall {
    CreatePanel(PanelDef),
    DestroyPanel {
        name: String,
    },
    /// `panel` defaults to the sender.
    Subscribe {
        channel: String,
        #[serde(default)]
        panel: Option<String>,
    },
    Unsubscribe {
        channel: String,
        #[serde(default)]
        panel: Option<String>,
    },
    ChannelNames,
    SubscriberNames {
        channel: String,
    },
    PanelNames,
}

impl HostCall {
    /// Calls starting with `_` are private to the host and never parsed.
    pub fn is_private(call: &str) -> bool {
        call.starts_with('_')
    }

    pub fn from_request(request: &HostRequest) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "call": request.call,
            "args": request.args,
        }))
    }
}

/// Outcome of one host call, delivered back to the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCallResult {
    /// Sequence number of the request on [`HOST_CALL_CHANNEL`].
    pub request: u64,
    pub call: String,
    pub success: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl HostCallResult {
    pub fn new(request: u64, call: &str, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(value) => Self {
                request,
                call: call.to_string(),
                success: true,
                value,
                error: None,
            },
            Err(error) => Self {
                request,
                call: call.to_string(),
                success: false,
                value: Value::Null,
                error: Some(error),
            },
        }
    }
}

/// Lets a panel send host calls under its own name.
#[derive(Clone)]
pub struct HostHandle {
    publisher: Publisher,
}

impl HostHandle {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// Queue a host call. Returns the request number that the matching
    /// `HostCallResult::request` will carry.
    ///
    /// Never blocks, so it is safe from `on_message`.
    pub fn call(&self, call: &str, args: Value) -> BusResult<u64> {
        let request = HostRequest {
            sender: self.publisher.source().to_string(),
            call: call.to_string(),
            args,
        };
        self.publisher
            .try_publish(HOST_CALL_CHANNEL, serde_json::to_value(&request)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(call: &str, args: Value) -> HostRequest {
        HostRequest {
            sender: "p1".to_string(),
            call: call.to_string(),
            args,
        }
    }

    #[test]
    fn test_parse_calls() {
        assert_eq!(
            HostCall::from_request(&request("subscribe", json!({ "channel": "a" }))).unwrap(),
            HostCall::Subscribe {
                channel: "a".to_string(),
                panel: None
            }
        );
        assert_eq!(
            HostCall::from_request(&request("channel_names", Value::Null)).unwrap(),
            HostCall::ChannelNames
        );
        let create = HostCall::from_request(&request(
            "create_panel",
            json!({ "name": "log2", "kind": "logger", "channels": ["a"] }),
        ))
        .unwrap();
        assert!(matches!(create, HostCall::CreatePanel(def) if def.name == "log2" && def.show));
    }

    #[test]
    fn test_unknown_or_malformed_calls() {
        assert!(HostCall::from_request(&request("reboot", Value::Null)).is_err());
        assert!(HostCall::from_request(&request("subscribe", json!({ "chan": "a" }))).is_err());
        assert!(HostCall::is_private("_broadcast"));
        assert!(!HostCall::is_private("subscribe"));
    }

    #[test]
    fn test_result_shape() {
        let ok = HostCallResult::new(3, "panel_names", Ok(json!(["a"])));
        assert!(ok.success);
        assert_eq!(ok.error, None);

        let failed = HostCallResult::new(4, "subscribe", Err("Unknown channel: x".to_string()));
        assert!(!failed.success);
        assert!(failed.value.is_null());
        assert_eq!(failed.error.as_deref(), Some("Unknown channel: x"));
    }
}
