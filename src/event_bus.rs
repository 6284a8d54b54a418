//! Bus wiring for the host.
//!
//! Channels come from the config and are created before any panel exists.
//! Subscriber failures are counted per panel and channel so the host can
//! summarise them on exit.

use crate::config::ChannelDef;
use capy_bus::{Bus, BusResult, DeliveryFailure, Dispatcher};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Longest the dispatch loop sleeps while idle.
pub const EVENT_POLL_INTERVAL_MS: u64 = 50;

/// How long pending messages may still be delivered during shutdown.
pub const SHUTDOWN_GRACE_MS: u64 = 500;

/// Create every configured channel. Stops at the first invalid or duplicate one.
pub fn create_channels(bus: &Bus, defs: &[ChannelDef]) -> BusResult<()> {
    for def in defs {
        bus.create_channel(&def.name, def.options())?;
    }
    Ok(())
}

/// Failure counts per (subscriber, channel).
#[derive(Default)]
pub struct FailureLedger {
    counts: RefCell<BTreeMap<(String, String), usize>>,
}

impl FailureLedger {
    pub fn install(dispatcher: &Dispatcher) -> Rc<Self> {
        let ledger = Rc::new(Self::default());
        let sink = Rc::clone(&ledger);
        dispatcher.on_failure(move |failure| sink.record(failure));
        ledger
    }

    fn record(&self, failure: &DeliveryFailure) {
        *self
            .counts
            .borrow_mut()
            .entry((failure.subscriber.to_string(), failure.channel.clone()))
            .or_default() += 1;
    }

    pub fn total(&self) -> usize {
        self.counts.borrow().values().sum()
    }

    /// One line per subscriber and channel, e.g. `logger on sysmon: 3`.
    pub fn summary(&self) -> Vec<String> {
        self.counts
            .borrow()
            .iter()
            .map(|((subscriber, channel), n)| format!("{subscriber} on {channel}: {n}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capy_bus::{BusError, CallbackResult, Message};
    use serde_json::json;

    fn def(name: &str, capacity: Option<usize>) -> ChannelDef {
        ChannelDef {
            name: name.to_string(),
            timeout_ms: 1000,
            capacity,
        }
    }

    #[test]
    fn test_create_channels() {
        let bus = Bus::new();
        create_channels(&bus, &[def("sysmon", Some(4)), def("alerts", None)]).unwrap();
        assert_eq!(bus.channel_names(), vec!["sysmon", "alerts"]);
    }

    #[test]
    fn test_create_channels_is_fatal_on_bad_definitions() {
        let bus = Bus::new();
        assert!(matches!(
            create_channels(&bus, &[def("sysmon", None), def("sysmon", None)]),
            Err(BusError::DuplicateChannel(_))
        ));
        assert!(matches!(
            create_channels(&bus, &[def("zero", Some(0))]),
            Err(BusError::InvalidChannel { .. })
        ));
    }

    #[test]
    fn test_failure_ledger_counts() {
        let bus = Bus::new();
        create_channels(&bus, &[def("sysmon", None), def("alerts", None)]).unwrap();
        let dispatcher = bus.dispatcher().unwrap();
        let ledger = FailureLedger::install(&dispatcher);

        for channel in ["sysmon", "alerts"] {
            dispatcher
                .subscribe(channel, "flaky", |_: &Message| -> CallbackResult {
                    Err("not ready".into())
                })
                .unwrap();
        }
        bus.publish("sysmon", json!(1)).unwrap();
        bus.publish("sysmon", json!(2)).unwrap();
        bus.publish("alerts", json!(3)).unwrap();
        while dispatcher.poll() > 0 {}

        assert_eq!(ledger.total(), 3);
        assert_eq!(
            ledger.summary(),
            vec!["flaky on alerts: 1", "flaky on sysmon: 2"]
        );
    }
}
