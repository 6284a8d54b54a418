//! Panel lifecycle on top of the bus.
//!
//! The manager owns every panel instance and wires its configured channels
//! to `PanelInstance::on_message`. Destroying a panel removes all of its
//! subscriptions, so a torn-down panel never receives another message.

use crate::config::{Constants, DockPosition, PanelDef};
use capy_bus::{
    Bus, BusError, CallbackResult, ChannelOptions, Dispatcher, Message, Publisher, Registrar,
};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

pub mod factory;
pub mod host;

pub use factory::PanelFactory;
pub use host::{HOST_CALL_CHANNEL, HostCall, HostCallResult, HostHandle, HostRequest};

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("Unknown panel kind: {0}")]
    UnknownKind(String),

    #[error("Panel already exists: {0}")]
    DuplicatePanel(String),

    #[error("Unknown panel: {0}")]
    UnknownPanel(String),

    #[error("Invalid arguments for '{panel}': {reason}")]
    InvalidArgs { panel: String, reason: String },

    #[error("Only public host calls are allowed: {0}")]
    PrivateCall(String),

    #[error("Invalid host call '{call}': {reason}")]
    InvalidCall { call: String, reason: String },

    #[error("Failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// A live panel. All methods run on the dispatch thread.
pub trait PanelInstance {
    fn name(&self) -> &str;
    fn on_show(&self) {}
    fn on_hide(&self) {}

    /// Called for every message on the panel's subscribed channels.
    fn on_message(&self, message: &Message) -> CallbackResult {
        let _ = message;
        Ok(())
    }

    /// Answer to a call this panel sent through its `HostHandle`.
    fn on_host_result(&self, result: &HostCallResult) {
        let _ = result;
    }

    /// Stop workers and release resources. Called once.
    fn on_teardown(&self) {}
}

/// Everything a factory gets to build one panel.
pub struct PanelContext {
    pub name: String,
    pub pos: DockPosition,
    pub publisher: Publisher,
    pub args: Value,
    pub constants: Arc<Constants>,
}

impl PanelContext {
    /// Deserialize the panel's `args`; missing args give the defaults.
    pub fn parse_args<T: DeserializeOwned + Default>(&self) -> Result<T, PanelError> {
        if self.args.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.args.clone()).map_err(|e| PanelError::InvalidArgs {
            panel: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// A string from the shared constants.
    pub fn constant_str(&self, key: &str) -> Option<&str> {
        self.constants.get(key).and_then(|v| v.as_str())
    }

    /// Check that a channel this panel publishes to exists.
    pub fn require_channel(&self, channel: &str) -> Result<(), PanelError> {
        if self.publisher.has_channel(channel) {
            Ok(())
        } else {
            Err(PanelError::Bus(BusError::UnknownChannel(channel.to_string())))
        }
    }

    /// Handle for sending host calls as this panel.
    pub fn host(&self) -> HostHandle {
        HostHandle::new(self.publisher.clone())
    }
}

struct ManagedPanel {
    instance: Rc<dyn PanelInstance>,
    visible: bool,
}

struct ManagerInner {
    factories: RefCell<Vec<Box<dyn PanelFactory>>>,
    panels: RefCell<Vec<ManagedPanel>>,
    registrar: Registrar,
    bus: Bus,
    constants: Arc<Constants>,
}

/// The main manager that coordinates all panels.
///
/// Clones share the same panels. The manager also answers host calls, so it
/// stays on the dispatch thread.
#[derive(Clone)]
pub struct PanelManager {
    inner: Rc<ManagerInner>,
}

impl PanelManager {
    /// Create the manager and its host call channel on the dispatcher's bus.
    pub fn new(dispatcher: &Dispatcher, constants: Constants) -> Result<Self, PanelError> {
        let bus = dispatcher.bus().clone();
        bus.create_channel(HOST_CALL_CHANNEL, ChannelOptions::default())?;

        let manager = Self {
            inner: Rc::new(ManagerInner {
                factories: RefCell::new(Vec::new()),
                panels: RefCell::new(Vec::new()),
                registrar: dispatcher.registrar(),
                bus,
                constants: Arc::new(constants),
            }),
        };

        let weak: Weak<ManagerInner> = Rc::downgrade(&manager.inner);
        manager.inner.registrar.subscribe(
            HOST_CALL_CHANNEL,
            host::HOST_SUBSCRIBER,
            move |msg: &Message| match weak.upgrade() {
                Some(inner) => PanelManager { inner }.handle_host_call(msg),
                None => Ok(()),
            },
        )?;
        Ok(manager)
    }

    pub fn register_factory<F: PanelFactory + 'static>(&self, factory: F) {
        debug!("Registered panel factory '{}'", factory.type_id());
        self.inner.factories.borrow_mut().push(Box::new(factory));
    }

    /// Create every configured panel, in order.
    pub fn start(&self, panels: &[PanelDef]) -> Result<(), PanelError> {
        for def in panels {
            self.create_panel(def)?;
        }
        info!("Started {} panel(s)", self.inner.panels.borrow().len());
        Ok(())
    }

    pub fn create_panel(&self, def: &PanelDef) -> Result<(), PanelError> {
        if self.find(&def.name).is_some() || def.name == host::HOST_SUBSCRIBER {
            return Err(PanelError::DuplicatePanel(def.name.clone()));
        }

        let ctx = PanelContext {
            name: def.name.clone(),
            pos: def.pos,
            publisher: self.inner.bus.publisher(def.name.as_str()),
            args: def.args.clone(),
            constants: Arc::clone(&self.inner.constants),
        };
        let instance: Rc<dyn PanelInstance> = {
            let factories = self.inner.factories.borrow();
            let factory = factories
                .iter()
                .find(|f| f.type_id() == def.kind)
                .ok_or_else(|| PanelError::UnknownKind(def.kind.clone()))?;
            Rc::from(factory.create_instance(ctx)?)
        };

        for channel in &def.channels {
            if let Err(e) = self.subscribe_instance(&instance, channel) {
                self.inner.registrar.unsubscribe_all(def.name.as_str());
                instance.on_teardown();
                return Err(e.into());
            }
        }

        if def.show {
            instance.on_show();
        }
        info!(
            "Created panel '{}' ({}) at {:?}, subscribed to {:?}",
            def.name, def.kind, def.pos, def.channels
        );
        self.inner.panels.borrow_mut().push(ManagedPanel {
            instance,
            visible: def.show,
        });
        Ok(())
    }

    /// Remove a panel from every channel and tear it down.
    pub fn destroy_panel(&self, name: &str) -> Result<(), PanelError> {
        let panel = {
            let mut panels = self.inner.panels.borrow_mut();
            let index = panels
                .iter()
                .position(|p| p.instance.name() == name)
                .ok_or_else(|| PanelError::UnknownPanel(name.to_string()))?;
            panels.remove(index)
        };

        let left = self.inner.registrar.unsubscribe_all(name);
        if panel.visible {
            panel.instance.on_hide();
        }
        panel.instance.on_teardown();
        info!("Destroyed panel '{}' (left {} channel(s))", name, left.len());
        Ok(())
    }

    /// Subscribe an existing panel to one more channel.
    pub fn subscribe(&self, name: &str, channel: &str) -> Result<(), PanelError> {
        let instance = self
            .find(name)
            .ok_or_else(|| PanelError::UnknownPanel(name.to_string()))?;
        Ok(self.subscribe_instance(&instance, channel)?)
    }

    /// Returns false if the panel was not subscribed.
    pub fn unsubscribe(&self, name: &str, channel: &str) -> Result<bool, PanelError> {
        if self.find(name).is_none() {
            return Err(PanelError::UnknownPanel(name.to_string()));
        }
        Ok(self.inner.registrar.unsubscribe(channel, name))
    }

    /// Destroy every panel, newest first.
    pub fn teardown(&self) {
        let names: Vec<String> = self.panel_names().into_iter().rev().collect();
        for name in names {
            if let Err(e) = self.destroy_panel(&name) {
                warn!("Failed to destroy panel '{}': {}", name, e);
            }
        }
    }

    pub fn panel_names(&self) -> Vec<String> {
        self.inner
            .panels
            .borrow()
            .iter()
            .map(|p| p.instance.name().to_string())
            .collect()
    }

    /// Channels a panel is currently subscribed to.
    pub fn subscriptions(&self, name: &str) -> Vec<String> {
        self.inner.registrar.channels_of(name)
    }

    /// Run one host call on behalf of `sender`.
    pub fn execute(&self, sender: &str, request: &HostRequest) -> Result<Value, PanelError> {
        if HostCall::is_private(&request.call) {
            return Err(PanelError::PrivateCall(request.call.clone()));
        }
        let call = HostCall::from_request(request).map_err(|e| PanelError::InvalidCall {
            call: request.call.clone(),
            reason: e.to_string(),
        })?;
        debug!("Host call from '{}': {:?}", sender, call);

        match call {
            HostCall::CreatePanel(def) => self.create_panel(&def).map(|_| Value::Null),
            HostCall::DestroyPanel { name } => self.destroy_panel(&name).map(|_| Value::Null),
            HostCall::Subscribe { channel, panel } => self
                .subscribe(panel.as_deref().unwrap_or(sender), &channel)
                .map(|_| Value::Null),
            HostCall::Unsubscribe { channel, panel } => self
                .unsubscribe(panel.as_deref().unwrap_or(sender), &channel)
                .map(Value::Bool),
            HostCall::ChannelNames => Ok(json!(self.inner.bus.channel_names())),
            HostCall::SubscriberNames { channel } => {
                if !self.inner.bus.has_channel(&channel) {
                    return Err(BusError::UnknownChannel(channel).into());
                }
                let names: Vec<String> = self
                    .inner
                    .registrar
                    .subscribers(&channel)
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                Ok(json!(names))
            }
            HostCall::PanelNames => Ok(json!(self.panel_names())),
        }
    }

    fn handle_host_call(&self, message: &Message) -> CallbackResult {
        let request: HostRequest = message.decode()?;
        let outcome = self.execute(&request.sender, &request);
        if let Err(e) = &outcome {
            error!("Host call '{}' from '{}' failed: {}", request.call, request.sender, e);
        } else {
            info!("Host call '{}' from '{}' done", request.call, request.sender);
        }

        let result = HostCallResult::new(
            message.sequence(),
            &request.call,
            outcome.map_err(|e| e.to_string()),
        );
        match self.find(&request.sender) {
            Some(sender) => sender.on_host_result(&result),
            None => debug!(
                "Host call sender '{}' is gone, result dropped",
                request.sender
            ),
        }
        Ok(())
    }

    fn subscribe_instance(
        &self,
        instance: &Rc<dyn PanelInstance>,
        channel: &str,
    ) -> Result<(), BusError> {
        let target = Rc::clone(instance);
        self.inner
            .registrar
            .subscribe(channel, instance.name(), move |msg: &Message| {
                target.on_message(msg)
            })
    }

    fn find(&self, name: &str) -> Option<Rc<dyn PanelInstance>> {
        self.inner
            .panels
            .borrow()
            .iter()
            .find(|p| p.instance.name() == name)
            .map(|p| Rc::clone(&p.instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capy_bus::ChannelOptions;
    use serde::Deserialize;
    use serde_json::json;

    type Events = Rc<RefCell<Vec<String>>>;
    type Results = Rc<RefCell<Vec<HostCallResult>>>;

    /// Records its lifecycle. A message carrying `call` is forwarded to the
    /// host as a host call.
    struct RecorderPanel {
        name: String,
        events: Events,
        results: Results,
        host: HostHandle,
    }

    impl PanelInstance for RecorderPanel {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_show(&self) {
            self.events.borrow_mut().push(format!("{}:show", self.name));
        }

        fn on_hide(&self) {
            self.events.borrow_mut().push(format!("{}:hide", self.name));
        }

        fn on_message(&self, message: &Message) -> CallbackResult {
            self.events.borrow_mut().push(format!(
                "{}:{}#{}",
                self.name,
                message.channel(),
                message.sequence()
            ));
            if let Some(call) = message.payload().get("call").and_then(|c| c.as_str()) {
                let args = message.payload().get("args").cloned().unwrap_or(Value::Null);
                self.host.call(call, args)?;
            }
            Ok(())
        }

        fn on_host_result(&self, result: &HostCallResult) {
            self.results.borrow_mut().push(result.clone());
        }

        fn on_teardown(&self) {
            self.events.borrow_mut().push(format!("{}:teardown", self.name));
        }
    }

    struct RecorderFactory {
        events: Events,
        results: Results,
    }

    impl PanelFactory for RecorderFactory {
        fn type_id(&self) -> &str {
            "recorder"
        }

        fn create_instance(&self, ctx: PanelContext) -> Result<Box<dyn PanelInstance>, PanelError> {
            Ok(Box::new(RecorderPanel {
                host: ctx.host(),
                name: ctx.name,
                events: Rc::clone(&self.events),
                results: Rc::clone(&self.results),
            }))
        }
    }

    fn panel(name: &str, channels: &[&str]) -> PanelDef {
        PanelDef {
            name: name.to_string(),
            kind: "recorder".to_string(),
            show: true,
            pos: DockPosition::Left,
            channels: channels.iter().map(|c| c.to_string()).collect(),
            args: Value::Null,
        }
    }

    struct Harness {
        bus: Bus,
        dispatcher: Dispatcher,
        manager: PanelManager,
        events: Events,
        results: Results,
    }

    impl Harness {
        fn new() -> Self {
            let bus = Bus::new();
            bus.create_channel("a", ChannelOptions::default()).unwrap();
            bus.create_channel("b", ChannelOptions::default()).unwrap();
            let dispatcher = bus.dispatcher().unwrap();
            let events: Events = Rc::default();
            let results: Results = Rc::default();
            let manager = PanelManager::new(&dispatcher, Constants::new()).unwrap();
            manager.register_factory(RecorderFactory {
                events: Rc::clone(&events),
                results: Rc::clone(&results),
            });
            Self {
                bus,
                dispatcher,
                manager,
                events,
                results,
            }
        }

        /// Ask the host for `call` through panel p1, which listens on "a".
        fn call_through_p1(&self, call: &str, args: Value) {
            self.bus
                .publish("a", json!({ "call": call, "args": args }))
                .unwrap();
            while self.dispatcher.poll() > 0 {}
        }
    }

    #[test]
    fn test_panels_receive_subscribed_channels() {
        let Harness {
            bus,
            dispatcher,
            manager,
            events,
            ..
        } = Harness::new();
        manager
            .start(&[panel("p1", &["a", "b"]), panel("p2", &["b"])])
            .unwrap();

        bus.publish("a", json!(1)).unwrap();
        bus.publish("b", json!(2)).unwrap();
        while dispatcher.poll() > 0 {}

        assert_eq!(
            *events.borrow(),
            vec!["p1:show", "p2:show", "p1:a#1", "p1:b#1", "p2:b#1"]
        );
        assert_eq!(manager.subscriptions("p1"), vec!["a", "b"]);
    }

    #[test]
    fn test_destroy_panel_unsubscribes_everywhere() {
        let Harness {
            bus,
            dispatcher,
            manager,
            events,
            ..
        } = Harness::new();
        manager.start(&[panel("p1", &["a", "b"])]).unwrap();
        manager.destroy_panel("p1").unwrap();

        bus.publish("a", json!(1)).unwrap();
        while dispatcher.poll() > 0 {}

        assert_eq!(
            *events.borrow(),
            vec!["p1:show", "p1:hide", "p1:teardown"]
        );
        assert!(manager.panel_names().is_empty());
        assert!(dispatcher.subscribers("a").is_empty());
        assert!(matches!(
            manager.destroy_panel("p1"),
            Err(PanelError::UnknownPanel(_))
        ));
    }

    #[test]
    fn test_create_errors() {
        let Harness {
            dispatcher: _dispatcher,
            manager,
            events,
            ..
        } = Harness::new();
        manager.create_panel(&panel("p1", &["a"])).unwrap();

        assert!(matches!(
            manager.create_panel(&panel("p1", &["b"])),
            Err(PanelError::DuplicatePanel(_))
        ));

        let mut unknown = panel("p2", &[]);
        unknown.kind = "weather".to_string();
        assert!(matches!(
            manager.create_panel(&unknown),
            Err(PanelError::UnknownKind(kind)) if kind == "weather"
        ));

        // A bad channel rolls back the partial subscriptions.
        assert!(matches!(
            manager.create_panel(&panel("p3", &["a", "missing"])),
            Err(PanelError::Bus(BusError::UnknownChannel(_)))
        ));
        assert_eq!(manager.subscriptions("p3"), Vec::<String>::new());
        assert!(events.borrow().contains(&"p3:teardown".to_string()));
        assert_eq!(manager.panel_names(), vec!["p1"]);
    }

    #[test]
    fn test_teardown_newest_first() {
        let Harness {
            dispatcher: _dispatcher,
            manager,
            events,
            ..
        } = Harness::new();
        let mut hidden = panel("p2", &[]);
        hidden.show = false;
        manager.start(&[panel("p1", &[]), hidden]).unwrap();
        events.borrow_mut().clear();

        manager.teardown();
        assert_eq!(
            *events.borrow(),
            vec!["p2:teardown", "p1:hide", "p1:teardown"]
        );
    }

    #[test]
    fn test_parse_args() {
        #[derive(Debug, Default, Deserialize, PartialEq)]
        #[serde(default)]
        struct Args {
            period_ms: u64,
            label: String,
        }

        let bus = Bus::new();
        bus.create_channel("a", ChannelOptions::default()).unwrap();
        let mut ctx = PanelContext {
            name: "p".to_string(),
            pos: DockPosition::Top,
            publisher: bus.publisher("p"),
            args: Value::Null,
            constants: Arc::new(Constants::new()),
        };
        assert_eq!(ctx.parse_args::<Args>().unwrap(), Args::default());

        ctx.args = json!({ "period_ms": 10 });
        assert_eq!(ctx.parse_args::<Args>().unwrap().period_ms, 10);

        ctx.args = json!({ "period_ms": "soon" });
        assert!(matches!(
            ctx.parse_args::<Args>(),
            Err(PanelError::InvalidArgs { .. })
        ));

        assert!(ctx.require_channel("a").is_ok());
        assert!(ctx.require_channel("b").is_err());
    }
    #[test]
    fn test_panel_subscribes_itself_from_on_message() {
        let h = Harness::new();
        h.manager.start(&[panel("p1", &["a"])]).unwrap();

        h.call_through_p1("subscribe", json!({ "channel": "b" }));
        assert_eq!(h.manager.subscriptions("p1"), vec!["a", "b"]);

        h.bus.publish("b", json!("later")).unwrap();
        while h.dispatcher.poll() > 0 {}
        assert_eq!(*h.events.borrow(), vec!["p1:show", "p1:a#1", "p1:b#1"]);

        let results = h.results.borrow();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].call, "subscribe");
        assert_eq!(results[0].request, 1);
    }

    #[test]
    fn test_host_call_on_unknown_channel_fails() {
        let h = Harness::new();
        h.manager.start(&[panel("p1", &["a"])]).unwrap();

        h.call_through_p1("subscribe", json!({ "channel": "nowhere" }));
        h.call_through_p1("subscriber_names", json!({ "channel": "nowhere" }));

        let results = h.results.borrow();
        assert_eq!(results.len(), 2);
        for result in results.iter() {
            assert!(!result.success);
            assert!(result.value.is_null());
            assert!(result.error.as_deref().unwrap().contains("nowhere"));
        }
        assert_eq!(h.manager.subscriptions("p1"), vec!["a"]);
        assert_eq!(h.dispatcher.stats().failures, 0);
    }

    #[test]
    fn test_private_and_unknown_host_calls_rejected() {
        let h = Harness::new();
        h.manager.start(&[panel("p1", &["a"])]).unwrap();

        h.call_through_p1("_handle_host_call", json!({ "channel": "b" }));
        h.call_through_p1("reboot", Value::Null);

        let results = h.results.borrow();
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("Only public"));
        assert!(!results[1].success);
        assert!(results[1].error.as_deref().unwrap().contains("reboot"));
        assert_eq!(h.manager.subscriptions("p1"), vec!["a"]);
    }

    #[test]
    fn test_host_calls_manage_panels() {
        let h = Harness::new();
        h.manager.start(&[panel("p1", &["a"])]).unwrap();

        h.call_through_p1(
            "create_panel",
            json!({ "name": "p2", "kind": "recorder", "channels": ["b"] }),
        );
        h.call_through_p1("panel_names", Value::Null);
        h.call_through_p1("subscriber_names", json!({ "channel": "b" }));
        h.call_through_p1("unsubscribe", json!({ "channel": "b", "panel": "p2" }));
        h.call_through_p1("destroy_panel", json!({ "name": "p2" }));
        h.call_through_p1("channel_names", Value::Null);

        let results = h.results.borrow();
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[1].value, json!(["p1", "p2"]));
        assert_eq!(results[2].value, json!(["p2"]));
        assert_eq!(results[3].value, json!(true));
        assert_eq!(results[5].value, json!(["a", "b", HOST_CALL_CHANNEL]));
        // Requests are numbered in the order they were sent.
        let requests: Vec<u64> = results.iter().map(|r| r.request).collect();
        assert_eq!(requests, vec![1, 2, 3, 4, 5, 6]);

        assert_eq!(h.manager.panel_names(), vec!["p1"]);
        assert!(h.events.borrow().contains(&"p2:teardown".to_string()));
    }

    #[test]
    fn test_result_for_destroyed_sender_is_dropped() {
        let h = Harness::new();
        h.manager.start(&[panel("p1", &["a"])]).unwrap();

        h.call_through_p1("destroy_panel", json!({ "name": "p1" }));

        assert!(h.manager.panel_names().is_empty());
        assert!(h.results.borrow().is_empty());
        assert!(h.events.borrow().contains(&"p1:teardown".to_string()));
    }

    #[test]
    fn test_host_channel_is_reserved() {
        let h = Harness::new();
        assert!(matches!(
            PanelManager::new(&h.dispatcher, Constants::new()),
            Err(PanelError::Bus(BusError::DuplicateChannel(_)))
        ));
        assert!(matches!(
            h.manager.create_panel(&panel("capydash", &[])),
            Err(PanelError::DuplicatePanel(_))
        ));
    }
}
