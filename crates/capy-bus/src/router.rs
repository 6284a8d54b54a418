//! Dispatch table: channel name -> ordered subscriber callbacks.
//!
//! The router lives on the dispatch thread. Callbacks are never required to
//! be `Send`, so a panel can capture UI-thread-only handles in them.

use crate::message::{Message, SubscriberId};
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::rc::Rc;

/// Result returned by a subscriber callback.
pub type CallbackResult = Result<(), Box<dyn Error>>;

/// Subscriber callback, invoked on the dispatch thread only.
pub type Callback = Rc<dyn Fn(&Message) -> CallbackResult>;

/// One entry of a channel's fan-out.
#[derive(Clone)]
pub struct Route {
    pub subscriber: SubscriberId,
    pub callback: Callback,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("subscriber", &self.subscriber)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct Router {
    /// Subscribers per channel, in subscription order.
    routes: HashMap<String, Vec<Route>>,
    /// Channels per subscriber.
    by_subscriber: HashMap<SubscriberId, BTreeSet<String>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Re-subscribing replaces the callback in place and
    /// keeps the original position. Returns true for a new subscription.
    pub fn subscribe(&mut self, channel: &str, subscriber: SubscriberId, callback: Callback) -> bool {
        let routes = self.routes.entry(channel.to_string()).or_default();
        if let Some(route) = routes.iter_mut().find(|r| r.subscriber == subscriber) {
            route.callback = callback;
            return false;
        }

        routes.push(Route {
            subscriber: subscriber.clone(),
            callback,
        });
        self.by_subscriber
            .entry(subscriber)
            .or_default()
            .insert(channel.to_string());
        true
    }

    /// Remove a subscription. Returns false if there was none.
    pub fn unsubscribe(&mut self, channel: &str, subscriber: &SubscriberId) -> bool {
        let Some(routes) = self.routes.get_mut(channel) else {
            return false;
        };
        let before = routes.len();
        routes.retain(|r| &r.subscriber != subscriber);
        if routes.len() == before {
            return false;
        }
        if routes.is_empty() {
            self.routes.remove(channel);
        }

        if let Some(channels) = self.by_subscriber.get_mut(subscriber) {
            channels.remove(channel);
            if channels.is_empty() {
                self.by_subscriber.remove(subscriber);
            }
        }
        true
    }

    /// Remove every subscription of a subscriber. Returns the channels it left.
    pub fn unsubscribe_all(&mut self, subscriber: &SubscriberId) -> Vec<String> {
        let channels: Vec<String> = self
            .by_subscriber
            .remove(subscriber)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for channel in &channels {
            if let Some(routes) = self.routes.get_mut(channel) {
                routes.retain(|r| &r.subscriber != subscriber);
                if routes.is_empty() {
                    self.routes.remove(channel);
                }
            }
        }
        channels
    }

    /// Snapshot of the current fan-out for a channel.
    pub fn resolve(&self, channel: &str) -> Vec<Route> {
        self.routes.get(channel).cloned().unwrap_or_default()
    }

    pub fn subscribers(&self, channel: &str) -> Vec<SubscriberId> {
        self.routes
            .get(channel)
            .map(|routes| routes.iter().map(|r| r.subscriber.clone()).collect())
            .unwrap_or_default()
    }

    pub fn channels_of(&self, subscriber: &SubscriberId) -> Vec<String> {
        self.by_subscriber
            .get(subscriber)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, channel: &str, subscriber: &SubscriberId) -> bool {
        self.by_subscriber
            .get(subscriber)
            .is_some_and(|set| set.contains(channel))
    }
}
