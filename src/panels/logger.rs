//! Logger panel: a ring buffer of everything it receives.
//!
//! Commands arrive as ordinary payloads:
//! `{"command": "clear"}`, `{"command": "follow", "channel": "alerts"}` and
//! `{"command": "unfollow", "channel": "alerts"}`. Following goes through a
//! host call, so the subscription changes once the host has handled it.

use crate::panel_manager::{
    HostCallResult, HostHandle, PanelContext, PanelError, PanelFactory, PanelInstance,
};
use capy_bus::{CallbackResult, Message};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use std::cell::RefCell;
use std::collections::VecDeque;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct LoggerArgs {
    max_lines: usize,
    echo: bool,
}

impl Default for LoggerArgs {
    fn default() -> Self {
        Self {
            max_lines: 200,
            echo: true,
        }
    }
}

pub struct LoggerFactory;

impl PanelFactory for LoggerFactory {
    fn type_id(&self) -> &str {
        "logger"
    }

    fn create_instance(&self, ctx: PanelContext) -> Result<Box<dyn PanelInstance>, PanelError> {
        let args: LoggerArgs = ctx.parse_args()?;
        if args.max_lines == 0 {
            return Err(PanelError::InvalidArgs {
                panel: ctx.name,
                reason: "max_lines must be positive".to_string(),
            });
        }
        Ok(Box::new(
            LoggerPanel::new(&ctx.name, args.max_lines, args.echo).with_host(ctx.host()),
        ))
    }
}

pub struct LoggerPanel {
    name: String,
    max_lines: usize,
    echo: bool,
    lines: RefCell<VecDeque<String>>,
    host: Option<HostHandle>,
}

impl LoggerPanel {
    pub fn new(name: &str, max_lines: usize, echo: bool) -> Self {
        Self {
            name: name.to_string(),
            max_lines,
            echo,
            lines: RefCell::new(VecDeque::with_capacity(max_lines)),
            host: None,
        }
    }

    /// Enables the `follow` and `unfollow` commands.
    pub fn with_host(mut self, host: HostHandle) -> Self {
        self.host = Some(host);
        self
    }

    fn request(&self, call: &str, channel: &str) -> CallbackResult {
        let Some(host) = &self.host else {
            warn!("{}: '{}' needs a host connection", self.name, call);
            return Ok(());
        };
        host.call(call, json!({ "channel": channel }))?;
        Ok(())
    }

    /// Buffered lines, oldest first.
    #[cfg(test)]
    fn lines(&self) -> Vec<String> {
        self.lines.borrow().iter().cloned().collect()
    }
}

impl PanelInstance for LoggerPanel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_message(&self, message: &Message) -> CallbackResult {
        let payload = message.payload();
        let target = payload.get("channel").and_then(|c| c.as_str());
        match (payload.get("command").and_then(|c| c.as_str()), target) {
            (Some("clear"), _) => {
                self.lines.borrow_mut().clear();
                info!("{}: cleared", self.name);
                return Ok(());
            }
            (Some("follow"), Some(channel)) => return self.request("subscribe", channel),
            (Some("unfollow"), Some(channel)) => return self.request("unsubscribe", channel),
            _ => {}
        }

        let line = format!(
            "[{} #{}] {}",
            message.channel(),
            message.sequence(),
            message.payload()
        );
        if self.echo {
            info!("{}: {}", self.name, line);
        }

        let mut lines = self.lines.borrow_mut();
        if lines.len() == self.max_lines {
            lines.pop_front();
        }
        lines.push_back(line);
        Ok(())
    }

    fn on_host_result(&self, result: &HostCallResult) {
        match &result.error {
            None => info!(
                "{}: {} #{} done ({})",
                self.name, result.call, result.request, result.value
            ),
            Some(e) => warn!("{}: {} #{} failed: {}", self.name, result.call, result.request, e),
        }
    }
}
