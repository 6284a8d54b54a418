//! Alert panel: watches a numeric field and raises or clears an alert when it
//! crosses a threshold.
//!
//! Runs on the dispatch thread, so alerts go out with `try_publish`. A full
//! alert channel loses the alert instead of stalling dispatch.

use crate::panel_manager::{PanelContext, PanelError, PanelFactory, PanelInstance};
use capy_bus::{BusError, CallbackResult, Message, Publisher};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::cell::Cell;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct AlertArgs {
    publish_to: String,
    field: String,
    threshold: f64,
}

impl Default for AlertArgs {
    fn default() -> Self {
        Self {
            publish_to: "alerts".to_string(),
            field: "cpu_usage".to_string(),
            threshold: 90.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Raised,
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub source: String,
    pub level: AlertLevel,
    pub field: String,
    pub value: f64,
    pub threshold: f64,
}

pub struct AlertFactory;

impl PanelFactory for AlertFactory {
    fn type_id(&self) -> &str {
        "alert"
    }

    fn create_instance(&self, ctx: PanelContext) -> Result<Box<dyn PanelInstance>, PanelError> {
        let args: AlertArgs = ctx.parse_args()?;
        ctx.require_channel(&args.publish_to)?;
        Ok(Box::new(AlertPanel {
            name: ctx.name,
            publisher: ctx.publisher,
            args,
            raised: Cell::new(false),
        }))
    }
}

struct AlertPanel {
    name: String,
    publisher: Publisher,
    args: AlertArgs,
    raised: Cell<bool>,
}

impl AlertPanel {
    fn emit(&self, level: AlertLevel, value: f64) -> CallbackResult {
        let alert = Alert {
            source: self.name.clone(),
            level,
            field: self.args.field.clone(),
            value,
            threshold: self.args.threshold,
        };
        let payload = serde_json::to_value(&alert)?;
        match self.publisher.try_publish(&self.args.publish_to, payload) {
            Ok(_) => Ok(()),
            Err(e) if e.is_backpressure() => {
                warn!("{}: alert dropped, {}", self.name, e);
                Ok(())
            }
            Err(BusError::BusClosed) => {
                debug!("{}: alert not sent, bus closed", self.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl PanelInstance for AlertPanel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_message(&self, message: &Message) -> CallbackResult {
        let Some(value) = message
            .payload()
            .get(&self.args.field)
            .and_then(|v| v.as_f64())
        else {
            return Err(format!(
                "'{}' #{} has no numeric '{}'",
                message.channel(),
                message.sequence(),
                self.args.field
            )
            .into());
        };

        let above = value > self.args.threshold;
        if above == self.raised.get() {
            return Ok(());
        }
        self.raised.set(above);
        let level = if above {
            AlertLevel::Raised
        } else {
            AlertLevel::Cleared
        };
        self.emit(level, value)
    }
}
