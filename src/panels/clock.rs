use crate::config::DockPosition;
use crate::panel_manager::{PanelContext, PanelError, PanelFactory, PanelInstance};
use crate::services::worker::{Worker, publish_step};
use chrono::{DateTime, TimeZone};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ClockArgs {
    publish_to: String,
    period_ms: u64,
    time_format: String,
    date_format: String,
}

impl Default for ClockArgs {
    fn default() -> Self {
        Self {
            publish_to: "clock".to_string(),
            period_ms: 1000,
            time_format: "%H:%M:%S".to_string(),
            date_format: "%d/%m/%Y".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockTick {
    pub time: String,
    pub date: String,
}

impl ClockTick {
    fn at<Tz: TimeZone>(now: &DateTime<Tz>, time_format: &str, date_format: &str) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        Self {
            time: now.format(time_format).to_string(),
            date: now.format(date_format).to_string(),
        }
    }
}

pub struct ClockFactory;

impl PanelFactory for ClockFactory {
    fn type_id(&self) -> &str {
        "clock"
    }

    fn create_instance(&self, ctx: PanelContext) -> Result<Box<dyn PanelInstance>, PanelError> {
        let mut args: ClockArgs = ctx.parse_args()?;
        // Shared formats apply unless the panel sets its own.
        for (key, target) in [
            ("time_format", &mut args.time_format),
            ("date_format", &mut args.date_format),
        ] {
            if ctx.args.get(key).is_none() {
                if let Some(format) = ctx.constant_str(key) {
                    *target = format.to_string();
                }
            }
        }
        ctx.require_channel(&args.publish_to)?;
        if args.period_ms == 0 {
            return Err(PanelError::InvalidArgs {
                panel: ctx.name,
                reason: "period_ms must be positive".to_string(),
            });
        }

        let publisher = ctx.publisher.clone();
        let channel = args.publish_to.clone();
        let worker = Worker::spawn_periodic(
            &ctx.name,
            Duration::from_millis(args.period_ms),
            move || {
                let tick = ClockTick::at(&chrono::Local::now(), &args.time_format, &args.date_format);
                publish_step(publisher.source().as_str(), publisher.broadcast(&channel, &tick))
            },
        )?;

        Ok(Box::new(ClockPanel {
            name: ctx.name,
            pos: ctx.pos,
            worker: RefCell::new(Some(worker)),
        }))
    }
}

struct ClockPanel {
    name: String,
    pos: DockPosition,
    worker: RefCell<Option<Worker>>,
}

impl PanelInstance for ClockPanel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_show(&self) {
        let running = self
            .worker
            .borrow()
            .as_ref()
            .is_some_and(|w| w.is_running());
        if running {
            info!("Clock '{}' ticking at {:?}", self.name, self.pos);
        } else {
            warn!("Clock '{}' shown but its worker has stopped", self.name);
        }
    }

    fn on_teardown(&self) {
        if let Some(mut worker) = self.worker.borrow_mut().take() {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Constants;
    use capy_bus::{Bus, ChannelOptions, Message};
    use chrono::Utc;
    use serde_json::json;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Instant;

    fn context(bus: &Bus, args: serde_json::Value) -> PanelContext {
        PanelContext {
            name: "clock".to_string(),
            pos: DockPosition::Top,
            publisher: bus.publisher("clock"),
            args,
            constants: Arc::new(Constants::new()),
        }
    }

    #[test]
    fn test_tick_formats() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).unwrap();
        let tick = ClockTick::at(&now, "%H:%M:%S", "%d/%m/%Y");
        assert_eq!(tick.time, "07:05:03");
        assert_eq!(tick.date, "09/03/2024");
    }

    #[test]
    fn test_publishes_ticks() {
        let bus = Bus::new();
        bus.create_channel("time", ChannelOptions::default()).unwrap();
        let panel = ClockFactory
            .create_instance(context(&bus, json!({ "publish_to": "time", "period_ms": 10 })))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while bus.pending("time").unwrap() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        panel.on_teardown();
        assert!(bus.pending("time").unwrap() >= 2);
    }

    #[test]
    fn test_shared_formats_from_constants() {
        let bus = Bus::new();
        bus.create_channel("clock", ChannelOptions::default()).unwrap();
        let mut ctx = context(&bus, json!({ "period_ms": 3_600_000, "date_format": "%Y" }));
        let mut constants = Constants::new();
        constants.insert("time_format".to_string(), json!("%H"));
        constants.insert("date_format".to_string(), json!("%d"));
        ctx.constants = Arc::new(constants);

        let panel = ClockFactory.create_instance(ctx).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while bus.pending("clock").unwrap() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        panel.on_teardown();

        let dispatcher = bus.dispatcher().unwrap();
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&ticks);
        dispatcher
            .subscribe("clock", "recorder", move |msg: &Message| {
                sink.borrow_mut().push(msg.decode::<ClockTick>()?);
                Ok(())
            })
            .unwrap();
        dispatcher.poll();

        let ticks = ticks.borrow();
        assert_eq!(ticks[0].time.len(), 2);
        assert_eq!(ticks[0].date.len(), 4);
    }

    #[test]
    fn test_rejects_bad_args() {
        let bus = Bus::new();
        bus.create_channel("clock", ChannelOptions::default()).unwrap();

        assert!(matches!(
            ClockFactory.create_instance(context(&bus, json!({ "publish_to": "nowhere" }))),
            Err(PanelError::Bus(_))
        ));
        assert!(matches!(
            ClockFactory.create_instance(context(&bus, json!({ "period_ms": 0 }))),
            Err(PanelError::InvalidArgs { .. })
        ));
    }
}
