use crate::panel_manager::{PanelContext, PanelError, PanelFactory, PanelInstance};
use crate::services::system_info::{self, MetricFilter, Sampler};
use crate::services::worker::{Worker, publish_step};
use log::info;
use serde::Deserialize;
use std::cell::RefCell;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SysmonArgs {
    publish_to: String,
    period_ms: u64,
    metrics: MetricFilter,
}

impl Default for SysmonArgs {
    fn default() -> Self {
        Self {
            publish_to: "sysmon".to_string(),
            period_ms: 2000,
            metrics: MetricFilter::default(),
        }
    }
}

pub struct SysmonFactory;

impl PanelFactory for SysmonFactory {
    fn type_id(&self) -> &str {
        "sysmon"
    }

    fn create_instance(&self, ctx: PanelContext) -> Result<Box<dyn PanelInstance>, PanelError> {
        let args: SysmonArgs = ctx.parse_args()?;
        ctx.require_channel(&args.publish_to)?;
        if args.period_ms == 0 || args.metrics.is_empty() {
            return Err(PanelError::InvalidArgs {
                panel: ctx.name,
                reason: "needs a positive period_ms and at least one metric".to_string(),
            });
        }

        let host = system_info::get_static_info();
        info!(
            "Sysmon '{}' on {} ({} {}, {} cores, {} RAM)",
            ctx.name,
            host.host,
            host.name,
            host.kernel,
            host.cpu_count,
            system_info::readable_bytes(host.total_mem)
        );

        let publisher = ctx.publisher.clone();
        let channel = args.publish_to;
        let mut sampler = Sampler::new(args.metrics);
        let worker = Worker::spawn_periodic(
            &ctx.name,
            Duration::from_millis(args.period_ms),
            move || {
                let status = sampler.sample();
                publish_step(publisher.source().as_str(), publisher.broadcast(&channel, &status))
            },
        )?;

        Ok(Box::new(SysmonPanel {
            name: ctx.name,
            worker: RefCell::new(Some(worker)),
        }))
    }
}

struct SysmonPanel {
    name: String,
    worker: RefCell<Option<Worker>>,
}

impl PanelInstance for SysmonPanel {
    fn name(&self) -> &str {
        &self.name
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
    use crate::config::{Constants, DockPosition};
    use crate::services::system_info::SystemStatus;
    use capy_bus::{Bus, ChannelOptions, Message};
    use serde_json::json;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Instant;

    fn context(bus: &Bus, args: serde_json::Value) -> PanelContext {
        PanelContext {
            name: "cpu".to_string(),
            pos: DockPosition::Right,
            publisher: bus.publisher("cpu"),
            args,
            constants: Arc::new(Constants::new()),
        }
    }

    #[test]
    fn test_publishes_status() {
        let bus = Bus::new();
        bus.create_channel("sysmon", ChannelOptions::bounded(4)).unwrap();
        let dispatcher = bus.dispatcher().unwrap();
        let seen: Rc<RefCell<Vec<SystemStatus>>> = Rc::default();
        let sink = Rc::clone(&seen);
        dispatcher
            .subscribe("sysmon", "recorder", move |msg: &Message| {
                sink.borrow_mut().push(msg.decode::<SystemStatus>()?);
                Ok(())
            })
            .unwrap();

        let panel = SysmonFactory
            .create_instance(context(
                &bus,
                json!({ "period_ms": 10, "metrics": { "cpu": false, "network": false } }),
            ))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.borrow().is_empty() && Instant::now() < deadline {
            if dispatcher.poll() == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        panel.on_teardown();

        let seen = seen.borrow();
        assert!(!seen.is_empty());
        assert_eq!(seen[0].cpu_usage, 0.0);
        assert!(!seen[0].ram_used_readable.is_empty());
    }

    #[test]
    fn test_rejects_empty_metrics() {
        let bus = Bus::new();
        bus.create_channel("sysmon", ChannelOptions::default()).unwrap();
        let args = json!({ "metrics": { "cpu": false, "ram": false, "network": false } });
        assert!(matches!(
            SysmonFactory.create_instance(context(&bus, args)),
            Err(PanelError::InvalidArgs { .. })
        ));
    }
}
