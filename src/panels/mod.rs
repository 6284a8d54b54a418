//! Built-in panel kinds.

pub mod alert;
pub mod clock;
pub mod logger;
pub mod sysmon;

use crate::panel_manager::PanelManager;

pub fn register_builtin(manager: &PanelManager) {
    manager.register_factory(clock::ClockFactory);
    manager.register_factory(sysmon::SysmonFactory);
    manager.register_factory(logger::LoggerFactory);
    manager.register_factory(alert::AlertFactory);
}
