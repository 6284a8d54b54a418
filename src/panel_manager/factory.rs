use crate::panel_manager::{PanelContext, PanelError, PanelInstance};

/// Trait that defines a factory for one kind of panel (e.g. clock, logger).
pub trait PanelFactory {
    /// Unique identifier for this panel kind, matched against `kind` in the config.
    fn type_id(&self) -> &str;

    /// Builds a panel instance. Background workers are started here and
    /// stopped in `PanelInstance::on_teardown`.
    ///
    /// Subscriptions are wired by the manager after this returns.
    fn create_instance(&self, ctx: PanelContext) -> Result<Box<dyn PanelInstance>, PanelError>;
}
