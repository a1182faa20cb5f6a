//! Callbacks into the surrounding container.

/// Container-owned reactions to dynamic-duration reconfiguration.
///
/// The container owns buffer sizing metadata derived from the engine's
/// required-sample caches; these hooks fire whenever that configuration is
/// rebuilt so the container can resize what it owns.
pub trait ContainerHooks {
    /// The engine invalidated one variant of its required-sample caches.
    fn clear_required_samples(&mut self, is_max: bool);

    /// Input-connection buffer sizing metadata must be re-derived.
    fn update_input_connection_buffer_info(&mut self);
}

/// No-op hooks for tests and containers without derived buffer metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHooks;

impl ContainerHooks for NullHooks {
    fn clear_required_samples(&mut self, _is_max: bool) {}
    fn update_input_connection_buffer_info(&mut self) {}
}
