//! The call surface between the engine and a leaf module.
//!
//! The engine drives every module through two entry points: [`configure`]
//! (mode and sample-count pushes, CAPI `set_param` style) and [`process`]
//! (one forward kick per frame). Modules raise side-channel events into the
//! shared [`FrameCtx`]; the engine drains them after each module runs.
//!
//! [`configure`]: ModuleBehavior::configure
//! [`process`]: ModuleBehavior::process

use crate::module::DurationMode;

/// One `(port index, samples per channel)` pair in a sample-count push or
/// report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortSamples {
    /// Index into the module's input or output port list.
    pub port_index: u32,
    /// Required samples per channel for that port.
    pub samples_per_channel: u32,
}

/// A configuration push from the engine to a module.
#[derive(Debug)]
pub enum ConfigDirective<'a> {
    /// Offer a dynamic-duration operating mode.
    DurationMode(DurationMode),
    /// Push concrete required-sample counts for one side of the module.
    RequiredSamples {
        /// `true` when the entries address input ports.
        is_input: bool,
        /// Flat `(port index, samples)` array, bounded by the module's port
        /// count.
        entries: &'a [PortSamples],
    },
}

/// Module answer to a [`ConfigDirective`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigOutcome {
    /// The directive took effect.
    Applied,
    /// The module cannot act yet (e.g. input media format unknown). The
    /// engine clears cached required-sample state for the module and retries
    /// on a later rebuild.
    NotReady,
    /// The module refuses the directive. The engine reverts to ordinary
    /// fixed-size processing for it.
    Rejected,
}

/// Result of one module's forward kick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Consumed and/or produced data this frame.
    Advanced,
    /// Nothing to do; the module's inputs sat at a gap.
    Starved,
    /// Cannot run until reconfigured.
    NotReady,
}

/// Asynchronous event raised by a module during processing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleEvent {
    /// New required-sample counts, pushed from inside the module (e.g. a
    /// rate-dependent module reacting to a sample-rate change).
    ReportRequiredSamples {
        /// `true` when the entries address input ports.
        is_input: bool,
        /// `(port index, samples)` pairs.
        entries: Vec<PortSamples>,
    },
    /// The module enables or disables its own dynamic-duration support.
    SetDynamicDurationDisabled(bool),
    /// Request to silence or revive one of the module's output branches.
    PortActivity {
        /// Index into the module's output port list.
        output_index: u32,
        /// Target activity.
        active: bool,
    },
}

/// Per-frame context handed to each module's [`process`] call.
///
/// [`process`]: ModuleBehavior::process
#[derive(Debug)]
pub struct FrameCtx {
    /// Frame size in samples per channel for this invocation.
    pub frame_samples: u32,
    events: Vec<ModuleEvent>,
    format_propagated: bool,
}

impl FrameCtx {
    /// Creates a context for one frame.
    pub fn new(frame_samples: u32) -> Self {
        Self {
            frame_samples,
            events: Vec::new(),
            format_propagated: false,
        }
    }

    /// Raises a side-channel event; the engine drains it after this module's
    /// kick completes.
    pub fn raise(&mut self, event: ModuleEvent) {
        self.events.push(event);
    }

    /// Marks that a media format moved across a connection this frame.
    pub fn note_format_propagated(&mut self) {
        self.format_propagated = true;
    }

    /// Whether any module marked a format propagation.
    pub fn format_propagated(&self) -> bool {
        self.format_propagated
    }

    /// Drains the events raised so far, oldest first.
    pub fn drain_events(&mut self) -> Vec<ModuleEvent> {
        core::mem::take(&mut self.events)
    }
}

/// Leaf-module implementation behind the engine's call surface.
///
/// Implementations are self-contained DSP; the engine never inspects their
/// internals beyond this trait and the optional [`DynamicDuration`]
/// capability.
pub trait ModuleBehavior {
    /// Applies a configuration push. Must be side-effect free on
    /// [`ConfigOutcome::Rejected`].
    fn configure(&mut self, directive: &ConfigDirective<'_>) -> ConfigOutcome;

    /// Runs one forward kick: consume and/or produce one frame's worth of
    /// data. Side-channel events go through [`FrameCtx::raise`].
    fn process(&mut self, ctx: &mut FrameCtx) -> ProcessStatus;

    /// The dynamic-duration capability, for modules that support it.
    fn dynamic_duration(&self) -> Option<&dyn DynamicDuration> {
        None
    }
}

/// Capability of a variable-rate module to answer backward sample queries.
pub trait DynamicDuration {
    /// Input samples per channel this module needs to produce
    /// `output_samples` per channel (its declared rate ratio applied).
    fn required_input_samples(&self, output_samples: u32) -> u32;
}
