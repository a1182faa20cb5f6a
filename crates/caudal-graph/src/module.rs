//! Module records: identity, classification, and engine-mutable flags.

use crate::behavior::ModuleBehavior;
use crate::port::PortId;

/// Unique identifier for a module in the arena.
///
/// Ids are assigned sequentially and never reused within an arena instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) u32);

impl ModuleId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ModuleId({})", self.0)
    }
}

/// Structural classification of a module, derived from its port counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleClass {
    /// No input ports; originates data.
    Source,
    /// No output ports; terminates data.
    Sink,
    /// Exactly one input and one output port.
    Siso,
    /// Anything with fan-in or fan-out.
    Mimo,
}

/// Dynamic-duration operating mode for a variable-rate module.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DurationMode {
    /// Not configured; the module runs as ordinary fixed-size processing.
    #[default]
    Invalid,
    /// Consumes exactly the samples it is given, produces a variable amount.
    FixedInput,
    /// Produces exactly the requested amount, reports how much input it needs.
    FixedOutput,
}

/// Engine-mutable flags carried by every module.
///
/// The arena owns the storage; the engine is the only writer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuleFlags {
    /// The module is capable of variable-rate (dynamic-duration) operation.
    pub needs_dynamic_duration: bool,
    /// The module has self-disabled its dynamic-duration support.
    pub dynamic_duration_disabled: bool,
    /// Currently configured dynamic-duration mode.
    pub duration_mode: DurationMode,
    /// The module gates processing on an external trigger policy.
    pub needs_trigger_policy: bool,
    /// The module carries the synchronization extension (internal buffering
    /// across multiple outputs).
    pub needs_sync_extension: bool,
    /// The module only operates on a fixed frame size of its own.
    pub is_threshold: bool,
    /// Excluded from the fast-path module iteration.
    pub is_skip_process: bool,
    /// At least one input port sat at a data gap last frame.
    pub any_input_at_gap: bool,
}

/// A module node: behavior, flags, and port membership.
pub struct ModuleRecord {
    /// Stable identifier.
    pub id: ModuleId,
    /// Human-readable name, used in logs only.
    pub name: String,
    /// The leaf implementation the engine drives.
    pub behavior: Box<dyn ModuleBehavior + Send>,
    /// Engine-mutable flag block.
    pub flags: ModuleFlags,
    /// Input port ids, in declaration order.
    pub inputs: Vec<PortId>,
    /// Output port ids, in declaration order.
    pub outputs: Vec<PortId>,
    /// Fixed frame size (samples per channel) for threshold modules.
    pub threshold_frame: Option<u32>,
}

impl ModuleRecord {
    /// Structural classification, derived from port counts.
    pub fn class(&self) -> ModuleClass {
        match (self.inputs.len(), self.outputs.len()) {
            (0, _) => ModuleClass::Source,
            (_, 0) => ModuleClass::Sink,
            (1, 1) => ModuleClass::Siso,
            _ => ModuleClass::Mimo,
        }
    }
}

impl core::fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("class", &self.class())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
