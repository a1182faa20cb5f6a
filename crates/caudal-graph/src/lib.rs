//! Graph model for the Caudal audio topology engine.
//!
//! This crate holds the static shape of a processing topology: modules, their
//! input/output ports, and the connections between them. It is deliberately a
//! thin data layer — the engine crate reads and annotates it but owns none of
//! the scheduling logic.
//!
//! # Architecture
//!
//! - [`GraphArena`] — slab storage for module and port records, addressed by
//!   stable integer ids ([`ModuleId`], [`PortId`]). Connections are validated
//!   when made (direction, double-connect, cycles), so traversals downstream
//!   of the builder can trust the shape.
//! - [`ModuleBehavior`] — the single call surface the engine uses to talk to a
//!   leaf module: one `configure` entry point for mode and sample-count
//!   pushes, one `process` entry point per frame, and an optional
//!   [`DynamicDuration`] capability for variable-rate modules.
//! - [`ChainWalk`] — iterator over a no-internal-buffering chain (NBLC): the
//!   maximal run of single-in/single-out, non-buffering modules reachable
//!   from a starting module. Chain-break decisions belong to the caller; the
//!   walk only guarantees it never steps through a fan-in/fan-out module and
//!   never revisits a module.
//!
//! # Example
//!
//! ```rust,ignore
//! use caudal_graph::{GraphArena, ModuleFlags};
//!
//! let mut arena = GraphArena::new();
//! let src = arena.add_module("capture", Box::new(Capture::new()), 0, 1)?;
//! let mix = arena.add_module("mixer", Box::new(Mixer::new()), 1, 1)?;
//! arena.connect(arena.output_port(src, 0)?, arena.input_port(mix, 0)?)?;
//! ```

mod arena;
mod behavior;
mod chain;
mod format;
mod module;
mod port;

pub use arena::GraphArena;
pub use behavior::{
    ConfigDirective, ConfigOutcome, DynamicDuration, FrameCtx, ModuleBehavior, ModuleEvent,
    PortSamples, ProcessStatus,
};
pub use chain::{ChainWalk, WalkDir};
pub use format::MediaFormat;
pub use module::{DurationMode, ModuleClass, ModuleFlags, ModuleId, ModuleRecord};
pub use port::{
    ActivityState, DataFlowState, PortDirection, PortId, PortRecord, ReqSlot, SampleRequirement,
    TimestampRecord,
};

/// Errors raised while building or querying the graph model.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The specified module id does not exist in this arena.
    #[error("module {0:?} not found")]
    ModuleNotFound(ModuleId),

    /// The specified port id does not exist in this arena.
    #[error("port {0:?} not found")]
    PortNotFound(PortId),

    /// A module port index was out of range for that module.
    #[error("module {module:?} has no {direction:?} port at index {index}")]
    PortIndexOutOfRange {
        /// Module the index was resolved against.
        module: ModuleId,
        /// Port direction that was requested.
        direction: PortDirection,
        /// The out-of-range index.
        index: u32,
    },

    /// The port is already connected to a peer.
    #[error("port {0:?} is already connected")]
    AlreadyConnected(PortId),

    /// Connections must run from an output port to an input port.
    #[error("connection must be output → input, got {from:?} → {to:?}")]
    DirectionMismatch {
        /// Source side of the attempted connection.
        from: PortDirection,
        /// Destination side of the attempted connection.
        to: PortDirection,
    },

    /// Adding this connection would create a cycle.
    #[error("connecting these ports would create a cycle")]
    CycleDetected,

    /// The operation requires an external (topology-boundary) port.
    #[error("port {0:?} is not external")]
    NotExternal(PortId),
}

/// Convenience result type for graph operations.
pub type Result<T> = core::result::Result<T, GraphError>;
