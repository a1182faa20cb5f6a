//! Per-container topology engine for the Caudal DSP framework.
//!
//! Given a [`caudal_graph::GraphArena`] of processing modules connected by
//! ports, this crate decides, frame by frame, how many samples each port
//! needs, whether the cheap fast path can replace the general graph walk, how
//! variable-rate (dynamic-duration) modules are configured, and how timestamp
//! continuity is preserved across buffer boundaries.
//!
//! # Components
//!
//! - [`TopologyFlags`] — three small bitsets that let the engine skip full
//!   re-evaluation when nothing structurally relevant changed.
//! - [`SampleResolver`] — assigns each dynamic-duration module a concrete
//!   Fixed-Input/Fixed-Output mode and propagates required sample counts
//!   backward through the graph.
//! - [`ActivityCoordinator`] — applies asynchronous port
//!   activation/deactivation requests without losing in-flight data.
//! - [`timestamp`] — discontinuity detection, buffer splitting, and zero-fill
//!   bridging at the topology boundary.
//! - [`Engine`] — the per-invocation entry point choosing between the fast
//!   path and the general walk.
//!
//! # Scheduling model
//!
//! Single-threaded and cooperative: the engine never spawns threads or
//! blocks. "Waiting for data" is expressed by returning a [`ProcessInfo`]
//! whose [`should_reinvoke`](ProcessInfo::should_reinvoke) is `false`.

mod activity;
mod config;
mod dispatch;
mod flags;
mod hooks;
mod resolver;
pub mod timestamp;

pub use activity::{ActivityCoordinator, ActivitySummary};
pub use config::{EngineConfig, PathDirection};
pub use dispatch::{Engine, ProcessInfo};
pub use flags::{EnablingScan, L1Condition, L2Condition, TopologyFlags};
pub use hooks::{ContainerHooks, NullHooks};
pub use resolver::{Pass, SampleResolver};

use caudal_graph::{DurationMode, ModuleId, PortId};

/// Errors raised by the topology engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An underlying graph-model operation failed.
    #[error(transparent)]
    Graph(#[from] caudal_graph::GraphError),

    /// A module reported sample counts for the wrong side of its configured
    /// duration mode. No cached counts are changed.
    #[error("module {module:?} reported {side}-side samples while configured {mode:?}")]
    InvalidReportDirection {
        /// The reporting module.
        module: ModuleId,
        /// `"input"` or `"output"`.
        side: &'static str,
        /// The mode the module is configured with.
        mode: DurationMode,
    },

    /// The required-sample scratch cache could not grow. Its bookkeeping is
    /// rolled back to empty before this is returned.
    #[error("required-sample cache exhausted")]
    CacheExhausted,

    /// An external port was used for delivery without a negotiated media
    /// format.
    #[error("port {0} has no negotiated media format")]
    MissingFormat(PortId),

    /// Failed to read a configuration file.
    #[error("failed to read config '{path}': {source}")]
    ReadConfig {
        /// Path of the file that could not be read.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration TOML.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
