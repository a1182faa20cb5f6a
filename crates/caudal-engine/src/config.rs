//! Engine configuration: container frame size, path direction, and the
//! timestamp-gap policy.

use std::path::Path;

use serde::Deserialize;

use crate::{EngineError, Result};

/// Logical direction of the subgraph this engine instance schedules.
///
/// Drives the default dynamic-duration mode when neither graph direction is
/// pinned by a threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathDirection {
    /// Toward the local end-point consumer (e.g. speaker path).
    #[default]
    Receive,
    /// Away from the local capture point (e.g. microphone path).
    Transmit,
}

/// Tunables for one engine instance.
///
/// Loaded from TOML or built in code via [`Default`] plus field
/// assignment.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Container frame size in samples per channel, used where no threshold
    /// module pins a size.
    pub frame_samples: u32,
    /// Logical direction of this subgraph.
    pub path: PathDirection,
    /// The subgraph carries voice toward an end-point consumer. Forces
    /// Fixed-Input as the default dynamic-duration mode to avoid buffering
    /// before the consumer.
    pub voice_path: bool,
    /// Synthesize silence across timestamp gaps smaller than
    /// `gap_drop_threshold_us` instead of propagating the gap.
    pub zero_fill: bool,
    /// Gaps at or above this size (µs) are never bridged.
    pub gap_drop_threshold_us: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_samples: 480,
            path: PathDirection::Receive,
            voice_path: false,
            zero_fill: false,
            gap_drop_threshold_us: 150_000,
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
