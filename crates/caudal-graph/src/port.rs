//! Port records: data-flow state, negotiated format, sample requirements, and
//! the timestamp bookkeeping carried by topology-boundary ports.

use crate::format::MediaFormat;
use crate::module::ModuleId;

/// Unique identifier for a port in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortId(pub(crate) u32);

impl PortId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for PortId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PortId({})", self.0)
    }
}

/// Which side of a module a port sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortDirection {
    /// Data flows into the module through this port.
    Input,
    /// Data flows out of the module through this port.
    Output,
}

/// Whether data is currently moving through a port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataFlowState {
    /// No data at this port; the stream is at a gap.
    #[default]
    AtGap,
    /// Data is flowing.
    DataFlowing,
}

/// Activity membership of an output port, independent of [`DataFlowState`].
///
/// Transitions are requested by module events and applied lazily by the
/// engine's activity coordinator at a safe point after module processing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActivityState {
    /// Port participates in processing.
    #[default]
    Active,
    /// Deactivation requested; waiting for in-flight data to drain.
    PendingInactive,
    /// Port is silenced.
    Inactive,
    /// Reactivation requested; applied at the next safe point.
    PendingActive,
}

/// One cached sample-requirement value with its freshness marker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReqSlot {
    /// Required samples per channel.
    pub samples_per_channel: u32,
    /// Set when the value was written by the most recent propagation pass.
    pub is_updated: bool,
}

/// Per-port sample-requirement cache, in two variants.
///
/// The `current` slot is rewritten by the per-frame propagation pass; the
/// `max` slot only grows and is used to size buffers once, not per frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleRequirement {
    /// Per-frame requirement.
    pub current: ReqSlot,
    /// Largest requirement ever observed for this port.
    pub max: ReqSlot,
}

impl SampleRequirement {
    /// Writes one pass's result into the matching slot.
    ///
    /// The max slot is monotonic: it only ever grows. A normal-pass value that
    /// exceeds the recorded max also raises the max, so buffer sizing stays an
    /// upper bound for every per-frame result.
    pub fn record(&mut self, samples_per_channel: u32, max_pass: bool) {
        if max_pass {
            self.max.samples_per_channel = self.max.samples_per_channel.max(samples_per_channel);
            self.max.is_updated = true;
        } else {
            self.current.samples_per_channel = samples_per_channel;
            self.current.is_updated = true;
            if samples_per_channel > self.max.samples_per_channel {
                self.max.samples_per_channel = samples_per_channel;
            }
        }
    }

    /// Clears one variant of the cache.
    pub fn clear(&mut self, max_pass: bool) {
        if max_pass {
            self.max = ReqSlot::default();
        } else {
            self.current = ReqSlot::default();
        }
    }
}

/// Sample-accurate timestamp bookkeeping for an external port.
///
/// Created when a port is opened as external, destroyed with the port. Only
/// topology-boundary ports carry one.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimestampRecord {
    /// Timestamp (µs) of the next expected sample at this port.
    pub timestamp_us: i64,
    /// Whether `timestamp_us` has been established yet.
    pub valid: bool,
    /// A timestamp discontinuity is being held at this port.
    pub discontinuity: bool,
    /// Byte offset within the current buffer where the discontinuity begins.
    pub disc_pos_bytes: usize,
    /// Timestamp of the first sample after the discontinuity.
    pub resume_timestamp_us: i64,
}

/// A port node: connectivity, flow state, format, and engine annotations.
#[derive(Debug)]
pub struct PortRecord {
    /// Stable identifier.
    pub id: PortId,
    /// The module this port belongs to.
    pub owner: ModuleId,
    /// Input or output side.
    pub direction: PortDirection,
    /// The connected peer port, if any. Connections are output → input.
    pub peer: Option<PortId>,
    /// Sits at the topology boundary (external input/output).
    pub external: bool,
    /// Whether data is currently flowing.
    pub data_flow: DataFlowState,
    /// Negotiated media format, if any.
    pub format: Option<MediaFormat>,
    /// Validity of the negotiated media format.
    pub format_valid: bool,
    /// The port has completed its start handshake.
    pub started: bool,
    /// Active/inactive membership, engine-owned.
    pub activity: ActivityState,
    /// Cached required-sample counts, engine-owned.
    pub requirement: SampleRequirement,
    /// An end-of-frame/EOS marker is pending delivery through this port.
    pub pending_eof: bool,
    /// A media-format change is pending delivery through this port.
    pub pending_format: bool,
    /// A metadata list is attached to this port's stream.
    pub metadata_attached: bool,
    /// Unconsumed bytes still buffered on this (output) port.
    pub buffered_bytes: usize,
    /// Timestamp bookkeeping; present only on external ports.
    pub timestamp: Option<TimestampRecord>,
}

impl PortRecord {
    pub(crate) fn new(id: PortId, owner: ModuleId, direction: PortDirection) -> Self {
        Self {
            id,
            owner,
            direction,
            peer: None,
            external: false,
            data_flow: DataFlowState::AtGap,
            format: None,
            format_valid: false,
            started: false,
            activity: ActivityState::Active,
            requirement: SampleRequirement::default(),
            pending_eof: false,
            pending_format: false,
            metadata_attached: false,
            buffered_bytes: 0,
            timestamp: None,
        }
    }

    /// Whether the port currently participates in processing.
    ///
    /// Pending states count as their origin side: a `PendingInactive` port is
    /// still active until the coordinator completes the transition.
    pub fn is_active(&self) -> bool {
        matches!(
            self.activity,
            ActivityState::Active | ActivityState::PendingInactive
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_normal_pass_raises_max() {
        let mut req = SampleRequirement::default();
        req.record(320, true);
        assert_eq!(req.max.samples_per_channel, 320);

        req.record(480, false);
        assert_eq!(req.current.samples_per_channel, 480);
        // Normal pass may exceed the sized max; the max must follow.
        assert_eq!(req.max.samples_per_channel, 480);
    }

    #[test]
    fn max_slot_is_monotonic() {
        let mut req = SampleRequirement::default();
        req.record(500, true);
        req.record(100, true);
        assert_eq!(req.max.samples_per_channel, 500);
    }

    #[test]
    fn pending_inactive_still_counts_as_active() {
        let mut port = PortRecord::new(PortId(0), ModuleId(0), PortDirection::Output);
        port.activity = ActivityState::PendingInactive;
        assert!(port.is_active());
        port.activity = ActivityState::Inactive;
        assert!(!port.is_active());
    }
}
