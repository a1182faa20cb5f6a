//! Simplified-topology flag aggregation.
//!
//! Three small bitsets decide whether the per-frame fast path is usable
//! without an O(ports) scan in steady state:
//!
//! - **L1** — cheap-to-check *blocking* conditions. Any set bit disables the
//!   fast path outright.
//! - **L2** — expensive-to-check *enabling* conditions. All must hold.
//! - **Event** — which L2 conditions need re-evaluation after the current
//!   frame.
//!
//! Update operations short-circuit pessimistically (one invalid port is
//! enough to clear an L2 bit immediately) and set optimistically (a port
//! turning valid only schedules a lazy recheck). False positives — a recheck
//! scheduled unnecessarily — are tolerated; false negatives are not.

use caudal_graph::{DataFlowState, GraphArena, PortId};
use tracing::trace;

/// Cheap-to-check blocking conditions (L1). Any one disables the fast path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L1Condition {
    /// Data is still draining backward (held discontinuity or pending
    /// deactivation).
    PendingBackwardDrain,
    /// Some module cannot currently process.
    ModuleCannotProcess,
    /// Some port has not completed its start handshake.
    PortNotStarted,
    /// A source module exists in the topology.
    SourcePresent,
    /// A threshold module has its processing disabled.
    ThresholdDisabled,
}

impl L1Condition {
    #[inline]
    fn bit(self) -> u8 {
        match self {
            Self::PendingBackwardDrain => 1 << 0,
            Self::ModuleCannotProcess => 1 << 1,
            Self::PortNotStarted => 1 << 2,
            Self::SourcePresent => 1 << 3,
            Self::ThresholdDisabled => 1 << 4,
        }
    }
}

/// Expensive-to-check enabling conditions (L2). All must hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L2Condition {
    /// Every active port is in the data-flowing state.
    AllPortsFlowing,
    /// Every active port has a valid negotiated media format.
    AllFormatsValid,
    /// No pending media-format or EOF markers anywhere.
    NoPendingMarkers,
}

impl L2Condition {
    #[inline]
    fn bit(self) -> u8 {
        match self {
            Self::AllPortsFlowing => 1 << 0,
            Self::AllFormatsValid => 1 << 1,
            Self::NoPendingMarkers => 1 << 2,
        }
    }

    const ALL: u8 = 0b111;
}

/// Result of the O(ports) enabling-condition scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnablingScan {
    /// Every active port is data-flowing.
    pub all_flowing: bool,
    /// Every active port has a valid media format.
    pub all_formats_valid: bool,
    /// No pending media-format or EOF markers.
    pub no_pending_markers: bool,
}

impl EnablingScan {
    /// Recomputes the enabling conditions from scratch over all active ports.
    ///
    /// Inactive ports are excluded: a silenced branch must not hold the rest
    /// of the topology off the fast path.
    pub fn run(arena: &GraphArena) -> Self {
        let mut scan = Self {
            all_flowing: true,
            all_formats_valid: true,
            no_pending_markers: true,
        };
        for id in arena.port_ids() {
            let Ok(port) = arena.port(id) else { continue };
            if !port.is_active() {
                continue;
            }
            if port.data_flow != DataFlowState::DataFlowing {
                scan.all_flowing = false;
            }
            if !port.format_valid {
                scan.all_formats_valid = false;
            }
            if port.pending_eof || port.pending_format {
                scan.no_pending_markers = false;
            }
        }
        scan
    }

    fn as_bits(self) -> u8 {
        let mut bits = 0;
        if self.all_flowing {
            bits |= L2Condition::AllPortsFlowing.bit();
        }
        if self.all_formats_valid {
            bits |= L2Condition::AllFormatsValid.bit();
        }
        if self.no_pending_markers {
            bits |= L2Condition::NoPendingMarkers.bit();
        }
        bits
    }
}

/// Aggregated fast-path flags for one topology instance.
#[derive(Clone, Copy, Debug)]
pub struct TopologyFlags {
    l1: u8,
    l2: u8,
    events: u8,
    active_trigger_policies: u32,
}

impl Default for TopologyFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyFlags {
    /// Creates the aggregate with every enabling bit optimistically set and
    /// every event bit pending, so the first reconciliation scan establishes
    /// the real state before the fast path can engage.
    pub fn new() -> Self {
        Self {
            l1: 0,
            l2: L2Condition::ALL,
            events: L2Condition::ALL,
            active_trigger_policies: 0,
        }
    }

    /// Sets or clears one blocking condition.
    pub fn set_blocking(&mut self, cond: L1Condition, on: bool) {
        if on {
            self.l1 |= cond.bit();
        } else {
            self.l1 &= !cond.bit();
        }
    }

    /// Whether a blocking condition is currently set.
    pub fn is_blocking(&self, cond: L1Condition) -> bool {
        self.l1 & cond.bit() != 0
    }

    /// Records the number of trigger-policy modules with an active output.
    pub fn set_active_trigger_policies(&mut self, count: u32) {
        self.active_trigger_policies = count;
    }

    /// A port's media format became valid or invalid.
    ///
    /// Invalid short-circuits: the enabling bit clears immediately and its
    /// pending recheck is cancelled — one bad port is proof enough. Valid is
    /// optimistic: the bit is set and a lazy recheck scheduled, since other
    /// ports may still be invalid.
    pub fn on_media_format_validity(&mut self, port: PortId, is_valid: bool) {
        self.on_enabling_edge(L2Condition::AllFormatsValid, is_valid);
        trace!("flags: port {port} format_valid={is_valid}");
    }

    /// A port transitioned between data-flowing and at-gap.
    pub fn on_data_flow_transition(&mut self, port: PortId, state: DataFlowState) {
        let flowing = state == DataFlowState::DataFlowing;
        self.on_enabling_edge(L2Condition::AllPortsFlowing, flowing);
        trace!("flags: port {port} flow={state:?}");
    }

    /// A pending media-format or EOF marker appeared or cleared somewhere.
    ///
    /// Never short-circuits: marker detection must always re-scan.
    pub fn on_pending_marker(&mut self) {
        self.events |= L2Condition::NoPendingMarkers.bit();
    }

    /// Port connectivity changed (activation/deactivation applied); every
    /// enabling condition must be re-proven.
    pub fn on_connectivity_changed(&mut self) {
        self.events = L2Condition::ALL;
    }

    fn on_enabling_edge(&mut self, cond: L2Condition, became_good: bool) {
        if became_good {
            if self.l2 & cond.bit() == 0 {
                self.events |= cond.bit();
                self.l2 |= cond.bit();
            }
        } else {
            self.l2 &= !cond.bit();
            self.events &= !cond.bit();
        }
    }

    /// Whether the end-of-frame O(ports) reconciliation scan is due.
    ///
    /// Only worth running when some event bit is set, nothing blocks at L1,
    /// no trigger-policy module is active, and the optimistic L2 bits are
    /// already all true — the cheap checks gate the expensive one.
    pub fn needs_recheck(&self) -> bool {
        self.events != 0
            && self.l1 == 0
            && self.active_trigger_policies == 0
            && self.l2 == L2Condition::ALL
    }

    /// Applies a from-scratch scan result, clearing all event bits.
    pub fn reconcile(&mut self, scan: EnablingScan) {
        self.l2 = scan.as_bits();
        self.events = 0;
        trace!("flags: reconciled l2={:#05b}", self.l2);
    }

    /// The fast-path predicate: no blocking condition, no active
    /// trigger-policy module, no outstanding recheck, all enabling
    /// conditions met.
    pub fn can_use_fast_path(&self) -> bool {
        self.l1 == 0
            && self.active_trigger_policies == 0
            && self.events == 0
            && self.l2 == L2Condition::ALL
    }
}
