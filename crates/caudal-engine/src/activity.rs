//! Deferred port activation and deactivation.
//!
//! A multi-output module may ask for one of its downstream branches to be
//! silenced or revived mid-stream. "This branch is logically silenced" and
//! "data in flight has fully drained" are different facts: discarding
//! buffered EOS or metadata at deactivation time would lose data. Requests
//! are therefore only *scheduled* when they arrive and applied at a safe
//! point, strictly after all module processing for the frame.

use caudal_graph::{ActivityState, DataFlowState, GraphArena, ModuleId};
use tracing::{debug, warn};

use crate::flags::TopologyFlags;
use crate::Result;

/// One queued activity request from a module event.
#[derive(Clone, Copy, Debug)]
struct ActivityRequest {
    module: ModuleId,
    output_index: u32,
    active: bool,
}

/// Outcome of one end-of-frame application sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivitySummary {
    /// Transitions that completed this frame.
    pub applied: usize,
    /// Deactivations still waiting for drain; retried next frame.
    pub deferred: usize,
}

/// Coordinates the per-output-port activity state machine.
///
/// States live in the port records
/// ([`ActivityState`](caudal_graph::ActivityState)); the coordinator owns
/// only the request queue and the transition rules.
#[derive(Default)]
pub struct ActivityCoordinator {
    queue: Vec<ActivityRequest>,
}

impl ActivityCoordinator {
    /// Creates an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any request is scheduled but not yet resolved.
    pub fn has_pending(&self, arena: &GraphArena) -> bool {
        !self.queue.is_empty()
            || arena.port_ids().any(|id| {
                arena
                    .port(id)
                    .map(|p| {
                        matches!(
                            p.activity,
                            ActivityState::PendingInactive | ActivityState::PendingActive
                        )
                    })
                    .unwrap_or(false)
            })
    }

    /// Queues a module's activity request. Out-of-range output indices are
    /// logged and dropped.
    pub fn request(&mut self, arena: &GraphArena, module: ModuleId, output_index: u32, active: bool) {
        if arena.output_port(module, output_index).is_err() {
            warn!("activity: module {module} requested activity on out-of-range output {output_index}");
            return;
        }
        self.queue.push(ActivityRequest {
            module,
            output_index,
            active,
        });
    }

    /// Schedules queued requests onto port states.
    ///
    /// Scheduling never moves data: an Active port asked to deactivate only
    /// becomes PendingInactive here. A PendingInactive port asked to
    /// reactivate returns straight to Active — it never actually left.
    fn schedule(&mut self, arena: &mut GraphArena) -> Result<()> {
        for req in self.queue.drain(..) {
            let port = arena.output_port(req.module, req.output_index)?;
            let state = arena.port(port)?.activity;
            let next = match (state, req.active) {
                (ActivityState::Active, false) => ActivityState::PendingInactive,
                (ActivityState::PendingActive, false) => ActivityState::Inactive,
                (ActivityState::Inactive, true) => ActivityState::PendingActive,
                (ActivityState::PendingInactive, true) => ActivityState::Active,
                _ => continue,
            };
            debug!("activity: port {port} {state:?} → {next:?} (scheduled)");
            arena.port_mut(port)?.activity = next;
        }
        Ok(())
    }

    /// Applies pending transitions at the end-of-frame safe point.
    ///
    /// PendingInactive completes only once every drain condition holds: the
    /// connected input sits at a gap, neither port carries metadata, no EOS
    /// marker is pending, and no unconsumed data remains buffered. Otherwise
    /// the pending flag survives for a retry next frame. PendingActive is
    /// unconditional and also revives the paired downstream input. Any
    /// *applied* transition re-arms every recheck event — connectivity the
    /// fast path depends on has changed.
    pub fn apply_pending(
        &mut self,
        arena: &mut GraphArena,
        flags: &mut TopologyFlags,
    ) -> Result<ActivitySummary> {
        self.schedule(arena)?;

        let mut summary = ActivitySummary::default();
        for id in arena.port_ids().collect::<Vec<_>>() {
            match arena.port(id)?.activity {
                ActivityState::PendingInactive => {
                    if Self::drained(arena, id)? {
                        arena.port_mut(id)?.activity = ActivityState::Inactive;
                        if let Some(peer) = arena.port(id)?.peer {
                            arena.port_mut(peer)?.activity = ActivityState::Inactive;
                        }
                        debug!("activity: port {id} deactivated");
                        summary.applied += 1;
                    } else {
                        debug!("activity: port {id} deactivation not yet handled");
                        summary.deferred += 1;
                    }
                }
                ActivityState::PendingActive => {
                    arena.port_mut(id)?.activity = ActivityState::Active;
                    if let Some(peer) = arena.port(id)?.peer {
                        arena.port_mut(peer)?.activity = ActivityState::Active;
                    }
                    debug!("activity: port {id} reactivated");
                    summary.applied += 1;
                }
                _ => {}
            }
        }

        if summary.applied > 0 {
            flags.on_connectivity_changed();
        }
        Ok(summary)
    }

    /// All drain conditions for completing a deactivation.
    fn drained(arena: &GraphArena, output: caudal_graph::PortId) -> Result<bool> {
        let out = arena.port(output)?;
        if out.metadata_attached || out.pending_eof || out.buffered_bytes > 0 {
            return Ok(false);
        }
        if let Some(peer) = out.peer {
            let input = arena.port(peer)?;
            if input.data_flow == DataFlowState::DataFlowing
                || input.metadata_attached
                || input.pending_eof
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caudal_graph::{
        ConfigDirective, ConfigOutcome, FrameCtx, ModuleBehavior, PortId, ProcessStatus,
    };

    struct Nop;
    impl ModuleBehavior for Nop {
        fn configure(&mut self, _d: &ConfigDirective<'_>) -> ConfigOutcome {
            ConfigOutcome::Applied
        }
        fn process(&mut self, _ctx: &mut FrameCtx) -> ProcessStatus {
            ProcessStatus::Advanced
        }
    }

    /// Sync-style fork: one input, two outputs, each feeding a sink.
    fn fork_graph() -> (GraphArena, ModuleId, PortId, PortId) {
        let mut arena = GraphArena::new();
        let fork = arena.add_module("fork", Box::new(Nop), 1, 2);
        let a = arena.add_module("sink_a", Box::new(Nop), 1, 0);
        let b = arena.add_module("sink_b", Box::new(Nop), 1, 0);
        let out0 = arena.output_port(fork, 0).unwrap();
        let out1 = arena.output_port(fork, 1).unwrap();
        arena.connect(out0, arena.input_port(a, 0).unwrap()).unwrap();
        arena.connect(out1, arena.input_port(b, 0).unwrap()).unwrap();
        (arena, fork, out0, out1)
    }

    #[test]
    fn deactivation_defers_while_input_flowing() {
        let (mut arena, fork, out0, _) = fork_graph();
        let peer = arena.port(out0).unwrap().peer.unwrap();
        arena.port_mut(peer).unwrap().data_flow = DataFlowState::DataFlowing;

        let mut coord = ActivityCoordinator::new();
        let mut flags = TopologyFlags::new();
        coord.request(&arena, fork, 0, false);
        let summary = coord.apply_pending(&mut arena, &mut flags).unwrap();

        assert_eq!(summary.applied, 0);
        assert_eq!(summary.deferred, 1);
        assert_eq!(
            arena.port(out0).unwrap().activity,
            ActivityState::PendingInactive
        );

        // Drain completes next frame.
        arena.port_mut(peer).unwrap().data_flow = DataFlowState::AtGap;
        let summary = coord.apply_pending(&mut arena, &mut flags).unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(arena.port(out0).unwrap().activity, ActivityState::Inactive);
        assert_eq!(arena.port(peer).unwrap().activity, ActivityState::Inactive);
    }

    #[test]
    fn metadata_blocks_deactivation() {
        let (mut arena, fork, out0, _) = fork_graph();
        arena.port_mut(out0).unwrap().metadata_attached = true;

        let mut coord = ActivityCoordinator::new();
        let mut flags = TopologyFlags::new();
        coord.request(&arena, fork, 0, false);
        let summary = coord.apply_pending(&mut arena, &mut flags).unwrap();
        assert_eq!(summary.deferred, 1);
    }

    #[test]
    fn reactivation_is_unconditional_and_revives_peer() {
        let (mut arena, fork, out0, _) = fork_graph();
        let peer = arena.port(out0).unwrap().peer.unwrap();
        arena.port_mut(out0).unwrap().activity = ActivityState::Inactive;
        arena.port_mut(peer).unwrap().activity = ActivityState::Inactive;
        // Reactivation never waits, even with data in flight downstream.
        arena.port_mut(peer).unwrap().metadata_attached = true;

        let mut coord = ActivityCoordinator::new();
        let mut flags = TopologyFlags::new();
        coord.request(&arena, fork, 0, true);
        let summary = coord.apply_pending(&mut arena, &mut flags).unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(arena.port(out0).unwrap().activity, ActivityState::Active);
        assert_eq!(arena.port(peer).unwrap().activity, ActivityState::Active);
    }

    #[test]
    fn applied_transition_rearms_flag_events() {
        let (mut arena, fork, out0, _) = fork_graph();
        let _ = out0;
        let mut coord = ActivityCoordinator::new();
        let mut flags = TopologyFlags::new();
        flags.reconcile(crate::flags::EnablingScan {
            all_flowing: true,
            all_formats_valid: true,
            no_pending_markers: true,
        });
        assert!(flags.can_use_fast_path());

        coord.request(&arena, fork, 0, false);
        coord.apply_pending(&mut arena, &mut flags).unwrap();
        // The drain conditions held, so the transition applied and every
        // enabling condition must be re-proven.
        assert!(!flags.can_use_fast_path());
        assert!(flags.needs_recheck());
    }

    #[test]
    fn out_of_range_request_is_dropped() {
        let (mut arena, fork, _, _) = fork_graph();
        let mut coord = ActivityCoordinator::new();
        let mut flags = TopologyFlags::new();
        coord.request(&arena, fork, 9, false);
        let summary = coord.apply_pending(&mut arena, &mut flags).unwrap();
        assert_eq!(summary, ActivitySummary::default());
    }
}
