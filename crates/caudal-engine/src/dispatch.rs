//! Per-invocation frame dispatch.
//!
//! [`Engine::process_frame`] is evaluated once per container invocation: it
//! either runs the fast path (one pass over the pruned sorted module list,
//! none of the per-module bookkeeping) or the general graph walk (required
//! samples first, full bookkeeping, event handling). Both paths finish with
//! the deferred port-activity application and the lazy flag reconciliation,
//! strictly after all module processing — a module's decision to deactivate
//! a port never changes what earlier modules saw in the same frame.

use std::collections::HashMap;

use caudal_graph::{
    DataFlowState, FrameCtx, GraphArena, GraphError, MediaFormat, ModuleClass, ModuleEvent,
    ModuleId, PortId, ProcessStatus,
};
use tracing::{debug, warn};

use crate::activity::ActivityCoordinator;
use crate::config::EngineConfig;
use crate::flags::{EnablingScan, L1Condition, TopologyFlags};
use crate::hooks::ContainerHooks;
use crate::resolver::{Pass, SampleResolver};
use crate::timestamp::{self, FrameBuffer, InputVerdict, OutputSplitter};
use crate::Result;

/// What one frame accomplished, consumed by the caller to decide whether to
/// re-invoke immediately or wait for the next external trigger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Some module consumed or produced data.
    pub data_moved: bool,
    /// A media format moved across a connection.
    pub format_propagated: bool,
    /// A module raised a state-changing event (sample report, activity
    /// request, dynamic-duration toggle) or a deferred transition applied.
    pub state_event_raised: bool,
}

impl ProcessInfo {
    /// More data may still be processable; the caller should invoke again
    /// without waiting.
    pub fn should_reinvoke(&self) -> bool {
        self.data_moved || self.state_event_raised
    }
}

/// The per-container topology engine.
///
/// Owns the flag aggregate, the sample resolver, the activity coordinator,
/// and the output-side continuity state; the graph itself stays with the
/// caller.
pub struct Engine {
    config: EngineConfig,
    flags: TopologyFlags,
    resolver: SampleResolver,
    activity: ActivityCoordinator,
    splitters: HashMap<PortId, OutputSplitter>,
    /// Some module answered NotReady last frame.
    module_cannot_process: bool,
    /// Dynamic-duration configuration must be rebuilt before the next frame
    /// ends.
    duration_config_dirty: bool,
}

impl Engine {
    /// Creates an engine with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            flags: TopologyFlags::new(),
            resolver: SampleResolver::new(),
            activity: ActivityCoordinator::new(),
            splitters: HashMap::new(),
            module_cannot_process: false,
            duration_config_dirty: false,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The flag aggregate (introspection and tests).
    pub fn flags(&self) -> &TopologyFlags {
        &self.flags
    }

    /// The sample resolver (introspection and tests).
    pub fn resolver(&self) -> &SampleResolver {
        &self.resolver
    }

    /// Resolves dynamic-duration modes and runs the sizing (max) propagation
    /// pass. Call after the graph is built and whenever its shape changes.
    pub fn prepare(&mut self, arena: &mut GraphArena, hooks: &mut dyn ContainerHooks) -> Result<()> {
        self.resolver.resolve_modes(arena, &self.config, hooks)?;
        self.resolver.propagate(arena, &self.config, Pass::Max)?;
        Ok(())
    }

    // --- Port state notifications (keep the aggregate exact) ---

    /// Records a negotiated media format on a port and marks it valid.
    pub fn set_format(&mut self, arena: &mut GraphArena, port: PortId, fmt: MediaFormat) -> Result<()> {
        let rec = arena.port_mut(port)?;
        rec.format = Some(fmt);
        rec.format_valid = true;
        self.flags.on_media_format_validity(port, true);
        Ok(())
    }

    /// Marks a port's media format valid or invalid.
    pub fn set_format_valid(&mut self, arena: &mut GraphArena, port: PortId, valid: bool) -> Result<()> {
        arena.port_mut(port)?.format_valid = valid;
        self.flags.on_media_format_validity(port, valid);
        Ok(())
    }

    /// Transitions a port between data-flowing and at-gap.
    pub fn set_data_flow(&mut self, arena: &mut GraphArena, port: PortId, state: DataFlowState) -> Result<()> {
        arena.port_mut(port)?.data_flow = state;
        self.flags.on_data_flow_transition(port, state);
        Ok(())
    }

    /// Records a pending EOF marker on a port.
    pub fn set_pending_eof(&mut self, arena: &mut GraphArena, port: PortId, pending: bool) -> Result<()> {
        arena.port_mut(port)?.pending_eof = pending;
        self.flags.on_pending_marker();
        Ok(())
    }

    /// Records a pending media-format change on a port.
    pub fn set_pending_format(&mut self, arena: &mut GraphArena, port: PortId, pending: bool) -> Result<()> {
        arena.port_mut(port)?.pending_format = pending;
        self.flags.on_pending_marker();
        Ok(())
    }

    // --- External boundary ---

    /// Registers an inbound buffer at an external input port.
    ///
    /// A contiguous buffer is accumulated (the port turns data-flowing); a
    /// discontinuous one is recorded but blocks accumulation until the
    /// pre-gap data drains.
    pub fn accept_input(
        &mut self,
        arena: &mut GraphArena,
        port: PortId,
        buf: &FrameBuffer,
    ) -> Result<InputVerdict> {
        let buffered = arena.port(port)?.buffered_bytes;
        let Some(rec) = arena.port_mut(port)?.timestamp.as_mut() else {
            return Err(GraphError::NotExternal(port).into());
        };
        let verdict = timestamp::register_input(rec, buf.timestamp_us, buffered);
        if timestamp::can_accumulate(rec, buffered) {
            let rec = arena.port_mut(port)?;
            rec.buffered_bytes += buf.data.len();
            if rec.data_flow == DataFlowState::AtGap {
                rec.data_flow = DataFlowState::DataFlowing;
                self.flags
                    .on_data_flow_transition(port, DataFlowState::DataFlowing);
            }
        }
        Ok(verdict)
    }

    /// Accounts for `bytes` consumed from an external input port's
    /// accumulator, advancing its timestamp expectation and completing a held
    /// discontinuity once the pre-gap data is gone.
    pub fn consume_input(&mut self, arena: &mut GraphArena, port: PortId, bytes: usize) -> Result<()> {
        let fmt = arena.port(port)?.format;
        let rec = arena.port_mut(port)?;
        rec.buffered_bytes = rec.buffered_bytes.saturating_sub(bytes);
        let drained = rec.buffered_bytes == 0;
        let Some(ts) = rec.timestamp.as_mut() else {
            return Err(GraphError::NotExternal(port).into());
        };
        if let Some(fmt) = fmt {
            timestamp::advance_input(ts, &fmt, bytes);
        }
        if drained {
            timestamp::resume_after_drain(ts);
        }
        Ok(())
    }

    /// Reconciles a produced buffer at an external output port against the
    /// timestamp extrapolation, splitting around any discontinuity. Returns
    /// what may be delivered now.
    pub fn collect_output(
        &mut self,
        arena: &mut GraphArena,
        port: PortId,
        produced: FrameBuffer,
    ) -> Result<Option<FrameBuffer>> {
        let fmt = arena
            .port(port)?
            .format
            .ok_or(crate::EngineError::MissingFormat(port))?;
        let splitter = self.splitters.entry(port).or_default();
        let Some(rec) = arena.port_mut(port)?.timestamp.as_mut() else {
            return Err(GraphError::NotExternal(port).into());
        };
        Ok(splitter.commit(rec, &fmt, produced))
    }

    // --- Frame dispatch ---

    /// Runs one forward kick: fast path when the aggregate proves it safe,
    /// general walk otherwise, then deferred transitions and lazy flag
    /// reconciliation.
    pub fn process_frame(
        &mut self,
        arena: &mut GraphArena,
        hooks: &mut dyn ContainerHooks,
    ) -> Result<ProcessInfo> {
        self.refresh_blocking(arena)?;

        let order = arena.sorted_modules()?;
        let mut ctx = FrameCtx::new(self.config.frame_samples);
        let mut info = ProcessInfo::default();
        let mut saw_not_ready = false;

        if self.flags.can_use_fast_path() {
            debug!("dispatch: fast path over {} modules", order.len());
            for &module in &order {
                if arena.module(module)?.flags.is_skip_process {
                    continue;
                }
                let status = arena.module_mut(module)?.behavior.process(&mut ctx);
                self.note_status(module, status, &mut info, &mut saw_not_ready);
                self.handle_events(arena, module, &mut ctx, &mut info)?;
            }
        } else {
            debug!("dispatch: general path over {} modules", order.len());
            if self.has_dynamic_duration(arena)? {
                self.resolver.propagate(arena, &self.config, Pass::Normal)?;
            }
            for &module in &order {
                let at_gap = {
                    let rec = arena.module(module)?;
                    rec.inputs.iter().any(|&p| {
                        arena
                            .port(p)
                            .map(|port| port.is_active() && port.data_flow == DataFlowState::AtGap)
                            .unwrap_or(false)
                    })
                };
                {
                    let flags = &mut arena.module_mut(module)?.flags;
                    flags.any_input_at_gap = at_gap;
                    if flags.is_skip_process {
                        continue;
                    }
                }

                let status = arena.module_mut(module)?.behavior.process(&mut ctx);
                self.note_status(module, status, &mut info, &mut saw_not_ready);
                self.handle_events(arena, module, &mut ctx, &mut info)?;
            }
        }
        info.format_propagated = ctx.format_propagated();
        self.module_cannot_process = saw_not_ready;

        // Transitions apply strictly after all module processing.
        let summary = self.activity.apply_pending(arena, &mut self.flags)?;
        if summary.applied > 0 {
            info.state_event_raised = true;
        }

        if self.duration_config_dirty {
            self.duration_config_dirty = false;
            self.resolver.resolve_modes(arena, &self.config, hooks)?;
            self.resolver.propagate(arena, &self.config, Pass::Max)?;
            info.state_event_raised = true;
        }

        if self.flags.needs_recheck() {
            let scan = EnablingScan::run(arena);
            self.flags.reconcile(scan);
        }
        Ok(info)
    }

    fn note_status(
        &mut self,
        module: ModuleId,
        status: ProcessStatus,
        info: &mut ProcessInfo,
        saw_not_ready: &mut bool,
    ) {
        match status {
            ProcessStatus::Advanced => info.data_moved = true,
            ProcessStatus::Starved => {}
            ProcessStatus::NotReady => {
                *saw_not_ready = true;
                self.flags.set_blocking(L1Condition::ModuleCannotProcess, true);
                debug!("dispatch: module {module} not ready");
            }
        }
    }

    fn handle_events(
        &mut self,
        arena: &mut GraphArena,
        module: ModuleId,
        ctx: &mut FrameCtx,
        info: &mut ProcessInfo,
    ) -> Result<()> {
        for event in ctx.drain_events() {
            info.state_event_raised = true;
            match event {
                ModuleEvent::ReportRequiredSamples { is_input, entries } => {
                    if let Err(err) = self.resolver.on_report_required_samples(
                        arena, module, is_input, &entries,
                    ) {
                        // Hard failure curtails only this report; prior
                        // counts remain in place.
                        warn!("dispatch: dropped sample report from {module}: {err}");
                    }
                }
                ModuleEvent::SetDynamicDurationDisabled(disabled) => {
                    arena.module_mut(module)?.flags.dynamic_duration_disabled = disabled;
                    self.duration_config_dirty = true;
                }
                ModuleEvent::PortActivity {
                    output_index,
                    active,
                } => {
                    self.activity.request(arena, module, output_index, active);
                }
            }
        }
        Ok(())
    }

    /// Recomputes the cheap L1 blocking bits and the active trigger-policy
    /// count for this invocation.
    fn refresh_blocking(&mut self, arena: &GraphArena) -> Result<()> {
        let mut source_present = false;
        let mut threshold_disabled = false;
        let mut triggers = 0u32;
        for id in arena.module_ids() {
            let rec = arena.module(id)?;
            if rec.class() == ModuleClass::Source {
                source_present = true;
            }
            if rec.flags.is_threshold && rec.flags.is_skip_process {
                threshold_disabled = true;
            }
            if rec.flags.needs_trigger_policy
                && rec.outputs.iter().any(|&p| {
                    arena.port(p).map(|port| port.is_active()).unwrap_or(false)
                })
            {
                triggers += 1;
            }
        }

        let mut not_started = false;
        let mut backward_drain = false;
        for id in arena.port_ids() {
            let port = arena.port(id)?;
            if port.is_active() && !port.started {
                not_started = true;
            }
            if let Some(ts) = &port.timestamp
                && ts.discontinuity
                && port.buffered_bytes > 0
            {
                backward_drain = true;
            }
        }
        if self.activity.has_pending(arena) {
            backward_drain = true;
        }
        if self.splitters.values().any(OutputSplitter::has_held) {
            backward_drain = true;
        }

        self.flags.set_blocking(L1Condition::SourcePresent, source_present);
        self.flags
            .set_blocking(L1Condition::ThresholdDisabled, threshold_disabled);
        self.flags.set_blocking(L1Condition::PortNotStarted, not_started);
        self.flags
            .set_blocking(L1Condition::PendingBackwardDrain, backward_drain);
        self.flags
            .set_blocking(L1Condition::ModuleCannotProcess, self.module_cannot_process);
        self.flags.set_active_trigger_policies(triggers);
        Ok(())
    }

    fn has_dynamic_duration(&self, arena: &GraphArena) -> Result<bool> {
        for id in arena.module_ids() {
            if arena.module(id)?.flags.needs_dynamic_duration {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
