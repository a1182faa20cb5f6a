//! Dynamic-duration mode resolution and sample-requirement propagation.
//!
//! Variable-rate modules must be told whether to run Fixed-Input (consume
//! exactly what they are given) or Fixed-Output (produce exactly what is
//! requested, report the input they need). Mode assignment is a pure function
//! of topology: a walk down each no-buffering chain looks for the nearest
//! fixed boundary on either side. Once modes are set, backward queries from
//! each fixed anchor propagate concrete sample counts upstream, converting
//! through each Fixed-Output module's declared rate ratio.
//!
//! Propagation runs in two variants: a *normal* pass driven per frame, and a
//! *max* pass whose results only grow and are used to size buffers once.
//!
//! Re-entrancy is prevented structurally: the resolver is a two-state machine
//! (`Idle | Traversing`). A required-sample report arriving mid-traversal is
//! applied in place only during the max pass; otherwise it is queued and
//! applied at the next explicit [`get_required_input_samples`] call.
//!
//! [`get_required_input_samples`]: SampleResolver::get_required_input_samples

use caudal_graph::{
    ConfigDirective, ConfigOutcome, DurationMode, GraphArena, ModuleClass, ModuleId, PortSamples,
    WalkDir,
};
use tracing::{debug, warn};

use crate::config::{EngineConfig, PathDirection};
use crate::hooks::ContainerHooks;
use crate::{EngineError, Result};

/// Which requirement variant a propagation writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    /// Per-frame requirement, rewritten every general-path frame.
    Normal,
    /// Monotonic sizing pass; results only ever grow.
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TraversalState {
    Idle,
    Traversing { max_pass: bool },
}

struct DeferredReport {
    module: ModuleId,
    entries: Vec<PortSamples>,
}

/// Resolves dynamic-duration modes and propagates required sample counts.
pub struct SampleResolver {
    state: TraversalState,
    deferred: Vec<DeferredReport>,
    /// Modules from which backward queries start. Rebuilt whenever the
    /// dynamic-duration configuration changes; unordered.
    query_starts: Vec<ModuleId>,
    /// Scratch for the flat `(port, samples)` array pushed to modules.
    scratch: Vec<PortSamples>,
}

impl Default for SampleResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleResolver {
    /// Creates an idle resolver with no cached configuration.
    pub fn new() -> Self {
        Self {
            state: TraversalState::Idle,
            deferred: Vec::new(),
            query_starts: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// The current query-start set (test and introspection surface).
    pub fn query_starts(&self) -> &[ModuleId] {
        &self.query_starts
    }

    // --- Mode determination ---

    /// (Re)computes the duration mode of every dynamic-duration module, then
    /// rebuilds the query-start set and notifies the container.
    ///
    /// Mode assignment depends only on graph shape and configuration, never
    /// on call order.
    pub fn resolve_modes(
        &mut self,
        arena: &mut GraphArena,
        cfg: &EngineConfig,
        hooks: &mut dyn ContainerHooks,
    ) -> Result<()> {
        for module in arena.sorted_modules()? {
            let flags = arena.module(module)?.flags;
            if !flags.needs_dynamic_duration {
                continue;
            }

            if flags.dynamic_duration_disabled {
                if Self::should_rearm(arena, module)? {
                    // The graph now places this module on a variable-rate
                    // path; re-offer a mode.
                    arena.module_mut(module)?.flags.dynamic_duration_disabled = false;
                    debug!("resolver: re-arming self-disabled module {module}");
                } else {
                    arena.module_mut(module)?.flags.duration_mode = DurationMode::Invalid;
                    continue;
                }
            }

            let downstream_fixed = Self::direction_fixed(arena, module, WalkDir::Downstream)?;
            let upstream_fixed = Self::direction_fixed(arena, module, WalkDir::Upstream)?;

            let mode = match (upstream_fixed, downstream_fixed) {
                (true, true) => {
                    // Ambiguous placement: the module sits between two fixed
                    // boundaries and dynamic duration adds no value there.
                    warn!(
                        "resolver: module {} is both upstream- and downstream-fixed; \
                         Fixed-Input wins",
                        arena.module(module)?.name
                    );
                    DurationMode::FixedInput
                }
                (true, false) => DurationMode::FixedInput,
                (false, true) => DurationMode::FixedOutput,
                (false, false) => Self::default_mode(cfg),
            };

            let outcome = arena
                .module_mut(module)?
                .behavior
                .configure(&ConfigDirective::DurationMode(mode));
            match outcome {
                ConfigOutcome::Applied => {
                    arena.module_mut(module)?.flags.duration_mode = mode;
                    debug!("resolver: module {module} configured {mode:?}");
                }
                ConfigOutcome::NotReady => {
                    // Input media format not known yet; drop every cached
                    // count for this instance and fall back to fixed-size.
                    Self::clear_module_requirements(arena, module)?;
                    arena.module_mut(module)?.flags.duration_mode = DurationMode::Invalid;
                    debug!("resolver: module {module} not ready for {mode:?}");
                }
                ConfigOutcome::Rejected => {
                    arena.module_mut(module)?.flags.duration_mode = DurationMode::Invalid;
                    debug!("resolver: module {module} rejected {mode:?}");
                }
            }
        }

        self.rebuild_query_starts(arena)?;
        hooks.clear_required_samples(false);
        hooks.clear_required_samples(true);
        hooks.update_input_connection_buffer_info();
        Ok(())
    }

    /// Whether a walk from `module` hits a fixed boundary (threshold,
    /// non-SISO, or trigger-policy module) before any other dynamic-duration
    /// module.
    fn direction_fixed(arena: &GraphArena, module: ModuleId, dir: WalkDir) -> Result<bool> {
        for next in arena.chain_walk(module, dir) {
            let rec = arena.module(next)?;
            if rec.flags.needs_dynamic_duration {
                return Ok(false);
            }
            if rec.flags.is_threshold
                || rec.flags.needs_trigger_policy
                || rec.class() != ModuleClass::Siso
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Re-arming rule for a self-disabled module: the chain neighbor on
    /// either side makes the path variable-rate again.
    fn should_rearm(arena: &GraphArena, module: ModuleId) -> Result<bool> {
        if let Some(up) = arena.chain_neighbor(module, WalkDir::Upstream) {
            let f = arena.module(up)?.flags;
            if f.needs_dynamic_duration && f.duration_mode == DurationMode::FixedInput {
                return Ok(true);
            }
            // A plain non-threshold neighbor may buffer internally and also
            // produce variable timing.
            if !f.needs_dynamic_duration && !f.is_threshold {
                return Ok(true);
            }
        }
        if let Some(down) = arena.chain_neighbor(module, WalkDir::Downstream) {
            let f = arena.module(down)?.flags;
            if f.needs_dynamic_duration && f.duration_mode == DurationMode::FixedOutput {
                return Ok(true);
            }
            if !f.needs_dynamic_duration && !f.is_threshold {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn default_mode(cfg: &EngineConfig) -> DurationMode {
        match (cfg.path, cfg.voice_path) {
            // Voice toward the end-point consumer must not buffer in front
            // of it.
            (PathDirection::Receive, true) => DurationMode::FixedInput,
            (PathDirection::Receive, false) => DurationMode::FixedOutput,
            (PathDirection::Transmit, _) => DurationMode::FixedInput,
        }
    }

    // --- Query-start set ---

    /// Rebuilds the set of modules from which backward queries start.
    ///
    /// For every Fixed-Output module's output, the walk runs downstream to
    /// the first external output, Fixed-Input module, or
    /// threshold/trigger-policy module. Hitting another Fixed-Output module
    /// instead continues the search from that module's outputs.
    /// Sync-extension modules fed by variable upstream output are added
    /// unconditionally — their internal buffering makes them an effective
    /// boundary.
    fn rebuild_query_starts(&mut self, arena: &GraphArena) -> Result<()> {
        self.query_starts.clear();

        let mut work: Vec<ModuleId> = Vec::new();
        for id in arena.module_ids() {
            if arena.module(id)?.flags.duration_mode == DurationMode::FixedOutput {
                work.push(id);
            }
        }

        let mut expanded = vec![false; arena.module_count()];
        while let Some(from) = work.pop() {
            if core::mem::replace(&mut expanded[from.index() as usize], true) {
                continue;
            }
            for &out in &arena.module(from)?.outputs {
                if arena.port(out)?.external {
                    // The fixed-output boundary is the container itself.
                    self.push_start(from);
                    continue;
                }
                for next in arena.chain_walk_from_port(out, WalkDir::Downstream) {
                    let rec = arena.module(next)?;
                    let f = rec.flags;
                    if f.needs_dynamic_duration {
                        match f.duration_mode {
                            DurationMode::FixedInput => {
                                self.push_start(next);
                                break;
                            }
                            DurationMode::FixedOutput => {
                                work.push(next);
                                break;
                            }
                            // Unconfigured: ordinary fixed-size processing,
                            // keep walking.
                            DurationMode::Invalid => {}
                        }
                    }
                    if f.is_threshold || f.needs_trigger_policy {
                        self.push_start(next);
                        break;
                    }
                    if rec.outputs.iter().any(|&o| {
                        arena.port(o).map(|p| p.external).unwrap_or(false)
                    }) {
                        self.push_start(next);
                        break;
                    }
                }
            }
        }

        for id in arena.module_ids() {
            let rec = arena.module(id)?;
            if !rec.flags.needs_sync_extension {
                continue;
            }
            let fed_variable = arena.chain_walk(id, WalkDir::Upstream).any(|up| {
                arena
                    .module(up)
                    .map(|m| {
                        m.flags.needs_dynamic_duration
                            && m.flags.duration_mode != DurationMode::Invalid
                    })
                    .unwrap_or(false)
            });
            if fed_variable {
                self.push_start(id);
            }
        }

        debug!("resolver: {} query-start modules", self.query_starts.len());
        Ok(())
    }

    fn push_start(&mut self, module: ModuleId) {
        if !self.query_starts.contains(&module) {
            self.query_starts.push(module);
        }
    }

    // --- Backward propagation ---

    /// Runs one backward propagation pass from every query-start module.
    ///
    /// Each Fixed-Output module along an upstream walk answers how many input
    /// samples it needs for the requested output; the walk then continues one
    /// hop further upstream with the converted count. Results land in the
    /// per-port requirement cache and are pushed to the Fixed-Output modules
    /// as flat `(port, samples)` arrays.
    pub fn propagate(
        &mut self,
        arena: &mut GraphArena,
        cfg: &EngineConfig,
        pass: Pass,
    ) -> Result<()> {
        if matches!(self.state, TraversalState::Traversing { .. }) {
            // Structurally unreachable in the cooperative model; refuse to
            // recurse rather than corrupt in-progress state.
            debug!("resolver: propagate skipped, traversal already active");
            return Ok(());
        }
        let max_pass = pass == Pass::Max;
        self.state = TraversalState::Traversing { max_pass };
        let result = self.propagate_inner(arena, cfg, max_pass);
        self.state = TraversalState::Idle;
        result
    }

    fn propagate_inner(
        &mut self,
        arena: &mut GraphArena,
        cfg: &EngineConfig,
        max_pass: bool,
    ) -> Result<()> {
        let starts = self.query_starts.clone();
        for qs in starts {
            let (requested, entry_port, qs_mode, anchor_out) = {
                let rec = arena.module(qs)?;
                let anchor_out = rec
                    .outputs
                    .iter()
                    .copied()
                    .find(|&o| arena.port(o).map(|p| p.external).unwrap_or(false))
                    .or_else(|| rec.outputs.first().copied());
                (
                    rec.threshold_frame.unwrap_or(cfg.frame_samples),
                    rec.inputs.first().copied(),
                    rec.flags.duration_mode,
                    anchor_out,
                )
            };
            let Some(entry_port) = entry_port else {
                continue;
            };

            let mut required = requested;
            if qs_mode == DurationMode::FixedOutput {
                // A Fixed-Output query start is itself the first converting
                // hop: the requested count applies to its output, the
                // converted count to its input and everything upstream.
                if let Some(out) = anchor_out {
                    arena.port_mut(out)?.requirement.record(requested, max_pass);
                }
                required = arena
                    .module(qs)?
                    .behavior
                    .dynamic_duration()
                    .map_or(requested, |dd| dd.required_input_samples(requested));
            }
            arena
                .port_mut(entry_port)?
                .requirement
                .record(required, max_pass);

            let mut visited = vec![false; arena.module_count()];
            visited[qs.index() as usize] = true;
            let mut cursor = entry_port;
            loop {
                let Some(feed) = arena.port(cursor)?.peer else {
                    break;
                };
                let up = arena.port(feed)?.owner;
                if core::mem::replace(&mut visited[up.index() as usize], true) {
                    break;
                }
                // The output port the walk arrived through carries the
                // downstream requirement, whichever of the feeding module's
                // outputs it is.
                arena.port_mut(feed)?.requirement.record(required, max_pass);

                let (in_port, flags, class) = {
                    let urec = arena.module(up)?;
                    (urec.inputs.first().copied(), urec.flags, urec.class())
                };

                if flags.duration_mode == DurationMode::FixedOutput {
                    required = arena
                        .module(up)?
                        .behavior
                        .dynamic_duration()
                        .map_or(required, |dd| dd.required_input_samples(required));
                    let Some(inp) = in_port else {
                        break;
                    };
                    arena.port_mut(inp)?.requirement.record(required, max_pass);
                    cursor = inp;
                    continue;
                }
                if flags.duration_mode == DurationMode::FixedInput
                    || flags.is_threshold
                    || flags.needs_trigger_policy
                    || class != ModuleClass::Siso
                {
                    // Fixed boundary; the count does not cross it.
                    break;
                }
                // Plain pass-through module: requirement crosses unchanged.
                let Some(inp) = in_port else {
                    break;
                };
                arena.port_mut(inp)?.requirement.record(required, max_pass);
                cursor = inp;
            }
        }

        self.push_requirements(arena, max_pass)
    }

    /// Pushes cached input-side counts to every Fixed-Output module.
    fn push_requirements(&mut self, arena: &mut GraphArena, max_pass: bool) -> Result<()> {
        for module in arena.module_ids().collect::<Vec<_>>() {
            if arena.module(module)?.flags.duration_mode != DurationMode::FixedOutput {
                continue;
            }
            let inputs = arena.module(module)?.inputs.clone();

            self.scratch.clear();
            if self.scratch.try_reserve(inputs.len()).is_err() {
                // Roll the cache back to a consistent empty state so a retry
                // starts clean.
                self.scratch = Vec::new();
                return Err(EngineError::CacheExhausted);
            }
            for (index, &port) in inputs.iter().enumerate() {
                let req = arena.port(port)?.requirement;
                let slot = if max_pass { req.max } else { req.current };
                if slot.is_updated {
                    self.scratch.push(PortSamples {
                        port_index: index as u32,
                        samples_per_channel: slot.samples_per_channel,
                    });
                }
            }
            if self.scratch.is_empty() {
                continue;
            }

            let outcome = arena
                .module_mut(module)?
                .behavior
                .configure(&ConfigDirective::RequiredSamples {
                    is_input: true,
                    entries: &self.scratch,
                });
            match outcome {
                ConfigOutcome::Applied => {}
                ConfigOutcome::NotReady => {
                    Self::clear_module_requirements(arena, module)?;
                }
                ConfigOutcome::Rejected => {
                    // Configuration rejected: revert to ordinary fixed-size
                    // processing and keep going with the rest of the graph.
                    arena.module_mut(module)?.flags.duration_mode = DurationMode::Invalid;
                    warn!("resolver: module {module} rejected required-sample push");
                }
            }
        }
        Ok(())
    }

    // --- Asynchronous reports ---

    /// Handles a module's "report required samples" event.
    ///
    /// Direction is validated before anything is touched: counts must address
    /// the input side and the module must hold a concrete mode, otherwise the
    /// call hard-fails and every cached count stays as it was. During the max
    /// traversal the update is applied in place; otherwise it is deferred to
    /// the next [`get_required_input_samples`] call to avoid re-entrant
    /// traversal.
    ///
    /// [`get_required_input_samples`]: Self::get_required_input_samples
    pub fn on_report_required_samples(
        &mut self,
        arena: &mut GraphArena,
        module: ModuleId,
        is_input: bool,
        entries: &[PortSamples],
    ) -> Result<()> {
        let mode = arena.module(module)?.flags.duration_mode;
        if !is_input || mode == DurationMode::Invalid {
            return Err(EngineError::InvalidReportDirection {
                module,
                side: if is_input { "input" } else { "output" },
                mode,
            });
        }

        match self.state {
            TraversalState::Traversing { max_pass: true } => {
                Self::apply_report(arena, module, entries, true)
            }
            _ => {
                self.deferred.push(DeferredReport {
                    module,
                    entries: entries.to_vec(),
                });
                Ok(())
            }
        }
    }

    fn apply_report(
        arena: &mut GraphArena,
        module: ModuleId,
        entries: &[PortSamples],
        max_pass: bool,
    ) -> Result<()> {
        let inputs = arena.module(module)?.inputs.clone();
        for entry in entries {
            let Some(&port) = inputs.get(entry.port_index as usize) else {
                // Malformed report: drop the entry, keep the rest.
                warn!(
                    "resolver: module {module} reported samples for out-of-range port {}",
                    entry.port_index
                );
                continue;
            };
            arena
                .port_mut(port)?
                .requirement
                .record(entry.samples_per_channel, max_pass);
        }
        Ok(())
    }

    /// Returns the per-frame required sample count for a module input port,
    /// applying any deferred reports first.
    pub fn get_required_input_samples(
        &mut self,
        arena: &mut GraphArena,
        module: ModuleId,
        port_index: u32,
    ) -> Result<u32> {
        self.apply_deferred(arena)?;
        let port = arena.input_port(module, port_index)?;
        Ok(arena.port(port)?.requirement.current.samples_per_channel)
    }

    fn apply_deferred(&mut self, arena: &mut GraphArena) -> Result<()> {
        for report in core::mem::take(&mut self.deferred) {
            Self::apply_report(arena, report.module, &report.entries, false)?;
        }
        Ok(())
    }

    /// Whether any deferred report is still queued (test surface).
    pub fn has_deferred_reports(&self) -> bool {
        !self.deferred.is_empty()
    }

    fn clear_module_requirements(arena: &mut GraphArena, module: ModuleId) -> Result<()> {
        let ports: Vec<_> = {
            let rec = arena.module(module)?;
            rec.inputs.iter().chain(rec.outputs.iter()).copied().collect()
        };
        for port in ports {
            let req = &mut arena.port_mut(port)?.requirement;
            req.clear(false);
            req.clear(true);
        }
        Ok(())
    }
}
