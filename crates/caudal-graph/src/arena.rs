//! Arena storage for module and port records.
//!
//! Modules and ports live in flat slabs addressed by stable integer ids; all
//! adjacency ("connected peer", "owner module") is index fields inside the
//! records, validated when connections are made. The engine never allocates
//! or frees nodes — it only annotates what the builder created.

use tracing::debug;

use crate::behavior::ModuleBehavior;
use crate::module::{ModuleFlags, ModuleId, ModuleRecord};
use crate::port::{PortDirection, PortId, PortRecord, TimestampRecord};
use crate::{GraphError, Result};

/// Slab of module and port records plus their connectivity.
///
/// Mutations (adding, connecting) invalidate the cached topological order;
/// [`sorted_modules`](Self::sorted_modules) recomputes it lazily.
pub struct GraphArena {
    modules: Vec<ModuleRecord>,
    ports: Vec<PortRecord>,
    /// Cached Kahn order; invalidated on any structural mutation.
    sorted: Option<Vec<ModuleId>>,
}

impl Default for GraphArena {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            ports: Vec::new(),
            sorted: None,
        }
    }

    // --- Building ---

    /// Adds a module with `n_inputs` input and `n_outputs` output ports.
    ///
    /// Ports are created unconnected, at a data gap, with no negotiated
    /// format.
    pub fn add_module(
        &mut self,
        name: &str,
        behavior: Box<dyn ModuleBehavior + Send>,
        n_inputs: usize,
        n_outputs: usize,
    ) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);

        let mut inputs = Vec::with_capacity(n_inputs);
        for _ in 0..n_inputs {
            inputs.push(self.add_port(id, PortDirection::Input));
        }
        let mut outputs = Vec::with_capacity(n_outputs);
        for _ in 0..n_outputs {
            outputs.push(self.add_port(id, PortDirection::Output));
        }

        self.modules.push(ModuleRecord {
            id,
            name: name.to_owned(),
            behavior,
            flags: ModuleFlags::default(),
            inputs,
            outputs,
            threshold_frame: None,
        });
        self.sorted = None;
        debug!("graph_add: module {id} '{name}' ({n_inputs} in, {n_outputs} out)");
        id
    }

    fn add_port(&mut self, owner: ModuleId, direction: PortDirection) -> PortId {
        let id = PortId(self.ports.len() as u32);
        self.ports.push(PortRecord::new(id, owner, direction));
        id
    }

    /// Connects an output port to an input port.
    ///
    /// Validates direction, double-connect, and acyclicity. The cycle check
    /// runs at connect time so traversals can assume a DAG.
    pub fn connect(&mut self, from: PortId, to: PortId) -> Result<()> {
        let from_port = self.port(from)?;
        let to_port = self.port(to)?;

        if from_port.direction != PortDirection::Output || to_port.direction != PortDirection::Input
        {
            return Err(GraphError::DirectionMismatch {
                from: from_port.direction,
                to: to_port.direction,
            });
        }
        if from_port.peer.is_some() {
            return Err(GraphError::AlreadyConnected(from));
        }
        if to_port.peer.is_some() {
            return Err(GraphError::AlreadyConnected(to));
        }

        let (src, dst) = (from_port.owner, to_port.owner);
        if self.can_reach(dst, src) {
            return Err(GraphError::CycleDetected);
        }

        self.ports[from.0 as usize].peer = Some(to);
        self.ports[to.0 as usize].peer = Some(from);
        self.sorted = None;
        debug!("graph_connect: {from} → {to} ({src} → {dst})");
        Ok(())
    }

    /// Marks a port as external (topology boundary) and opens its timestamp
    /// record.
    pub fn open_external(&mut self, id: PortId) -> Result<()> {
        let port = self.port_mut(id)?;
        port.external = true;
        port.timestamp = Some(TimestampRecord::default());
        Ok(())
    }

    // --- Accessors ---

    /// Returns a module record.
    pub fn module(&self, id: ModuleId) -> Result<&ModuleRecord> {
        self.modules
            .get(id.0 as usize)
            .ok_or(GraphError::ModuleNotFound(id))
    }

    /// Returns a mutable module record.
    pub fn module_mut(&mut self, id: ModuleId) -> Result<&mut ModuleRecord> {
        self.modules
            .get_mut(id.0 as usize)
            .ok_or(GraphError::ModuleNotFound(id))
    }

    /// Returns a port record.
    pub fn port(&self, id: PortId) -> Result<&PortRecord> {
        self.ports
            .get(id.0 as usize)
            .ok_or(GraphError::PortNotFound(id))
    }

    /// Returns a mutable port record.
    pub fn port_mut(&mut self, id: PortId) -> Result<&mut PortRecord> {
        self.ports
            .get_mut(id.0 as usize)
            .ok_or(GraphError::PortNotFound(id))
    }

    /// Resolves a module's input port by index.
    pub fn input_port(&self, module: ModuleId, index: u32) -> Result<PortId> {
        self.module(module)?
            .inputs
            .get(index as usize)
            .copied()
            .ok_or(GraphError::PortIndexOutOfRange {
                module,
                direction: PortDirection::Input,
                index,
            })
    }

    /// Resolves a module's output port by index.
    pub fn output_port(&self, module: ModuleId, index: u32) -> Result<PortId> {
        self.module(module)?
            .outputs
            .get(index as usize)
            .copied()
            .ok_or(GraphError::PortIndexOutOfRange {
                module,
                direction: PortDirection::Output,
                index,
            })
    }

    /// All module ids, in creation order.
    pub fn module_ids(&self) -> impl Iterator<Item = ModuleId> + '_ {
        (0..self.modules.len() as u32).map(ModuleId)
    }

    /// All port ids, in creation order.
    pub fn port_ids(&self) -> impl Iterator<Item = PortId> + '_ {
        (0..self.ports.len() as u32).map(PortId)
    }

    /// Number of modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Number of ports.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    // --- Topological order ---

    /// Modules in topological order (Kahn's algorithm), cached until the next
    /// structural mutation.
    ///
    /// Returns a clone so callers can iterate while mutating records.
    pub fn sorted_modules(&mut self) -> Result<Vec<ModuleId>> {
        if let Some(sorted) = &self.sorted {
            return Ok(sorted.clone());
        }
        let sorted = self.kahn_sort()?;
        debug!("graph_sort: {} modules in topo order", sorted.len());
        self.sorted = Some(sorted.clone());
        Ok(sorted)
    }

    fn kahn_sort(&self) -> Result<Vec<ModuleId>> {
        let n = self.modules.len();
        let mut in_degree = vec![0u32; n];

        for module in &self.modules {
            for &pid in &module.inputs {
                if self.ports[pid.0 as usize].peer.is_some() {
                    in_degree[module.id.0 as usize] += 1;
                }
            }
        }

        let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(n);

        while let Some(idx) = queue.pop() {
            sorted.push(ModuleId(idx as u32));
            for &pid in &self.modules[idx].outputs {
                if let Some(peer) = self.ports[pid.0 as usize].peer {
                    let to_idx = self.ports[peer.0 as usize].owner.0 as usize;
                    in_degree[to_idx] -= 1;
                    if in_degree[to_idx] == 0 {
                        queue.push(to_idx);
                    }
                }
            }
        }

        // Connect-time validation makes this unreachable, kept as the last
        // line of defense for future graph shapes.
        if sorted.len() != n {
            return Err(GraphError::CycleDetected);
        }
        Ok(sorted)
    }

    /// DFS reachability over module adjacency: can `from` reach `to`?
    fn can_reach(&self, from: ModuleId, to: ModuleId) -> bool {
        let mut visited = vec![false; self.modules.len()];
        let mut stack = vec![from];

        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            let idx = current.0 as usize;
            if visited[idx] {
                continue;
            }
            visited[idx] = true;

            for &pid in &self.modules[idx].outputs {
                if let Some(peer) = self.ports[pid.0 as usize].peer {
                    stack.push(self.ports[peer.0 as usize].owner);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{ConfigDirective, ConfigOutcome, FrameCtx, ProcessStatus};

    struct Passthrough;

    impl ModuleBehavior for Passthrough {
        fn configure(&mut self, _directive: &ConfigDirective<'_>) -> ConfigOutcome {
            ConfigOutcome::Applied
        }
        fn process(&mut self, _ctx: &mut FrameCtx) -> ProcessStatus {
            ProcessStatus::Advanced
        }
    }

    fn chain3(arena: &mut GraphArena) -> (ModuleId, ModuleId, ModuleId) {
        let a = arena.add_module("a", Box::new(Passthrough), 0, 1);
        let b = arena.add_module("b", Box::new(Passthrough), 1, 1);
        let c = arena.add_module("c", Box::new(Passthrough), 1, 0);
        arena
            .connect(
                arena.output_port(a, 0).unwrap(),
                arena.input_port(b, 0).unwrap(),
            )
            .unwrap();
        arena
            .connect(
                arena.output_port(b, 0).unwrap(),
                arena.input_port(c, 0).unwrap(),
            )
            .unwrap();
        (a, b, c)
    }

    #[test]
    fn sorted_order_respects_edges() {
        let mut arena = GraphArena::new();
        let (a, b, c) = chain3(&mut arena);
        let sorted = arena.sorted_modules().unwrap();
        let pos = |m| sorted.iter().position(|&x| x == m).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn connect_rejects_wrong_direction() {
        let mut arena = GraphArena::new();
        let a = arena.add_module("a", Box::new(Passthrough), 1, 1);
        let b = arena.add_module("b", Box::new(Passthrough), 1, 1);
        let err = arena
            .connect(
                arena.input_port(a, 0).unwrap(),
                arena.input_port(b, 0).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::DirectionMismatch { .. }));
    }

    #[test]
    fn connect_rejects_cycle() {
        let mut arena = GraphArena::new();
        let a = arena.add_module("a", Box::new(Passthrough), 1, 1);
        let b = arena.add_module("b", Box::new(Passthrough), 1, 1);
        arena
            .connect(
                arena.output_port(a, 0).unwrap(),
                arena.input_port(b, 0).unwrap(),
            )
            .unwrap();
        let err = arena
            .connect(
                arena.output_port(b, 0).unwrap(),
                arena.input_port(a, 0).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected));
    }

    #[test]
    fn connect_rejects_double_connect() {
        let mut arena = GraphArena::new();
        let (_, b, _) = chain3(&mut arena);
        let d = arena.add_module("d", Box::new(Passthrough), 0, 1);
        let err = arena
            .connect(
                arena.output_port(d, 0).unwrap(),
                arena.input_port(b, 0).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::AlreadyConnected(_)));
    }

    #[test]
    fn open_external_creates_timestamp_record() {
        let mut arena = GraphArena::new();
        let a = arena.add_module("a", Box::new(Passthrough), 1, 1);
        let port = arena.input_port(a, 0).unwrap();
        arena.open_external(port).unwrap();
        let rec = arena.port(port).unwrap();
        assert!(rec.external);
        assert!(rec.timestamp.is_some());
    }
}
