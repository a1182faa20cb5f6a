//! No-internal-buffering chain (NBLC) traversal.
//!
//! An NBLC chain is a maximal run of single-in/single-out, non-buffering
//! modules between two buffering boundaries (threshold, fan-in/fan-out,
//! trigger-policy, or dynamic-duration modules). The walk yields successive
//! neighbor modules; deciding where a particular query stops is the caller's
//! concern, because different traversals break on different module kinds.
//!
//! Chains are acyclic by graph invariant (cycles are rejected at connect
//! time); the walk still carries an explicit visited set so a malformed
//! future graph shape terminates instead of looping.

use crate::arena::GraphArena;
use crate::module::{ModuleClass, ModuleId};
use crate::port::{PortDirection, PortId};

/// Direction of a chain walk relative to data flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkDir {
    /// Toward data producers.
    Upstream,
    /// Toward data consumers.
    Downstream,
}

/// Iterator over the modules of a no-internal-buffering chain.
///
/// Yields the successive neighbors of the starting point, nearest first. The
/// starting module itself is not yielded. The walk ends when a yielded module
/// cannot be stepped through (not SISO, or its far-side port is
/// unconnected) or when a module would repeat.
pub struct ChainWalk<'a> {
    arena: &'a GraphArena,
    dir: WalkDir,
    cursor: Option<PortId>,
    visited: Vec<bool>,
}

impl<'a> ChainWalk<'a> {
    pub(crate) fn from_port(arena: &'a GraphArena, port: PortId, dir: WalkDir) -> Self {
        // A downstream walk leaves through an output port, upstream through
        // an input port; anything else means an empty walk.
        let cursor = arena.port(port).ok().and_then(|p| {
            let expect = match dir {
                WalkDir::Downstream => PortDirection::Output,
                WalkDir::Upstream => PortDirection::Input,
            };
            (p.direction == expect).then_some(port)
        });
        Self {
            arena,
            dir,
            cursor,
            visited: vec![false; arena.module_count()],
        }
    }

    pub(crate) fn from_module(arena: &'a GraphArena, module: ModuleId, dir: WalkDir) -> Self {
        let cursor = arena.module(module).ok().and_then(|m| match dir {
            WalkDir::Downstream => m.outputs.first().copied(),
            WalkDir::Upstream => m.inputs.first().copied(),
        });
        let mut visited = vec![false; arena.module_count()];
        if let Some(slot) = visited.get_mut(module.0 as usize) {
            *slot = true;
        }
        Self {
            arena,
            dir,
            cursor,
            visited,
        }
    }
}

impl Iterator for ChainWalk<'_> {
    type Item = ModuleId;

    fn next(&mut self) -> Option<ModuleId> {
        let port = self.cursor.take()?;
        let peer = self.arena.port(port).ok()?.peer?;
        let next = self.arena.port(peer).ok()?.owner;

        let idx = next.0 as usize;
        if self.visited.get(idx).copied().unwrap_or(true) {
            return None;
        }
        self.visited[idx] = true;

        // Step through only if the module has an unambiguous far side.
        let module = self.arena.module(next).ok()?;
        if module.class() == ModuleClass::Siso {
            self.cursor = match self.dir {
                WalkDir::Downstream => module.outputs.first().copied(),
                WalkDir::Upstream => module.inputs.first().copied(),
            };
        }
        Some(next)
    }
}

impl GraphArena {
    /// Walks the NBLC chain away from `module` in the given direction.
    ///
    /// Starts from the module's first port on that side; modules with no port
    /// there produce an empty walk.
    pub fn chain_walk(&self, module: ModuleId, dir: WalkDir) -> ChainWalk<'_> {
        ChainWalk::from_module(self, module, dir)
    }

    /// Walks the NBLC chain leaving through a specific port.
    ///
    /// `dir` must match the port's side (downstream from an output, upstream
    /// from an input); otherwise the walk is empty.
    pub fn chain_walk_from_port(&self, port: PortId, dir: WalkDir) -> ChainWalk<'_> {
        ChainWalk::from_port(self, port, dir)
    }

    /// The nearest chain neighbor of `module` in the given direction, if any.
    pub fn chain_neighbor(&self, module: ModuleId, dir: WalkDir) -> Option<ModuleId> {
        self.chain_walk(module, dir).next()
    }
}
