//! The lock-order graph.
//! Nodes are lock classes; an edge `A -> B` records that some path acquired
//! `B` while holding `A`, witnessed by the pair of acquisition stacks after
//! common-prefix trimming. Cycles in the collapsed graph are the analysis
//! result: every edge of a cycle executing concurrently can deadlock.

use petgraph::algo;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent, EdgeRef};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::lockset::stack::{CallStack, StackInterner};
use crate::lockset::{LockClassId, StringSpace};

/// A deduplicated witness for an edge: the trimmed stacks at which the held
/// class and the newly acquired class were locked.
pub type WitnessPair = (CallStack, CallStack);

pub struct LockOrder {
    graph: DiGraph<LockClassId, ()>,
    nodes: FxHashMap<LockClassId, NodeIndex>,
    witnesses: FxHashMap<(LockClassId, LockClassId), Vec<WitnessPair>>,
    seen: FxHashSet<(LockClassId, LockClassId, CallStack, CallStack)>,
}

impl Default for LockOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl LockOrder {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: FxHashMap::default(),
            witnesses: FxHashMap::default(),
            seen: FxHashSet::default(),
        }
    }

    fn node(&mut self, class: LockClassId) -> NodeIndex {
        if let Some(idx) = self.nodes.get(&class) {
            return *idx;
        }
        let idx = self.graph.add_node(class);
        self.nodes.insert(class, idx);
        idx
    }

    /// Ensure `class` appears as a node even without edges, so unbalanced
    /// acquisitions still show up in the graph.
    pub fn add_class(&mut self, class: LockClassId) {
        self.node(class);
    }

    /// Record that `to` was acquired (at `to_stack`) while `from` was held
    /// (acquired at `from_stack`). Stacks are common-prefix trimmed before
    /// deduplication; without trimming, every distinct outer call chain
    /// would produce a distinct witness and the graph becomes unreadable.
    pub fn add(
        &mut self,
        from: LockClassId,
        to: LockClassId,
        from_stack: CallStack,
        to_stack: CallStack,
        stacks: &mut StackInterner,
    ) {
        let (tf, tt) = stacks.trim_common_prefix(from_stack, to_stack);
        if !self.seen.insert((from, to, tf, tt)) {
            return;
        }
        let from_idx = self.node(from);
        let to_idx = self.node(to);
        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, ());
        }
        self.witnesses.entry((from, to)).or_default().push((tf, tt));
    }

    pub fn has_edge(&self, from: LockClassId, to: LockClassId) -> bool {
        self.witnesses.contains_key(&(from, to))
    }

    pub fn witnesses(&self, from: LockClassId, to: LockClassId) -> &[WitnessPair] {
        self.witnesses
            .get(&(from, to))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn classes(&self) -> impl Iterator<Item = LockClassId> + '_ {
        self.graph.node_weights().copied()
    }

    pub fn edge_count(&self) -> usize {
        self.witnesses.len()
    }

    /// Enumerate simple cycles in the collapsed class graph. Each cycle is
    /// the sequence of classes along it; the closing edge returns to the
    /// first element. A self-loop is a cycle of length 1.
    pub fn find_cycles(&self) -> Vec<Vec<LockClassId>> {
        let mut cycles = Vec::new();

        // Self-loops first; the simple-path enumeration below skips them.
        let mut self_loops: Vec<NodeIndex> = self
            .graph
            .edge_references()
            .filter(|e| e.source() == e.target())
            .map(|e| e.source())
            .collect();
        self_loops.sort();
        self_loops.dedup();
        for n in self_loops {
            cycles.push(vec![self.graph[n]]);
        }

        // Find back edges, then enumerate the simple paths that close them.
        let mut back_edges: Vec<(NodeIndex, NodeIndex)> = Vec::new();
        depth_first_search(&self.graph, self.graph.node_indices(), |event| {
            if let DfsEvent::BackEdge(u, v) = event {
                if u != v && !back_edges.contains(&(u, v)) {
                    back_edges.push((u, v));
                }
            }
            Control::<()>::Continue
        });

        // Distinct paths starting at different nodes can denote the same
        // cycle; deduplicate by edge set, closing edge included.
        let mut edge_sets: Vec<FxHashSet<(NodeIndex, NodeIndex)>> = Vec::new();
        for (src, target) in back_edges {
            let paths =
                algo::all_simple_paths::<Vec<_>, _>(&self.graph, target, src, 0, None)
                    .collect::<Vec<_>>();
            for path in paths {
                let set: FxHashSet<(NodeIndex, NodeIndex)> = path
                    .iter()
                    .zip(path.iter().skip(1).chain(path.first()))
                    .map(|(a, b)| (*a, *b))
                    .collect();
                if !edge_sets.contains(&set) {
                    edge_sets.push(set);
                    cycles.push(path.into_iter().map(|n| self.graph[n]).collect());
                }
            }
        }
        cycles
    }

    /// Render the lock-order graph in dot format with class labels.
    pub fn dot(&self, space: &StringSpace) -> String {
        let named = self
            .graph
            .map(|_, class| space.label(*class).to_owned(), |_, _| "");
        format!("{:?}", Dot::with_config(&named, &[Config::GraphContentOnly]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Program;

    fn setup() -> (StringSpace, StackInterner) {
        (StringSpace::new(), StackInterner::new())
    }

    #[test]
    fn duplicate_witnesses_dedup_by_trimmed_stacks() {
        let (mut space, mut stacks) = setup();
        let mut program = Program::new();
        let c1 = program.const_int(1);
        let c2 = program.const_int(2);
        let a = space.intern("A");
        let b = space.intern("B");
        let mut order = LockOrder::new();

        // The same acquisition pair reached through different outer calls
        // trims to the same witness.
        let outer1 = stacks.extend(None, c1);
        let outer2 = stacks.extend(None, c2);
        let s1 = stacks.extend(outer1, c2);
        let s2 = stacks.extend(outer2, c2);
        order.add(a, b, outer1, s1, &mut stacks);
        order.add(a, b, outer2, s2, &mut stacks);
        assert_eq!(order.witnesses(a, b).len(), 1);
    }

    #[test]
    fn two_cycle_detected_once() {
        let (mut space, mut stacks) = setup();
        let a = space.intern("A");
        let b = space.intern("B");
        let mut order = LockOrder::new();
        order.add(a, b, None, None, &mut stacks);
        order.add(b, a, None, None, &mut stacks);
        let cycles = order.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 2);
        assert!(cycles[0].contains(&a) && cycles[0].contains(&b));
    }

    #[test]
    fn self_loop_is_a_cycle_of_length_one() {
        let (mut space, mut stacks) = setup();
        let l = space.intern("L");
        let mut order = LockOrder::new();
        order.add(l, l, None, None, &mut stacks);
        let cycles = order.find_cycles();
        assert_eq!(cycles, vec![vec![l]]);
    }

    #[test]
    fn straight_order_has_no_cycles() {
        let (mut space, mut stacks) = setup();
        let a = space.intern("A");
        let b = space.intern("B");
        let c = space.intern("C");
        let mut order = LockOrder::new();
        order.add(a, b, None, None, &mut stacks);
        order.add(b, c, None, None, &mut stacks);
        order.add(a, c, None, None, &mut stacks);
        assert!(order.find_cycles().is_empty());
    }

    #[test]
    fn three_cycle_found() {
        let (mut space, mut stacks) = setup();
        let a = space.intern("A");
        let b = space.intern("B");
        let c = space.intern("C");
        let mut order = LockOrder::new();
        order.add(a, b, None, None, &mut stacks);
        order.add(b, c, None, None, &mut stacks);
        order.add(c, a, None, None, &mut stacks);
        let cycles = order.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 3);
    }
}
