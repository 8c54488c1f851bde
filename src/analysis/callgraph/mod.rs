//! Callgraph over program functions.
//! Nodes are functions; a directed edge carries the callsite instructions at
//! which the caller may invoke the callee. The detector resolves indirect
//! calls by filtering a caller's out-edges to the current callsite, so edges
//! produced by a points-to-based callgraph builder can be fed in directly.

use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::{Directed, Direction, Graph};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ir::{Callee, FuncId, InstKind, Program, ValueId, ValueKind};

/// The NodeIndex of a function in the CallGraph.
pub type CallGraphNodeId = NodeIndex;

pub struct CallGraph {
    pub graph: Graph<FuncId, Vec<ValueId>, Directed>,
    node_ids: FxHashMap<FuncId, CallGraphNodeId>,
}

impl Default for CallGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CallGraph {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            node_ids: FxHashMap::default(),
        }
    }

    pub fn add_node(&mut self, f: FuncId) -> CallGraphNodeId {
        if let Some(id) = self.node_ids.get(&f) {
            return *id;
        }
        let id = self.graph.add_node(f);
        self.node_ids.insert(f, id);
        id
    }

    pub fn node(&self, f: FuncId) -> Option<CallGraphNodeId> {
        self.node_ids.get(&f).copied()
    }

    /// Record that `caller` may invoke `callee` at `callsite`. Repeated
    /// callsites merge into the existing edge weight.
    pub fn add_edge(&mut self, caller: FuncId, callee: FuncId, callsite: ValueId) {
        let caller_idx = self.add_node(caller);
        let callee_idx = self.add_node(callee);
        if let Some(edge) = self.graph.find_edge(caller_idx, callee_idx) {
            let sites = self.graph.edge_weight_mut(edge).unwrap();
            if !sites.contains(&callsite) {
                sites.push(callsite);
            }
        } else {
            self.graph.add_edge(caller_idx, callee_idx, vec![callsite]);
        }
    }

    /// The callees `caller` may invoke at `callsite`, per the edges recorded
    /// for that specific site. Returns `None` when `caller` has no node.
    pub fn callees_at(&self, caller: FuncId, callsite: ValueId) -> Option<SmallVec<[FuncId; 2]>> {
        let caller_idx = self.node(caller)?;
        let mut out = SmallVec::new();
        for edge in self.graph.edges_directed(caller_idx, Direction::Outgoing) {
            if edge.weight().contains(&callsite) {
                out.push(self.graph[edge.target()]);
            }
        }
        Some(out)
    }

    /// Build the static portion of the callgraph: a node per function and an
    /// edge per direct `Call`/`Go` site. Indirect and builtin callsites are
    /// left to the embedder's points-to results.
    pub fn build(program: &Program) -> Self {
        let mut cg = Self::new();
        for f in program.funcs() {
            cg.add_node(f);
            for block in &program.func(f).blocks {
                for &inst in &block.insts {
                    if let ValueKind::Inst(
                        InstKind::Call { callee, .. } | InstKind::Go { callee, .. },
                    ) = &program.value(inst).kind
                    {
                        if let Callee::Static(callee) = callee {
                            cg.add_edge(f, *callee, inst);
                        }
                    }
                }
            }
        }
        cg
    }

    /// Render the callgraph in dot format with function names.
    pub fn dot(&self, program: &Program) -> String {
        let named = self
            .graph
            .map(|_, f| program.func_name(*f), |_, sites| sites.len());
        format!("{:?}", Dot::with_config(&named, &[Config::GraphContentOnly]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;

    #[test]
    fn build_collects_static_callsites() {
        let mut program = Program::new();
        let f = program.declare_func("f");
        let g = program.declare_func("g");
        let mut fb = FunctionBuilder::new(&mut program, f);
        let c1 = fb.call_static(g, vec![]);
        let c2 = fb.call_static(g, vec![]);
        fb.ret(vec![]);

        let cg = CallGraph::build(&program);
        assert_eq!(cg.callees_at(f, c1).unwrap().as_slice(), &[g]);
        assert_eq!(cg.callees_at(f, c2).unwrap().as_slice(), &[g]);
        assert!(cg.callees_at(g, c1).unwrap().is_empty());
    }

    #[test]
    fn callees_filtered_by_site() {
        let mut program = Program::new();
        let f = program.declare_func("f");
        let g = program.declare_func("g");
        let h = program.declare_func("h");
        let fp = program.global("fp");
        let mut fb = FunctionBuilder::new(&mut program, f);
        let c1 = fb.call(Callee::Value(fp), vec![]);
        let c2 = fb.call(Callee::Value(fp), vec![]);
        fb.ret(vec![]);

        let mut cg = CallGraph::new();
        cg.add_edge(f, g, c1);
        cg.add_edge(f, h, c2);
        assert_eq!(cg.callees_at(f, c1).unwrap().as_slice(), &[g]);
        assert_eq!(cg.callees_at(f, c2).unwrap().as_slice(), &[h]);
    }
}
