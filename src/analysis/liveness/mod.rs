//! Liveness of control-flow dependencies.
//! For a function and a set of sink instructions (the detector passes every
//! block-terminating `If`), compute per block the set of instructions whose
//! values must be live at entry to that block in order to evaluate any
//! reachable sink. The result masks path-state equality: value distinctions
//! that cannot affect a future branch are discarded.

use log::warn;
use rustc_hash::FxHashSet;

use crate::ir::{FuncId, InstKind, Program, ValueId, ValueKind};
use smallvec::SmallVec;

#[cfg(test)]
mod tests;

/// Per-block liveness, indexed by block number in `f`.
pub fn liveness_for(program: &Program, f: FuncId, sinks: &[ValueId]) -> Vec<FxHashSet<ValueId>> {
    let mut builder = Liveness {
        program,
        f,
        deps: vec![FxHashSet::default(); program.func(f).blocks.len()],
        visited: FxHashSet::default(),
    };
    for &sink in sinks {
        builder.do_val(sink);
    }
    builder.deps
}

struct Liveness<'p> {
    program: &'p Program,
    f: FuncId,
    deps: Vec<FxHashSet<ValueId>>,
    visited: FxHashSet<ValueId>,
}

impl Liveness<'_> {
    /// Is `v` an instruction defined in the analyzed function?
    fn defining_block(&self, v: ValueId) -> Option<u32> {
        let data = self.program.value(v);
        match data.kind {
            ValueKind::Inst(_) if data.func == Some(self.f) => data.block,
            _ => None,
        }
    }

    /// Keep `def` live in every block from its definition to `use_block`.
    fn walk(&mut self, def: ValueId, use_block: u32) {
        if self.deps[use_block as usize].contains(&def) {
            return;
        }
        if self.defining_block(def) == Some(use_block) {
            // Reached the defining block.
            return;
        }
        self.deps[use_block as usize].insert(def);

        let preds: SmallVec<[u32; 4]> = self.program.func(self.f).blocks[use_block as usize]
            .preds
            .iter()
            .copied()
            .collect();
        if preds.is_empty() {
            warn!(
                "liveness: no definition path for a value in {}",
                self.program.func_name(self.f)
            );
            return;
        }
        for pred in preds {
            self.walk(def, pred);
        }
    }

    fn do_val(&mut self, val: ValueId) {
        if !self.visited.insert(val) {
            return;
        }
        let data = self.program.value(val);
        let kind = match &data.kind {
            ValueKind::Inst(kind) => kind,
            _ => return,
        };
        if let InstKind::Phi { edges } = kind {
            // A phi only uses each operand if control arrived from the
            // corresponding predecessor.
            let block = data.block.expect("phi has a block");
            let preds: SmallVec<[u32; 4]> = self.program.func(self.f).blocks[block as usize]
                .preds
                .iter()
                .copied()
                .collect();
            let edges: SmallVec<[ValueId; 4]> = edges.iter().copied().collect();
            for (i, edge) in edges.iter().enumerate() {
                if self.defining_block(*edge).is_none() {
                    continue;
                }
                self.deps[block as usize].insert(*edge);
                if let Some(&pred) = preds.get(i) {
                    self.walk(*edge, pred);
                }
                self.do_val(*edge);
            }
        } else {
            let use_block = data.block.expect("instruction has a block");
            let mut operands = SmallVec::new();
            kind.operands(&mut operands);
            for rand in operands {
                if self.defining_block(rand).is_none() {
                    continue;
                }
                self.walk(rand, use_block);
                self.do_val(rand);
            }
        }
    }
}
