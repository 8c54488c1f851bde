//! Call handlers for specially modeled runtime primitives.
//! A handler transforms a path state into zero or more successor states;
//! it is the extension point for semantics that cannot be captured by
//! walking a function body (lock acquisition, stack switches, panics).
//! The registry is keyed by fully-qualified function name and owned by the
//! analyzer rather than being process-global.

use rustc_hash::FxHashMap;

use crate::ir::{InstKind, Program, ValueId, ValueKind};
use crate::vstate::DynValue;

use super::pathstate::PathState;
use super::Analyzer;

/// Transforms `ps` at callsite `call` into successor states pushed to `out`.
/// Pushing nothing terminates the path.
pub type CallHandler = fn(&mut Analyzer<'_>, &PathState, ValueId, &mut Vec<PathState>);

#[derive(Default)]
pub struct Handlers {
    m: FxHashMap<String, CallHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: CallHandler) {
        self.m.insert(name.to_owned(), handler);
    }

    pub fn lookup(&self, name: &str) -> Option<CallHandler> {
        self.m.get(name).copied()
    }
}

/// The `i`th argument of the call instruction `call`.
fn call_arg(program: &Program, call: ValueId, i: usize) -> Option<ValueId> {
    match &program.value(call).kind {
        ValueKind::Inst(InstKind::Call { args, .. } | InstKind::Go { args, .. }) => {
            args.get(i).copied()
        }
        _ => None,
    }
}

/// `lock(l)`: emit lock-order edges from every held class to every class in
/// the points-to set of `l`, then extend the lockset. This is the only
/// producer of edges in the lock-order graph.
pub(super) fn handle_lock(
    an: &mut Analyzer<'_>,
    ps: &PathState,
    call: ValueId,
    out: &mut Vec<PathState>,
) {
    let classes = match call_arg(an.program, call, 0) {
        Some(arg) => an.lock_classes(arg),
        None => Default::default(),
    };
    let stack = an.stack;
    for &to in &classes {
        an.lock_order.add_class(to);
        for (held, held_stack) in ps.lock_set.iter() {
            an.lock_order.add(held, to, held_stack, stack, &mut an.stacks);
        }
    }
    let mut nps = ps.clone();
    nps.lock_set = ps.lock_set.plus(&classes, stack);
    out.push(nps);
}

/// `unlock(l)`: drop every class in the points-to set of `l`.
pub(super) fn handle_unlock(
    an: &mut Analyzer<'_>,
    ps: &PathState,
    call: ValueId,
    out: &mut Vec<PathState>,
) {
    let classes = match call_arg(an.program, call, 0) {
        Some(arg) => an.lock_classes(arg),
        None => Default::default(),
    };
    let mut nps = ps.clone();
    nps.lock_set = ps.lock_set.minus(&classes);
    out.push(nps);
}

/// Entering the system stack: save the current g in a fresh heap cell, bind
/// it as the call result, and switch `curM.curg` to g0.
pub(super) fn handle_presystemstack(
    an: &mut Analyzer<'_>,
    ps: &PathState,
    call: ValueId,
    out: &mut Vec<PathState>,
) {
    let saved = an.heap.new_object("savedG");
    let mut vs = ps.vs.clone();
    if let Some(cur) = vs.get_heap(an.seeds.cur_m_curg).cloned() {
        vs = vs.extend_heap(saved, cur);
    }
    vs = vs.extend_heap(an.seeds.cur_m_curg, DynValue::HeapPtr(an.seeds.g0));
    vs = vs.extend(call, DynValue::HeapPtr(saved));
    let mut nps = ps.clone();
    nps.vs = vs;
    out.push(nps);
}

/// Leaving the system stack: restore `curM.curg` from the saved g.
pub(super) fn handle_postsystemstack(
    an: &mut Analyzer<'_>,
    ps: &PathState,
    call: ValueId,
    out: &mut Vec<PathState>,
) {
    let mut vs = ps.vs.clone();
    if let Some(arg) = call_arg(an.program, call, 0) {
        if let Some(DynValue::HeapPtr(h)) = vs.resolve(an.program, arg) {
            if let Some(saved) = vs.get_heap(h).cloned() {
                vs = vs.extend_heap(an.seeds.cur_m_curg, saved);
            }
        }
    }
    let mut nps = ps.clone();
    nps.vs = vs;
    out.push(nps);
}

/// `getg()`: the current goroutine pointer is whatever `curM.curg` holds.
pub(super) fn handle_getg(
    an: &mut Analyzer<'_>,
    ps: &PathState,
    call: ValueId,
    out: &mut Vec<PathState>,
) {
    let mut nps = ps.clone();
    if let Some(g) = ps.vs.get_heap(an.seeds.cur_m_curg).cloned() {
        nps.vs = ps.vs.extend(call, g);
    }
    out.push(nps);
}

/// `gopanic` terminates the path: no successor states.
pub(super) fn handle_gopanic(
    _an: &mut Analyzer<'_>,
    _ps: &PathState,
    _call: ValueId,
    _out: &mut Vec<PathState>,
) {
}

/// The `morestack` prologue has no effect on locks or values.
pub(super) fn handle_morestack(
    _an: &mut Analyzer<'_>,
    ps: &PathState,
    _call: ValueId,
    out: &mut Vec<PathState>,
) {
    out.push(ps.clone());
}
