//! The deadlock detector: an inter-procedural, path-sensitive, partially
//! value-sensitive lockset analysis (after Engler and Ashcroft, SOSP 2003).
//! The walker explores every path through each root, threading a path state
//! (lockset, value state, call stack) across blocks, calls and joins, and
//! feeds each acquisition into the lock-order graph. Cycles in that graph
//! are the findings: code paths which, executed concurrently, can deadlock.

pub mod handlers;
pub mod lockorder;
pub mod pathstate;
pub mod report;

use std::io;
use std::sync::Arc;

use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::analysis::callgraph::CallGraph;
use crate::analysis::liveness::liveness_for;
use crate::analysis::pointsto::PointsTo;
use crate::ir::{
    BlockRef, Builtin, Callee, ConstValue, FuncId, InstKind, Pos, Program, RuntimeFns, ValueId,
    ValueKind,
};
use crate::lockset::stack::{CallStack, StackInterner};
use crate::lockset::{LockClassId, LockSet, LockSetSet, StringSpace};
use crate::vstate::{DynValue, Heap, HeapId, ValState};

use handlers::{CallHandler, Handlers};
use lockorder::LockOrder;
use pathstate::{Mask, PathState, PathStateMap, PathStateSet};
use report::{
    AnalysisReport, CycleDiagnosis, EdgeDiagnosis, Report, ReportContent, Warning, WitnessStacks,
};

/// Default cap on states sharing one hash key per block. A knob, not a
/// correctness requirement: exceeding it prunes the path with a warning,
/// bounding value-state splitting without affecting other paths.
pub const DEFAULT_MAX_SIMILAR_STATES: usize = 10;

/// Analysis state for a single function.
struct FuncInfo {
    /// Memoization cache for `walk_function` results.
    exit_lock_sets: PathStateMap,
    /// Per-block control-flow dependencies: the values live at entry to each
    /// block that may affect future branch decisions.
    if_deps: Vec<Mask>,
}

/// Heap cells for the fixed logical locations the handlers model.
pub(crate) struct HeapSeeds {
    pub cur_g: HeapId,
    pub user_g: HeapId,
    pub user_g_m: HeapId,
    pub g0: HeapId,
    pub g0_m: HeapId,
    pub cur_m: HeapId,
    pub cur_m_curg: HeapId,
    pub cur_m_g0: HeapId,
}

pub struct Analyzer<'p> {
    pub(crate) program: &'p Program,
    callgraph: CallGraph,
    pub(crate) pta: PointsTo,
    rt: RuntimeFns,
    pub(crate) space: StringSpace,
    pub(crate) stacks: StackInterner,
    pub(crate) heap: Heap,
    pub(crate) seeds: HeapSeeds,
    handlers: Handlers,
    release_on_return: FxHashMap<String, String>,
    pub(crate) lock_order: LockOrder,
    fns: FxHashMap<FuncId, FuncInfo>,
    /// The call chain of the walk in progress; recorded into locksets.
    pub(crate) stack: CallStack,
    roots: Vec<FuncId>,
    root_set: FxHashSet<FuncId>,
    warnings: Vec<Warning>,
    /// Explosion guard; see `DEFAULT_MAX_SIMILAR_STATES`.
    pub max_similar_states: usize,
}

impl<'p> Analyzer<'p> {
    pub fn new(program: &'p Program, callgraph: CallGraph, pta: PointsTo, rt: RuntimeFns) -> Self {
        let mut heap = Heap::new();
        let seeds = HeapSeeds {
            cur_g: heap.new_object("curG"),
            user_g: heap.new_object("userG"),
            user_g_m: heap.new_object("userG.m"),
            g0: heap.new_object("g0"),
            g0_m: heap.new_object("g0.m"),
            cur_m: heap.new_object("curM"),
            cur_m_curg: heap.new_object("curM.curg"),
            cur_m_g0: heap.new_object("curM.g0"),
        };

        let mut handlers = Handlers::new();
        handlers.register(program.func_name(rt.lock), handlers::handle_lock);
        handlers.register(program.func_name(rt.unlock), handlers::handle_unlock);
        handlers.register(
            program.func_name(rt.presystemstack),
            handlers::handle_presystemstack,
        );
        handlers.register(
            program.func_name(rt.postsystemstack),
            handlers::handle_postsystemstack,
        );
        handlers.register(program.func_name(rt.gopanic), handlers::handle_gopanic);
        handlers.register(program.func_name(rt.morestack), handlers::handle_morestack);
        if let Some(getg) = rt.getg {
            handlers.register(program.func_name(getg), handlers::handle_getg);
        }

        // Inter-procedurally correlated control flow the walker cannot
        // match: returning from traceReleaseBuffer releases the trace
        // buffer lock.
        let mut release_on_return = FxHashMap::default();
        release_on_return.insert(
            "runtime.traceReleaseBuffer".to_owned(),
            "runtime.trace.bufLock".to_owned(),
        );

        Self {
            program,
            callgraph,
            pta,
            rt,
            space: StringSpace::new(),
            stacks: StackInterner::new(),
            heap,
            seeds,
            handlers,
            release_on_return,
            lock_order: LockOrder::new(),
            fns: FxHashMap::default(),
            stack: None,
            roots: Vec::new(),
            root_set: FxHashSet::default(),
            warnings: Vec::new(),
            max_similar_states: DEFAULT_MAX_SIMILAR_STATES,
        }
    }

    /// Register an additional call handler by fully-qualified name.
    pub fn register_handler(&mut self, name: &str, handler: CallHandler) {
        self.handlers.register(name, handler);
    }

    /// Register a lock label released when returning from `func`.
    pub fn register_release_on_return(&mut self, func: &str, label: &str) {
        self.release_on_return
            .insert(func.to_owned(), label.to_owned());
    }

    /// Add `f` as a root to visit. `Go` launches enqueue their callees here.
    pub fn add_root(&mut self, f: FuncId) {
        if self.root_set.insert(f) {
            self.roots.push(f);
        }
    }

    pub fn roots(&self) -> &[FuncId] {
        &self.roots
    }

    /// Walk every root to completion. Roots added while walking (by `go`
    /// launches) are picked up in the same run.
    pub fn analyze(&mut self, roots: &[FuncId]) {
        for &root in roots {
            self.add_root(root);
        }
        let mut i = 0;
        while i < self.roots.len() {
            let root = self.roots[i];
            i += 1;

            // Fresh heap state for entering from user space.
            let entry = PathState {
                block: self.program.entry(root),
                lock_set: LockSet::new(),
                vs: self.initial_valstate(),
                mask: Mask::default(),
            };
            let exit_lock_sets = self.walk_function(root, entry);

            // Warn if any locks are held at return.
            for ls in exit_lock_sets.iter() {
                if ls.is_empty() {
                    continue;
                }
                let pos = self.program.func(root).pos;
                let message = format!(
                    "locks at return from root {}: {}",
                    self.program.func_name(root),
                    ls.render(&self.space)
                );
                self.warn(pos, message);
                self.warn(
                    pos,
                    "\t(likely analysis failed to match control flow for unlock)".to_owned(),
                );
            }
        }
    }

    /// Heap bindings for the fixed logical locations: the current goroutine,
    /// g0, the current M, and their cross-links. Initially on the user stack.
    fn initial_valstate(&self) -> ValState {
        let s = &self.seeds;
        ValState::new()
            .extend_heap(s.cur_g, DynValue::HeapPtr(s.user_g))
            .extend_heap(s.user_g, DynValue::struct_of(&[("m", s.user_g_m)]))
            .extend_heap(s.user_g_m, DynValue::HeapPtr(s.cur_m))
            .extend_heap(s.g0, DynValue::struct_of(&[("m", s.g0_m)]))
            .extend_heap(s.g0_m, DynValue::HeapPtr(s.cur_m))
            .extend_heap(
                s.cur_m,
                DynValue::struct_of(&[("curg", s.cur_m_curg), ("g0", s.cur_m_g0)]),
            )
            .extend_heap(s.cur_m_curg, DynValue::HeapPtr(s.user_g))
            .extend_heap(s.cur_m_g0, DynValue::HeapPtr(s.g0))
    }

    /// Explore `f` from `ps` and return the locksets possible at exit.
    /// `ps.vs` should be restricted to heap values; results are memoized by
    /// the incoming path state.
    fn walk_function(&mut self, f: FuncId, ps: PathState) -> LockSetSet {
        if !self.fns.contains_key(&f) {
            // First visit: compute control-flow dependencies.
            let func = self.program.func(f);
            let mut sinks = Vec::new();
            for block in &func.blocks {
                if let Some(&last) = block.insts.last() {
                    if matches!(
                        self.program.value(last).kind,
                        ValueKind::Inst(InstKind::If { .. })
                    ) {
                        sinks.push(last);
                    }
                }
            }
            let if_deps = liveness_for(self.program, f, &sinks)
                .into_iter()
                .map(Arc::new)
                .collect();
            self.fns.insert(
                f,
                FuncInfo {
                    exit_lock_sets: PathStateMap::new(),
                    if_deps,
                },
            );
            if func.is_external() {
                self.warn(func.pos, format!("external function {}", func.name));
            }
        }

        if self.program.func(f).is_external() {
            // Assume an external function does not affect locks.
            let mut out = LockSetSet::new();
            out.add(ps.lock_set.clone());
            return out;
        }

        if let Some(memo) = self.fns[&f].exit_lock_sets.get(&ps) {
            return memo.clone();
        }

        // Resolve call cycles by memoizing an empty set before walking: a
        // recursive entry returns no exit states, terminating that path
        // without blocking other callers.
        self.fns
            .get_mut(&f)
            .unwrap()
            .exit_lock_sets
            .set(ps.clone(), LockSetSet::new());

        let mut block_cache = PathStateSet::new();
        let enter = PathState {
            block: self.program.entry(f),
            lock_set: ps.lock_set.clone(),
            vs: ps.vs.clone(),
            mask: Mask::default(),
        };
        let mut exit_lock_sets = LockSetSet::new();
        self.walk_block(&mut block_cache, enter, &mut exit_lock_sets);

        self.fns
            .get_mut(&f)
            .unwrap()
            .exit_lock_sets
            .set(ps, exit_lock_sets.clone());
        exit_lock_sets
    }

    /// Visit a block and everything reachable from it, committing locksets
    /// at `Return` into `exit_lock_sets`. `block_cache` holds the path
    /// states already visited within this function walk.
    fn walk_block(
        &mut self,
        block_cache: &mut PathStateSet,
        mut enter: PathState,
        exit_lock_sets: &mut LockSetSet,
    ) {
        let program = self.program;
        let bref = enter.block;
        let f = bref.func;

        // The values live at this block; distinctions outside the mask
        // cannot affect control flow and are discarded by state equality.
        enter.mask = self.fns[&f].if_deps[bref.index as usize].clone();

        let (cached, similar) = block_cache.contains(&enter);
        if cached {
            // Some other path already visited with this lockset and value
            // state.
            return;
        }
        if similar > self.max_similar_states {
            let message = format!("too many states, trimming path (block {})", bref.index);
            self.warn(program.block_pos(bref), message);
            return;
        }
        block_cache.add(enter.clone());

        let mut states = PathStateSet::new();
        states.add(enter);

        // Compute the effect of each instruction on all path states.
        let mut if_cond: Option<ValueId> = None;
        for &inst in &program.block(bref).insts {
            states.map_in_place(|ps| {
                let vs = ps.vs.eval(program, inst);
                PathState { vs, ..ps }
            });

            let kind = match &program.value(inst).kind {
                ValueKind::Inst(kind) => kind,
                _ => continue,
            };
            match kind {
                InstKind::If { cond } => {
                    // Bound to true or false when visiting successors.
                    if_cond = Some(*cond);
                }
                InstKind::Call { .. } => {
                    let callees = self.callees(f, inst);
                    if !callees.is_empty() {
                        states = self.do_call(states, inst, &callees);
                    }
                }
                // Implicit runtime calls.
                InstKind::MapLookup { comma_ok, .. } => {
                    let target = if *comma_ok {
                        self.rt.mapaccess2
                    } else {
                        self.rt.mapaccess1
                    };
                    states = self.do_call(states, inst, &[target]);
                }
                InstKind::MapUpdate { .. } => {
                    states = self.do_call(states, inst, &[self.rt.mapassign1]);
                }
                InstKind::MakeMap => {
                    states = self.do_call(states, inst, &[self.rt.makemap]);
                }
                InstKind::MakeChan => {
                    states = self.do_call(states, inst, &[self.rt.makechan]);
                }
                InstKind::MakeSlice => {
                    states = self.do_call(states, inst, &[self.rt.newarray]);
                }
                InstKind::Send { .. } => {
                    states = self.do_call(states, inst, &[self.rt.chansend1]);
                }
                InstKind::Panic { .. } => {
                    states = self.do_call(states, inst, &[self.rt.gopanic]);
                }
                InstKind::Go { .. } => {
                    // Launched code runs under any interleaving; walk it as
                    // its own root instead of on this path.
                    for callee in self.callees(f, inst) {
                        self.add_root(callee);
                    }
                }
                InstKind::Return { .. } => {
                    if let Some(label) = self.release_on_return.get(program.func_name(f)).cloned() {
                        let id = self.space.intern(&label);
                        states.map_in_place(|mut ps| {
                            ps.lock_set = ps.lock_set.minus(&[id]);
                            ps
                        });
                    }
                    states.for_each(|ps| {
                        exit_lock_sets.add(ps.lock_set.clone());
                    });
                }
                _ => {}
            }
        }

        // Process successor blocks.
        let succs = &program.block(bref).succs;
        for ps in states.into_states() {
            // If a branch condition is known, prune to the taken edge.
            let mut known: Option<bool> = None;
            if let Some(cond) = if_cond {
                if let Some(DynValue::Const(ConstValue::Bool(b))) = ps.vs.resolve(program, cond) {
                    known = Some(b);
                }
            }
            for (i, &succ) in succs.iter().enumerate() {
                match known {
                    Some(true) if i != 0 => continue,
                    Some(false) if i != 1 => continue,
                    _ => {}
                }
                let mut ps2 = ps.clone();
                ps2.block = BlockRef {
                    func: f,
                    index: succ,
                };
                if let Some(cond) = if_cond {
                    // Refine: on this edge the condition is known.
                    ps2.vs = ps2
                        .vs
                        .extend(cond, DynValue::Const(ConstValue::Bool(i == 0)));
                }

                // Propagate values over phis at the start of the successor.
                let succ_block = program.block(ps2.block);
                for &phi in &succ_block.insts {
                    let edges = match &program.value(phi).kind {
                        ValueKind::Inst(InstKind::Phi { edges }) => edges,
                        _ => break,
                    };
                    for (j, &pred) in succ_block.preds.iter().enumerate() {
                        if pred != bref.index {
                            continue;
                        }
                        if let Some(&inval) = edges.get(j) {
                            if let Some(x) = ps2.vs.resolve(program, inval) {
                                ps2.vs = ps2.vs.extend(phi, x);
                            }
                        }
                    }
                }

                self.walk_block(block_cache, ps2, exit_lock_sets);
            }
        }
    }

    /// Expand a call site over its callees: handlers transform the state
    /// directly; other callees are walked with a heap-restricted value state
    /// and contribute one successor per exit lockset. The walk stack is
    /// extended around the call so recorded acquisition stacks include the
    /// current call chain.
    fn do_call(
        &mut self,
        states: PathStateSet,
        call: ValueId,
        callees: &[FuncId],
    ) -> PathStateSet {
        let program = self.program;
        self.stack = self.stacks.extend(self.stack, call);
        let out = states.flat_map(|ps, new_states| {
            let entry_vs = ps.vs.limit_to_heap();
            for &callee in callees {
                let handler = self.handlers.lookup(program.func_name(callee));
                if let Some(handler) = handler {
                    handler(self, ps, call, new_states);
                } else {
                    let entry = PathState {
                        block: program.entry(callee),
                        lock_set: ps.lock_set.clone(),
                        vs: entry_vs.clone(),
                        mask: Mask::default(),
                    };
                    for ls in self.walk_function(callee, entry).iter() {
                        let mut nps = ps.clone();
                        nps.lock_set = ls.clone();
                        new_states.push(nps);
                    }
                }
            }
        });
        self.stack = self.stacks.parent(self.stack);
        out
    }

    /// The functions a call site may invoke: builtins map to their runtime
    /// equivalents, static callees resolve directly, and indirect calls go
    /// through the callgraph filtered to this site.
    fn callees(&mut self, caller: FuncId, call: ValueId) -> SmallVec<[FuncId; 2]> {
        let program = self.program;
        let callee = match &program.value(call).kind {
            ValueKind::Inst(InstKind::Call { callee, .. } | InstKind::Go { callee, .. }) => callee,
            _ => return SmallVec::new(),
        };
        let mut out = SmallVec::new();
        match callee {
            Callee::Builtin(builtin) => match builtin {
                Builtin::Append => out.push(self.rt.growslice),
                Builtin::Close => out.push(self.rt.closechan),
                Builtin::Copy => out.push(self.rt.slicecopy),
                Builtin::CopyString => out.push(self.rt.slicestringcopy),
                Builtin::Delete => out.push(self.rt.mapdelete),
                // len, cap and print cannot affect locks.
                Builtin::Len | Builtin::Cap | Builtin::Print => {}
            },
            Callee::Static(f) => out.push(*f),
            Callee::Value(_) => match self.callgraph.callees_at(caller, call) {
                Some(callees) => return callees,
                None => {
                    let pos = program.value(call).pos;
                    let message =
                        format!("no call graph for call in {}", program.func_name(caller));
                    self.warn(pos, message);
                }
            },
        }
        out
    }

    /// Intern the canonical lock classes of the points-to set of `v`.
    pub(crate) fn lock_classes(&mut self, v: ValueId) -> SmallVec<[LockClassId; 2]> {
        let Analyzer { pta, space, .. } = self;
        pta.points_to(v).iter().map(|label| space.intern(label)).collect()
    }

    fn warn(&mut self, pos: Pos, message: String) {
        let pos_str = self.program.pos_str(pos).unwrap_or("").to_owned();
        if pos_str.is_empty() {
            warn!("{}", message);
        } else {
            warn!("{}: {}", pos_str, message);
        }
        self.warnings.push(Warning {
            pos: pos_str,
            message,
        });
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn lock_order(&self) -> &LockOrder {
        &self.lock_order
    }

    /// Whether the lock-order graph has an edge between the named classes.
    pub fn has_lock_edge(&self, from: &str, to: &str) -> bool {
        match (self.space.lookup(from), self.space.lookup(to)) {
            (Some(from), Some(to)) => self.lock_order.has_edge(from, to),
            _ => false,
        }
    }

    /// The discovered cycles, rendered as class labels.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        self.lock_order
            .find_cycles()
            .into_iter()
            .map(|cycle| {
                cycle
                    .into_iter()
                    .map(|class| self.space.label(class).to_owned())
                    .collect()
            })
            .collect()
    }

    pub fn lock_graph_dot(&self) -> String {
        self.lock_order.dot(&self.space)
    }

    pub fn callgraph_dot(&self) -> String {
        self.callgraph.dot(self.program)
    }

    fn render_stack(&self, stack: CallStack) -> Vec<String> {
        let mut buf: SmallVec<[ValueId; 16]> = SmallVec::new();
        self.stacks.flatten(stack, &mut buf);
        buf.iter()
            .map(|&call| {
                let data = self.program.value(call);
                let func = data
                    .func
                    .map(|f| self.program.func_name(f))
                    .unwrap_or("?");
                match self.program.pos_str(data.pos) {
                    Some(pos) => format!("{} ({})", func, pos),
                    None => func.to_owned(),
                }
            })
            .collect()
    }

    /// The complete analysis output: roots, warnings, and one report per
    /// lock cycle with witness stacks per edge.
    pub fn report(&self) -> AnalysisReport {
        let roots = self
            .roots
            .iter()
            .map(|&f| self.program.func_name(f).to_owned())
            .collect();
        let warnings = self
            .warnings
            .iter()
            .map(|w| Warning {
                pos: w.pos.clone(),
                message: w.message.clone(),
            })
            .collect();
        let cycles = self
            .lock_order
            .find_cycles()
            .into_iter()
            .map(|cycle| {
                let classes: Vec<String> = cycle
                    .iter()
                    .map(|&class| self.space.label(class).to_owned())
                    .collect();
                let mut edges = Vec::new();
                for (i, &from) in cycle.iter().enumerate() {
                    let to = cycle[(i + 1) % cycle.len()];
                    let witnesses = self
                        .lock_order
                        .witnesses(from, to)
                        .iter()
                        .map(|&(first, second)| WitnessStacks {
                            first_stack: self.render_stack(first),
                            second_stack: self.render_stack(second),
                        })
                        .collect();
                    edges.push(EdgeDiagnosis {
                        first_lock: self.space.label(from).to_owned(),
                        second_lock: self.space.label(to).to_owned(),
                        witnesses,
                    });
                }
                Report::LockCycle(ReportContent::new(
                    "LockCycle".to_owned(),
                    "Possibly".to_owned(),
                    CycleDiagnosis { classes, edges },
                    "Locks mutually wait for each other to form a cycle".to_owned(),
                ))
            })
            .collect();
        AnalysisReport {
            roots,
            warnings,
            cycles,
        }
    }

    /// Print the textual cycle report.
    pub fn check(&self, w: impl io::Write) -> io::Result<()> {
        self.report().write_text(w)
    }
}
