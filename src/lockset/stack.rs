//! Interned call stacks.
//! A stack is a singly-linked list of call sites from outer call inward,
//! hash-consed in an arena so that two stacks with the same call sequence
//! share one `StackId`. Lockset equality relies on this: comparing stacks
//! is comparing ids.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ir::ValueId;

/// Handle to an interned non-empty stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StackId(u32);

/// A call stack; `None` is the empty stack.
pub type CallStack = Option<StackId>;

struct Frame {
    parent: CallStack,
    call: ValueId,
}

/// Arena of hash-consed stack frames.
#[derive(Default)]
pub struct StackInterner {
    frames: Vec<Frame>,
    dedup: FxHashMap<(CallStack, ValueId), StackId>,
}

impl StackInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `call` onto `stack`. Stacks built through `extend` are canonical:
    /// equal call sequences yield equal ids.
    pub fn extend(&mut self, stack: CallStack, call: ValueId) -> CallStack {
        let id = *self.dedup.entry((stack, call)).or_insert_with(|| {
            let id = StackId(self.frames.len() as u32);
            self.frames.push(Frame {
                parent: stack,
                call,
            });
            id
        });
        Some(id)
    }

    pub fn parent(&self, stack: CallStack) -> CallStack {
        stack.and_then(|id| self.frames[id.0 as usize].parent)
    }

    pub fn call(&self, id: StackId) -> ValueId {
        self.frames[id.0 as usize].call
    }

    /// Write the call sites of `stack` into `into`, outer-most first.
    pub fn flatten(&self, stack: CallStack, into: &mut SmallVec<[ValueId; 16]>) {
        into.clear();
        let mut cur = stack;
        while let Some(id) = cur {
            let frame = &self.frames[id.0 as usize];
            into.push(frame.call);
            cur = frame.parent;
        }
        into.reverse();
    }

    /// Remove the maximal shared outer prefix of `a` and `b` and return the
    /// remaining suffixes, re-interned.
    pub fn trim_common_prefix(&mut self, a: CallStack, b: CallStack) -> (CallStack, CallStack) {
        let mut fa: SmallVec<[ValueId; 16]> = SmallVec::new();
        let mut fb: SmallVec<[ValueId; 16]> = SmallVec::new();
        self.flatten(a, &mut fa);
        self.flatten(b, &mut fb);

        let mut common = 0;
        while common < fa.len() && common < fb.len() && fa[common] == fb[common] {
            common += 1;
        }
        if common == 0 {
            return (a, b);
        }

        let mut na = None;
        for &call in &fa[common..] {
            na = self.extend(na, call);
        }
        let mut nb = None;
        for &call in &fb[common..] {
            nb = self.extend(nb, call);
        }
        (na, nb)
    }
}
