//! Lock classes and locksets.
//! A lock class is an interned points-to label; a `LockSet` is the set of
//! classes held on a path, each tagged with the call stack at which it was
//! acquired. All lockset operations are pure: the receiver is shared when
//! nothing changes, cloned otherwise.

pub mod stack;

use std::sync::Arc;

use fixedbitset::FixedBitSet;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use stack::CallStack;

/// Identity of a lock class produced by `StringSpace`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockClassId(pub u32);

/// Interns lock-class labels into small integers.
/// `intern(x) == intern(y)` iff `x == y`; classes are never destroyed.
#[derive(Default)]
pub struct StringSpace {
    m: FxHashMap<String, LockClassId>,
    s: Vec<String>,
}

impl StringSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, label: &str) -> LockClassId {
        if let Some(id) = self.m.get(label) {
            return *id;
        }
        let id = LockClassId(self.s.len() as u32);
        self.s.push(label.to_owned());
        self.m.insert(label.to_owned(), id);
        id
    }

    pub fn label(&self, id: LockClassId) -> &str {
        &self.s[id.0 as usize]
    }

    /// The id of an already interned label.
    pub fn lookup(&self, label: &str) -> Option<LockClassId> {
        self.m.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.s.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockSetInner {
    bits: FixedBitSet,
    stacks: FxHashMap<u32, CallStack>,
}

/// A set of held lock classes with per-class acquisition stacks.
/// Invariant: a class id is in `bits` iff it has an entry in `stacks`.
#[derive(Clone, Debug, Default)]
pub struct LockSet {
    inner: Arc<LockSetInner>,
}

/// Hash key capturing the bitset alone; `a.equal(b)` implies equal keys.
pub type LockSetHashKey = SmallVec<[u32; 8]>;

/// Key capturing bits and per-class stack identity: equal keys iff the same
/// classes were acquired at the same stacks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockSetKey(SmallVec<[(u32, CallStack); 4]>);

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.stacks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.stacks.len()
    }

    pub fn contains(&self, id: LockClassId) -> bool {
        self.inner.bits.contains(id.0 as usize)
    }

    /// The acquisition stack recorded for `id`, if held.
    pub fn stack(&self, id: LockClassId) -> Option<CallStack> {
        self.inner.stacks.get(&id.0).copied()
    }

    /// Held classes with their acquisition stacks, in class-id order.
    pub fn iter(&self) -> impl Iterator<Item = (LockClassId, CallStack)> + '_ {
        self.inner
            .bits
            .ones()
            .map(move |i| (LockClassId(i as u32), self.inner.stacks[&(i as u32)]))
    }

    fn clone_inner(&self) -> LockSetInner {
        LockSetInner {
            bits: self.inner.bits.clone(),
            stacks: self.inner.stacks.clone(),
        }
    }

    /// Extend with every class in `ids`, acquired at `stack`. Classes already
    /// held keep their original stack. Returns the receiver when all classes
    /// were already present.
    pub fn plus(&self, ids: &[LockClassId], stack: CallStack) -> LockSet {
        let mut out: Option<LockSetInner> = None;
        for id in ids {
            if self.contains(*id) || out.as_ref().map_or(false, |o| o.stacks.contains_key(&id.0)) {
                continue;
            }
            let inner = out.get_or_insert_with(|| self.clone_inner());
            inner.bits.grow(id.0 as usize + 1);
            inner.bits.insert(id.0 as usize);
            inner.stacks.insert(id.0, stack);
        }
        match out {
            Some(inner) => LockSet {
                inner: Arc::new(inner),
            },
            None => self.clone(),
        }
    }

    /// Single-class variant of `plus`, used by call handlers that acquire a
    /// named runtime lock.
    pub fn plus_label(&self, space: &mut StringSpace, label: &str, stack: CallStack) -> LockSet {
        let id = space.intern(label);
        self.plus(&[id], stack)
    }

    /// Remove every class in `ids`, clearing both the bit and the stack.
    pub fn minus(&self, ids: &[LockClassId]) -> LockSet {
        let mut out: Option<LockSetInner> = None;
        for id in ids {
            if !self.contains(*id) {
                continue;
            }
            let inner = out.get_or_insert_with(|| self.clone_inner());
            inner.bits.set(id.0 as usize, false);
            inner.stacks.remove(&id.0);
        }
        match out {
            Some(inner) => LockSet {
                inner: Arc::new(inner),
            },
            None => self.clone(),
        }
    }

    pub fn minus_label(&self, space: &mut StringSpace, label: &str) -> LockSet {
        let id = space.intern(label);
        self.minus(&[id])
    }

    /// Union; where both hold a class, the receiver's stack wins.
    pub fn union(&self, other: &LockSet) -> LockSet {
        let mut out: Option<LockSetInner> = None;
        for (id, stack) in other.iter() {
            if self.contains(id) {
                continue;
            }
            let inner = out.get_or_insert_with(|| self.clone_inner());
            inner.bits.grow(id.0 as usize + 1);
            inner.bits.insert(id.0 as usize);
            inner.stacks.insert(id.0, stack);
        }
        match out {
            Some(inner) => LockSet {
                inner: Arc::new(inner),
            },
            None => self.clone(),
        }
    }

    /// Same classes acquired at the same stacks.
    pub fn equal(&self, other: &LockSet) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        if self.inner.stacks.len() != other.inner.stacks.len() {
            return false;
        }
        self.inner
            .stacks
            .iter()
            .all(|(id, stack)| other.inner.stacks.get(id) == Some(stack))
    }

    pub fn hash_key(&self) -> LockSetHashKey {
        self.inner.bits.ones().map(|i| i as u32).collect()
    }

    pub fn key(&self) -> LockSetKey {
        LockSetKey(self.iter().map(|(id, stack)| (id.0, stack)).collect())
    }

    pub fn render(&self, space: &StringSpace) -> String {
        let mut out = String::from("{");
        for (i, (id, _)) in self.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(space.label(id));
        }
        out.push('}');
        out
    }
}

/// A set of locksets, keyed by the stack-aware `LockSet::key`.
#[derive(Clone, Debug, Default)]
pub struct LockSetSet {
    m: FxHashMap<LockSetKey, LockSet>,
}

impl LockSetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ls: LockSet) {
        self.m.insert(ls.key(), ls);
    }

    pub fn union(&mut self, other: &LockSetSet) {
        for (k, ls) in &other.m {
            self.m.insert(k.clone(), ls.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockSet> {
        self.m.values()
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::stack::StackInterner;
    use super::*;
    use crate::ir::Program;

    fn ids(space: &mut StringSpace, labels: &[&str]) -> Vec<LockClassId> {
        labels.iter().map(|l| space.intern(l)).collect()
    }

    #[test]
    fn intern_is_a_bijection() {
        let mut space = StringSpace::new();
        let a = space.intern("runtime.sched");
        let b = space.intern("runtime.trace.bufLock");
        assert_ne!(a, b);
        assert_eq!(space.intern("runtime.sched"), a);
        assert_eq!(space.label(a), "runtime.sched");
        assert_eq!(space.label(b), "runtime.trace.bufLock");
    }

    #[test]
    fn plus_then_minus_restores_when_disjoint() {
        let mut space = StringSpace::new();
        let cls = ids(&mut space, &["A", "B"]);
        let empty = LockSet::new();
        let held = empty.plus(&cls, None);
        assert_eq!(held.len(), 2);
        let back = held.minus(&cls);
        assert!(back.equal(&empty));
        assert!(back.is_empty());
    }

    #[test]
    fn plus_keeps_original_stack_and_shares_when_unchanged() {
        let mut program = Program::new();
        let call = program.const_int(0);
        let mut space = StringSpace::new();
        let mut stacks = StackInterner::new();
        let s1 = stacks.extend(None, call);
        let a = ids(&mut space, &["A"]);
        let held = LockSet::new().plus(&a, s1);
        // Re-adding an already held class is a no-op and keeps its stack.
        let again = held.plus(&a, None);
        assert!(again.equal(&held));
        assert_eq!(again.stack(a[0]), Some(s1));
    }

    #[test]
    fn union_is_idempotent_and_prefers_receiver_stacks() {
        let mut program = Program::new();
        let c1 = program.const_int(1);
        let c2 = program.const_int(2);
        let mut space = StringSpace::new();
        let mut stacks = StackInterner::new();
        let a = ids(&mut space, &["A"]);
        let s1 = stacks.extend(None, c1);
        let s2 = stacks.extend(None, c2);
        let x = LockSet::new().plus(&a, s1);
        let y = LockSet::new().plus(&a, s2);
        assert!(x.union(&x).equal(&x));
        let u = x.union(&y);
        assert_eq!(u.stack(a[0]), Some(s1));
    }

    #[test]
    fn hash_key_coarser_than_key() {
        let mut program = Program::new();
        let c1 = program.const_int(1);
        let c2 = program.const_int(2);
        let mut space = StringSpace::new();
        let mut stacks = StackInterner::new();
        let a = ids(&mut space, &["A"]);
        let x = LockSet::new().plus(&a, stacks.extend(None, c1));
        let y = LockSet::new().plus(&a, stacks.extend(None, c2));
        // Same classes: hash keys agree, stack-aware keys and equality differ.
        assert_eq!(x.hash_key(), y.hash_key());
        assert_ne!(x.key(), y.key());
        assert!(!x.equal(&y));
    }

    #[test]
    fn lockset_set_distinguishes_provenance() {
        let mut program = Program::new();
        let c1 = program.const_int(1);
        let c2 = program.const_int(2);
        let mut space = StringSpace::new();
        let mut stacks = StackInterner::new();
        let a = ids(&mut space, &["A"]);
        let mut set = LockSetSet::new();
        set.add(LockSet::new().plus(&a, stacks.extend(None, c1)));
        set.add(LockSet::new().plus(&a, stacks.extend(None, c2)));
        set.add(LockSet::new().plus(&a, stacks.extend(None, c1)));
        assert_eq!(set.len(), 2);
    }
}
