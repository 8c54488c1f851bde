//! Path states and their collections.
//! A `PathState` is one exploration frontier: the current block, the held
//! lockset, the symbolic value state, and the liveness mask installed on
//! block entry. Sets and maps hash by `(block, lockset bits)` only and probe
//! linearly with full (masked) equality; the bucket population doubles as
//! the state-explosion signal.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{BlockRef, ValueId};
use crate::lockset::{LockSet, LockSetHashKey, LockSetSet};
use crate::vstate::ValState;

/// The liveness mask for the current block, shared from the function info.
pub type Mask = Arc<FxHashSet<ValueId>>;

#[derive(Clone, Debug)]
pub struct PathState {
    pub block: BlockRef,
    pub lock_set: LockSet,
    pub vs: ValState,
    pub mask: Mask,
}

impl PathState {
    /// Key such that `a.equal(b)` implies `a.hash_key() == b.hash_key()`.
    /// Deliberately coarse: value state and lock stacks are excluded, which
    /// is what makes the similar-count an explosion signal.
    pub fn hash_key(&self) -> PathStateKey {
        PathStateKey {
            block: self.block,
            bits: self.lock_set.hash_key(),
        }
    }

    pub fn equal(&self, other: &PathState) -> bool {
        // Equal blocks have equal masks, so using self's mask is symmetric.
        self.block == other.block
            && self.lock_set.equal(&other.lock_set)
            && self.vs.equal_at(&other.vs, &self.mask)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathStateKey {
    block: BlockRef,
    bits: LockSetHashKey,
}

/// A mutable set of `PathState`s.
#[derive(Default)]
pub struct PathStateSet {
    m: FxHashMap<PathStateKey, Vec<PathState>>,
}

impl PathStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ps: PathState) {
        let slot = self.m.entry(ps.hash_key()).or_default();
        if slot.iter().any(|have| have.equal(&ps)) {
            return;
        }
        slot.push(ps);
    }

    /// Whether the set contains `ps`, along with the number of states that
    /// share its hash key (differing only in value state or lock stacks).
    pub fn contains(&self, ps: &PathState) -> (bool, usize) {
        match self.m.get(&ps.hash_key()) {
            Some(slot) => (slot.iter().any(|have| have.equal(ps)), slot.len()),
            None => (false, 0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    /// Apply `f` to each state, re-keying the changed ones. Optimized for
    /// `f` returning the state unchanged.
    pub fn map_in_place<F: FnMut(PathState) -> PathState>(&mut self, mut f: F) {
        let mut to_add = Vec::new();
        self.m.retain(|_, slot| {
            let mut i = 0;
            while i < slot.len() {
                let ps2 = f(slot[i].clone());
                if slot[i].equal(&ps2) {
                    i += 1;
                    continue;
                }
                slot.swap_remove(i);
                to_add.push(ps2);
            }
            !slot.is_empty()
        });
        for ps in to_add {
            self.add(ps);
        }
    }

    pub fn for_each<F: FnMut(&PathState)>(&self, mut f: F) {
        for slot in self.m.values() {
            for ps in slot {
                f(ps);
            }
        }
    }

    /// Replace each state with zero or more successors produced by `f` into
    /// the scratch vector.
    pub fn flat_map<F: FnMut(&PathState, &mut Vec<PathState>)>(self, mut f: F) -> PathStateSet {
        let mut out = PathStateSet::new();
        let mut scratch: Vec<PathState> = Vec::with_capacity(16);
        for slot in self.m.into_values() {
            for ps in slot {
                scratch.clear();
                f(&ps, &mut scratch);
                for nps in scratch.drain(..) {
                    out.add(nps);
                }
            }
        }
        out
    }

    pub fn into_states(self) -> Vec<PathState> {
        self.m.into_values().flatten().collect()
    }
}

/// A mutable map from `PathState` to the exit locksets memoized for it.
#[derive(Default)]
pub struct PathStateMap {
    m: FxHashMap<PathStateKey, Vec<(PathState, LockSetSet)>>,
}

impl PathStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, ps: PathState, val: LockSetSet) {
        let slot = self.m.entry(ps.hash_key()).or_default();
        for entry in slot.iter_mut() {
            if entry.0.equal(&ps) {
                entry.1 = val;
                return;
            }
        }
        slot.push((ps, val));
    }

    pub fn get(&self, ps: &PathState) -> Option<&LockSetSet> {
        self.m
            .get(&ps.hash_key())?
            .iter()
            .find(|entry| entry.0.equal(ps))
            .map(|entry| &entry.1)
    }
}
