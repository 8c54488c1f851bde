//! Symbolic value state.
//! `ValState` binds SSA values and abstract heap cells to `DynValue`s and
//! carries the lightweight constant propagation the path walker relies on
//! to prune branches. States are persistent: extension shares structure and
//! the no-change paths return the receiver.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{BinOpKind, ConstValue, InstKind, NumKind, Program, UnOpKind, ValueId, ValueKind};

/// Identity of an abstract heap cell. Cells are compared by identity only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

/// Arena of named heap cells. Names are for rendering, not identity.
#[derive(Default)]
pub struct Heap {
    names: Vec<String>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_object(&mut self, name: &str) -> HeapId {
        let id = HeapId(self.names.len() as u32);
        self.names.push(name.to_owned());
        id
    }

    pub fn name(&self, id: HeapId) -> &str {
        &self.names[id.0 as usize]
    }
}

/// The symbolic value of an SSA value or heap cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DynValue {
    Const(ConstValue),
    HeapPtr(HeapId),
    Struct(Arc<FxHashMap<String, HeapId>>),
}

impl DynValue {
    pub fn struct_of(fields: &[(&str, HeapId)]) -> DynValue {
        DynValue::Struct(Arc::new(
            fields
                .iter()
                .map(|(name, id)| ((*name).to_owned(), *id))
                .collect(),
        ))
    }
}

/// Immutable mapping from SSA values and heap cells to `DynValue`s.
#[derive(Clone, Debug, Default)]
pub struct ValState {
    ssa: Arc<FxHashMap<ValueId, DynValue>>,
    heap: Arc<FxHashMap<HeapId, DynValue>>,
}

impl ValState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, v: ValueId) -> Option<&DynValue> {
        self.ssa.get(&v)
    }

    pub fn get_heap(&self, h: HeapId) -> Option<&DynValue> {
        self.heap.get(&h)
    }

    /// The symbolic value of `v`: constants resolve directly, everything else
    /// through the SSA bindings.
    pub fn resolve(&self, program: &Program, v: ValueId) -> Option<DynValue> {
        if let ValueKind::Const(c) = &program.value(v).kind {
            return Some(DynValue::Const(c.clone()));
        }
        self.ssa.get(&v).cloned()
    }

    pub fn extend(&self, v: ValueId, d: DynValue) -> ValState {
        if self.ssa.get(&v) == Some(&d) {
            return self.clone();
        }
        let mut ssa = (*self.ssa).clone();
        ssa.insert(v, d);
        ValState {
            ssa: Arc::new(ssa),
            heap: self.heap.clone(),
        }
    }

    pub fn extend_heap(&self, h: HeapId, d: DynValue) -> ValState {
        if self.heap.get(&h) == Some(&d) {
            return self.clone();
        }
        let mut heap = (*self.heap).clone();
        heap.insert(h, d);
        ValState {
            ssa: self.ssa.clone(),
            heap: Arc::new(heap),
        }
    }

    /// Drop all SSA bindings, keeping the heap. Used when entering a callee
    /// so caller-local values do not leak into its state.
    pub fn limit_to_heap(&self) -> ValState {
        if self.ssa.is_empty() {
            return self.clone();
        }
        ValState {
            ssa: Arc::new(FxHashMap::default()),
            heap: self.heap.clone(),
        }
    }

    /// Equality restricted to the SSA values in `mask`, plus all heap cells.
    pub fn equal_at(&self, other: &ValState, mask: &FxHashSet<ValueId>) -> bool {
        if !Arc::ptr_eq(&self.ssa, &other.ssa) {
            for v in mask {
                if self.ssa.get(v) != other.ssa.get(v) {
                    return false;
                }
            }
        }
        Arc::ptr_eq(&self.heap, &other.heap) || self.heap == other.heap
    }

    /// Apply the effect of `inst` on the value state: constant folding over
    /// `BinOp`/`UnOp`/`Convert`, heap loads, field projection through struct
    /// cells, and phi agreement. Any other instruction leaves the state
    /// unchanged.
    pub fn eval(&self, program: &Program, inst: ValueId) -> ValState {
        let kind = match &program.value(inst).kind {
            ValueKind::Inst(kind) => kind,
            _ => return self.clone(),
        };
        match kind {
            InstKind::BinOp { op, lhs, rhs } => {
                let (a, b) = match (self.resolve(program, *lhs), self.resolve(program, *rhs)) {
                    (Some(DynValue::Const(a)), Some(DynValue::Const(b))) => (a, b),
                    _ => return self.clone(),
                };
                match eval_binop(*op, &a, &b) {
                    Some(c) => self.extend(inst, DynValue::Const(c)),
                    None => self.clone(),
                }
            }
            InstKind::UnOp { op, x } => match (op, self.resolve(program, *x)) {
                (UnOpKind::Load, Some(DynValue::HeapPtr(h))) => match self.heap.get(&h) {
                    Some(d) => {
                        let d = d.clone();
                        self.extend(inst, d)
                    }
                    None => self.clone(),
                },
                (UnOpKind::Not, Some(DynValue::Const(ConstValue::Bool(b)))) => {
                    self.extend(inst, DynValue::Const(ConstValue::Bool(!b)))
                }
                (UnOpKind::Neg, Some(DynValue::Const(ConstValue::Int(i)))) => {
                    self.extend(inst, DynValue::Const(ConstValue::Int(i.wrapping_neg())))
                }
                (UnOpKind::Neg, Some(DynValue::Const(ConstValue::Uint(u)))) => {
                    self.extend(inst, DynValue::Const(ConstValue::Uint(u.wrapping_neg())))
                }
                (UnOpKind::BitNot, Some(DynValue::Const(ConstValue::Int(i)))) => {
                    self.extend(inst, DynValue::Const(ConstValue::Int(!i)))
                }
                (UnOpKind::BitNot, Some(DynValue::Const(ConstValue::Uint(u)))) => {
                    self.extend(inst, DynValue::Const(ConstValue::Uint(!u)))
                }
                _ => self.clone(),
            },
            InstKind::Field { x, field } | InstKind::FieldAddr { x, field } => {
                let h = match self.resolve(program, *x) {
                    Some(DynValue::HeapPtr(h)) => h,
                    _ => return self.clone(),
                };
                match self.heap.get(&h) {
                    Some(DynValue::Struct(fields)) => match fields.get(field) {
                        Some(obj) => {
                            let obj = *obj;
                            self.extend(inst, DynValue::HeapPtr(obj))
                        }
                        None => self.clone(),
                    },
                    _ => self.clone(),
                }
            }
            InstKind::Phi { edges } => {
                // A binding propagated along the taken edge is more precise
                // than anything agreement can conclude; keep it.
                if self.ssa.contains_key(&inst) {
                    return self.clone();
                }
                let mut agreed: Option<ConstValue> = None;
                for e in edges {
                    match self.resolve(program, *e) {
                        Some(DynValue::Const(c)) => match &agreed {
                            Some(prev) if *prev == c => {}
                            Some(_) => return self.clone(),
                            None => agreed = Some(c),
                        },
                        _ => return self.clone(),
                    }
                }
                match agreed {
                    Some(c) => self.extend(inst, DynValue::Const(c)),
                    None => self.clone(),
                }
            }
            InstKind::Convert { x, to } => match self.resolve(program, *x) {
                Some(DynValue::Const(c)) => {
                    let converted = match (c, to) {
                        (ConstValue::Int(i), NumKind::Uint) => Some(ConstValue::Uint(i as u64)),
                        (ConstValue::Uint(u), NumKind::Int) => Some(ConstValue::Int(u as i64)),
                        (c @ ConstValue::Int(_), NumKind::Int) => Some(c),
                        (c @ ConstValue::Uint(_), NumKind::Uint) => Some(c),
                        _ => None,
                    };
                    match converted {
                        Some(c) => self.extend(inst, DynValue::Const(c)),
                        None => self.clone(),
                    }
                }
                _ => self.clone(),
            },
            _ => self.clone(),
        }
    }
}

fn shift_amount(c: &ConstValue) -> Option<u32> {
    match c {
        ConstValue::Int(i) if *i >= 0 => u32::try_from(*i).ok(),
        ConstValue::Uint(u) => u32::try_from(*u).ok(),
        _ => None,
    }
}

fn eval_binop(op: BinOpKind, a: &ConstValue, b: &ConstValue) -> Option<ConstValue> {
    use BinOpKind::*;
    use ConstValue::*;

    if matches!(op, Shl | Shr) {
        let n = shift_amount(b)?;
        if n >= 64 {
            return None;
        }
        return match (a, op) {
            (Int(x), Shl) => Some(Int(x.wrapping_shl(n))),
            (Int(x), Shr) => Some(Int(x.wrapping_shr(n))),
            (Uint(x), Shl) => Some(Uint(x.wrapping_shl(n))),
            (Uint(x), Shr) => Some(Uint(x.wrapping_shr(n))),
            _ => None,
        };
    }

    match (a, b) {
        (Int(x), Int(y)) => match op {
            Add => Some(Int(x.wrapping_add(*y))),
            Sub => Some(Int(x.wrapping_sub(*y))),
            Mul => Some(Int(x.wrapping_mul(*y))),
            Div => x.checked_div(*y).map(Int),
            Rem => x.checked_rem(*y).map(Int),
            And => Some(Int(x & y)),
            Or => Some(Int(x | y)),
            Xor => Some(Int(x ^ y)),
            AndNot => Some(Int(x & !y)),
            Eq => Some(Bool(x == y)),
            Ne => Some(Bool(x != y)),
            Lt => Some(Bool(x < y)),
            Le => Some(Bool(x <= y)),
            Gt => Some(Bool(x > y)),
            Ge => Some(Bool(x >= y)),
            Shl | Shr => None,
        },
        (Uint(x), Uint(y)) => match op {
            Add => Some(Uint(x.wrapping_add(*y))),
            Sub => Some(Uint(x.wrapping_sub(*y))),
            Mul => Some(Uint(x.wrapping_mul(*y))),
            Div => x.checked_div(*y).map(Uint),
            Rem => x.checked_rem(*y).map(Uint),
            And => Some(Uint(x & y)),
            Or => Some(Uint(x | y)),
            Xor => Some(Uint(x ^ y)),
            AndNot => Some(Uint(x & !y)),
            Eq => Some(Bool(x == y)),
            Ne => Some(Bool(x != y)),
            Lt => Some(Bool(x < y)),
            Le => Some(Bool(x <= y)),
            Gt => Some(Bool(x > y)),
            Ge => Some(Bool(x >= y)),
            Shl | Shr => None,
        },
        (Bool(x), Bool(y)) => match op {
            Eq => Some(Bool(x == y)),
            Ne => Some(Bool(x != y)),
            _ => None,
        },
        (Str(x), Str(y)) => match op {
            Add => Some(Str(format!("{}{}", x, y))),
            Eq => Some(Bool(x == y)),
            Ne => Some(Bool(x != y)),
            Lt => Some(Bool(x < y)),
            Le => Some(Bool(x <= y)),
            Gt => Some(Bool(x > y)),
            Ge => Some(Bool(x >= y)),
            _ => None,
        },
        (Nil, Nil) => match op {
            Eq => Some(Bool(true)),
            Ne => Some(Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{BinOpKind, InstKind, UnOpKind};
    use rustc_hash::FxHashSet;

    #[test]
    fn binop_folds_constants() {
        let mut program = Program::new();
        let f = program.declare_func("f");
        let two = program.const_int(2);
        let three = program.const_int(3);
        let mut fb = FunctionBuilder::new(&mut program, f);
        let add = fb.inst(InstKind::BinOp {
            op: BinOpKind::Add,
            lhs: two,
            rhs: three,
        });
        let cmp = fb.inst(InstKind::BinOp {
            op: BinOpKind::Lt,
            lhs: two,
            rhs: three,
        });
        let vs = ValState::new().eval(&program, add).eval(&program, cmp);
        assert_eq!(vs.get(add), Some(&DynValue::Const(ConstValue::Int(5))));
        assert_eq!(vs.get(cmp), Some(&DynValue::Const(ConstValue::Bool(true))));
    }

    #[test]
    fn division_by_zero_leaves_unbound() {
        let mut program = Program::new();
        let f = program.declare_func("f");
        let one = program.const_int(1);
        let zero = program.const_int(0);
        let mut fb = FunctionBuilder::new(&mut program, f);
        let div = fb.inst(InstKind::BinOp {
            op: BinOpKind::Div,
            lhs: one,
            rhs: zero,
        });
        let vs = ValState::new().eval(&program, div);
        assert_eq!(vs.get(div), None);
    }

    #[test]
    fn load_and_field_follow_heap_cells() {
        let mut program = Program::new();
        let f = program.declare_func("f");
        let mut heap = Heap::new();
        let m = heap.new_object("curM");
        let curg = heap.new_object("curM.curg");
        let g = heap.new_object("userG");

        let mut fb = FunctionBuilder::new(&mut program, f);
        let p = fb.param();
        let addr = fb.inst(InstKind::FieldAddr {
            x: p,
            field: "curg".to_owned(),
        });
        let load = fb.inst(InstKind::UnOp {
            op: UnOpKind::Load,
            x: addr,
        });

        let vs = ValState::new()
            .extend(p, DynValue::HeapPtr(m))
            .extend_heap(m, DynValue::struct_of(&[("curg", curg)]))
            .extend_heap(curg, DynValue::HeapPtr(g));
        let vs = vs.eval(&program, addr).eval(&program, load);
        assert_eq!(vs.get(addr), Some(&DynValue::HeapPtr(curg)));
        assert_eq!(vs.get(load), Some(&DynValue::HeapPtr(g)));
    }

    #[test]
    fn phi_binds_only_on_agreement() {
        let mut program = Program::new();
        let f = program.declare_func("f");
        let one = program.const_int(1);
        let one2 = program.const_int(1);
        let two = program.const_int(2);
        let mut fb = FunctionBuilder::new(&mut program, f);
        let agree = fb.phi(vec![one, one2]);
        let disagree = fb.phi(vec![one, two]);
        let vs = ValState::new()
            .eval(&program, agree)
            .eval(&program, disagree);
        assert_eq!(vs.get(agree), Some(&DynValue::Const(ConstValue::Int(1))));
        assert_eq!(vs.get(disagree), None);
    }

    #[test]
    fn limit_to_heap_drops_ssa_bindings() {
        let mut program = Program::new();
        let f = program.declare_func("f");
        let mut heap = Heap::new();
        let h = heap.new_object("cell");
        let mut fb = FunctionBuilder::new(&mut program, f);
        let p = fb.param();
        let vs = ValState::new()
            .extend(p, DynValue::Const(ConstValue::Int(7)))
            .extend_heap(h, DynValue::Const(ConstValue::Int(9)));
        let restricted = vs.limit_to_heap();
        assert_eq!(restricted.get(p), None);
        assert_eq!(
            restricted.get_heap(h),
            Some(&DynValue::Const(ConstValue::Int(9)))
        );
    }

    #[test]
    fn masked_equality_ignores_values_outside_mask() {
        let mut program = Program::new();
        let f = program.declare_func("f");
        let mut fb = FunctionBuilder::new(&mut program, f);
        let a = fb.param();
        let b = fb.param();
        let x = ValState::new().extend(a, DynValue::Const(ConstValue::Int(1)));
        let y = ValState::new().extend(a, DynValue::Const(ConstValue::Int(2)));

        let mut mask = FxHashSet::default();
        mask.insert(b);
        assert!(x.equal_at(&y, &mask));
        mask.insert(a);
        assert!(!x.equal_at(&y, &mask));
    }

    #[test]
    fn heap_always_participates_in_equality() {
        let mut heap = Heap::new();
        let h = heap.new_object("cell");
        let x = ValState::new().extend_heap(h, DynValue::Const(ConstValue::Int(1)));
        let y = ValState::new().extend_heap(h, DynValue::Const(ConstValue::Int(2)));
        let mask = FxHashSet::default();
        assert!(!x.equal_at(&y, &mask));
    }
}
