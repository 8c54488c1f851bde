use super::*;
use crate::ir::builder::FunctionBuilder;
use crate::ir::{BinOpKind, InstKind};

#[test]
fn operand_live_between_definition_and_use() {
    let mut program = Program::new();
    let f = program.declare_func("f");
    let one = program.const_int(1);
    let ten = program.const_int(10);
    let g = program.global("g");

    let mut fb = FunctionBuilder::new(&mut program, f);
    let p = fb.param();
    // b0: x = p + 1; jump b1
    let x = fb.inst(InstKind::BinOp {
        op: BinOpKind::Add,
        lhs: p,
        rhs: one,
    });
    let b1 = fb.block();
    let b2 = fb.block();
    let b3 = fb.block();
    fb.jump(b1);
    // b1: cmp = x < 10; if cmp -> b2 else b3
    fb.switch_to(b1);
    let cmp = fb.inst(InstKind::BinOp {
        op: BinOpKind::Lt,
        lhs: x,
        rhs: ten,
    });
    let branch = fb.branch(cmp, b2, b3);
    fb.switch_to(b2);
    fb.ret(vec![g]);
    fb.switch_to(b3);
    fb.ret(vec![]);

    let deps = liveness_for(&program, f, &[branch]);
    // x is live at entry to b1; cmp is defined in its use block and is not.
    assert!(deps[1].contains(&x));
    assert!(!deps[1].contains(&cmp));
    assert!(deps[0].is_empty());
    assert!(deps[2].is_empty());
    assert!(deps[3].is_empty());
}

#[test]
fn phi_operands_live_only_on_their_edges() {
    let mut program = Program::new();
    let f = program.declare_func("f");
    let one = program.const_int(1);
    let two = program.const_int(2);
    let zero = program.const_int(0);
    let cond = program.global("cond");

    let mut fb = FunctionBuilder::new(&mut program, f);
    // b0: x = 1 + 1 (used by one phi edge); if cond -> b1 else b2
    let x = fb.inst(InstKind::BinOp {
        op: BinOpKind::Add,
        lhs: one,
        rhs: one,
    });
    let b1 = fb.block();
    let b2 = fb.block();
    let b3 = fb.block();
    fb.branch(cond, b1, b2);
    // b1: y = 2 + 2; jump b3
    fb.switch_to(b1);
    let y = fb.inst(InstKind::BinOp {
        op: BinOpKind::Add,
        lhs: two,
        rhs: two,
    });
    fb.jump(b3);
    // b2: jump b3 (phi edge uses x, defined back in b0)
    fb.switch_to(b2);
    fb.jump(b3);
    // b3: phi(y from b1, x from b2); if phi != 0 -> b1 else b2 (any sink)
    fb.switch_to(b3);
    let phi = fb.phi(vec![y, x]);
    let cmp = fb.inst(InstKind::BinOp {
        op: BinOpKind::Ne,
        lhs: phi,
        rhs: zero,
    });
    let branch = fb.branch(cmp, b1, b2);

    let deps = liveness_for(&program, f, &[branch]);
    // Both phi operands are live at the phi's block.
    assert!(deps[3].contains(&x));
    assert!(deps[3].contains(&y));
    // x flows in through b2 only; y is defined in b1 itself.
    assert!(deps[2].contains(&x));
    assert!(!deps[1].contains(&x));
    assert!(!deps[1].contains(&y));
    assert!(!deps[2].contains(&y));
}
