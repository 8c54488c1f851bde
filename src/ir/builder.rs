//! Incremental construction of SSA functions.
//! `FunctionBuilder` appends blocks and instructions to a declared function
//! and wires block edges (`jump`, `branch`) so that predecessor order is
//! explicit; phi edges must line up with that order.

use super::{
    Block, BlockRef, Callee, FuncId, InstKind, Pos, Program, ValueData, ValueId, ValueKind,
};

pub struct FunctionBuilder<'p> {
    program: &'p mut Program,
    func: FuncId,
    cur: u32,
}

impl<'p> FunctionBuilder<'p> {
    /// Start building the body of `func`. Creates the entry block (index 0)
    /// and positions the builder in it.
    pub fn new(program: &'p mut Program, func: FuncId) -> Self {
        program.func_mut(func).blocks.push(Block::default());
        Self {
            program,
            func,
            cur: 0,
        }
    }

    pub fn func(&self) -> FuncId {
        self.func
    }

    pub fn current_block(&self) -> u32 {
        self.cur
    }

    pub fn param(&mut self) -> ValueId {
        let func = self.func;
        let index = self.program.func(func).params.len() as u32;
        let v = self.program.push_value(ValueData {
            kind: ValueKind::Param { index },
            pos: Pos::NONE,
            func: Some(func),
            block: None,
        });
        self.program.func_mut(func).params.push(v);
        v
    }

    /// Append a new empty block and return its index. Does not switch to it.
    pub fn block(&mut self) -> u32 {
        let blocks = &mut self.program.func_mut(self.func).blocks;
        blocks.push(Block::default());
        (blocks.len() - 1) as u32
    }

    pub fn switch_to(&mut self, block: u32) {
        self.cur = block;
    }

    pub fn inst_at(&mut self, kind: InstKind, pos: Pos) -> ValueId {
        let v = self.program.push_value(ValueData {
            kind: ValueKind::Inst(kind),
            pos,
            func: Some(self.func),
            block: Some(self.cur),
        });
        self.program.func_mut(self.func).blocks[self.cur as usize]
            .insts
            .push(v);
        v
    }

    pub fn inst(&mut self, kind: InstKind) -> ValueId {
        self.inst_at(kind, Pos::NONE)
    }

    pub fn call(&mut self, callee: Callee, args: Vec<ValueId>) -> ValueId {
        self.inst(InstKind::Call { callee, args })
    }

    pub fn call_at(&mut self, callee: Callee, args: Vec<ValueId>, pos: Pos) -> ValueId {
        self.inst_at(InstKind::Call { callee, args }, pos)
    }

    pub fn call_static(&mut self, callee: FuncId, args: Vec<ValueId>) -> ValueId {
        self.call(Callee::Static(callee), args)
    }

    pub fn go(&mut self, callee: Callee, args: Vec<ValueId>) -> ValueId {
        self.inst(InstKind::Go { callee, args })
    }

    pub fn ret(&mut self, results: Vec<ValueId>) -> ValueId {
        self.inst(InstKind::Return { results })
    }

    /// Terminate the current block with an unconditional jump to `target`.
    pub fn jump(&mut self, target: u32) -> ValueId {
        let v = self.inst(InstKind::Jump);
        self.edge(self.cur, target);
        v
    }

    /// Terminate the current block with a conditional branch. Successor
    /// order is `[then_block, else_block]`.
    pub fn branch(&mut self, cond: ValueId, then_block: u32, else_block: u32) -> ValueId {
        let v = self.inst(InstKind::If { cond });
        self.edge(self.cur, then_block);
        self.edge(self.cur, else_block);
        v
    }

    /// A phi at the start of the current block; `edges` follow the block's
    /// predecessor order.
    pub fn phi(&mut self, edges: Vec<ValueId>) -> ValueId {
        self.inst(InstKind::Phi { edges })
    }

    fn edge(&mut self, from: u32, to: u32) {
        let blocks = &mut self.program.func_mut(self.func).blocks;
        blocks[from as usize].succs.push(to);
        blocks[to as usize].preds.push(from);
    }

    pub fn block_ref(&self, index: u32) -> BlockRef {
        BlockRef {
            func: self.func,
            index,
        }
    }
}
