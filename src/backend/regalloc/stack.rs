//! The naive allocation strategy: every virtual register gets a stack slot,
//! and every instruction reloads what it reads and stores what it writes
//! through the scratch registers. Slow code, trivially correct; it exists as
//! the baseline the linear scanner is checked against.

use hashbrown::HashMap;

use crate::{
    backend::{
        regalloc::{rewrite_instr, FrameBuilder, Location},
        x64::{self, Frame},
    },
    middle::cfg::VarId,
};

pub fn allocate(mut function: x64::Function) -> x64::Function {
    let mut frame = FrameBuilder::new();
    let mut slots: HashMap<VarId, i64> = HashMap::new();

    for block in function.blocks.iter_mut() {
        let instrs = core::mem::take(&mut block.instrs);
        let mut rewritten = Vec::with_capacity(instrs.len() * 3);
        for instr in instrs {
            rewrite_instr(
                instr,
                &mut |var| Location::Slot(*slots.entry(var).or_insert_with(|| frame.slot())),
                &mut rewritten,
            );
        }
        block.instrs = rewritten;
    }

    function.frame = Frame {
        size: frame.size(),
        saved: vec![],
    };
    function
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::sample,
        backend::{munch, x64::VReg},
        intern::Interner,
        middle::cfg::ast_lowering,
    };

    #[test]
    fn no_virtual_registers_survive() {
        let mut interner = Interner::new();
        let ast = sample::factorial(&mut interner);
        let program = ast_lowering::lower_program(&ast, &mut interner);
        let program = munch::munch_program(&program, &mut interner);

        for function in program.functions {
            let function = allocate(function);
            assert!(function.frame.size % 16 == 0);
            for (_, block) in function.blocks.enumerate() {
                for instr in &block.instrs {
                    for reg in instr.uses.iter().chain(&instr.defs) {
                        assert!(matches!(reg, VReg::Phys(_)));
                    }
                }
            }
        }
    }
}
