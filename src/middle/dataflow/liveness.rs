//! Liveness: which variables may still be read before being overwritten.
//! Used by dead-code elimination and by the register allocators.
//!
//! Phi operands are treated as uses inside the block that owns the phi.
//! That is slightly coarser than charging each operand to its incoming
//! edge, but only ever errs by keeping a variable alive, which is the safe
//! direction for every consumer here.

use crate::{
    middle::cfg::{BlockId, Function, VarId},
    middle::dataflow::{Analysis, Direction, Loc, Meet},
};

pub struct Liveness;

impl Analysis for Liveness {
    type Fact = VarId;

    const DIRECTION: Direction = Direction::Backward;
    const MEET: Meet = Meet::Union;

    fn generates(&self, function: &Function, block: BlockId, loc: Loc) -> Vec<VarId> {
        let b = &function.blocks[block];
        let mut uses = Vec::new();
        match loc {
            Loc::Phi(i) => {
                for &(_, value) in &b.phis[i].args {
                    if let Some(var) = value.as_var() {
                        uses.push(var);
                    }
                }
            }
            Loc::Stm(i) => b.stms[i].for_each_use(|var| uses.push(var)),
            Loc::Terminator => b.terminator.for_each_use(|var| uses.push(var)),
        }
        uses
    }

    fn kills(&self, function: &Function, block: BlockId, loc: Loc) -> Vec<VarId> {
        let b = &function.blocks[block];
        match loc {
            Loc::Phi(i) => vec![b.phis[i].dst],
            Loc::Stm(i) => b.stms[i].def().into_iter().collect(),
            Loc::Terminator => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        intern::Interner,
        middle::cfg::{FunctionBuilder, Stm, Terminator, Type, Value},
        middle::dataflow,
    };

    /// entry branches to a block that reads `x` and one that does not.
    /// `x` must be live into the reading arm only, and live out of entry.
    #[test]
    fn live_only_into_the_arm_that_reads() {
        let mut interner = Interner::new();
        let mut b = FunctionBuilder::new(
            Type::Int,
            interner.intern("C"),
            interner.intern("m"),
        );
        let c = b.add_formal(interner.intern("c"), Type::Int);
        let x = b.add_var(interner.intern("x"), Type::Int);

        let entry = b.new_block();
        let reads = b.new_block();
        let ignores = b.new_block();

        b.push(
            entry,
            Stm::Assign {
                dst: x,
                src: Value::Imm(7),
            },
        );
        b.terminate(
            entry,
            Terminator::Branch {
                cond: Value::Var(c),
                then_block: reads,
                else_block: ignores,
            },
        );
        b.terminate(reads, Terminator::Ret(Value::Var(x)));
        b.terminate(ignores, Terminator::Ret(Value::Imm(0)));
        let f = b.finish();

        let results = dataflow::solve(&Liveness, &f);

        assert!(results.block_in[reads].contains(&x));
        assert!(!results.block_in[ignores].contains(&x));
        assert!(results.block_out[entry].contains(&x));

        // the assignment in entry makes x dead on entry to the function
        assert!(!results.block_in[entry].contains(&x));
        assert!(results.block_in[entry].contains(&c));
    }

    #[test]
    fn per_statement_facts_shrink_backward() {
        let mut interner = Interner::new();
        let mut b = FunctionBuilder::new(
            Type::Int,
            interner.intern("C"),
            interner.intern("m"),
        );
        let x = b.add_var(interner.intern("x"), Type::Int);
        let y = b.add_var(interner.intern("y"), Type::Int);

        let entry = b.new_block();
        b.push(
            entry,
            Stm::Assign {
                dst: x,
                src: Value::Imm(1),
            },
        );
        b.push(
            entry,
            Stm::Assign {
                dst: y,
                src: Value::Var(x),
            },
        );
        b.terminate(entry, Terminator::Ret(Value::Var(y)));
        let f = b.finish();

        let results = dataflow::solve(&Liveness, &f);
        let after = dataflow::per_statement(&Liveness, &f, &results, entry);

        // after `x = 1`: x is about to be read
        assert!(after[0].contains(&x));
        // after `y = x`: only y survives to the return
        assert!(!after[1].contains(&x));
        assert!(after[1].contains(&y));
    }
}
