//! Available expressions: which binary computations have already been
//! performed on every path reaching a point, with no operand overwritten
//! since. Drives common-subexpression elimination.

use hashbrown::HashSet;

use crate::{
    middle::cfg::{BinOp, BlockId, Function, Stm, Value},
    middle::dataflow::{Analysis, Direction, Loc, Meet},
};

/// The right-hand side of a binary-operation statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Expr {
    pub op: BinOp,
    pub lhs: Value,
    pub rhs: Value,
}

impl Expr {
    fn mentions(&self, var: crate::middle::cfg::VarId) -> bool {
        self.lhs == Value::Var(var) || self.rhs == Value::Var(var)
    }
}

pub struct AvailableExpressions {
    exprs: Vec<Expr>,
}

impl AvailableExpressions {
    pub fn new(function: &Function) -> Self {
        let mut exprs = Vec::new();
        for (_, block) in function.blocks.enumerate() {
            for stm in &block.stms {
                if let Stm::BinOp { op, lhs, rhs, .. } = *stm {
                    let expr = Expr { op, lhs, rhs };
                    if !exprs.contains(&expr) {
                        exprs.push(expr);
                    }
                }
            }
        }
        Self { exprs }
    }
}

impl Analysis for AvailableExpressions {
    type Fact = Expr;

    const DIRECTION: Direction = Direction::Forward;
    const MEET: Meet = Meet::Intersection;

    fn universe(&self, _function: &Function) -> HashSet<Expr> {
        self.exprs.iter().copied().collect()
    }

    fn generates(&self, function: &Function, block: BlockId, loc: Loc) -> Vec<Expr> {
        let b = &function.blocks[block];
        if let Loc::Stm(i) = loc {
            if let Stm::BinOp { dst, op, lhs, rhs } = b.stms[i] {
                let expr = Expr { op, lhs, rhs };
                // x = x + 1 computes nothing reusable
                if !expr.mentions(dst) {
                    return vec![expr];
                }
            }
        }
        Vec::new()
    }

    /// Redefining a variable invalidates every expression reading it.
    fn kills(&self, function: &Function, block: BlockId, loc: Loc) -> Vec<Expr> {
        let b = &function.blocks[block];
        let def = match loc {
            Loc::Phi(i) => Some(b.phis[i].dst),
            Loc::Stm(i) => b.stms[i].def(),
            Loc::Terminator => None,
        };
        match def {
            Some(var) => self
                .exprs
                .iter()
                .filter(|expr| expr.mentions(var))
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        intern::Interner,
        middle::cfg::{FunctionBuilder, Terminator, Type},
        middle::dataflow,
    };

    /// Both arms of a diamond compute a+b; the merge sees it available.
    /// One arm additionally computes a*b, which the intersection drops.
    #[test]
    fn intersection_keeps_only_common_expressions() {
        let mut interner = Interner::new();
        let mut b = FunctionBuilder::new(
            Type::Int,
            interner.intern("C"),
            interner.intern("m"),
        );
        let a = b.add_formal(interner.intern("a"), Type::Int);
        let bb = b.add_formal(interner.intern("b"), Type::Int);
        let c = b.add_formal(interner.intern("c"), Type::Int);
        let t1 = b.add_var(interner.intern("t1"), Type::Int);
        let t2 = b.add_var(interner.intern("t2"), Type::Int);
        let t3 = b.add_var(interner.intern("t3"), Type::Int);

        let entry = b.new_block();
        let left = b.new_block();
        let right = b.new_block();
        let merge = b.new_block();

        b.terminate(
            entry,
            Terminator::Branch {
                cond: Value::Var(c),
                then_block: left,
                else_block: right,
            },
        );
        b.push(
            left,
            Stm::BinOp {
                dst: t1,
                op: BinOp::Add,
                lhs: Value::Var(a),
                rhs: Value::Var(bb),
            },
        );
        b.push(
            left,
            Stm::BinOp {
                dst: t3,
                op: BinOp::Mul,
                lhs: Value::Var(a),
                rhs: Value::Var(bb),
            },
        );
        b.terminate(left, Terminator::Jump(merge));
        b.push(
            right,
            Stm::BinOp {
                dst: t2,
                op: BinOp::Add,
                lhs: Value::Var(a),
                rhs: Value::Var(bb),
            },
        );
        b.terminate(right, Terminator::Jump(merge));
        b.terminate(merge, Terminator::Ret(Value::Imm(0)));
        let f = b.finish();

        let analysis = AvailableExpressions::new(&f);
        let results = dataflow::solve(&analysis, &f);

        let sum = Expr {
            op: BinOp::Add,
            lhs: Value::Var(a),
            rhs: Value::Var(bb),
        };
        let product = Expr {
            op: BinOp::Mul,
            lhs: Value::Var(a),
            rhs: Value::Var(bb),
        };

        assert!(results.block_in[merge].contains(&sum));
        assert!(!results.block_in[merge].contains(&product));
        assert!(results.block_in[entry].is_empty());
    }

    /// Redefining an operand kills the expression even inside one block.
    #[test]
    fn operand_redefinition_kills() {
        let mut interner = Interner::new();
        let mut b = FunctionBuilder::new(
            Type::Int,
            interner.intern("C"),
            interner.intern("m"),
        );
        let a = b.add_formal(interner.intern("a"), Type::Int);
        let bb = b.add_formal(interner.intern("b"), Type::Int);
        let t = b.add_var(interner.intern("t"), Type::Int);

        let entry = b.new_block();
        b.push(
            entry,
            Stm::BinOp {
                dst: t,
                op: BinOp::Add,
                lhs: Value::Var(a),
                rhs: Value::Var(bb),
            },
        );
        b.push(
            entry,
            Stm::Assign {
                dst: a,
                src: Value::Imm(0),
            },
        );
        b.terminate(entry, Terminator::Ret(Value::Var(t)));
        let f = b.finish();

        let analysis = AvailableExpressions::new(&f);
        let results = dataflow::solve(&analysis, &f);

        let sum = Expr {
            op: BinOp::Add,
            lhs: Value::Var(a),
            rhs: Value::Var(bb),
        };
        assert!(!results.block_out[entry].contains(&sum));
    }
}
