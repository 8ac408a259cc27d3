//! The SSA optimization passes: copy propagation, common-subexpression
//! elimination, and dead-code elimination. Each pass reports whether it
//! changed anything; [`optimize`] cycles them to a fixed point, since each
//! one exposes work for the others (a CSE rewrite becomes a copy, a
//! propagated copy becomes dead).

use hashbrown::HashMap;

use crate::{
    fatal::ice,
    middle::cfg::{BlockId, Function, Program, Stm, Value, VarId},
    middle::dataflow::{
        self,
        available::{AvailableExpressions, Expr},
        liveness::Liveness,
    },
    middle::ssa::Dominance,
};

pub fn optimize_program(program: &mut Program) {
    for function in &mut program.functions {
        optimize(function);
    }
}

pub fn optimize(function: &mut Function) {
    loop {
        let mut changed = copy_propagation(function);
        changed |= common_subexpressions(function);
        changed |= dead_code(function);
        if !changed {
            break;
        }
    }
}

/// Rewrites every use of a copied variable to the copy's source. Sound
/// because each variable has a single definition here, so the source still
/// holds the same value at every use of the destination. The now-unused
/// copies are left for dead-code elimination.
pub fn copy_propagation(function: &mut Function) -> bool {
    let mut copies: HashMap<VarId, VarId> = HashMap::new();
    for (_, block) in function.blocks.enumerate() {
        for stm in &block.stms {
            if let Stm::Assign {
                dst,
                src: Value::Var(src),
            } = *stm
            {
                copies.insert(dst, src);
            }
        }
    }
    if copies.is_empty() {
        return false;
    }

    let resolve = |start: VarId| {
        let mut var = start;
        let mut hops = 0;
        while let Some(&next) = copies.get(&var) {
            var = next;
            hops += 1;
            if hops > copies.len() {
                ice!("copy chain loops");
            }
        }
        var
    };

    let mut changed = false;
    let mut rewrite = |value: Value| match value {
        Value::Var(var) => {
            let resolved = resolve(var);
            if resolved != var {
                changed = true;
            }
            Value::Var(resolved)
        }
        imm => imm,
    };

    for block in function.blocks.iter_mut() {
        for phi in &mut block.phis {
            for arg in &mut phi.args {
                arg.1 = rewrite(arg.1);
            }
        }
        for stm in &mut block.stms {
            stm.map_uses(&mut rewrite);
        }
        block.terminator.map_uses(&mut rewrite);
    }
    changed
}

/// Replaces a recomputation of an already-available expression with a copy
/// from the variable that holds it. The availability result proves some
/// earlier computation reaches on every path; single definitions mean any
/// dominating computation of the same operands still holds the value, so the
/// holder is picked by dominance.
pub fn common_subexpressions(function: &mut Function) -> bool {
    let analysis = AvailableExpressions::new(function);
    let results = dataflow::solve(&analysis, function);
    let dom = Dominance::compute(function);

    let mut sites: HashMap<Expr, Vec<(VarId, BlockId, usize)>> = HashMap::new();
    for (id, block) in function.blocks.enumerate() {
        for (i, stm) in block.stms.iter().enumerate() {
            if let Stm::BinOp { dst, op, lhs, rhs } = *stm {
                sites.entry(Expr { op, lhs, rhs }).or_default().push((dst, id, i));
            }
        }
    }

    let mut changed = false;
    let block_ids: Vec<BlockId> = function.blocks.indices().collect();
    for block in block_ids {
        let before = dataflow::per_statement(&analysis, function, &results, block);
        for i in 0..function.blocks[block].stms.len() {
            let Stm::BinOp { dst, op, lhs, rhs } = function.blocks[block].stms[i] else {
                continue;
            };
            let expr = Expr { op, lhs, rhs };
            if !before[i].contains(&expr) {
                continue;
            }
            let holder = sites[&expr].iter().find(|&&(holder, hb, hi)| {
                holder != dst && ((hb == block && hi < i) || (hb != block && dom.dominates(hb, block)))
            });
            if let Some(&(holder, ..)) = holder {
                function.blocks[block].stms[i] = Stm::Assign {
                    dst,
                    src: Value::Var(holder),
                };
                changed = true;
            }
        }
    }
    changed
}

/// Removes side-effect-free statements whose destination is dead. Calls,
/// prints, and array writes always stay. Removing a statement can kill the
/// statements feeding it, so liveness is recomputed until nothing moves.
pub fn dead_code(function: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let results = dataflow::solve(&Liveness, function);
        let mut removed = false;

        let block_ids: Vec<BlockId> = function.blocks.indices().collect();
        for block in block_ids {
            let after = dataflow::per_statement(&Liveness, function, &results, block);
            let stms = &mut function.blocks[block].stms;
            let mut i = 0;
            stms.retain(|stm| {
                let live_after = &after[i];
                i += 1;
                let removable = match stm {
                    Stm::Assign { dst, .. }
                    | Stm::BinOp { dst, .. }
                    | Stm::ArrayLoad { dst, .. }
                    | Stm::GetVirtualMethod { dst, .. }
                    | Stm::New { dst, .. } => !live_after.contains(dst),
                    Stm::Call { .. } | Stm::ArrayStore { .. } | Stm::Print { .. } => false,
                };
                if removable {
                    removed = true;
                }
                !removable
            });
        }

        if !removed {
            break;
        }
        changed = true;
    }
    changed
}
