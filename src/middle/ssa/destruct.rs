//! SSA destruction: turns phis back into ordinary copies so instruction
//! selection never sees them.
//!
//! Critical edges (from a multi-successor block into a multi-predecessor
//! one) are split first, so every phi-carrying edge has a block of its own
//! to hold the copies. The copies for one edge are a parallel assignment;
//! sources that are themselves overwritten by the same group are snapshotted
//! into fresh temporaries before any destination is written, which makes
//! swap-shaped phi cycles come out right.

use hashbrown::{HashMap, HashSet};

use crate::{
    intern::Interner,
    middle::cfg::{Block, BlockId, Function, Program, Stm, Terminator, Value, VarId},
};

pub fn destruct_program(program: &mut Program, interner: &mut Interner) {
    for function in &mut program.functions {
        destruct(function, interner);
    }
}

pub fn destruct(function: &mut Function, interner: &mut Interner) {
    split_critical_edges(function);
    lower_phis(function, interner);
}

pub fn split_critical_edges(function: &mut Function) {
    let preds = function.predecessors();

    let mut edges = Vec::new();
    for (id, block) in function.blocks.enumerate() {
        let succs = block.terminator.successors();
        if succs.len() < 2 {
            continue;
        }
        for succ in succs {
            if preds[succ].len() >= 2 && !edges.contains(&(id, succ)) {
                edges.push((id, succ));
            }
        }
    }

    for (from, to) in edges {
        let mid = function.blocks.push(Block {
            phis: Vec::new(),
            stms: Vec::new(),
            terminator: Terminator::Jump(to),
        });
        function.blocks[from].terminator.retarget(to, mid);
        for phi in &mut function.blocks[to].phis {
            for arg in &mut phi.args {
                if arg.0 == from {
                    arg.0 = mid;
                }
            }
        }
    }
}

pub fn lower_phis(function: &mut Function, interner: &mut Interner) {
    let block_ids: Vec<BlockId> = function.blocks.indices().collect();
    for block in block_ids {
        let phis = core::mem::take(&mut function.blocks[block].phis);
        if phis.is_empty() {
            continue;
        }

        // one parallel-copy group per incoming edge
        let mut by_pred: HashMap<BlockId, Vec<(VarId, Value)>> = HashMap::new();
        for phi in &phis {
            for &(pred, value) in &phi.args {
                by_pred.entry(pred).or_default().push((phi.dst, value));
            }
        }

        let mut preds: Vec<BlockId> = by_pred.keys().copied().collect();
        preds.sort();
        for pred in preds {
            let copies = sequentialize(function, &by_pred[&pred], interner);
            function.blocks[pred].stms.extend(copies);
        }
    }
}

/// Orders one edge's parallel copies. Every source that some copy in the
/// group overwrites is read into a temporary first, then all destinations
/// are written from the snapshots.
fn sequentialize(
    function: &mut Function,
    copies: &[(VarId, Value)],
    interner: &mut Interner,
) -> Vec<Stm> {
    let dsts: HashSet<VarId> = copies.iter().map(|&(dst, _)| dst).collect();

    let mut out = Vec::new();
    let mut snapshots: HashMap<VarId, VarId> = HashMap::new();
    for &(_, src) in copies {
        if let Value::Var(var) = src {
            if dsts.contains(&var) && !snapshots.contains_key(&var) {
                let name = interner.fresh("swap");
                let temp = function.fresh_var(name, function.vars[var].ty);
                out.push(Stm::Assign {
                    dst: temp,
                    src: Value::Var(var),
                });
                snapshots.insert(var, temp);
            }
        }
    }
    for &(dst, src) in copies {
        let src = match src {
            Value::Var(var) => Value::Var(snapshots.get(&var).copied().unwrap_or(var)),
            imm => imm,
        };
        if src == Value::Var(dst) {
            continue;
        }
        out.push(Stm::Assign { dst, src });
    }
    out
}

#[cfg(test)]
fn no_phis_remain(function: &Function) -> bool {
    function.blocks.iter().all(|block| block.phis.is_empty())
}
