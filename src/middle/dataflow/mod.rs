//! A generic forward/backward dataflow solver over the CFG IR.
//!
//! An [`Analysis`] contributes gen and kill sets per program point; the
//! engine owns the fixed-point iteration. Transfer through a point is
//! `out = gen ∪ (in − kill)`, composed across a block in execution order
//! (or reverse order for backward analyses). Block-level results are solved
//! with a worklist seeded in reverse postorder, so forward facts converge
//! in few passes and backward ones in few more.

use hashbrown::HashSet;

use crate::{
    index::IndexVec,
    middle::cfg::{BlockId, Function},
};

pub mod available;
pub mod liveness;
pub mod reaching;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meet {
    Union,
    Intersection,
}

/// A program point inside a block, in execution order: phis, then ordinary
/// statements, then the terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Loc {
    Phi(usize),
    Stm(usize),
    Terminator,
}

pub trait Analysis {
    type Fact: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    const DIRECTION: Direction;
    const MEET: Meet;

    /// The starting value for interior blocks under an intersection meet.
    /// Union analyses start from nothing and never call this.
    fn universe(&self, _function: &Function) -> HashSet<Self::Fact> {
        HashSet::new()
    }

    fn generates(&self, function: &Function, block: BlockId, loc: Loc) -> Vec<Self::Fact>;

    fn kills(&self, function: &Function, block: BlockId, loc: Loc) -> Vec<Self::Fact>;
}

/// Facts at the boundary of every block. For a forward analysis `block_in`
/// holds facts at block entry and `block_out` at block exit; a backward
/// analysis reads the same way (liveness: `block_in` is live-in).
#[derive(Debug)]
pub struct Results<A: Analysis> {
    pub block_in: IndexVec<BlockId, HashSet<A::Fact>>,
    pub block_out: IndexVec<BlockId, HashSet<A::Fact>>,
}

pub fn solve<A: Analysis>(analysis: &A, function: &Function) -> Results<A> {
    // seed in an order that follows the direction of flow
    let rpo = function.reverse_postorder();
    let seed = match A::DIRECTION {
        Direction::Forward => rpo,
        Direction::Backward => rpo.into_iter().rev().collect(),
    };
    solve_from(analysis, function, seed)
}

/// Runs the fixpoint from an explicit seed order over the reachable blocks.
/// The order only changes how fast the iteration converges, never what it
/// converges to.
fn solve_from<A: Analysis>(analysis: &A, function: &Function, seed: Vec<BlockId>) -> Results<A> {
    let preds = function.predecessors();

    let interior = match A::MEET {
        Meet::Union => HashSet::new(),
        Meet::Intersection => analysis.universe(function),
    };
    let mut block_in: IndexVec<BlockId, HashSet<A::Fact>> =
        function.blocks.map_to(interior.clone());
    let mut block_out: IndexVec<BlockId, HashSet<A::Fact>> = function.blocks.map_to(interior);

    let mut worklist: Vec<BlockId> = seed.iter().rev().copied().collect();
    let mut queued = function.blocks.map_to(false);
    for &block in &seed {
        queued[block] = true;
    }

    while let Some(block) = worklist.pop() {
        queued[block] = false;

        match A::DIRECTION {
            Direction::Forward => {
                let incoming = meet::<A>(&preds[block], &block_out);
                let outgoing = transfer_block(analysis, function, block, incoming.clone(), false);
                block_in[block] = incoming;
                if outgoing != block_out[block] {
                    block_out[block] = outgoing;
                    for succ in function.blocks[block].terminator.successors() {
                        if !queued[succ] {
                            queued[succ] = true;
                            worklist.push(succ);
                        }
                    }
                }
            }
            Direction::Backward => {
                let succs = function.blocks[block].terminator.successors();
                let outgoing = meet::<A>(&succs, &block_in);
                let incoming = transfer_block(analysis, function, block, outgoing.clone(), true);
                block_out[block] = outgoing;
                if incoming != block_in[block] {
                    block_in[block] = incoming;
                    for &pred in &preds[block] {
                        if !queued[pred] {
                            queued[pred] = true;
                            worklist.push(pred);
                        }
                    }
                }
            }
        }
    }

    Results {
        block_in,
        block_out,
    }
}

/// Facts at each ordinary statement of `block`: just before it for a forward
/// analysis, just after it for a backward one. Indexed like `block.stms`.
pub fn per_statement<A: Analysis>(
    analysis: &A,
    function: &Function,
    results: &Results<A>,
    block: BlockId,
) -> Vec<HashSet<A::Fact>> {
    let b = &function.blocks[block];
    let mut facts = Vec::with_capacity(b.stms.len());

    match A::DIRECTION {
        Direction::Forward => {
            let mut set = results.block_in[block].clone();
            for i in 0..b.phis.len() {
                apply(analysis, function, block, Loc::Phi(i), &mut set);
            }
            for i in 0..b.stms.len() {
                facts.push(set.clone());
                apply(analysis, function, block, Loc::Stm(i), &mut set);
            }
        }
        Direction::Backward => {
            let mut set = results.block_out[block].clone();
            apply(analysis, function, block, Loc::Terminator, &mut set);
            for i in (0..b.stms.len()).rev() {
                facts.push(set.clone());
                apply(analysis, function, block, Loc::Stm(i), &mut set);
            }
            facts.reverse();
        }
    }
    facts
}

fn meet<A: Analysis>(
    neighbors: &[BlockId],
    sets: &IndexVec<BlockId, HashSet<A::Fact>>,
) -> HashSet<A::Fact> {
    match A::MEET {
        Meet::Union => {
            let mut out = HashSet::new();
            for &n in neighbors {
                out.extend(sets[n].iter().cloned());
            }
            out
        }
        Meet::Intersection => match neighbors.split_first() {
            // boundary blocks start from nothing, not the universe
            None => HashSet::new(),
            Some((&first, rest)) => {
                let mut out = sets[first].clone();
                for &n in rest {
                    out.retain(|fact| sets[n].contains(fact));
                }
                out
            }
        },
    }
}

fn transfer_block<A: Analysis>(
    analysis: &A,
    function: &Function,
    block: BlockId,
    mut set: HashSet<A::Fact>,
    backward: bool,
) -> HashSet<A::Fact> {
    let b = &function.blocks[block];
    let mut locs: Vec<Loc> = (0..b.phis.len())
        .map(Loc::Phi)
        .chain((0..b.stms.len()).map(Loc::Stm))
        .chain([Loc::Terminator])
        .collect();
    if backward {
        locs.reverse();
    }
    for loc in locs {
        apply(analysis, function, block, loc, &mut set);
    }
    set
}

fn apply<A: Analysis>(
    analysis: &A,
    function: &Function,
    block: BlockId,
    loc: Loc,
    set: &mut HashSet<A::Fact>,
) {
    for fact in analysis.kills(function, block, loc) {
        set.remove(&fact);
    }
    for fact in analysis.generates(function, block, loc) {
        set.insert(fact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        intern::Interner,
        middle::cfg::{BinOp, FunctionBuilder, Stm, Terminator, Type, Value},
        middle::dataflow::{liveness::Liveness, reaching::ReachingDefinitions},
    };

    /// entry -> header -> {body -> header, exit}; a loop plus a join, so the
    /// iteration has real back edges to converge over.
    fn loopy(interner: &mut Interner) -> Function {
        let mut b = FunctionBuilder::new(Type::Int, interner.intern("C"), interner.intern("m"));
        let n = b.add_formal(interner.intern("n"), Type::Int);
        let i = b.add_var(interner.intern("i"), Type::Int);
        let c = b.add_var(interner.intern("c"), Type::Int);

        let entry = b.new_block();
        let header = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        b.push(
            entry,
            Stm::Assign {
                dst: i,
                src: Value::Imm(0),
            },
        );
        b.terminate(entry, Terminator::Jump(header));
        b.push(
            header,
            Stm::BinOp {
                dst: c,
                op: BinOp::LessThan,
                lhs: Value::Var(i),
                rhs: Value::Var(n),
            },
        );
        b.terminate(
            header,
            Terminator::Branch {
                cond: Value::Var(c),
                then_block: body,
                else_block: exit,
            },
        );
        b.push(
            body,
            Stm::BinOp {
                dst: i,
                op: BinOp::Add,
                lhs: Value::Var(i),
                rhs: Value::Imm(1),
            },
        );
        b.terminate(body, Terminator::Jump(header));
        b.terminate(exit, Terminator::Ret(Value::Var(i)));
        b.finish()
    }

    fn assert_same<A: Analysis>(f: &Function, a: &Results<A>, b: &Results<A>) {
        for block in f.blocks.indices() {
            assert_eq!(a.block_in[block], b.block_in[block], "in of {block:?}");
            assert_eq!(a.block_out[block], b.block_out[block], "out of {block:?}");
        }
    }

    #[test]
    fn any_seed_order_reaches_the_same_fixpoint() {
        let mut interner = Interner::new();
        let f = loopy(&mut interner);

        let rpo = f.reverse_postorder();
        let reversed: Vec<BlockId> = rpo.iter().rev().copied().collect();
        let rotated: Vec<BlockId> = rpo.iter().cycle().skip(1).take(rpo.len()).copied().collect();

        let reference = solve(&Liveness, &f);
        for seed in [rpo.clone(), reversed.clone(), rotated.clone()] {
            let results = solve_from(&Liveness, &f, seed);
            assert_same(&f, &reference, &results);
        }

        let analysis = ReachingDefinitions::new(&f);
        let reference = solve(&analysis, &f);
        for seed in [rpo, reversed, rotated] {
            let results = solve_from(&analysis, &f, seed);
            assert_same(&f, &reference, &results);
        }
    }
}
