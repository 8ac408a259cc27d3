//! SSA construction and the dominance machinery behind it.
//!
//! Dominators come from the Cooper-Harvey-Kennedy iterative scheme: walk the
//! blocks in reverse postorder intersecting predecessor dominators until the
//! immediate-dominator table stops changing. Dominance frontiers fall out of
//! a runner walk from each join block's predecessors up to its idom.
//!
//! Construction then inserts phis at the iterated dominance frontier of
//! every variable assigned in more than one block (formals count as assigned
//! at the entry) and renames along the dominator tree, giving each
//! assignment a fresh variable and rewriting every use to the version in
//! scope. The walk is an explicit stack, with scope pops recorded on the way
//! down.

use hashbrown::{HashMap, HashSet};

use crate::{
    fatal::ice,
    index::{Index, IndexVec},
    intern::Interner,
    middle::cfg::{BlockId, Function, Phi, Program, Value, VarId},
};

pub mod destruct;
pub mod optimize;

#[derive(Debug)]
pub struct Dominance {
    /// Immediate dominator of each block. The entry (and any unreachable
    /// block) maps to itself.
    pub idom: IndexVec<BlockId, BlockId>,
    pub frontier: IndexVec<BlockId, Vec<BlockId>>,
    /// Dominator-tree children, for the rename walk.
    pub children: IndexVec<BlockId, Vec<BlockId>>,
}

impl Dominance {
    pub fn compute(function: &Function) -> Self {
        let rpo = function.reverse_postorder();
        let preds = function.predecessors();
        let entry = Function::entry();

        let mut order: IndexVec<BlockId, usize> = function.blocks.map_to(usize::MAX);
        for (i, &block) in rpo.iter().enumerate() {
            order[block] = i;
        }

        let mut idom: IndexVec<BlockId, Option<BlockId>> = function.blocks.map_to(None);
        idom[entry] = Some(entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom = None;
                for &pred in &preds[block] {
                    if idom[pred].is_none() {
                        // not processed yet this round
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(pred, current, &idom, &order),
                    });
                }
                let new_idom = new_idom
                    .unwrap_or_else(|| ice!("reachable block with no reachable predecessor"));
                if idom[block] != Some(new_idom) {
                    idom[block] = Some(new_idom);
                    changed = true;
                }
            }
        }

        let mut frontier: IndexVec<BlockId, Vec<BlockId>> = function.blocks.map_to(Vec::new());
        for &block in &rpo {
            if preds[block].len() < 2 {
                continue;
            }
            let stop = idom[block].unwrap_or(block);
            for &pred in &preds[block] {
                if idom[pred].is_none() {
                    continue;
                }
                let mut runner = pred;
                while runner != stop {
                    if !frontier[runner].contains(&block) {
                        frontier[runner].push(block);
                    }
                    runner = idom[runner].unwrap_or(runner);
                }
            }
        }

        let mut children: IndexVec<BlockId, Vec<BlockId>> = function.blocks.map_to(Vec::new());
        for &block in rpo.iter().skip(1) {
            if let Some(parent) = idom[block] {
                children[parent].push(block);
            }
        }

        let idom = idom
            .enumerate()
            .map(|(block, &parent)| parent.unwrap_or(block))
            .collect::<Vec<_>>()
            .into_iter()
            .collect();

        Self {
            idom,
            frontier,
            children,
        }
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut runner = b;
        loop {
            if runner == a {
                return true;
            }
            let parent = self.idom[runner];
            if parent == runner {
                return false;
            }
            runner = parent;
        }
    }

    /// The iterated dominance frontier of a set of blocks: close the
    /// frontier under itself, since an inserted phi is a definition too.
    pub fn iterated_frontier(&self, seeds: &[BlockId]) -> Vec<BlockId> {
        let mut result: HashSet<BlockId> = HashSet::new();
        let mut work: Vec<BlockId> = seeds.to_vec();
        while let Some(block) = work.pop() {
            for &join in &self.frontier[block] {
                if result.insert(join) {
                    work.push(join);
                }
            }
        }
        let mut result: Vec<BlockId> = result.into_iter().collect();
        result.sort();
        result
    }
}

fn intersect(
    mut a: BlockId,
    mut b: BlockId,
    idom: &IndexVec<BlockId, Option<BlockId>>,
    order: &IndexVec<BlockId, usize>,
) -> BlockId {
    while a != b {
        while order[a] > order[b] {
            a = idom[a].unwrap_or_else(|| ice!("idom walk left the processed region"));
        }
        while order[b] > order[a] {
            b = idom[b].unwrap_or_else(|| ice!("idom walk left the processed region"));
        }
    }
    a
}

pub fn construct_program(program: &mut Program, interner: &mut Interner) {
    for function in &mut program.functions {
        construct(function, interner);
    }
}

/// Rewrites one function into SSA form in place.
pub fn construct(function: &mut Function, interner: &mut Interner) {
    for (_, block) in function.blocks.enumerate() {
        if !block.phis.is_empty() {
            ice!("function is already in SSA form");
        }
    }

    let dom = Dominance::compute(function);
    let preds = function.predecessors();
    let entry = Function::entry();

    // definition sites, with formals counting as entry definitions
    let mut def_blocks: HashMap<VarId, Vec<BlockId>> = HashMap::new();
    for &formal in &function.formals {
        def_blocks.entry(formal).or_default().push(entry);
    }
    for (id, block) in function.blocks.enumerate() {
        for stm in &block.stms {
            if let Some(var) = stm.def() {
                let sites = def_blocks.entry(var).or_default();
                if !sites.contains(&id) {
                    sites.push(id);
                }
            }
        }
    }

    // phis for every variable assigned in more than one block; remember each
    // phi's source variable so argument slots can be filled from any
    // predecessor during renaming
    let mut phi_bases: HashMap<(BlockId, usize), VarId> = HashMap::new();
    let mut vars: Vec<VarId> = def_blocks.keys().copied().collect();
    vars.sort();
    for var in vars {
        let sites = &def_blocks[&var];
        if sites.len() < 2 {
            continue;
        }
        for join in dom.iterated_frontier(sites) {
            let block = &mut function.blocks[join];
            block.phis.push(Phi {
                dst: var,
                args: preds[join].iter().map(|&p| (p, Value::Var(var))).collect(),
            });
            phi_bases.insert((join, block.phis.len() - 1), var);
        }
    }

    rename(function, &dom, &phi_bases, interner);
}

struct Renamer<'a> {
    interner: &'a mut Interner,
    /// Version stack per source variable. An empty stack reads as the
    /// source variable itself.
    stacks: HashMap<VarId, Vec<VarId>>,
    versions: HashMap<VarId, usize>,
}

impl Renamer<'_> {
    fn top(&self, base: VarId) -> VarId {
        self.stacks
            .get(&base)
            .and_then(|stack| stack.last().copied())
            .unwrap_or(base)
    }

    /// Allocates the next version of `base` and makes it current.
    fn define(&mut self, function: &mut Function, base: VarId) -> VarId {
        let version = self.versions.entry(base).or_insert(0);
        *version += 1;
        let name = format!(
            "{}.{}",
            self.interner.resolve(function.vars[base].name).to_owned(),
            version
        );
        let name = self.interner.intern(&name);
        let new = function.fresh_var(name, function.vars[base].ty);
        self.stacks.entry(base).or_default().push(new);
        new
    }
}

fn rename(
    function: &mut Function,
    dom: &Dominance,
    phi_bases: &HashMap<(BlockId, usize), VarId>,
    interner: &mut Interner,
) {
    let mut renamer = Renamer {
        interner,
        stacks: HashMap::new(),
        versions: HashMap::new(),
    };

    // formals are version zero of themselves
    for &formal in &function.formals {
        renamer.stacks.entry(formal).or_default().push(formal);
    }

    enum Visit {
        Enter(BlockId),
        // bases whose stacks must pop when the subtree is done
        Exit(Vec<VarId>),
    }

    let mut walk = vec![Visit::Enter(Function::entry())];
    while let Some(visit) = walk.pop() {
        let block = match visit {
            Visit::Enter(block) => block,
            Visit::Exit(bases) => {
                for base in bases {
                    let stack = renamer
                        .stacks
                        .get_mut(&base)
                        .unwrap_or_else(|| ice!("scope pop for a variable never pushed"));
                    stack.pop();
                }
                continue;
            }
        };

        let mut pushed = Vec::new();

        for i in 0..function.blocks[block].phis.len() {
            let base = phi_bases[&(block, i)];
            let new = renamer.define(function, base);
            function.blocks[block].phis[i].dst = new;
            pushed.push(base);
        }

        for i in 0..function.blocks[block].stms.len() {
            let mut stm = function.blocks[block].stms[i].clone();
            stm.map_uses(|value| match value {
                Value::Var(var) => Value::Var(renamer.top(var)),
                imm => imm,
            });
            if let Some(dst) = stm.def() {
                let new = renamer.define(function, dst);
                if let Some(slot) = stm.def_mut() {
                    *slot = new;
                }
                pushed.push(dst);
            }
            function.blocks[block].stms[i] = stm;
        }

        function.blocks[block]
            .terminator
            .map_uses(|value| match value {
                Value::Var(var) => Value::Var(renamer.top(var)),
                imm => imm,
            });

        // fill our slot in every successor's phis
        for succ in function.blocks[block].terminator.successors() {
            for i in 0..function.blocks[succ].phis.len() {
                let base = phi_bases[&(succ, i)];
                let current = renamer.top(base);
                for arg in &mut function.blocks[succ].phis[i].args {
                    if arg.0 == block {
                        arg.1 = Value::Var(current);
                    }
                }
            }
        }

        walk.push(Visit::Exit(pushed));
        for &child in dom.children[block].iter().rev() {
            walk.push(Visit::Enter(child));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::sample,
        middle::cfg::{ast_lowering, eval, FunctionBuilder, Stm, Terminator, Type},
    };

    fn diamond(interner: &mut Interner) -> Function {
        // entry: x = 1; br c left right
        // left:  x = 2; jmp merge
        // right: jmp merge
        // merge: ret x
        let mut b = FunctionBuilder::new(Type::Int, interner.intern("C"), interner.intern("m"));
        let c = b.add_formal(interner.intern("c"), Type::Int);
        let x = b.add_var(interner.intern("x"), Type::Int);

        let entry = b.new_block();
        let left = b.new_block();
        let right = b.new_block();
        let merge = b.new_block();
        b.push(
            entry,
            Stm::Assign {
                dst: x,
                src: Value::Imm(1),
            },
        );
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
            Stm::Assign {
                dst: x,
                src: Value::Imm(2),
            },
        );
        b.terminate(left, Terminator::Jump(merge));
        b.terminate(right, Terminator::Jump(merge));
        b.terminate(merge, Terminator::Ret(Value::Var(x)));
        b.finish()
    }

    #[test]
    fn dominators_of_a_diamond() {
        let mut interner = Interner::new();
        let f = diamond(&mut interner);
        let dom = Dominance::compute(&f);

        let entry = BlockId::new(0);
        let left = BlockId::new(1);
        let right = BlockId::new(2);
        let merge = BlockId::new(3);

        assert_eq!(dom.idom[left], entry);
        assert_eq!(dom.idom[right], entry);
        // neither arm dominates the merge
        assert_eq!(dom.idom[merge], entry);

        assert_eq!(dom.frontier[left], vec![merge]);
        assert_eq!(dom.frontier[right], vec![merge]);
        assert!(dom.frontier[entry].is_empty());

        assert!(dom.dominates(entry, merge));
        assert!(!dom.dominates(left, merge));
    }

    #[test]
    fn construction_places_one_phi_at_the_join() {
        let mut interner = Interner::new();
        let mut f = diamond(&mut interner);
        construct(&mut f, &mut interner);

        let merge = BlockId::new(3);
        assert_eq!(f.blocks[merge].phis.len(), 1);
        assert_eq!(f.blocks[merge].phis[0].args.len(), 2);

        // no phis anywhere else
        for (id, block) in f.blocks.enumerate() {
            if id != merge {
                assert!(block.phis.is_empty());
            }
        }

        // the return reads the phi's destination
        let phi_dst = f.blocks[merge].phis[0].dst;
        assert_eq!(
            f.blocks[merge].terminator,
            Terminator::Ret(Value::Var(phi_dst))
        );
    }

    #[test]
    fn every_variable_has_at_most_one_definition() {
        let mut interner = Interner::new();
        let ast = sample::factorial(&mut interner);
        let mut program = ast_lowering::lower_program(&ast, &mut interner);
        construct_program(&mut program, &mut interner);

        for f in &program.functions {
            let mut defined: HashSet<VarId> = HashSet::new();
            for (_, block) in f.blocks.enumerate() {
                for phi in &block.phis {
                    assert!(defined.insert(phi.dst), "phi destination defined twice");
                }
                for stm in &block.stms {
                    if let Some(var) = stm.def() {
                        assert!(defined.insert(var), "variable defined twice");
                    }
                }
            }
            f.validate().unwrap();
        }
    }

    #[test]
    fn construction_preserves_what_the_program_prints() {
        let mut interner = Interner::new();
        let ast = sample::factorial(&mut interner);
        let mut program = ast_lowering::lower_program(&ast, &mut interner);
        let before = eval::run(&program);
        construct_program(&mut program, &mut interner);
        assert_eq!(eval::run(&program), before);
        assert_eq!(before, vec![3628800]);
    }
}
