//! Reaching definitions: which assignments of a variable may still be the
//! one in effect at a program point.

use hashbrown::HashMap;

use crate::{
    middle::cfg::{BlockId, Function, VarId},
    middle::dataflow::{Analysis, Direction, Loc, Meet},
};

/// One definition site: `var` is assigned at `loc` of `block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Def {
    pub var: VarId,
    pub block: BlockId,
    pub loc: Loc,
}

pub struct ReachingDefinitions {
    defs_by_var: HashMap<VarId, Vec<Def>>,
}

impl ReachingDefinitions {
    pub fn new(function: &Function) -> Self {
        let mut defs_by_var: HashMap<VarId, Vec<Def>> = HashMap::new();
        for (block, b) in function.blocks.enumerate() {
            for (i, phi) in b.phis.iter().enumerate() {
                defs_by_var.entry(phi.dst).or_default().push(Def {
                    var: phi.dst,
                    block,
                    loc: Loc::Phi(i),
                });
            }
            for (i, stm) in b.stms.iter().enumerate() {
                if let Some(var) = stm.def() {
                    defs_by_var.entry(var).or_default().push(Def {
                        var,
                        block,
                        loc: Loc::Stm(i),
                    });
                }
            }
        }
        Self { defs_by_var }
    }

    /// Every definition site of `var` in the function.
    pub fn defs_of(&self, var: VarId) -> &[Def] {
        self.defs_by_var.get(&var).map_or(&[], Vec::as_slice)
    }
}

impl Analysis for ReachingDefinitions {
    type Fact = Def;

    const DIRECTION: Direction = Direction::Forward;
    const MEET: Meet = Meet::Union;

    fn generates(&self, function: &Function, block: BlockId, loc: Loc) -> Vec<Def> {
        let b = &function.blocks[block];
        let var = match loc {
            Loc::Phi(i) => Some(b.phis[i].dst),
            Loc::Stm(i) => b.stms[i].def(),
            Loc::Terminator => None,
        };
        var.map_or(Vec::new(), |var| vec![Def { var, block, loc }])
    }

    /// A definition kills every other definition of the same variable.
    fn kills(&self, function: &Function, block: BlockId, loc: Loc) -> Vec<Def> {
        let b = &function.blocks[block];
        let var = match loc {
            Loc::Phi(i) => Some(b.phis[i].dst),
            Loc::Stm(i) => b.stms[i].def(),
            Loc::Terminator => None,
        };
        match var {
            Some(var) => self
                .defs_of(var)
                .iter()
                .filter(|def| !(def.block == block && def.loc == loc))
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }
}
