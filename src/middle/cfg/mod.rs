//! The register-machine control-flow-graph IR. In this form the class-based
//! source program has been flattened into typed virtual registers, basic
//! blocks of straight-line statements, and explicit jump/branch/return
//! terminators; classes survive only as vtables and struct layouts.
//!
//! Every block holds exactly one terminator. Construction goes through
//! [`FunctionBuilder`], which keeps the terminator optional while a block is
//! open and refuses to seal a function with a missing (or doubled) one.

use strum::Display;

use crate::{
    fatal::ice,
    index::{simple_index, Index, IndexVec},
    intern::Symbol,
};

pub mod ast_lowering;
pub mod eval;
pub mod pretty_print;
pub mod serialize;

simple_index! {
    /// Identifies a basic block within its function.
    pub struct BlockId;
}

simple_index! {
    /// Identifies a virtual register (formal, local, or compiler temp)
    /// within its function.
    pub struct VarId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Class(Symbol),
    IntArray,
    /// A pointer to code, produced by virtual-method lookup.
    CodePtr,
}

/// A named virtual register together with its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarDecl {
    pub name: Symbol,
    pub ty: Type,
}

/// An operand: an integer literal or a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Imm(i64),
    Var(VarId),
}

impl Value {
    pub fn as_var(self) -> Option<VarId> {
        match self {
            Value::Var(v) => Some(v),
            Value::Imm(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BinOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "<")]
    LessThan,
}

/// A merge-point statement; exists only while the function is in SSA form
/// and must be eliminated before instruction selection. Operands are ordered
/// by predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phi {
    pub dst: VarId,
    pub args: Vec<(BlockId, Value)>,
}

/// An ordinary statement. Each one defines at most one virtual register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stm {
    Assign {
        dst: VarId,
        src: Value,
    },
    BinOp {
        dst: VarId,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    /// Indirect call through a code pointer previously produced by
    /// [`Stm::GetVirtualMethod`].
    Call {
        dst: VarId,
        code: VarId,
        args: Vec<Value>,
    },
    New {
        dst: VarId,
        class: Symbol,
    },
    ArrayLoad {
        dst: VarId,
        array: VarId,
        index: Value,
    },
    ArrayStore {
        array: VarId,
        index: Value,
        src: Value,
    },
    Print {
        value: Value,
    },
    /// Virtual-method lookup: fetch the code pointer for `method` out of the
    /// vtable of `object`, whose static class is `class`.
    GetVirtualMethod {
        dst: VarId,
        object: Value,
        class: Symbol,
        method: Symbol,
    },
}

impl Stm {
    /// The virtual register this statement defines, if any.
    pub fn def(&self) -> Option<VarId> {
        match *self {
            Stm::Assign { dst, .. }
            | Stm::BinOp { dst, .. }
            | Stm::Call { dst, .. }
            | Stm::New { dst, .. }
            | Stm::ArrayLoad { dst, .. }
            | Stm::GetVirtualMethod { dst, .. } => Some(dst),
            Stm::ArrayStore { .. } | Stm::Print { .. } => None,
        }
    }

    pub fn def_mut(&mut self) -> Option<&mut VarId> {
        match self {
            Stm::Assign { dst, .. }
            | Stm::BinOp { dst, .. }
            | Stm::Call { dst, .. }
            | Stm::New { dst, .. }
            | Stm::ArrayLoad { dst, .. }
            | Stm::GetVirtualMethod { dst, .. } => Some(dst),
            Stm::ArrayStore { .. } | Stm::Print { .. } => None,
        }
    }

    /// Calls `f` with every virtual register this statement reads, in
    /// operand order.
    pub fn for_each_use(&self, mut f: impl FnMut(VarId)) {
        let mut value = |v: &Value| {
            if let Value::Var(var) = v {
                f(*var);
            }
        };
        match self {
            Stm::Assign { src, .. } => value(src),
            Stm::BinOp { lhs, rhs, .. } => {
                value(lhs);
                value(rhs);
            }
            Stm::Call { code, args, .. } => {
                value(&Value::Var(*code));
                args.iter().for_each(value);
            }
            Stm::New { .. } => {}
            Stm::ArrayLoad { array, index, .. } => {
                value(&Value::Var(*array));
                value(index);
            }
            Stm::ArrayStore { array, index, src } => {
                value(&Value::Var(*array));
                value(index);
                value(src);
            }
            Stm::Print { value: v } => value(v),
            Stm::GetVirtualMethod { object, .. } => value(object),
        }
    }

    /// Rewrites every used operand through `f` (definitions are untouched).
    pub fn map_uses(&mut self, mut f: impl FnMut(Value) -> Value) {
        let mut var = |v: &mut VarId| {
            // register-only positions may not become immediates
            match f(Value::Var(*v)) {
                Value::Var(new) => *v = new,
                Value::Imm(_) => ice!("immediate substituted into a register-only operand"),
            }
        };
        match self {
            Stm::Assign { src, .. } => *src = f(*src),
            Stm::BinOp { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            Stm::Call { code, args, .. } => {
                var(code);
                for a in args {
                    *a = f(*a);
                }
            }
            Stm::New { .. } => {}
            Stm::ArrayLoad { array, index, .. } => {
                var(array);
                *index = f(*index);
            }
            Stm::ArrayStore { array, index, src } => {
                var(array);
                *index = f(*index);
                *src = f(*src);
            }
            Stm::Print { value } => *value = f(*value),
            Stm::GetVirtualMethod { object, .. } => *object = f(*object),
        }
    }
}

/// The single mandatory exit of a basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret(Value),
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match *self {
            Terminator::Jump(target) => vec![target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![then_block, else_block],
            Terminator::Ret(_) => vec![],
        }
    }

    pub fn for_each_use(&self, mut f: impl FnMut(VarId)) {
        match self {
            Terminator::Branch {
                cond: Value::Var(v),
                ..
            }
            | Terminator::Ret(Value::Var(v)) => f(*v),
            _ => {}
        }
    }

    pub fn map_uses(&mut self, mut f: impl FnMut(Value) -> Value) {
        match self {
            Terminator::Branch { cond, .. } => *cond = f(*cond),
            Terminator::Ret(value) => *value = f(*value),
            Terminator::Jump(_) => {}
        }
    }

    pub fn retarget(&mut self, from: BlockId, to: BlockId) {
        match self {
            Terminator::Jump(target) => {
                if *target == from {
                    *target = to;
                }
            }
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                if *then_block == from {
                    *then_block = to;
                }
                if *else_block == from {
                    *else_block = to;
                }
            }
            Terminator::Ret(_) => {}
        }
    }
}

/// A sealed basic block: phi statements (SSA form only), ordinary
/// statements, and exactly one terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub phis: Vec<Phi>,
    pub stms: Vec<Stm>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub ret: Type,
    /// The class the method was declared in.
    pub class: Symbol,
    pub name: Symbol,
    pub formals: Vec<VarId>,
    pub vars: IndexVec<VarId, VarDecl>,
    /// Block 0 is the entry point. The list is immutable once lowering
    /// finishes; optimization passes produce fresh functions.
    pub blocks: IndexVec<BlockId, Block>,
}

impl Function {
    pub fn entry() -> BlockId {
        BlockId::new(0)
    }

    pub fn fresh_var(&mut self, name: Symbol, ty: Type) -> VarId {
        self.vars.push(VarDecl { name, ty })
    }

    /// Predecessor lists, recomputed from the terminators.
    pub fn predecessors(&self) -> IndexVec<BlockId, Vec<BlockId>> {
        let mut preds: IndexVec<BlockId, Vec<BlockId>> = self.blocks.map_to(Vec::new());
        for (id, block) in self.blocks.enumerate() {
            for succ in block.terminator.successors() {
                preds[succ].push(id);
            }
        }
        preds
    }

    /// Reverse postorder over reachable blocks, starting at the entry.
    /// Iterative so deeply nested source programs cannot overflow the stack.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    pub fn postorder(&self) -> Vec<BlockId> {
        let mut visited = self.blocks.map_to(false);
        let mut order = Vec::with_capacity(self.blocks.len());
        // (block, next successor index to visit)
        let mut stack = vec![(Self::entry(), 0usize)];
        visited[Self::entry()] = true;

        while let Some((block, succ_idx)) = stack.pop() {
            let succs = self.blocks[block].terminator.successors();
            if let Some(&next) = succs.get(succ_idx) {
                stack.push((block, succ_idx + 1));
                if !visited[next] {
                    visited[next] = true;
                    stack.push((next, 0));
                }
            } else {
                order.push(block);
            }
        }
        order
    }

    /// Checks the structural invariants a well-formed function must satisfy.
    /// Sealed construction guarantees them; deserialized functions are
    /// re-checked through here.
    pub fn validate(&self) -> Result<(), String> {
        if self.blocks.is_empty() {
            return Err("function has no blocks".into());
        }
        for (id, block) in self.blocks.enumerate() {
            for succ in block.terminator.successors() {
                if !self.blocks.contains_index(succ) {
                    return Err(format!(
                        "block {} jumps to nonexistent block {}",
                        id.index(),
                        succ.index()
                    ));
                }
            }
            for phi in &block.phis {
                if !self.vars.contains_index(phi.dst) {
                    return Err(format!("phi in block {} defines unknown var", id.index()));
                }
                for &(pred, value) in &phi.args {
                    let var_ok = value
                        .as_var()
                        .map_or(true, |v| self.vars.contains_index(v));
                    if !self.blocks.contains_index(pred) || !var_ok {
                        return Err(format!(
                            "phi in block {} has an out-of-range argument",
                            id.index()
                        ));
                    }
                }
            }
            for stm in &block.stms {
                let mut ok = stm.def().map_or(true, |d| self.vars.contains_index(d));
                stm.for_each_use(|v| ok &= self.vars.contains_index(v));
                if !ok {
                    return Err(format!(
                        "statement in block {} mentions unknown var",
                        id.index()
                    ));
                }
            }
        }
        for &formal in &self.formals {
            if !self.vars.contains_index(formal) {
                return Err("formal refers to unknown var".into());
            }
        }
        Ok(())
    }
}

/// One dispatch-table entry. The position of an entry inside its table is
/// the method's fixed dispatch offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtableEntry {
    pub ret: Type,
    /// The class whose implementation this entry points at (the defining
    /// class, not necessarily the table's owner).
    pub class: Symbol,
    pub method: Symbol,
    pub params: Vec<Type>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vtable {
    pub class: Symbol,
    pub entries: Vec<VtableEntry>,
}

/// The runtime layout source for a class: declared fields, inherited ones
/// first. The leading vtable-pointer word is implicit and never listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    pub class: Symbol,
    pub fields: Vec<VarDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub main_class: Symbol,
    pub main_func: Symbol,
    pub vtables: Vec<Vtable>,
    pub structs: Vec<StructDef>,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn vtable(&self, class: Symbol) -> Option<&Vtable> {
        self.vtables.iter().find(|v| v.class == class)
    }

    pub fn struct_def(&self, class: Symbol) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.class == class)
    }

    pub fn function(&self, class: Symbol, name: Symbol) -> Option<&Function> {
        self.functions
            .iter()
            .find(|f| f.class == class && f.name == name)
    }
}

/// Builds one function, enforcing the construction contract: statements may
/// only be appended to an existing, still-open block, and each block accepts
/// exactly one terminator.
#[derive(Debug)]
pub struct FunctionBuilder {
    ret: Type,
    class: Symbol,
    name: Symbol,
    formals: Vec<VarId>,
    vars: IndexVec<VarId, VarDecl>,
    blocks: IndexVec<BlockId, OpenBlock>,
}

#[derive(Debug, Default)]
struct OpenBlock {
    stms: Vec<Stm>,
    terminator: Option<Terminator>,
}

impl FunctionBuilder {
    pub fn new(ret: Type, class: Symbol, name: Symbol) -> Self {
        Self {
            ret,
            class,
            name,
            formals: Vec::new(),
            vars: IndexVec::new(),
            blocks: IndexVec::new(),
        }
    }

    pub fn add_var(&mut self, name: Symbol, ty: Type) -> VarId {
        self.vars.push(VarDecl { name, ty })
    }

    pub fn add_formal(&mut self, name: Symbol, ty: Type) -> VarId {
        let var = self.add_var(name, ty);
        self.formals.push(var);
        var
    }

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(OpenBlock::default())
    }

    pub fn push(&mut self, block: BlockId, stm: Stm) {
        let b = &mut self.blocks[block];
        if b.terminator.is_some() {
            ice!(
                "statement appended to block {} after its terminator",
                block.index()
            );
        }
        b.stms.push(stm);
    }

    pub fn terminate(&mut self, block: BlockId, terminator: Terminator) {
        let b = &mut self.blocks[block];
        if b.terminator.is_some() {
            ice!("second terminator for block {}", block.index());
        }
        b.terminator = Some(terminator);
    }

    /// Seals every block, producing an immutable [`Function`].
    pub fn finish(self) -> Function {
        let blocks = self
            .blocks
            .enumerate()
            .map(|(id, open)| Block {
                phis: Vec::new(),
                stms: open.stms.clone(),
                terminator: open
                    .terminator
                    .clone()
                    .unwrap_or_else(|| ice!("block {} sealed without a terminator", id.index())),
            })
            .collect();

        Function {
            ret: self.ret,
            class: self.class,
            name: self.name,
            formals: self.formals,
            vars: self.vars,
            blocks,
        }
    }
}
