//! The x86-64 instruction representation.
//!
//! Instructions keep their operands as explicit use and def lists over
//! [`VReg`]s, alongside a rendering closure that formats the final assembly
//! text from whatever the register allocator substituted into those lists.
//! The allocators therefore never parse or rewrite text; they swap registers
//! in the lists and the closure prints the right thing.

use core::fmt;
use std::fmt::Write as _;

use colored::Colorize;
use strum::Display;

use crate::{
    index::{Index, IndexVec},
    intern::{Interner, Symbol},
    middle::cfg::{BlockId, VarDecl, VarId, Vtable},
};

pub const WORD: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    pub fn operand(self) -> String {
        format!("%{self}")
    }
}

/// Integer argument registers in call order, per the System V ABI.
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

pub const RET_REG: Reg = Reg::Rax;

/// What the linear scanner hands out. All callee-saved, so values survive
/// the calls this instruction set is full of.
pub const ALLOCATABLE: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Reload scratch for spilled operands. Never allocated, so always free at
/// the point of use; rax only backs the third operand of an array store and
/// is skipped whenever an instruction touches it physically.
pub const SCRATCH: [Reg; 3] = [Reg::R10, Reg::R11, Reg::Rax];

/// Everything a call may clobber.
pub const CALLER_SAVED: [Reg; 9] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VReg {
    Virtual(VarId),
    Phys(Reg),
}

pub type EmitFn = Box<dyn Fn(&[String], &[String]) -> String>;

/// One machine instruction: operand lists plus the closure that renders it.
pub struct Instr {
    pub uses: Vec<VReg>,
    pub defs: Vec<VReg>,
    emit: EmitFn,
}

impl Instr {
    pub fn new(
        uses: Vec<VReg>,
        defs: Vec<VReg>,
        emit: impl Fn(&[String], &[String]) -> String + 'static,
    ) -> Self {
        Self {
            uses,
            defs,
            emit: Box::new(emit),
        }
    }

    /// The same instruction over different operands; the rendering closure
    /// carries over.
    pub fn with_operands(mut self, uses: Vec<VReg>, defs: Vec<VReg>) -> Self {
        self.uses = uses;
        self.defs = defs;
        self
    }

    pub fn render(&self, name: &mut dyn FnMut(VReg) -> String) -> String {
        let uses: Vec<String> = self.uses.iter().map(|&r| name(r)).collect();
        let defs: Vec<String> = self.defs.iter().map(|&r| name(r)).collect();
        (self.emit)(&uses, &defs)
    }
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instr")
            .field("uses", &self.uses)
            .field("defs", &self.defs)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Cond {
    #[strum(serialize = "je")]
    Eq,
    #[strum(serialize = "jne")]
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Jmp(BlockId),
    /// Conditional jump to `then_block` on `cond`, falling through (via an
    /// explicit jump) to `else_block`.
    JCond {
        cond: Cond,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret,
}

impl Transfer {
    pub fn successors(&self) -> Vec<BlockId> {
        match *self {
            Transfer::Jmp(target) => vec![target],
            Transfer::JCond {
                then_block,
                else_block,
                ..
            } => vec![then_block, else_block],
            Transfer::Ret => vec![],
        }
    }
}

#[derive(Debug)]
pub struct Block {
    pub instrs: Vec<Instr>,
    pub transfer: Transfer,
}

/// Stack-frame shape, filled in by register allocation.
#[derive(Debug, Default, Clone)]
pub struct Frame {
    /// Bytes subtracted from rsp on entry; multiple of 16 so calls stay
    /// aligned.
    pub size: i64,
    /// Callee-saved registers the function uses, with the rbp-relative slot
    /// each is preserved in.
    pub saved: Vec<(Reg, i64)>,
}

#[derive(Debug)]
pub struct Function {
    pub class: Symbol,
    pub name: Symbol,
    pub formals: Vec<VarId>,
    pub vars: IndexVec<VarId, VarDecl>,
    pub blocks: IndexVec<BlockId, Block>,
    pub frame: Frame,
}

impl Function {
    /// Colored listing with virtual registers shown by their source names;
    /// feeds `--dump x64` and the emitter's comment embedding.
    pub fn dump(&self, interner: &Interner) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {}{}{}",
            "fn".magenta(),
            interner.resolve(self.class).blue(),
            "_".white(),
            interner.resolve(self.name).blue()
        );
        for (id, block) in self.blocks.enumerate() {
            let _ = writeln!(out, "{}", format!(".block_{}:", id.index()).bright_red());
            for instr in &block.instrs {
                let mut names = |reg: VReg| match reg {
                    VReg::Virtual(var) => {
                        // compiler temps already carry a % prefix
                        let name = interner.resolve(self.vars[var].name);
                        if name.starts_with('%') {
                            name.yellow().to_string()
                        } else {
                            format!("%{name}").yellow().to_string()
                        }
                    }
                    VReg::Phys(reg) => reg.operand(),
                };
                let _ = writeln!(out, "    {}", instr.render(&mut names));
            }
            let transfer = match block.transfer {
                Transfer::Jmp(target) => format!("jmp .block_{}", target.index()),
                Transfer::JCond {
                    cond,
                    then_block,
                    else_block,
                } => format!(
                    "{cond} .block_{} .block_{}",
                    then_block.index(),
                    else_block.index()
                ),
                Transfer::Ret => "ret".to_owned(),
            };
            let _ = writeln!(out, "    {}", transfer.cyan());
        }
        out
    }
}

#[derive(Debug)]
pub struct Program {
    pub main_class: Symbol,
    pub main_func: Symbol,
    pub vtables: Vec<Vtable>,
    pub functions: Vec<Function>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    #[test]
    fn rendering_substitutes_the_current_operands() {
        let a = VarId::new(0);
        let b = VarId::new(1);
        let instr = Instr::new(
            vec![VReg::Virtual(a)],
            vec![VReg::Virtual(b)],
            |u, d| format!("movq {}, {}", u[0], d[0]),
        );

        let mut names = |r: VReg| match r {
            VReg::Virtual(v) if v == a => "%r10".to_owned(),
            VReg::Virtual(_) => "%r11".to_owned(),
            VReg::Phys(reg) => reg.operand(),
        };
        assert_eq!(instr.render(&mut names), "movq %r10, %r11");

        // rebinding operands reuses the closure
        let instr = instr.with_operands(vec![VReg::Phys(Reg::Rbx)], vec![VReg::Phys(Reg::R12)]);
        assert_eq!(instr.render(&mut names), "movq %rbx, %r12");
    }
}
