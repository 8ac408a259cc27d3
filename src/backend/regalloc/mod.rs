//! Register allocation: maps every virtual register to a machine register
//! or an rbp-relative spill slot, then rewrites the instruction stream so no
//! virtual registers remain. Two interchangeable strategies exist: a linear
//! scanner over live intervals and a naive everything-on-the-stack fallback.
//! Both route spilled operands through the reserved scratch registers, so
//! the rewrite of one instruction never disturbs another's values.

use crate::{
    backend::x64::{self, Instr, Reg, VReg, SCRATCH, WORD},
    fatal::ice,
    middle::cfg::VarId,
};

pub mod linear_scan;
pub mod stack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Linear scan over live intervals, spilling the interval that ends
    /// furthest away when the callee-saved pool runs dry.
    LinearScan,
    /// Every virtual register lives in its own stack slot.
    Stack,
}

pub fn allocate_program(program: x64::Program, strategy: Strategy) -> x64::Program {
    let x64::Program {
        main_class,
        main_func,
        vtables,
        functions,
    } = program;
    let functions = functions
        .into_iter()
        .map(|f| match strategy {
            Strategy::LinearScan => linear_scan::allocate(f),
            Strategy::Stack => stack::allocate(f),
        })
        .collect();
    x64::Program {
        main_class,
        main_func,
        vtables,
        functions,
    }
}

/// Where a virtual register ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Reg(Reg),
    /// rbp-relative byte offset (negative).
    Slot(i64),
}

/// Hands out spill slots below rbp and remembers how much frame they need.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    next: i64,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&mut self) -> i64 {
        self.next -= WORD;
        self.next
    }

    /// Total frame size, rounded so rsp stays 16-byte aligned at calls.
    pub fn size(&self) -> i64 {
        (-self.next + 15) & !15
    }
}

pub(crate) fn load_slot(offset: i64, reg: Reg) -> Instr {
    Instr::new(vec![], vec![VReg::Phys(reg)], move |_, d| {
        format!("movq {offset}(%rbp), {}", d[0])
    })
}

pub(crate) fn store_slot(reg: Reg, offset: i64) -> Instr {
    Instr::new(vec![VReg::Phys(reg)], vec![], move |u, _| {
        format!("movq {}, {offset}(%rbp)", u[0])
    })
}

/// Replaces the virtual registers of one instruction according to `locate`,
/// emitting reloads before and spill stores after. Scratch registers are
/// assigned per distinct spilled variable, skipping any register the
/// instruction itself reads.
pub(crate) fn rewrite_instr(
    instr: Instr,
    locate: &mut dyn FnMut(VarId) -> Location,
    out: &mut Vec<Instr>,
) {
    struct Mapped {
        var: VarId,
        reg: Reg,
        /// Slot offset when the variable is spilled.
        spilled: Option<i64>,
    }

    let mut forbidden: Vec<Reg> = instr
        .uses
        .iter()
        .filter_map(|r| match r {
            VReg::Phys(reg) => Some(*reg),
            VReg::Virtual(_) => None,
        })
        .collect();

    let mut mapped: Vec<Mapped> = Vec::new();
    for &vreg in instr.uses.iter().chain(&instr.defs) {
        let VReg::Virtual(var) = vreg else { continue };
        if mapped.iter().any(|m| m.var == var) {
            continue;
        }
        match locate(var) {
            Location::Reg(reg) => mapped.push(Mapped {
                var,
                reg,
                spilled: None,
            }),
            Location::Slot(offset) => {
                let reg = SCRATCH
                    .iter()
                    .copied()
                    .find(|r| !forbidden.contains(r))
                    .unwrap_or_else(|| ice!("instruction needs more scratch registers than exist"));
                forbidden.push(reg);
                mapped.push(Mapped {
                    var,
                    reg,
                    spilled: Some(offset),
                });
            }
        }
    }

    let resolve = |vreg: VReg| match vreg {
        VReg::Phys(_) => vreg,
        VReg::Virtual(var) => {
            let m = mapped
                .iter()
                .find(|m| m.var == var)
                .unwrap_or_else(|| ice!("operand escaped the rewrite map"));
            VReg::Phys(m.reg)
        }
    };

    for m in &mapped {
        if let Some(offset) = m.spilled {
            if instr.uses.contains(&VReg::Virtual(m.var)) {
                out.push(load_slot(offset, m.reg));
            }
        }
    }

    let uses: Vec<VReg> = instr.uses.iter().copied().map(resolve).collect();
    let defs: Vec<VReg> = instr.defs.iter().copied().map(resolve).collect();
    let stores: Vec<(Reg, i64)> = mapped
        .iter()
        .filter_map(|m| {
            let offset = m.spilled?;
            instr
                .defs
                .contains(&VReg::Virtual(m.var))
                .then_some((m.reg, offset))
        })
        .collect();

    out.push(instr.with_operands(uses, defs));
    for (reg, offset) in stores {
        out.push(store_slot(reg, offset));
    }
}
