//! Maximal-munch instruction selection from the phi-free CFG IR.
//!
//! Each statement becomes a short fixed sequence of x86-64 instructions
//! over virtual registers. Binary arithmetic goes destination-in-place
//! (`movq lhs, dst; addq rhs, dst`), comparisons go through `setl`, object
//! allocation and printing call into the runtime (`mj_alloc`, `mj_print`),
//! and virtual dispatch is two loads: the vtable pointer out of the object,
//! then the code pointer at the method's fixed offset. Calls pass at most
//! six arguments in registers; more is a contract violation upstream.

use crate::{
    backend::{
        layout::{Layout, VTABLE_PTR_OFFSET},
        x64::{
            self, Block, Cond, Frame, Instr, Reg, Transfer, VReg, ARG_REGS, CALLER_SAVED,
            RET_REG, WORD,
        },
    },
    fatal::ice,
    index::IndexVec,
    intern::Interner,
    middle::cfg::{self, BinOp, Function, Stm, Terminator, Type, Value, VarDecl, VarId},
};

pub fn munch_program(program: &cfg::Program, interner: &mut Interner) -> x64::Program {
    let layout = Layout::of_program(program);
    let functions = program
        .functions
        .iter()
        .map(|f| munch_function(f, &layout, interner))
        .collect();
    x64::Program {
        main_class: program.main_class,
        main_func: program.main_func,
        vtables: program.vtables.clone(),
        functions,
    }
}

pub fn munch_function(
    function: &Function,
    layout: &Layout,
    interner: &mut Interner,
) -> x64::Function {
    if function.formals.len() > ARG_REGS.len() {
        ice!("function takes more arguments than there are argument registers");
    }

    let mut muncher = Muncher {
        layout,
        interner,
        vars: function.vars.clone(),
        out: Vec::new(),
    };

    let mut blocks = IndexVec::new();
    for (id, block) in function.blocks.enumerate() {
        if !block.phis.is_empty() {
            ice!("phi survived to instruction selection");
        }

        // the entry block starts by moving the arguments home
        if id == Function::entry() {
            for (i, &formal) in function.formals.iter().enumerate() {
                muncher.push(mov(VReg::Phys(ARG_REGS[i]), VReg::Virtual(formal)));
            }
        }

        for stm in &block.stms {
            muncher.stm(stm);
        }
        let transfer = muncher.terminator(&block.terminator);
        blocks.push(Block {
            instrs: core::mem::take(&mut muncher.out),
            transfer,
        });
    }

    x64::Function {
        class: function.class,
        name: function.name,
        formals: function.formals.clone(),
        vars: muncher.vars,
        blocks,
        frame: Frame::default(),
    }
}

fn mov(src: VReg, dst: VReg) -> Instr {
    Instr::new(vec![src], vec![dst], |u, d| {
        format!("movq {}, {}", u[0], d[0])
    })
}

fn mov_imm(imm: i64, dst: VReg) -> Instr {
    Instr::new(vec![], vec![dst], move |_, d| format!("movq ${imm}, {}", d[0]))
}

/// A call to a known label: arguments are already in the argument
/// registers, and everything caller-saved is clobbered.
fn call_direct(label: &'static str, nargs: usize) -> Instr {
    let uses = ARG_REGS[..nargs].iter().copied().map(VReg::Phys).collect();
    let defs = CALLER_SAVED.iter().copied().map(VReg::Phys).collect();
    Instr::new(uses, defs, move |_, _| format!("call {label}"))
}

struct Muncher<'a> {
    layout: &'a Layout,
    interner: &'a mut Interner,
    vars: IndexVec<VarId, VarDecl>,
    out: Vec<Instr>,
}

impl Muncher<'_> {
    fn push(&mut self, instr: Instr) {
        self.out.push(instr);
    }

    fn temp(&mut self, prefix: &str, ty: Type) -> VarId {
        let name = self.interner.fresh(prefix);
        self.vars.push(VarDecl { name, ty })
    }

    fn value_into(&mut self, src: Value, dst: VReg) {
        match src {
            Value::Imm(imm) => self.push(mov_imm(imm, dst)),
            Value::Var(var) => self.push(mov(VReg::Virtual(var), dst)),
        }
    }

    fn force_reg(&mut self, value: Value) -> VReg {
        match value {
            Value::Var(var) => VReg::Virtual(var),
            Value::Imm(imm) => {
                let temp = VReg::Virtual(self.temp("imm", Type::Int));
                self.push(mov_imm(imm, temp));
                temp
            }
        }
    }

    fn stm(&mut self, stm: &Stm) {
        match *stm {
            Stm::Assign { dst, src } => self.value_into(src, VReg::Virtual(dst)),
            Stm::BinOp {
                dst,
                op: op @ (BinOp::Add | BinOp::Sub | BinOp::Mul),
                lhs,
                rhs,
            } => self.arith(dst, op, lhs, rhs),
            Stm::BinOp {
                dst,
                op: BinOp::LessThan,
                lhs,
                rhs,
            } => self.less_than(dst, lhs, rhs),
            Stm::Call {
                dst,
                code,
                ref args,
            } => {
                if args.len() > ARG_REGS.len() {
                    ice!("call with more arguments than argument registers");
                }
                for (i, &arg) in args.iter().enumerate() {
                    self.value_into(arg, VReg::Phys(ARG_REGS[i]));
                }
                let mut uses = vec![VReg::Virtual(code)];
                uses.extend(ARG_REGS[..args.len()].iter().copied().map(VReg::Phys));
                let defs = CALLER_SAVED.iter().copied().map(VReg::Phys).collect();
                self.push(Instr::new(uses, defs, |u, _| format!("call *{}", u[0])));
                self.push(mov(VReg::Phys(RET_REG), VReg::Virtual(dst)));
            }
            Stm::New { dst, class } => {
                self.push(mov_imm(self.layout.size_of(class), VReg::Phys(Reg::Rdi)));
                let label = format!(".V_{}", self.interner.resolve(class));
                self.push(Instr::new(
                    vec![],
                    vec![VReg::Phys(Reg::Rsi)],
                    move |_, d| format!("leaq {label}(%rip), {}", d[0]),
                ));
                self.push(call_direct("mj_alloc", 2));
                self.push(mov(VReg::Phys(RET_REG), VReg::Virtual(dst)));
            }
            Stm::ArrayLoad { dst, array, index } => {
                let instr = match index {
                    Value::Imm(i) => {
                        let offset = i * WORD;
                        Instr::new(
                            vec![VReg::Virtual(array)],
                            vec![VReg::Virtual(dst)],
                            move |u, d| format!("movq {offset}({}), {}", u[0], d[0]),
                        )
                    }
                    Value::Var(i) => Instr::new(
                        vec![VReg::Virtual(array), VReg::Virtual(i)],
                        vec![VReg::Virtual(dst)],
                        |u, d| format!("movq ({},{},8), {}", u[0], u[1], d[0]),
                    ),
                };
                self.push(instr);
            }
            Stm::ArrayStore { array, index, src } => {
                let instr = match (index, src) {
                    (Value::Imm(i), Value::Imm(v)) => {
                        let offset = i * WORD;
                        Instr::new(vec![VReg::Virtual(array)], vec![], move |u, _| {
                            format!("movq ${v}, {offset}({})", u[0])
                        })
                    }
                    (Value::Imm(i), Value::Var(s)) => {
                        let offset = i * WORD;
                        Instr::new(
                            vec![VReg::Virtual(s), VReg::Virtual(array)],
                            vec![],
                            move |u, _| format!("movq {}, {offset}({})", u[0], u[1]),
                        )
                    }
                    (Value::Var(i), Value::Imm(v)) => Instr::new(
                        vec![VReg::Virtual(array), VReg::Virtual(i)],
                        vec![],
                        move |u, _| format!("movq ${v}, ({},{},8)", u[0], u[1]),
                    ),
                    (Value::Var(i), Value::Var(s)) => Instr::new(
                        vec![VReg::Virtual(s), VReg::Virtual(array), VReg::Virtual(i)],
                        vec![],
                        |u, _| format!("movq {}, ({},{},8)", u[0], u[1], u[2]),
                    ),
                };
                self.push(instr);
            }
            Stm::Print { value } => {
                self.value_into(value, VReg::Phys(Reg::Rdi));
                self.push(call_direct("mj_print", 1));
            }
            Stm::GetVirtualMethod {
                dst,
                object,
                class,
                method,
            } => {
                let object = match object {
                    Value::Var(var) => var,
                    Value::Imm(_) => ice!("virtual lookup on an immediate"),
                };
                let vtable = self.temp("vt", Type::CodePtr);
                self.push(Instr::new(
                    vec![VReg::Virtual(object)],
                    vec![VReg::Virtual(vtable)],
                    |u, d| format!("movq {VTABLE_PTR_OFFSET}({}), {}", u[0], d[0]),
                ));
                let offset = self.layout.method_offset(class, method);
                self.push(Instr::new(
                    vec![VReg::Virtual(vtable)],
                    vec![VReg::Virtual(dst)],
                    move |u, d| format!("movq {offset}({}), {}", u[0], d[0]),
                ));
            }
        }
    }

    /// `dst = lhs op rhs` as `movq lhs, dst; opq rhs, dst`, snapshotting rhs
    /// first when the move would clobber it.
    fn arith(&mut self, dst: VarId, op: BinOp, lhs: Value, rhs: Value) {
        let mnemonic = match op {
            BinOp::Add => "addq",
            BinOp::Sub => "subq",
            BinOp::Mul => "imulq",
            BinOp::LessThan => ice!("comparison munched as arithmetic"),
        };

        let rhs = if rhs == Value::Var(dst) {
            let temp = self.temp("rhs", Type::Int);
            self.push(mov(VReg::Virtual(dst), VReg::Virtual(temp)));
            Value::Var(temp)
        } else {
            rhs
        };

        self.value_into(lhs, VReg::Virtual(dst));
        let instr = match rhs {
            Value::Imm(imm) => Instr::new(
                vec![VReg::Virtual(dst)],
                vec![VReg::Virtual(dst)],
                move |_, d| format!("{mnemonic} ${imm}, {}", d[0]),
            ),
            Value::Var(rhs) => Instr::new(
                vec![VReg::Virtual(rhs), VReg::Virtual(dst)],
                vec![VReg::Virtual(dst)],
                move |u, d| format!("{mnemonic} {}, {}", u[0], d[0]),
            ),
        };
        self.push(instr);
    }

    /// `dst = lhs < rhs` via `cmpq; setl; movzbq`. The flags produce a byte,
    /// widened to the full word the IR expects.
    fn less_than(&mut self, dst: VarId, lhs: Value, rhs: Value) {
        if let (Value::Imm(a), Value::Imm(b)) = (lhs, rhs) {
            self.push(mov_imm(i64::from(a < b), VReg::Virtual(dst)));
            return;
        }

        // the left operand is the cmpq destination and must be a register
        let lhs = self.force_reg(lhs);
        let compare = match rhs {
            Value::Imm(imm) => Instr::new(vec![lhs], vec![], move |u, _| {
                format!("cmpq ${imm}, {}", u[0])
            }),
            Value::Var(rhs) => Instr::new(vec![VReg::Virtual(rhs), lhs], vec![], |u, _| {
                format!("cmpq {}, {}", u[0], u[1])
            }),
        };
        self.push(compare);
        self.push(Instr::new(
            vec![],
            vec![VReg::Phys(Reg::Rax)],
            |_, _| "setl %al".to_owned(),
        ));
        self.push(Instr::new(
            vec![VReg::Phys(Reg::Rax)],
            vec![VReg::Phys(Reg::Rax)],
            |_, _| "movzbq %al, %rax".to_owned(),
        ));
        self.push(mov(VReg::Phys(Reg::Rax), VReg::Virtual(dst)));
    }

    fn terminator(&mut self, terminator: &Terminator) -> Transfer {
        match *terminator {
            Terminator::Jump(target) => Transfer::Jmp(target),
            Terminator::Branch {
                cond: Value::Imm(imm),
                then_block,
                else_block,
            } => Transfer::Jmp(if imm != 0 { then_block } else { else_block }),
            Terminator::Branch {
                cond: Value::Var(cond),
                then_block,
                else_block,
            } => {
                self.push(Instr::new(vec![VReg::Virtual(cond)], vec![], |u, _| {
                    format!("cmpq $0, {}", u[0])
                }));
                Transfer::JCond {
                    cond: Cond::Ne,
                    then_block,
                    else_block,
                }
            }
            Terminator::Ret(value) => {
                self.value_into(value, VReg::Phys(RET_REG));
                Transfer::Ret
            }
        }
    }
}
