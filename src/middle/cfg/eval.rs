//! A direct interpreter for the CFG IR. The printed output is the observable
//! behavior of a program, so every transformation in the pipeline can be
//! checked by running the IR before and after and comparing what it prints.
//!
//! Dispatch is dynamic: `GetVirtualMethod` consults the vtable of the
//! receiver's runtime class, exactly as the emitted code will.

use crate::{
    fatal::ice,
    index::IndexVec,
    intern::Symbol,
    middle::cfg::{Function, Program, Stm, Terminator, Value, VarId},
};

/// Runs the program's main function and returns everything it printed.
pub fn run(program: &Program) -> Vec<i64> {
    let main = program
        .function(program.main_class, program.main_func)
        .unwrap_or_else(|| ice!("program has no main function"));

    let mut evaluator = Evaluator {
        program,
        output: Vec::new(),
        objects: Vec::new(),
        arrays: Vec::new(),
    };
    evaluator.call(main, vec![]);
    evaluator.output
}

#[derive(Debug, Clone, Copy)]
enum Val {
    Uninit,
    Int(i64),
    /// Handle into the object heap.
    Obj(usize),
    /// Handle into the array heap.
    Arr(usize),
    /// Index into the program's function list.
    Code(usize),
}

struct Evaluator<'a> {
    program: &'a Program,
    output: Vec<i64>,
    /// Runtime class of each allocated object.
    objects: Vec<Symbol>,
    arrays: Vec<Vec<i64>>,
}

impl Evaluator<'_> {
    fn call(&mut self, function: &Function, args: Vec<Val>) -> Val {
        if args.len() != function.formals.len() {
            ice!("call arity does not match the callee's formals");
        }
        let mut vars: IndexVec<VarId, Val> = function.vars.map_to(Val::Uninit);
        for (&formal, arg) in function.formals.iter().zip(args) {
            vars[formal] = arg;
        }

        let mut prev = None;
        let mut block = Function::entry();
        loop {
            let b = &function.blocks[block];

            // phis read their operands simultaneously on entry to the block
            let phi_vals: Vec<(VarId, Val)> = b
                .phis
                .iter()
                .map(|phi| {
                    let pred = prev.unwrap_or_else(|| ice!("phi in the entry block"));
                    let arg = phi
                        .args
                        .iter()
                        .find(|&&(p, _)| p == pred)
                        .unwrap_or_else(|| ice!("phi has no operand for the taken edge"));
                    (phi.dst, self.value(&vars, arg.1))
                })
                .collect();
            for (dst, val) in phi_vals {
                vars[dst] = val;
            }

            for stm in &b.stms {
                self.stm(&mut vars, stm);
            }

            prev = Some(block);
            match b.terminator {
                Terminator::Jump(target) => block = target,
                Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                } => {
                    block = if self.int(&vars, cond) != 0 {
                        then_block
                    } else {
                        else_block
                    };
                }
                Terminator::Ret(value) => return self.value(&vars, value),
            }
        }
    }

    fn stm(&mut self, vars: &mut IndexVec<VarId, Val>, stm: &Stm) {
        match stm {
            Stm::Assign { dst, src } => vars[*dst] = self.value(vars, *src),
            Stm::BinOp { dst, op, lhs, rhs } => {
                let lhs = self.int(vars, *lhs);
                let rhs = self.int(vars, *rhs);
                use crate::middle::cfg::BinOp;
                let result = match op {
                    BinOp::Add => lhs.wrapping_add(rhs),
                    BinOp::Sub => lhs.wrapping_sub(rhs),
                    BinOp::Mul => lhs.wrapping_mul(rhs),
                    BinOp::LessThan => i64::from(lhs < rhs),
                };
                vars[*dst] = Val::Int(result);
            }
            Stm::Call { dst, code, args } => {
                let program = self.program;
                let callee = match vars[*code] {
                    Val::Code(index) => &program.functions[index],
                    _ => ice!("call through a non-code value"),
                };
                let args: Vec<Val> = args.iter().map(|&a| self.value(vars, a)).collect();
                vars[*dst] = self.call(callee, args);
            }
            Stm::New { dst, class } => {
                self.objects.push(*class);
                vars[*dst] = Val::Obj(self.objects.len() - 1);
            }
            Stm::ArrayLoad { dst, array, index } => {
                let handle = self.array(vars, *array);
                let index = self.int(vars, *index) as usize;
                let element = *self.arrays[handle]
                    .get(index)
                    .unwrap_or_else(|| ice!("array read out of bounds"));
                vars[*dst] = Val::Int(element);
            }
            Stm::ArrayStore { array, index, src } => {
                let handle = self.array(vars, *array);
                let index = self.int(vars, *index) as usize;
                let value = self.int(vars, *src);
                match self.arrays[handle].get_mut(index) {
                    Some(slot) => *slot = value,
                    None => ice!("array write out of bounds"),
                }
            }
            Stm::Print { value } => {
                let value = self.int(vars, *value);
                self.output.push(value);
            }
            Stm::GetVirtualMethod {
                dst,
                object,
                method,
                ..
            } => {
                let class = match self.value(vars, *object) {
                    Val::Obj(handle) => self.objects[handle],
                    _ => ice!("virtual lookup on a non-object"),
                };
                let vtable = self
                    .program
                    .vtable(class)
                    .unwrap_or_else(|| ice!("object of a class with no vtable"));
                let entry = vtable
                    .entries
                    .iter()
                    .find(|e| e.method == *method)
                    .unwrap_or_else(|| ice!("method missing from the receiver's vtable"));
                let index = self
                    .program
                    .functions
                    .iter()
                    .position(|f| f.class == entry.class && f.name == entry.method)
                    .unwrap_or_else(|| ice!("vtable entry points at a missing function"));
                vars[*dst] = Val::Code(index);
            }
        }
    }

    fn value(&self, vars: &IndexVec<VarId, Val>, v: Value) -> Val {
        match v {
            Value::Imm(n) => Val::Int(n),
            Value::Var(var) => match vars[var] {
                Val::Uninit => ice!("read of an uninitialized variable"),
                val => val,
            },
        }
    }

    fn int(&self, vars: &IndexVec<VarId, Val>, v: Value) -> i64 {
        match self.value(vars, v) {
            Val::Int(n) => n,
            _ => ice!("integer expected"),
        }
    }

    fn array(&self, vars: &IndexVec<VarId, Val>, var: VarId) -> usize {
        match vars[var] {
            Val::Arr(handle) => handle,
            _ => ice!("array expected"),
        }
    }
}
