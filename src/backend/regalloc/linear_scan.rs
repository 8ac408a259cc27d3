//! Linear-scan register allocation.
//!
//! Instructions are numbered in block order and each virtual register gets
//! one conservative interval covering every position where it is live
//! (block liveness stretches intervals across loop back edges). The scan
//! walks intervals by start, handing out registers from the callee-saved
//! pool; when the pool is empty the interval that ends furthest away is the
//! one that goes to the stack, whether that is the newcomer or something
//! already active.

use hashbrown::{HashMap, HashSet};

use crate::{
    backend::{
        regalloc::{rewrite_instr, FrameBuilder, Location},
        x64::{self, Frame, Reg, VReg, ALLOCATABLE},
    },
    fatal::ice,
    index::IndexVec,
    middle::cfg::{BlockId, VarId},
};

pub fn allocate(mut function: x64::Function) -> x64::Function {
    let intervals = intervals(&function);
    let (assignment, mut frame, used) = scan(intervals);

    for block in function.blocks.iter_mut() {
        let instrs = core::mem::take(&mut block.instrs);
        let mut rewritten = Vec::with_capacity(instrs.len());
        for instr in instrs {
            rewrite_instr(
                instr,
                &mut |var| match assignment.get(&var) {
                    Some(&location) => location,
                    None => ice!("virtual register was never given an interval"),
                },
                &mut rewritten,
            );
        }
        block.instrs = rewritten;
    }

    let saved = used.into_iter().map(|reg| (reg, frame.slot())).collect();
    function.frame = Frame {
        size: frame.size(),
        saved,
    };
    function
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    var: VarId,
    start: usize,
    end: usize,
}

/// Upward-exposed-use liveness at block granularity over the selected
/// instructions, virtual registers only.
fn block_liveness(
    function: &x64::Function,
) -> (
    IndexVec<BlockId, HashSet<VarId>>,
    IndexVec<BlockId, HashSet<VarId>>,
) {
    let mut gens: IndexVec<BlockId, HashSet<VarId>> = function.blocks.map_to(HashSet::new());
    let mut kills: IndexVec<BlockId, HashSet<VarId>> = function.blocks.map_to(HashSet::new());
    let mut preds: IndexVec<BlockId, Vec<BlockId>> = function.blocks.map_to(Vec::new());

    for (id, block) in function.blocks.enumerate() {
        for succ in block.transfer.successors() {
            preds[succ].push(id);
        }
        for instr in &block.instrs {
            for reg in &instr.uses {
                if let VReg::Virtual(var) = *reg {
                    if !kills[id].contains(&var) {
                        gens[id].insert(var);
                    }
                }
            }
            for reg in &instr.defs {
                if let VReg::Virtual(var) = *reg {
                    kills[id].insert(var);
                }
            }
        }
    }

    let mut live_in: IndexVec<BlockId, HashSet<VarId>> = function.blocks.map_to(HashSet::new());
    let mut live_out: IndexVec<BlockId, HashSet<VarId>> = function.blocks.map_to(HashSet::new());

    let mut worklist: Vec<BlockId> = function.blocks.indices().collect();
    while let Some(block) = worklist.pop() {
        let mut out = HashSet::new();
        for succ in function.blocks[block].transfer.successors() {
            out.extend(live_in[succ].iter().copied());
        }

        let mut incoming = out.clone();
        for var in &kills[block] {
            incoming.remove(var);
        }
        incoming.extend(gens[block].iter().copied());

        live_out[block] = out;
        if incoming != live_in[block] {
            live_in[block] = incoming;
            for &pred in &preds[block] {
                if !worklist.contains(&pred) {
                    worklist.push(pred);
                }
            }
        }
    }

    (live_in, live_out)
}

fn intervals(function: &x64::Function) -> Vec<Interval> {
    let (live_in, live_out) = block_liveness(function);

    let mut ranges: HashMap<VarId, (usize, usize)> = HashMap::new();
    let mut extend = |var: VarId, pos: usize| {
        let range = ranges.entry(var).or_insert((pos, pos));
        range.0 = range.0.min(pos);
        range.1 = range.1.max(pos);
    };

    let mut pos = 0;
    for (id, block) in function.blocks.enumerate() {
        let block_start = pos;
        for instr in &block.instrs {
            pos += 1;
            for reg in instr.uses.iter().chain(&instr.defs) {
                if let VReg::Virtual(var) = *reg {
                    extend(var, pos);
                }
            }
        }
        // the transfer occupies a position of its own
        pos += 1;
        let block_end = pos;

        for &var in &live_in[id] {
            extend(var, block_start);
        }
        for &var in &live_out[id] {
            extend(var, block_end);
        }
    }

    let mut intervals: Vec<Interval> = ranges
        .into_iter()
        .map(|(var, (start, end))| Interval { var, start, end })
        .collect();
    intervals.sort_by_key(|interval| (interval.start, interval.var));
    intervals
}

fn scan(intervals: Vec<Interval>) -> (HashMap<VarId, Location>, FrameBuilder, Vec<Reg>) {
    let mut frame = FrameBuilder::new();
    let mut assignment: HashMap<VarId, Location> = HashMap::new();
    let mut free: Vec<Reg> = ALLOCATABLE.iter().rev().copied().collect();
    let mut active: Vec<(Interval, Reg)> = Vec::new();
    let mut used: Vec<Reg> = Vec::new();

    for interval in intervals {
        active.retain(|&(a, reg)| {
            if a.end < interval.start {
                free.push(reg);
                false
            } else {
                true
            }
        });

        if let Some(reg) = free.pop() {
            if !used.contains(&reg) {
                used.push(reg);
            }
            assignment.insert(interval.var, Location::Reg(reg));
            active.push((interval, reg));
            continue;
        }

        // nothing free: the furthest-ending of the conflicting intervals
        // goes to the stack
        let victim = active
            .iter()
            .enumerate()
            .max_by_key(|(_, (a, _))| a.end)
            .map(|(i, _)| i)
            .unwrap_or_else(|| ice!("register pool empty with nothing active"));

        if active[victim].0.end > interval.end {
            let (evicted, reg) = active[victim];
            assignment.insert(evicted.var, Location::Slot(frame.slot()));
            assignment.insert(interval.var, Location::Reg(reg));
            active[victim] = (interval, reg);
        } else {
            assignment.insert(interval.var, Location::Slot(frame.slot()));
        }
    }

    (assignment, frame, used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::sample,
        backend::munch,
        intern::Interner,
        middle::cfg::{
            ast_lowering, BinOp, FunctionBuilder, Stm, Terminator, Type, Value,
        },
    };

    fn rendered(function: &x64::Function) -> Vec<String> {
        let mut out = Vec::new();
        for (_, block) in function.blocks.enumerate() {
            for instr in &block.instrs {
                let mut names = |r: VReg| match r {
                    VReg::Phys(reg) => reg.operand(),
                    VReg::Virtual(_) => panic!("virtual register survived allocation"),
                };
                out.push(instr.render(&mut names));
            }
        }
        out
    }

    #[test]
    fn factorial_fits_in_the_register_pool() {
        let mut interner = Interner::new();
        let ast = sample::factorial(&mut interner);
        let program = ast_lowering::lower_program(&ast, &mut interner);
        let program = munch::munch_program(&program, &mut interner);

        for function in program.functions {
            let function = allocate(function);
            let text = rendered(&function);

            // few enough locals that nothing spills: no frame traffic
            // besides the callee-saved slots
            assert!(text.iter().all(|line| !line.contains("(%rbp)")));
            assert!(function.frame.size % 16 == 0);
            assert!(!function.frame.saved.is_empty());
        }
    }

    #[test]
    fn pressure_beyond_the_pool_spills_to_the_frame() {
        let mut interner = Interner::new();
        let mut b = FunctionBuilder::new(Type::Int, interner.intern("C"), interner.intern("m"));
        let entry = b.new_block();

        // more simultaneously-live values than allocatable registers
        let vars: Vec<_> = (0..8)
            .map(|i| b.add_var(interner.intern(&format!("v{i}")), Type::Int))
            .collect();
        for (i, &var) in vars.iter().enumerate() {
            b.push(
                entry,
                Stm::Assign {
                    dst: var,
                    src: Value::Imm(i as i64),
                },
            );
        }
        let mut acc = vars[0];
        for &var in &vars[1..] {
            let next = b.add_var(interner.fresh("s"), Type::Int);
            b.push(
                entry,
                Stm::BinOp {
                    dst: next,
                    op: BinOp::Add,
                    lhs: Value::Var(acc),
                    rhs: Value::Var(var),
                },
            );
            acc = next;
        }
        b.terminate(entry, Terminator::Ret(Value::Var(acc)));
        let f = b.finish();

        let ast = sample::factorial(&mut interner);
        let program = ast_lowering::lower_program(&ast, &mut interner);
        let layout = crate::backend::layout::Layout::of_program(&program);
        let function = allocate(munch::munch_function(&f, &layout, &mut interner));

        let text = rendered(&function);
        assert!(text.iter().any(|line| line.contains("(%rbp)")));
        assert_eq!(function.frame.saved.len(), ALLOCATABLE.len());
    }

    #[test]
    fn intervals_cover_loop_back_edges() {
        let mut interner = Interner::new();
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
        let f = b.finish();

        let ast = sample::factorial(&mut interner);
        let cfg_program = ast_lowering::lower_program(&ast, &mut interner);
        let layout = crate::backend::layout::Layout::of_program(&cfg_program);
        let munched = munch::munch_function(&f, &layout, &mut interner);

        let intervals = intervals(&munched);
        let n_interval = intervals.iter().find(|iv| iv.var == n).unwrap();
        let i_interval = intervals.iter().find(|iv| iv.var == i).unwrap();

        // n is read every trip round the loop, so both stay live past the
        // body's instructions
        assert!(n_interval.end > n_interval.start);
        assert!(i_interval.end > i_interval.start);
        assert!(n_interval.end >= i_interval.start);
    }
}
