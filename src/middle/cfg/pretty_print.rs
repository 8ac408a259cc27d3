//! Human-readable dumps of the CFG IR, used by the driver's `--dump` stages.

use std::fmt::Write;

use colored::Colorize;
use itertools::Itertools;

use crate::{
    index::Index,
    intern::Interner,
    middle::cfg::{
        BlockId, Function, Phi, Program, Stm, Terminator, Type, Value, VarId, Vtable,
    },
};

pub fn print_program(program: &Program, interner: &Interner) -> String {
    let mut out = String::new();
    for vtable in &program.vtables {
        out.push_str(&print_vtable(vtable, interner));
    }
    for function in &program.functions {
        out.push_str(&print_function(function, interner));
        out.push('\n');
    }
    out
}

fn print_vtable(vtable: &Vtable, interner: &Interner) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} {}",
        "vtable".magenta(),
        interner.resolve(vtable.class).blue(),
        "{".white()
    );
    for entry in &vtable.entries {
        let _ = writeln!(
            out,
            "    {}{}{}",
            interner.resolve(entry.class).blue(),
            "::".white(),
            interner.resolve(entry.method).blue()
        );
    }
    let _ = writeln!(out, "{}", "}".white());
    out
}

pub fn print_function(function: &Function, interner: &Interner) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "{} {}{}{}{}",
        "fn".magenta(),
        interner.resolve(function.class).blue(),
        "_".white(),
        interner.resolve(function.name).blue(),
        "(".white()
    );
    let _ = write!(
        out,
        "{}",
        function
            .formals
            .iter()
            .map(|&formal| var(function, interner, formal))
            .join(", ")
    );
    let _ = writeln!(out, "{}", ") {".white());

    for (id, block) in function.blocks.enumerate() {
        let _ = writeln!(out, "{}", format!("{}:", label(id)).bright_red());
        for phi in &block.phis {
            let _ = writeln!(out, "    {}", print_phi(function, interner, phi));
        }
        for stm in &block.stms {
            let _ = writeln!(out, "    {}", print_stm(function, interner, stm));
        }
        let _ = writeln!(
            out,
            "    {}",
            print_terminator(function, interner, &block.terminator)
        );
    }

    let _ = writeln!(out, "{}", "}".white());
    out
}

fn label(id: BlockId) -> String {
    format!(".block_{}", id.index())
}

fn var(function: &Function, interner: &Interner, id: VarId) -> String {
    interner
        .resolve(function.vars[id].name)
        .yellow()
        .to_string()
}

fn value(function: &Function, interner: &Interner, v: Value) -> String {
    match v {
        Value::Imm(n) => n.to_string().purple().to_string(),
        Value::Var(id) => var(function, interner, id),
    }
}

fn print_phi(function: &Function, interner: &Interner, phi: &Phi) -> String {
    format!(
        "{} {} {}{}{}{}",
        var(function, interner, phi.dst),
        "=".white(),
        "phi".bright_green(),
        "(".white(),
        phi.args
            .iter()
            .map(|&(block, v)| format!(
                "{} -> {}",
                label(block).blue(),
                value(function, interner, v)
            ))
            .join(", "),
        ")".white()
    )
}

pub fn print_stm(function: &Function, interner: &Interner, stm: &Stm) -> String {
    let val = |v| value(function, interner, v);
    let reg = |r| var(function, interner, r);
    match stm {
        Stm::Assign { dst, src } => format!("{} {} {}", reg(*dst), "=".white(), val(*src)),
        Stm::BinOp { dst, op, lhs, rhs } => format!(
            "{} {} {} {} {}",
            reg(*dst),
            "=".white(),
            val(*lhs),
            op.to_string().white(),
            val(*rhs)
        ),
        Stm::Call { dst, code, args } => format!(
            "{} {} {} {}{}{}",
            reg(*dst),
            "=".white(),
            "call".cyan(),
            reg(*code),
            "(".white(),
            format!("{}{}", args.iter().map(|&a| val(a)).join(", "), ")".white()),
        ),
        Stm::New { dst, class } => format!(
            "{} {} {} {}",
            reg(*dst),
            "=".white(),
            "new".cyan(),
            interner.resolve(*class).blue()
        ),
        Stm::ArrayLoad { dst, array, index } => format!(
            "{} {} {}{}{}{}",
            reg(*dst),
            "=".white(),
            reg(*array),
            "[".white(),
            val(*index),
            "]".white()
        ),
        Stm::ArrayStore { array, index, src } => format!(
            "{}{}{}{} {} {}",
            reg(*array),
            "[".white(),
            val(*index),
            "]".white(),
            "<-".white(),
            val(*src)
        ),
        Stm::Print { value: v } => format!("{} {}", "print".cyan(), val(*v)),
        Stm::GetVirtualMethod {
            dst,
            object,
            class,
            method,
        } => format!(
            "{} {} {} {}{}{}{}{}",
            reg(*dst),
            "=".white(),
            "virtual".cyan(),
            val(*object),
            ".".white(),
            interner.resolve(*class).blue(),
            "::".white(),
            interner.resolve(*method).blue()
        ),
    }
}

fn print_terminator(function: &Function, interner: &Interner, terminator: &Terminator) -> String {
    match terminator {
        Terminator::Jump(target) => {
            format!("{} {}", "jmp".cyan(), label(*target).blue())
        }
        Terminator::Branch {
            cond,
            then_block,
            else_block,
        } => format!(
            "{} {} {} {}",
            "br".cyan(),
            value(function, interner, *cond),
            label(*then_block).blue(),
            label(*else_block).blue()
        ),
        Terminator::Ret(v) => format!("{} {}", "ret".cyan(), value(function, interner, *v)),
    }
}

impl core::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::IntArray => write!(f, "int[]"),
            Type::Class(_) => write!(f, "object"),
            Type::CodePtr => write!(f, "code"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ast::sample, middle::cfg::ast_lowering};

    #[test]
    fn dump_mentions_every_block_once() {
        let mut interner = Interner::new();
        let ast = sample::factorial(&mut interner);
        let program = ast_lowering::lower_program(&ast, &mut interner);

        let text = String::from_utf8(
            strip_ansi_escapes::strip(print_program(&program, &interner)),
        )
        .unwrap();

        assert!(text.contains("fn Fac_ComputeFac("));
        assert!(text.contains("vtable Fac {"));
        let fac = program
            .function(interner.intern("Fac"), interner.intern("ComputeFac"))
            .unwrap();
        for id in fac.blocks.indices() {
            assert!(text.contains(&format!(".block_{}:", id.index())));
        }
    }
}
