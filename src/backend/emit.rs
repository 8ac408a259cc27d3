//! Final AT&T-syntax assembly emission.
//!
//! By this point every operand is a physical register, so emission is pure
//! text: a `.data` section with one vtable per class, then one `.text`
//! symbol per method with the usual rbp frame, then a tiny `main` stub that
//! calls the program's entry method and exits with status 0. The runtime
//! (`mj_alloc`, `mj_print`) is linked in separately.

use std::{fs, io, path::Path};

use indoc::formatdoc;
use thiserror::Error;

use crate::{
    backend::x64::{Function, Program, Transfer, VReg},
    fatal::ice,
    index::Index,
    intern::Interner,
    middle::cfg::BlockId,
};

#[derive(Debug, Error)]
#[error("could not write assembly to `{path}`")]
pub struct WriteError {
    path: String,
    #[source]
    source: io::Error,
}

pub fn write_assembly(path: &Path, text: &str) -> Result<(), WriteError> {
    fs::write(path, text).map_err(|source| WriteError {
        path: path.display().to_string(),
        source,
    })
}

/// Renders the whole program as assembly text. `listings`, when given, holds
/// one pre-allocation instruction dump per function (in program order) to
/// embed above it as comments; ANSI colors are stripped first.
pub fn emit_program(program: &Program, interner: &Interner, listings: Option<&[String]>) -> String {
    let mut emitter = Emitter {
        interner,
        listings,
        out: String::new(),
    };
    emitter.program(program);
    emitter.out
}

struct Emitter<'a> {
    interner: &'a Interner,
    listings: Option<&'a [String]>,
    out: String,
}

impl Emitter<'_> {
    fn line(&mut self, line: impl AsRef<str>) {
        self.out.push('\t');
        self.out.push_str(line.as_ref());
        self.out.push('\n');
    }

    fn label(&mut self, label: impl AsRef<str>) {
        self.out.push_str(label.as_ref());
        self.out.push_str(":\n");
    }

    fn comment(&mut self, text: impl AsRef<str>) {
        for line in text.as_ref().lines() {
            self.out.push_str("\t# ");
            self.out.push_str(line);
            self.out.push('\n');
        }
    }

    fn func_label(&self, function: &Function) -> String {
        format!(
            "{}_{}",
            self.interner.resolve(function.class),
            self.interner.resolve(function.name)
        )
    }

    fn block_label(&self, function: &Function, block: BlockId) -> String {
        format!(".L{}_{}", self.func_label(function), block.index())
    }

    fn program(&mut self, program: &Program) {
        self.comment("runtime: mj_alloc(size, vtable), mj_print(value)");
        self.line(".data");
        for vtable in &program.vtables {
            self.label(format!(".V_{}", self.interner.resolve(vtable.class)));
            for entry in &vtable.entries {
                self.line(format!(
                    ".quad {}_{}",
                    self.interner.resolve(entry.class),
                    self.interner.resolve(entry.method)
                ));
            }
        }

        self.out.push('\n');
        self.line(".text");
        for (i, function) in program.functions.iter().enumerate() {
            let listing = self.listings.and_then(|l| l.get(i)).cloned();
            self.function(function, listing.as_deref());
        }

        let entry = format!(
            "{}_{}",
            self.interner.resolve(program.main_class),
            self.interner.resolve(program.main_func)
        );
        self.out.push_str(&formatdoc! {"
            \t.globl main
            main:
            \tcall {entry}
            \tmovq $0, %rax
            \tret
        "});
    }

    fn function(&mut self, function: &Function, listing: Option<&str>) {
        let label = self.func_label(function);
        self.out.push('\n');
        if let Some(listing) = listing {
            let stripped = String::from_utf8_lossy(&strip_ansi_escapes::strip(listing)).into_owned();
            self.comment(stripped);
            let saved = function
                .frame
                .saved
                .iter()
                .map(|(reg, _)| reg.operand())
                .collect::<Vec<_>>()
                .join(" ");
            self.comment(format!("frame {} bytes, saves [{saved}]", function.frame.size));
        }
        self.line(format!(".globl {label}"));
        self.label(&label);

        self.line("pushq %rbp");
        self.line("movq %rsp, %rbp");
        if function.frame.size > 0 {
            self.line(format!("subq ${}, %rsp", function.frame.size));
        }
        for &(reg, offset) in &function.frame.saved {
            self.line(format!("movq {}, {offset}(%rbp)", reg.operand()));
        }

        for (id, block) in function.blocks.enumerate() {
            self.label(self.block_label(function, id));
            for instr in &block.instrs {
                let mut names = |reg: VReg| match reg {
                    VReg::Phys(reg) => reg.operand(),
                    VReg::Virtual(_) => ice!("virtual register reached emission"),
                };
                let text = instr.render(&mut names);
                self.line(text);
            }
            match block.transfer {
                Transfer::Jmp(target) => {
                    let target = self.block_label(function, target);
                    self.line(format!("jmp {target}"));
                }
                Transfer::JCond {
                    cond,
                    then_block,
                    else_block,
                } => {
                    let then_label = self.block_label(function, then_block);
                    let else_label = self.block_label(function, else_block);
                    self.line(format!("{cond} {then_label}"));
                    self.line(format!("jmp {else_label}"));
                }
                Transfer::Ret => {
                    for &(reg, offset) in &function.frame.saved {
                        self.line(format!("movq {offset}(%rbp), {}", reg.operand()));
                    }
                    self.line("leave");
                    self.line("ret");
                }
            }
        }
    }
}
