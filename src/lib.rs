//! The middle and back end of a small ahead-of-time compiler for a
//! class-based toy language.
//!
//! Programs enter as an [`ast::Program`], are lowered to a control-flow
//! graph IR ([`middle::cfg`]), rewritten into and out of SSA form with the
//! optimizations in between ([`middle::ssa`]), and leave as x86-64 assembly
//! ([`backend`]). The CFG also serializes to a compact binary blob and can
//! be interpreted directly, which is how the tests pin down that every
//! transformation preserves what a program prints.

pub mod ast;
pub mod backend;
pub mod index;
pub mod intern;
pub mod middle;

pub(crate) mod fatal;
