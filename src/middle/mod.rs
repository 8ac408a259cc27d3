//! The middle end. The checked AST is lowered into a control-flow-graph IR
//! over virtual registers, analyzed by a generic dataflow engine, rewritten
//! into SSA form for the optimization passes, and destructed again before
//! the backend takes over.

pub mod cfg;
pub mod dataflow;
pub mod ssa;
