//! The backend. Phi-free CFG functions are translated to x86-64 machine
//! instructions over virtual registers by maximal-munch selection, virtual
//! registers are mapped to machine registers and spill slots by one of two
//! allocation strategies, and the result is rendered as AT&T-syntax
//! assembly ready for `as`.

pub mod emit;
pub mod layout;
pub mod munch;
pub mod regalloc;
pub mod x64;
