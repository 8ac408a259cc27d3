//! Fatal-failure macros for the two abort classes the pipeline knows about.
//!
//! `ice!` marks a broken invariant: some earlier stage handed us a value that
//! violates the construction contract (a block with a second terminator, a
//! call with more than six arguments, a dispatch offset that does not
//! resolve). There is no recovery; the defect is upstream.
//!
//! `nyi!` marks a shape the current stage has no rewrite rule for. It aborts
//! just as hard but is distinguishable from `ice!` by its prefix, so a
//! partially built pipeline can be exercised stage by stage without silently
//! producing wrong code.

/// Internal compiler error: a construction contract was violated.
macro_rules! ice {
    ($($arg:tt)*) => {
        panic!("internal compiler error: {}", format_args!($($arg)*))
    };
}

/// Not yet implemented: the stage lacks a rewrite rule for this shape.
macro_rules! nyi {
    ($($arg:tt)*) => {
        panic!("not yet implemented: {}", format_args!($($arg)*))
    };
}

pub(crate) use ice;
pub(crate) use nyi;
