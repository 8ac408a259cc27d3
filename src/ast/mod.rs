//! The checked source AST handed over by the front end. Lexing, parsing and
//! the two-pass checker are external collaborators: by the time a
//! [`Program`] reaches this crate every identifier has been resolved to a
//! unique interned name and every expression carries its resolved type, so
//! lowering never has to consult a symbol table.

use crate::intern::Symbol;

pub mod sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Int,
    Boolean,
    IntArray,
    Class(Symbol),
}

/// A typed variable declaration (field, formal, or local).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dec {
    pub ty: Type,
    pub name: Symbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    LessThan,
}

#[derive(Debug, Clone)]
pub enum Exp {
    /// An integer (or boolean, already encoded as 0/1) literal.
    Num(i64),
    /// A resolved local/formal read.
    Ident(Symbol, Type),
    Binary {
        lhs: Box<Exp>,
        op: BinaryOp,
        rhs: Box<Exp>,
    },
    ArrayIndex {
        array: Box<Exp>,
        index: Box<Exp>,
    },
    NewIntArray {
        length: Box<Exp>,
    },
    NewObject {
        class: Symbol,
    },
    /// A virtual method call. The checker recorded the static class of the
    /// receiver and the resolved return type.
    Call {
        object: Box<Exp>,
        method: Symbol,
        args: Vec<Exp>,
        receiver_class: Symbol,
        ret: Type,
    },
    This,
}

#[derive(Debug, Clone)]
pub enum Stm {
    Assign {
        dst: Symbol,
        value: Exp,
    },
    ArrayAssign {
        array: Symbol,
        index: Exp,
        value: Exp,
    },
    If {
        cond: Exp,
        then_branch: Vec<Stm>,
        else_branch: Vec<Stm>,
    },
    While {
        cond: Exp,
        body: Vec<Stm>,
    },
    Print(Exp),
}

#[derive(Debug, Clone)]
pub struct Method {
    pub ret: Type,
    pub name: Symbol,
    pub formals: Vec<Dec>,
    pub locals: Vec<Dec>,
    pub body: Vec<Stm>,
    pub ret_exp: Exp,
}

#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: Symbol,
    /// `None` means the class extends the implicit empty root.
    pub parent: Option<Symbol>,
    pub fields: Vec<Dec>,
    pub methods: Vec<Method>,
}

/// The `Main` class is special-cased in the source language: one static
/// method wrapping a single statement.
#[derive(Debug, Clone)]
pub struct MainClass {
    pub name: Symbol,
    pub body: Stm,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub main: MainClass,
    pub classes: Vec<ClassDecl>,
}
