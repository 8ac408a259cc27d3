//! Programs built directly as checked ASTs. The front end is an external
//! collaborator, so these stand in for its output when exercising the
//! pipeline from the command line or from tests.

use crate::{
    ast::{BinaryOp, ClassDecl, Dec, Exp, MainClass, Method, Program, Stm, Type},
    intern::Interner,
};

/// ```text
/// class Factorial {
///     public static void main(String[] a) {
///         System.out.println(new Fac().ComputeFac(10));
///     }
/// }
/// class Fac {
///     public int ComputeFac(int num) {
///         int num_aux;
///         if (num < 1)
///             num_aux = 1;
///         else
///             num_aux = num * (this.ComputeFac(num - 1));
///         return num_aux;
///     }
/// }
/// ```
pub fn factorial(interner: &mut Interner) -> Program {
    let fac = interner.intern("Fac");
    let compute_fac = interner.intern("ComputeFac");
    let num = interner.intern("num");
    let num_aux = interner.intern("num_aux");

    let recurse = Exp::Call {
        object: Box::new(Exp::This),
        method: compute_fac,
        args: vec![Exp::Binary {
            lhs: Box::new(Exp::Ident(num, Type::Int)),
            op: BinaryOp::Sub,
            rhs: Box::new(Exp::Num(1)),
        }],
        receiver_class: fac,
        ret: Type::Int,
    };

    let body = vec![Stm::If {
        cond: Exp::Binary {
            lhs: Box::new(Exp::Ident(num, Type::Int)),
            op: BinaryOp::LessThan,
            rhs: Box::new(Exp::Num(1)),
        },
        then_branch: vec![Stm::Assign {
            dst: num_aux,
            value: Exp::Num(1),
        }],
        else_branch: vec![Stm::Assign {
            dst: num_aux,
            value: Exp::Binary {
                lhs: Box::new(Exp::Ident(num, Type::Int)),
                op: BinaryOp::Mul,
                rhs: Box::new(recurse),
            },
        }],
    }];

    Program {
        main: MainClass {
            name: interner.intern("Factorial"),
            body: Stm::Print(Exp::Call {
                object: Box::new(Exp::NewObject { class: fac }),
                method: compute_fac,
                args: vec![Exp::Num(10)],
                receiver_class: fac,
                ret: Type::Int,
            }),
        },
        classes: vec![ClassDecl {
            name: fac,
            parent: None,
            fields: vec![],
            methods: vec![Method {
                ret: Type::Int,
                name: compute_fac,
                formals: vec![Dec {
                    ty: Type::Int,
                    name: num,
                }],
                locals: vec![Dec {
                    ty: Type::Int,
                    name: num_aux,
                }],
                body,
                ret_exp: Exp::Ident(num_aux, Type::Int),
            }],
        }],
    }
}

/// ```text
/// class SumRec {
///     public static void main(String[] a) {
///         System.out.println(new Doit().doit(100));
///     }
/// }
/// class Doit {
///     public int doit(int n) {
///         int sum;
///         if (n < 1)
///             sum = 0;
///         else
///             sum = n + (this.doit(n - 1));
///         return sum;
///     }
/// }
/// ```
pub fn sum_rec(interner: &mut Interner) -> Program {
    let doit_class = interner.intern("Doit");
    let doit = interner.intern("doit");
    let n = interner.intern("n");
    let sum = interner.intern("sum");

    let recurse = Exp::Call {
        object: Box::new(Exp::This),
        method: doit,
        args: vec![Exp::Binary {
            lhs: Box::new(Exp::Ident(n, Type::Int)),
            op: BinaryOp::Sub,
            rhs: Box::new(Exp::Num(1)),
        }],
        receiver_class: doit_class,
        ret: Type::Int,
    };

    let body = vec![Stm::If {
        cond: Exp::Binary {
            lhs: Box::new(Exp::Ident(n, Type::Int)),
            op: BinaryOp::LessThan,
            rhs: Box::new(Exp::Num(1)),
        },
        then_branch: vec![Stm::Assign {
            dst: sum,
            value: Exp::Num(0),
        }],
        else_branch: vec![Stm::Assign {
            dst: sum,
            value: Exp::Binary {
                lhs: Box::new(Exp::Ident(n, Type::Int)),
                op: BinaryOp::Add,
                rhs: Box::new(recurse),
            },
        }],
    }];

    Program {
        main: MainClass {
            name: interner.intern("SumRec"),
            body: Stm::Print(Exp::Call {
                object: Box::new(Exp::NewObject { class: doit_class }),
                method: doit,
                args: vec![Exp::Num(100)],
                receiver_class: doit_class,
                ret: Type::Int,
            }),
        },
        classes: vec![ClassDecl {
            name: doit_class,
            parent: None,
            fields: vec![],
            methods: vec![Method {
                ret: Type::Int,
                name: doit,
                formals: vec![Dec {
                    ty: Type::Int,
                    name: n,
                }],
                locals: vec![Dec {
                    ty: Type::Int,
                    name: sum,
                }],
                body,
                ret_exp: Exp::Ident(sum, Type::Int),
            }],
        }],
    }
}
