//! Lowers the checked AST into the CFG IR.
//!
//! Class structure is compiled away here. Field lists and dispatch tables
//! follow the prefixing discipline: a subclass starts from a copy of its
//! parent's layout and table, appends what it declares, and an override
//! replaces the inherited entry in place so the method keeps the dispatch
//! offset the ancestor assigned to it.
//!
//! Method bodies lower by walking statements in order; control flow opens
//! fresh blocks through the builder and every join point is an explicit
//! block of its own. Intermediate expression results land in compiler temps.

use hashbrown::HashMap;

use crate::{
    ast,
    fatal::{ice, nyi},
    intern::{Interner, Symbol},
    middle::cfg::{
        BinOp, BlockId, Function, FunctionBuilder, Program, Stm, StructDef, Terminator, Type,
        Value, VarDecl, VarId, Vtable, VtableEntry,
    },
};

pub fn lower_program(program: &ast::Program, interner: &mut Interner) -> Program {
    let order = hierarchy_order(&program.classes);

    let mut vtables: Vec<Vtable> = Vec::with_capacity(order.len());
    let mut structs: Vec<StructDef> = Vec::with_capacity(order.len());
    for &idx in &order {
        let class = &program.classes[idx];
        let (vtable, struct_def) = lay_out_class(class, &vtables, &structs);
        vtables.push(vtable);
        structs.push(struct_def);
    }

    let mut functions = Vec::new();
    let main_func = interner.intern("main");
    functions.push(lower_main(&program.main, main_func, interner));
    for class in &program.classes {
        for method in &class.methods {
            functions.push(lower_method(class.name, method, interner));
        }
    }

    Program {
        main_class: program.main.name,
        main_func,
        vtables,
        structs,
        functions,
    }
}

/// Orders class indices so every class appears after its parent. A parent
/// that is not declared anywhere, or a cycle in the extends chain, is a
/// checker bug.
fn hierarchy_order(classes: &[ast::ClassDecl]) -> Vec<usize> {
    let by_name: HashMap<Symbol, usize> = classes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name, i))
        .collect();

    let mut placed: HashMap<Symbol, ()> = HashMap::new();
    let mut order = Vec::with_capacity(classes.len());
    let mut pending: Vec<usize> = (0..classes.len()).collect();

    while !pending.is_empty() {
        let before = pending.len();
        pending.retain(|&idx| {
            let ready = match classes[idx].parent {
                None => true,
                Some(parent) => {
                    if !by_name.contains_key(&parent) {
                        ice!("class extends an undeclared parent");
                    }
                    placed.contains_key(&parent)
                }
            };
            if ready {
                placed.insert(classes[idx].name, ());
                order.push(idx);
            }
            !ready
        });
        if pending.len() == before {
            ice!("cycle in the class hierarchy");
        }
    }
    order
}

/// Builds one class's vtable and field layout from its parent's, which must
/// already be present in the accumulating lists.
fn lay_out_class(
    class: &ast::ClassDecl,
    vtables: &[Vtable],
    structs: &[StructDef],
) -> (Vtable, StructDef) {
    let (mut entries, mut fields) = match class.parent {
        None => (Vec::new(), Vec::new()),
        Some(parent) => {
            let vtable = vtables
                .iter()
                .find(|v| v.class == parent)
                .unwrap_or_else(|| ice!("parent class laid out after its child"));
            let struct_def = structs
                .iter()
                .find(|s| s.class == parent)
                .unwrap_or_else(|| ice!("parent class laid out after its child"));
            (vtable.entries.clone(), struct_def.fields.clone())
        }
    };

    for method in &class.methods {
        let entry = VtableEntry {
            ret: lower_type(method.ret),
            class: class.name,
            method: method.name,
            params: method.formals.iter().map(|d| lower_type(d.ty)).collect(),
        };
        match entries.iter_mut().find(|e| e.method == method.name) {
            // an override keeps the inherited dispatch offset
            Some(inherited) => *inherited = entry,
            None => entries.push(entry),
        }
    }

    for field in &class.fields {
        if fields.iter().any(|f: &VarDecl| f.name == field.name) {
            ice!("field shadows an inherited field of the same name");
        }
        fields.push(VarDecl {
            name: field.name,
            ty: lower_type(field.ty),
        });
    }

    (
        Vtable {
            class: class.name,
            entries,
        },
        StructDef {
            class: class.name,
            fields,
        },
    )
}

fn lower_type(ty: ast::Type) -> Type {
    match ty {
        // booleans are 0/1 machine words from here on
        ast::Type::Int | ast::Type::Boolean => Type::Int,
        ast::Type::IntArray => Type::IntArray,
        ast::Type::Class(name) => Type::Class(name),
    }
}

fn lower_method(class: Symbol, method: &ast::Method, interner: &mut Interner) -> Function {
    let mut builder = FunctionBuilder::new(lower_type(method.ret), class, method.name);

    let this = interner.intern("this");
    let mut lowerer = Lowerer {
        env: HashMap::new(),
        this: Some(builder.add_formal(this, Type::Class(class))),
        builder,
        interner,
    };
    for formal in &method.formals {
        let var = lowerer.builder.add_formal(formal.name, lower_type(formal.ty));
        lowerer.env.insert(formal.name, var);
    }
    for local in &method.locals {
        let var = lowerer.builder.add_var(local.name, lower_type(local.ty));
        lowerer.env.insert(local.name, var);
    }

    let mut block = lowerer.builder.new_block();
    for stm in &method.body {
        block = lowerer.stm(block, stm);
    }
    let ret = lowerer.exp(block, &method.ret_exp);
    lowerer.builder.terminate(block, Terminator::Ret(ret));
    lowerer.builder.finish()
}

/// The main method is static: no receiver, no formals, and its single
/// statement is wrapped in a function returning 0.
fn lower_main(main: &ast::MainClass, name: Symbol, interner: &mut Interner) -> Function {
    let builder = FunctionBuilder::new(Type::Int, main.name, name);
    let mut lowerer = Lowerer {
        env: HashMap::new(),
        this: None,
        builder,
        interner,
    };

    let entry = lowerer.builder.new_block();
    let last = lowerer.stm(entry, &main.body);
    lowerer
        .builder
        .terminate(last, Terminator::Ret(Value::Imm(0)));
    lowerer.builder.finish()
}

struct Lowerer<'a> {
    builder: FunctionBuilder,
    env: HashMap<Symbol, VarId>,
    this: Option<VarId>,
    interner: &'a mut Interner,
}

impl Lowerer<'_> {
    fn temp(&mut self, ty: Type) -> VarId {
        let name = self.interner.fresh("t");
        self.builder.add_var(name, ty)
    }

    fn var(&self, name: Symbol) -> VarId {
        match self.env.get(&name) {
            Some(&var) => var,
            None => ice!("unresolved identifier reached lowering"),
        }
    }

    /// Lowers a statement into `block`, returning the block where control
    /// continues afterwards.
    fn stm(&mut self, block: BlockId, stm: &ast::Stm) -> BlockId {
        match stm {
            ast::Stm::Assign { dst, value } => {
                let src = self.exp(block, value);
                let dst = self.var(*dst);
                self.builder.push(block, Stm::Assign { dst, src });
                block
            }
            ast::Stm::ArrayAssign {
                array,
                index,
                value,
            } => {
                let array = self.var(*array);
                let index = self.exp(block, index);
                let src = self.exp(block, value);
                self.builder.push(block, Stm::ArrayStore { array, index, src });
                block
            }
            ast::Stm::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.exp(block, cond);
                let then_entry = self.builder.new_block();
                let else_entry = self.builder.new_block();
                self.builder.terminate(
                    block,
                    Terminator::Branch {
                        cond,
                        then_block: then_entry,
                        else_block: else_entry,
                    },
                );

                let then_exit = self.stms(then_entry, then_branch);
                let else_exit = self.stms(else_entry, else_branch);
                let merge = self.builder.new_block();
                self.builder.terminate(then_exit, Terminator::Jump(merge));
                self.builder.terminate(else_exit, Terminator::Jump(merge));
                merge
            }
            ast::Stm::While { cond, body } => {
                // the condition gets its own header block so the back edge
                // re-evaluates it
                let header = self.builder.new_block();
                self.builder.terminate(block, Terminator::Jump(header));

                let cond = self.exp(header, cond);
                let body_entry = self.builder.new_block();
                let exit = self.builder.new_block();
                self.builder.terminate(
                    header,
                    Terminator::Branch {
                        cond,
                        then_block: body_entry,
                        else_block: exit,
                    },
                );

                let body_exit = self.stms(body_entry, body);
                self.builder.terminate(body_exit, Terminator::Jump(header));
                exit
            }
            ast::Stm::Print(exp) => {
                let value = self.exp(block, exp);
                self.builder.push(block, Stm::Print { value });
                block
            }
        }
    }

    fn stms(&mut self, mut block: BlockId, stms: &[ast::Stm]) -> BlockId {
        for stm in stms {
            block = self.stm(block, stm);
        }
        block
    }

    /// Lowers an expression into `block`, returning the operand holding its
    /// result. Expressions never branch, so control stays in `block`.
    fn exp(&mut self, block: BlockId, exp: &ast::Exp) -> Value {
        match exp {
            ast::Exp::Num(n) => Value::Imm(*n),
            ast::Exp::Ident(name, _) => Value::Var(self.var(*name)),
            ast::Exp::This => match self.this {
                Some(var) => Value::Var(var),
                None => ice!("`this` in a static context"),
            },
            ast::Exp::Binary { lhs, op, rhs } => {
                let lhs = self.exp(block, lhs);
                let rhs = self.exp(block, rhs);
                let op = match op {
                    ast::BinaryOp::Add => BinOp::Add,
                    ast::BinaryOp::Sub => BinOp::Sub,
                    ast::BinaryOp::Mul => BinOp::Mul,
                    ast::BinaryOp::LessThan => BinOp::LessThan,
                };
                let dst = self.temp(Type::Int);
                self.builder.push(block, Stm::BinOp { dst, op, lhs, rhs });
                Value::Var(dst)
            }
            ast::Exp::ArrayIndex { array, index } => {
                let array = self.register(block, array);
                let index = self.exp(block, index);
                let dst = self.temp(Type::Int);
                self.builder.push(block, Stm::ArrayLoad { dst, array, index });
                Value::Var(dst)
            }
            ast::Exp::NewIntArray { .. } => nyi!("array allocation"),
            ast::Exp::NewObject { class } => {
                let dst = self.temp(Type::Class(*class));
                self.builder.push(block, Stm::New { dst, class: *class });
                Value::Var(dst)
            }
            ast::Exp::Call {
                object,
                method,
                args,
                receiver_class,
                ret,
            } => {
                let object = self.exp(block, object);
                let code = self.temp(Type::CodePtr);
                self.builder.push(
                    block,
                    Stm::GetVirtualMethod {
                        dst: code,
                        object,
                        class: *receiver_class,
                        method: *method,
                    },
                );

                // the receiver rides along as the hidden first argument
                let mut call_args = vec![object];
                for arg in args {
                    call_args.push(self.exp(block, arg));
                }

                let dst = self.temp(lower_type(*ret));
                self.builder.push(
                    block,
                    Stm::Call {
                        dst,
                        code,
                        args: call_args,
                    },
                );
                Value::Var(dst)
            }
        }
    }

    /// Like [`Lowerer::exp`] but forces the result into a register, for the
    /// positions that cannot take an immediate.
    fn register(&mut self, block: BlockId, exp: &ast::Exp) -> VarId {
        match self.exp(block, exp) {
            Value::Var(var) => var,
            Value::Imm(imm) => {
                let dst = self.temp(Type::Int);
                self.builder.push(
                    block,
                    Stm::Assign {
                        dst,
                        src: Value::Imm(imm),
                    },
                );
                dst
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::sample;

    #[test]
    fn lowers_the_factorial_sample() {
        let mut interner = Interner::new();
        let ast = sample::factorial(&mut interner);
        let program = lower_program(&ast, &mut interner);

        assert_eq!(program.functions.len(), 2);
        for function in &program.functions {
            function.validate().unwrap();
        }

        // ComputeFac: receiver plus one declared formal
        let fac = interner.intern("Fac");
        let compute_fac = interner.intern("ComputeFac");
        let f = program.function(fac, compute_fac).unwrap();
        assert_eq!(f.formals.len(), 2);

        // the if produces a diamond: entry, two arms, merge
        assert_eq!(f.blocks.len(), 4);
    }

    #[test]
    fn overriding_keeps_the_dispatch_offset() {
        let mut interner = Interner::new();
        let base = interner.intern("Base");
        let derived = interner.intern("Derived");
        let first = interner.intern("first");
        let second = interner.intern("second");

        let method = |name| ast::Method {
            ret: ast::Type::Int,
            name,
            formals: vec![],
            locals: vec![],
            body: vec![],
            ret_exp: ast::Exp::Num(0),
        };

        let ast = ast::Program {
            main: ast::MainClass {
                name: interner.intern("Main"),
                body: ast::Stm::Print(ast::Exp::Num(0)),
            },
            classes: vec![
                ast::ClassDecl {
                    name: base,
                    parent: None,
                    fields: vec![ast::Dec {
                        ty: ast::Type::Int,
                        name: interner.intern("count"),
                    }],
                    methods: vec![method(first), method(second)],
                },
                ast::ClassDecl {
                    name: derived,
                    parent: Some(base),
                    fields: vec![],
                    methods: vec![method(second)],
                },
            ],
        };

        let program = lower_program(&ast, &mut interner);

        let base_table = program.vtable(base).unwrap();
        let derived_table = program.vtable(derived).unwrap();
        assert_eq!(base_table.entries.len(), 2);
        assert_eq!(derived_table.entries.len(), 2);

        // `second` stays in slot 1, now pointing at Derived's code
        assert_eq!(derived_table.entries[1].method, second);
        assert_eq!(derived_table.entries[1].class, derived);
        assert_eq!(derived_table.entries[0].class, base);

        // the subclass inherits the field layout
        assert_eq!(program.struct_def(derived).unwrap().fields.len(), 1);
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn rejects_a_hierarchy_cycle() {
        let mut interner = Interner::new();
        let a = interner.intern("A");
        let b = interner.intern("B");
        let ast = ast::Program {
            main: ast::MainClass {
                name: interner.intern("Main"),
                body: ast::Stm::Print(ast::Exp::Num(0)),
            },
            classes: vec![
                ast::ClassDecl {
                    name: a,
                    parent: Some(b),
                    fields: vec![],
                    methods: vec![],
                },
                ast::ClassDecl {
                    name: b,
                    parent: Some(a),
                    fields: vec![],
                    methods: vec![],
                },
            ],
        };
        lower_program(&ast, &mut interner);
    }
}
