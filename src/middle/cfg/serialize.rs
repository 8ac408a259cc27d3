//! A versioned binary encoding of a lowered [`Program`], so the middle end
//! can be exercised on saved inputs without re-running lowering. The interned
//! string table travels with the program; decoding rebuilds it with the same
//! symbol values.
//!
//! All integers are little-endian. Enums are a one-byte tag followed by
//! their payload. Decoded functions are re-validated, since the bytes did
//! not come through the sealed builder.

use thiserror::Error;

use crate::{
    index::{Index, IndexVec},
    intern::{Interner, Symbol},
    middle::cfg::{
        BinOp, Block, BlockId, Function, Phi, Program, Stm, StructDef, Terminator, Type, Value,
        VarDecl, VarId, Vtable, VtableEntry,
    },
};

const MAGIC: &[u8; 4] = b"MJCF";
const VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("input truncated")]
    UnexpectedEof,
    #[error("not a program blob (bad magic)")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("invalid {what} tag {tag}")]
    BadTag { what: &'static str, tag: u8 },
    #[error("string table entry is not UTF-8")]
    BadString,
    #[error("symbol index out of range")]
    BadSymbol,
    #[error("malformed function: {0}")]
    Invalid(String),
    #[error("{0} bytes left over after the program")]
    TrailingBytes(usize),
}

pub fn encode(program: &Program, interner: &Interner) -> Vec<u8> {
    let mut e = Encoder { buf: Vec::new() };
    e.buf.extend_from_slice(MAGIC);
    e.buf.extend_from_slice(&VERSION.to_le_bytes());

    let strings: Vec<&str> = interner.strings().collect();
    e.u32(strings.len() as u32);
    for s in strings {
        e.str(s);
    }

    e.symbol(program.main_class);
    e.symbol(program.main_func);

    e.u32(program.vtables.len() as u32);
    for vtable in &program.vtables {
        e.symbol(vtable.class);
        e.u32(vtable.entries.len() as u32);
        for entry in &vtable.entries {
            e.ty(entry.ret);
            e.symbol(entry.class);
            e.symbol(entry.method);
            e.u32(entry.params.len() as u32);
            for &param in &entry.params {
                e.ty(param);
            }
        }
    }

    e.u32(program.structs.len() as u32);
    for s in &program.structs {
        e.symbol(s.class);
        e.u32(s.fields.len() as u32);
        for field in &s.fields {
            e.var_decl(field);
        }
    }

    e.u32(program.functions.len() as u32);
    for function in &program.functions {
        e.function(function);
    }

    e.buf
}

pub fn decode(bytes: &[u8]) -> Result<(Program, Interner), DecodeError> {
    let mut d = Decoder {
        bytes,
        pos: 0,
        symbols: Vec::new(),
    };

    if d.take(4)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = d.u16()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let mut interner = Interner::new();
    let nstrings = d.u32()?;
    for _ in 0..nstrings {
        let s = d.str()?;
        d.symbols.push(interner.intern(&s));
    }

    let main_class = d.symbol()?;
    let main_func = d.symbol()?;

    let mut vtables = Vec::new();
    for _ in 0..d.u32()? {
        let class = d.symbol()?;
        let mut entries = Vec::new();
        for _ in 0..d.u32()? {
            let ret = d.ty()?;
            let class = d.symbol()?;
            let method = d.symbol()?;
            let mut params = Vec::new();
            for _ in 0..d.u32()? {
                params.push(d.ty()?);
            }
            entries.push(VtableEntry {
                ret,
                class,
                method,
                params,
            });
        }
        vtables.push(Vtable { class, entries });
    }

    let mut structs = Vec::new();
    for _ in 0..d.u32()? {
        let class = d.symbol()?;
        let mut fields = Vec::new();
        for _ in 0..d.u32()? {
            fields.push(d.var_decl()?);
        }
        structs.push(StructDef { class, fields });
    }

    let mut functions = Vec::new();
    for _ in 0..d.u32()? {
        let function = d.function()?;
        function.validate().map_err(DecodeError::Invalid)?;
        functions.push(function);
    }

    if d.pos != bytes.len() {
        return Err(DecodeError::TrailingBytes(bytes.len() - d.pos));
    }

    Ok((
        Program {
            main_class,
            main_func,
            vtables,
            structs,
            functions,
        },
        interner,
    ))
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn symbol(&mut self, s: Symbol) {
        self.u32(s.as_u32());
    }

    fn ty(&mut self, ty: Type) {
        match ty {
            Type::Int => self.u8(0),
            Type::Class(class) => {
                self.u8(1);
                self.symbol(class);
            }
            Type::IntArray => self.u8(2),
            Type::CodePtr => self.u8(3),
        }
    }

    fn var_decl(&mut self, decl: &VarDecl) {
        self.symbol(decl.name);
        self.ty(decl.ty);
    }

    fn value(&mut self, v: Value) {
        match v {
            Value::Imm(n) => {
                self.u8(0);
                self.i64(n);
            }
            Value::Var(var) => {
                self.u8(1);
                self.u32(var.index() as u32);
            }
        }
    }

    fn function(&mut self, f: &Function) {
        self.ty(f.ret);
        self.symbol(f.class);
        self.symbol(f.name);
        self.u32(f.formals.len() as u32);
        for &formal in &f.formals {
            self.u32(formal.index() as u32);
        }
        self.u32(f.vars.len() as u32);
        for (_, decl) in f.vars.enumerate() {
            self.var_decl(decl);
        }
        self.u32(f.blocks.len() as u32);
        for (_, block) in f.blocks.enumerate() {
            self.block(block);
        }
    }

    fn block(&mut self, block: &Block) {
        self.u32(block.phis.len() as u32);
        for phi in &block.phis {
            self.u32(phi.dst.index() as u32);
            self.u32(phi.args.len() as u32);
            for &(pred, value) in &phi.args {
                self.u32(pred.index() as u32);
                self.value(value);
            }
        }
        self.u32(block.stms.len() as u32);
        for stm in &block.stms {
            self.stm(stm);
        }
        self.terminator(&block.terminator);
    }

    fn stm(&mut self, stm: &Stm) {
        match stm {
            Stm::Assign { dst, src } => {
                self.u8(0);
                self.u32(dst.index() as u32);
                self.value(*src);
            }
            Stm::BinOp { dst, op, lhs, rhs } => {
                self.u8(1);
                self.u32(dst.index() as u32);
                self.u8(match op {
                    BinOp::Add => 0,
                    BinOp::Sub => 1,
                    BinOp::Mul => 2,
                    BinOp::LessThan => 3,
                });
                self.value(*lhs);
                self.value(*rhs);
            }
            Stm::Call { dst, code, args } => {
                self.u8(2);
                self.u32(dst.index() as u32);
                self.u32(code.index() as u32);
                self.u32(args.len() as u32);
                for &arg in args {
                    self.value(arg);
                }
            }
            Stm::New { dst, class } => {
                self.u8(3);
                self.u32(dst.index() as u32);
                self.symbol(*class);
            }
            Stm::ArrayLoad { dst, array, index } => {
                self.u8(4);
                self.u32(dst.index() as u32);
                self.u32(array.index() as u32);
                self.value(*index);
            }
            Stm::ArrayStore { array, index, src } => {
                self.u8(5);
                self.u32(array.index() as u32);
                self.value(*index);
                self.value(*src);
            }
            Stm::Print { value } => {
                self.u8(6);
                self.value(*value);
            }
            Stm::GetVirtualMethod {
                dst,
                object,
                class,
                method,
            } => {
                self.u8(7);
                self.u32(dst.index() as u32);
                self.value(*object);
                self.symbol(*class);
                self.symbol(*method);
            }
        }
    }

    fn terminator(&mut self, terminator: &Terminator) {
        match terminator {
            Terminator::Jump(target) => {
                self.u8(0);
                self.u32(target.index() as u32);
            }
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => {
                self.u8(1);
                self.value(*cond);
                self.u32(then_block.index() as u32);
                self.u32(else_block.index() as u32);
            }
            Terminator::Ret(value) => {
                self.u8(2);
                self.value(*value);
            }
        }
    }
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    symbols: Vec<Symbol>,
}

impl Decoder<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap_or_default();
        Ok(u32::from_le_bytes(bytes))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap_or_default();
        Ok(i64::from_le_bytes(bytes))
    }

    fn str(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadString)
    }

    fn symbol(&mut self) -> Result<Symbol, DecodeError> {
        let index = self.u32()? as usize;
        self.symbols
            .get(index)
            .copied()
            .ok_or(DecodeError::BadSymbol)
    }

    fn ty(&mut self) -> Result<Type, DecodeError> {
        Ok(match self.u8()? {
            0 => Type::Int,
            1 => Type::Class(self.symbol()?),
            2 => Type::IntArray,
            3 => Type::CodePtr,
            tag => return Err(DecodeError::BadTag { what: "type", tag }),
        })
    }

    fn var_decl(&mut self) -> Result<VarDecl, DecodeError> {
        Ok(VarDecl {
            name: self.symbol()?,
            ty: self.ty()?,
        })
    }

    fn var(&mut self) -> Result<VarId, DecodeError> {
        Ok(VarId::new(self.u32()? as usize))
    }

    fn block_id(&mut self) -> Result<BlockId, DecodeError> {
        Ok(BlockId::new(self.u32()? as usize))
    }

    fn value(&mut self) -> Result<Value, DecodeError> {
        Ok(match self.u8()? {
            0 => Value::Imm(self.i64()?),
            1 => Value::Var(self.var()?),
            tag => return Err(DecodeError::BadTag { what: "value", tag }),
        })
    }

    fn function(&mut self) -> Result<Function, DecodeError> {
        let ret = self.ty()?;
        let class = self.symbol()?;
        let name = self.symbol()?;

        let mut formals = Vec::new();
        for _ in 0..self.u32()? {
            formals.push(self.var()?);
        }

        let mut vars = IndexVec::new();
        for _ in 0..self.u32()? {
            vars.push(self.var_decl()?);
        }

        let mut blocks = IndexVec::new();
        for _ in 0..self.u32()? {
            let block = self.block()?;
            blocks.push(block);
        }

        Ok(Function {
            ret,
            class,
            name,
            formals,
            vars,
            blocks,
        })
    }

    fn block(&mut self) -> Result<Block, DecodeError> {
        let mut phis = Vec::new();
        for _ in 0..self.u32()? {
            let dst = self.var()?;
            let mut args = Vec::new();
            for _ in 0..self.u32()? {
                let pred = self.block_id()?;
                let value = self.value()?;
                args.push((pred, value));
            }
            phis.push(Phi { dst, args });
        }

        let mut stms = Vec::new();
        for _ in 0..self.u32()? {
            stms.push(self.stm()?);
        }

        let terminator = self.terminator()?;
        Ok(Block {
            phis,
            stms,
            terminator,
        })
    }

    fn stm(&mut self) -> Result<Stm, DecodeError> {
        Ok(match self.u8()? {
            0 => Stm::Assign {
                dst: self.var()?,
                src: self.value()?,
            },
            1 => Stm::BinOp {
                dst: self.var()?,
                op: match self.u8()? {
                    0 => BinOp::Add,
                    1 => BinOp::Sub,
                    2 => BinOp::Mul,
                    3 => BinOp::LessThan,
                    tag => return Err(DecodeError::BadTag { what: "binop", tag }),
                },
                lhs: self.value()?,
                rhs: self.value()?,
            },
            2 => {
                let dst = self.var()?;
                let code = self.var()?;
                let mut args = Vec::new();
                for _ in 0..self.u32()? {
                    args.push(self.value()?);
                }
                Stm::Call { dst, code, args }
            }
            3 => Stm::New {
                dst: self.var()?,
                class: self.symbol()?,
            },
            4 => Stm::ArrayLoad {
                dst: self.var()?,
                array: self.var()?,
                index: self.value()?,
            },
            5 => Stm::ArrayStore {
                array: self.var()?,
                index: self.value()?,
                src: self.value()?,
            },
            6 => Stm::Print {
                value: self.value()?,
            },
            7 => Stm::GetVirtualMethod {
                dst: self.var()?,
                object: self.value()?,
                class: self.symbol()?,
                method: self.symbol()?,
            },
            tag => return Err(DecodeError::BadTag {
                what: "statement",
                tag,
            }),
        })
    }

    fn terminator(&mut self) -> Result<Terminator, DecodeError> {
        Ok(match self.u8()? {
            0 => Terminator::Jump(self.block_id()?),
            1 => Terminator::Branch {
                cond: self.value()?,
                then_block: self.block_id()?,
                else_block: self.block_id()?,
            },
            2 => Terminator::Ret(self.value()?),
            tag => return Err(DecodeError::BadTag {
                what: "terminator",
                tag,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ast::sample, middle::cfg::ast_lowering};

    #[test]
    fn round_trips_a_lowered_program() {
        let mut interner = Interner::new();
        let ast = sample::factorial(&mut interner);
        let program = ast_lowering::lower_program(&ast, &mut interner);

        let bytes = encode(&program, &interner);
        let (decoded, decoded_interner) = decode(&bytes).unwrap();

        assert_eq!(program, decoded);
        assert_eq!(
            decoded_interner.resolve(decoded.main_class),
            interner.resolve(program.main_class)
        );
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(
            decode(b"NOPE\x01\x00"),
            Err(DecodeError::BadMagic)
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let mut interner = Interner::new();
        let ast = sample::factorial(&mut interner);
        let program = ast_lowering::lower_program(&ast, &mut interner);
        let bytes = encode(&program, &interner);

        assert!(matches!(
            decode(&bytes[..bytes.len() / 2]),
            Err(DecodeError::UnexpectedEof)
        ));
    }

    #[test]
    fn rejects_an_out_of_range_jump() {
        let mut interner = Interner::new();
        let ast = sample::factorial(&mut interner);
        let mut program = ast_lowering::lower_program(&ast, &mut interner);

        // corrupt a terminator target past the end of the block list
        let f = &mut program.functions[0];
        let bogus = BlockId::new(f.blocks.len() + 10);
        let entry = Function::entry();
        f.blocks[entry].terminator = Terminator::Jump(bogus);

        let bytes = encode(&program, &interner);
        assert!(matches!(decode(&bytes), Err(DecodeError::Invalid(_))));
    }
}
