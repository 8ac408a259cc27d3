//! A tiny interpreter for the subset of AT&T-syntax x86-64 the compiler
//! emits. It is just enough machine to run the generated programs in the
//! test suite: word-sized integer registers, a flat word-addressed memory
//! holding the stack, the heap and the vtables, and the two runtime entry
//! points (`mj_alloc`, `mj_print`) handled as intrinsics.

use hashbrown::HashMap;

const DATA_BASE: i64 = 0x10_0000;
const HEAP_BASE: i64 = 0x20_0000;
const STACK_TOP: i64 = 0x7f_0000;
const SENTINEL: i64 = -1;

#[derive(Debug, Clone)]
enum Operand {
    Imm(i64),
    Reg(String),
    /// `offset(%base)` or `(%base,%index,scale)`.
    Mem {
        base: String,
        index: Option<String>,
        scale: i64,
        offset: i64,
    },
}

#[derive(Debug, Clone)]
enum Ins {
    Mov(Operand, Operand),
    Add(Operand, Operand),
    Sub(Operand, Operand),
    Mul(Operand, Operand),
    Cmp(Operand, Operand),
    Setl,
    Movzbq,
    Lea(String, Operand),
    Jmp(String),
    Je(String),
    Jne(String),
    Call(String),
    CallIndirect(Operand),
    Push(Operand),
    Pop(Operand),
    Leave,
    Ret,
}

struct Image {
    code: Vec<Ins>,
    labels: HashMap<String, i64>,
    /// Word values to place at fixed data addresses, with code labels
    /// resolved to instruction indices.
    data: Vec<(i64, String)>,
}

/// Assembles and runs `asm` from its `main` symbol, returning everything the
/// program printed.
pub fn run(asm: &str) -> Vec<i64> {
    let image = parse(asm);
    Machine::new(&image).run()
}

fn parse(asm: &str) -> Image {
    let mut code = Vec::new();
    let mut labels = HashMap::new();
    let mut data = Vec::new();
    let mut in_data = false;
    let mut data_cursor = DATA_BASE;

    for raw in asm.lines() {
        let line = match raw.find('#') {
            Some(i) => raw[..i].trim(),
            None => raw.trim(),
        };
        if line.is_empty() {
            continue;
        }

        if let Some(label) = line.strip_suffix(':') {
            if in_data {
                labels.insert(label.to_owned(), data_cursor);
            } else {
                labels.insert(label.to_owned(), code.len() as i64);
            }
            continue;
        }

        let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
            Some((m, r)) => (m, r.trim()),
            None => (line, ""),
        };
        match mnemonic {
            ".data" => in_data = true,
            ".text" => in_data = false,
            ".globl" => {}
            ".quad" => {
                data.push((data_cursor, rest.to_owned()));
                data_cursor += 8;
            }
            _ => code.push(instruction(mnemonic, rest)),
        }
    }

    Image { code, labels, data }
}

fn instruction(mnemonic: &str, rest: &str) -> Ins {
    // label-shaped operands first, so they never reach the operand parser
    match mnemonic {
        "setl" => return Ins::Setl,
        "movzbq" => return Ins::Movzbq,
        "leave" => return Ins::Leave,
        "ret" => return Ins::Ret,
        "jmp" => return Ins::Jmp(rest.to_owned()),
        "je" => return Ins::Je(rest.to_owned()),
        "jne" => return Ins::Jne(rest.to_owned()),
        "call" => {
            return match rest.strip_prefix('*') {
                Some(indirect) => Ins::CallIndirect(operand(indirect)),
                None => Ins::Call(rest.to_owned()),
            }
        }
        "leaq" => {
            let (label, _) = rest
                .split_once("(%rip)")
                .unwrap_or_else(|| panic!("leaq without %rip: {rest}"));
            let dst = rest
                .rsplit_once(',')
                .map(|(_, d)| operand(d.trim()))
                .unwrap_or_else(|| panic!("leaq without a destination: {rest}"));
            return Ins::Lea(label.trim().to_owned(), dst);
        }
        _ => {}
    }

    let ops = operands(rest);
    match (mnemonic, ops.as_slice()) {
        ("movq", [a, b]) => Ins::Mov(a.clone(), b.clone()),
        ("addq", [a, b]) => Ins::Add(a.clone(), b.clone()),
        ("subq", [a, b]) => Ins::Sub(a.clone(), b.clone()),
        ("imulq", [a, b]) => Ins::Mul(a.clone(), b.clone()),
        ("cmpq", [a, b]) => Ins::Cmp(a.clone(), b.clone()),
        ("pushq", [a]) => Ins::Push(a.clone()),
        ("popq", [a]) => Ins::Pop(a.clone()),
        _ => panic!("unsupported instruction: {mnemonic} {rest}"),
    }
}

/// Splits at commas outside parentheses, then parses each piece.
fn operands(rest: &str) -> Vec<Operand> {
    if rest.is_empty() {
        return vec![];
    }
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(rest[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(rest[start..].trim());
    parts.iter().map(|p| operand(p)).collect()
}

fn operand(text: &str) -> Operand {
    if let Some(imm) = text.strip_prefix('$') {
        return Operand::Imm(imm.parse().unwrap_or_else(|_| panic!("bad immediate: {text}")));
    }
    if text.starts_with('%') {
        return Operand::Reg(text.to_owned());
    }
    let (offset, inner) = match text.split_once('(') {
        Some((off, rest)) => {
            let offset = if off.is_empty() {
                0
            } else {
                off.parse().unwrap_or_else(|_| panic!("bad offset: {text}"))
            };
            (offset, rest.trim_end_matches(')'))
        }
        None => panic!("unsupported operand: {text}"),
    };
    let mut fields = inner.split(',').map(str::trim);
    let base = fields.next().unwrap().to_owned();
    let index = fields.next().map(str::to_owned);
    let scale = fields.next().map(|s| s.parse().unwrap()).unwrap_or(1);
    Operand::Mem {
        base,
        index,
        scale,
        offset,
    }
}

struct Machine<'a> {
    image: &'a Image,
    regs: HashMap<String, i64>,
    memory: HashMap<i64, i64>,
    heap: i64,
    /// Result of the last cmpq as (dst < src, dst == src).
    flags: (bool, bool),
    output: Vec<i64>,
}

impl<'a> Machine<'a> {
    fn new(image: &'a Image) -> Self {
        let mut memory = HashMap::new();
        for (addr, symbol) in &image.data {
            let target = *image
                .labels
                .get(symbol)
                .unwrap_or_else(|| panic!("unresolved .quad {symbol}"));
            memory.insert(*addr, target);
        }
        let mut regs = HashMap::new();
        regs.insert("%rsp".to_owned(), STACK_TOP);
        Machine {
            image,
            regs,
            memory,
            heap: HEAP_BASE,
            flags: (false, false),
            output: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<i64> {
        self.push(SENTINEL);
        let mut pc = self.target("main");
        loop {
            let ins = &self.image.code[pc as usize];
            pc += 1;
            match ins.clone() {
                Ins::Mov(src, dst) => {
                    let v = self.read(&src);
                    self.write(&dst, v);
                }
                Ins::Add(src, dst) => {
                    let v = self.read(&dst).wrapping_add(self.read(&src));
                    self.write(&dst, v);
                }
                Ins::Sub(src, dst) => {
                    let v = self.read(&dst).wrapping_sub(self.read(&src));
                    self.write(&dst, v);
                }
                Ins::Mul(src, dst) => {
                    let v = self.read(&dst).wrapping_mul(self.read(&src));
                    self.write(&dst, v);
                }
                Ins::Cmp(src, dst) => {
                    let (s, d) = (self.read(&src), self.read(&dst));
                    self.flags = (d < s, d == s);
                }
                Ins::Setl => {
                    let rax = self.reg("%rax") & !0xff;
                    self.regs.insert("%rax".to_owned(), rax | i64::from(self.flags.0));
                }
                Ins::Movzbq => {
                    let rax = self.reg("%rax") & 0xff;
                    self.regs.insert("%rax".to_owned(), rax);
                }
                Ins::Lea(label, dst) => {
                    let addr = self.target(&label);
                    self.write(&dst, addr);
                }
                Ins::Jmp(label) => pc = self.target(&label),
                Ins::Je(label) => {
                    if self.flags.1 {
                        pc = self.target(&label);
                    }
                }
                Ins::Jne(label) => {
                    if !self.flags.1 {
                        pc = self.target(&label);
                    }
                }
                Ins::Call(label) => match label.as_str() {
                    "mj_alloc" => {
                        let size = self.reg("%rdi");
                        let vtable = self.reg("%rsi");
                        let obj = self.heap;
                        self.heap += size;
                        self.memory.insert(obj, vtable);
                        self.regs.insert("%rax".to_owned(), obj);
                    }
                    "mj_print" => {
                        let value = self.reg("%rdi");
                        self.output.push(value);
                    }
                    _ => {
                        self.push(pc);
                        pc = self.target(&label);
                    }
                },
                Ins::CallIndirect(op) => {
                    let entry = self.read(&op);
                    self.push(pc);
                    pc = entry;
                }
                Ins::Push(op) => {
                    let v = self.read(&op);
                    self.push(v);
                }
                Ins::Pop(op) => {
                    let v = self.pop();
                    self.write(&op, v);
                }
                Ins::Leave => {
                    let rbp = self.reg("%rbp");
                    self.regs.insert("%rsp".to_owned(), rbp);
                    let v = self.pop();
                    self.regs.insert("%rbp".to_owned(), v);
                }
                Ins::Ret => {
                    pc = self.pop();
                    if pc == SENTINEL {
                        return self.output;
                    }
                }
            }
        }
    }

    fn target(&self, label: &str) -> i64 {
        *self
            .image
            .labels
            .get(label)
            .unwrap_or_else(|| panic!("unresolved label: {label}"))
    }

    fn reg(&self, name: &str) -> i64 {
        self.regs.get(name).copied().unwrap_or(0)
    }

    fn address(&self, base: &str, index: &Option<String>, scale: i64, offset: i64) -> i64 {
        let mut addr = self.reg(base) + offset;
        if let Some(index) = index {
            addr += self.reg(index) * scale;
        }
        addr
    }

    fn read(&self, op: &Operand) -> i64 {
        match op {
            Operand::Imm(v) => *v,
            Operand::Reg(name) => self.reg(name),
            Operand::Mem {
                base,
                index,
                scale,
                offset,
            } => {
                let addr = self.address(base, index, *scale, *offset);
                self.memory.get(&addr).copied().unwrap_or(0)
            }
        }
    }

    fn write(&mut self, op: &Operand, value: i64) {
        match op {
            Operand::Imm(_) => panic!("write to an immediate"),
            Operand::Reg(name) => {
                self.regs.insert(name.clone(), value);
            }
            Operand::Mem {
                base,
                index,
                scale,
                offset,
            } => {
                let addr = self.address(base, index, *scale, *offset);
                self.memory.insert(addr, value);
            }
        }
    }

    fn push(&mut self, value: i64) {
        let rsp = self.reg("%rsp") - 8;
        self.regs.insert("%rsp".to_owned(), rsp);
        self.memory.insert(rsp, value);
    }

    fn pop(&mut self) -> i64 {
        let rsp = self.reg("%rsp");
        let value = self.memory.get(&rsp).copied().unwrap_or(0);
        self.regs.insert("%rsp".to_owned(), rsp + 8);
        value
    }
}
