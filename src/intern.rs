//! String interning. The interner is owned by the compilation session and
//! passed explicitly to whatever needs to resolve a [`Symbol`] back to text;
//! identity and hashing of symbols go through the handle alone.

use hashbrown::HashMap;

/// An index into the session's interning table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Symbol {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Symbol").field(&self.0).finish()
    }
}

#[derive(Debug, Default)]
pub struct Interner {
    strings: Vec<String>,
    lookup: HashMap<String, u32>,
    // counter for compiler-generated names
    fresh: u32,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, string: &str) -> Symbol {
        if let Some(&index) = self.lookup.get(string) {
            return Symbol(index);
        }

        let index = self.strings.len() as u32;
        self.strings.push(string.to_owned());
        self.lookup.insert(string.to_owned(), index);
        Symbol(index)
    }

    /// Generates a name no source program can collide with (`%t.3`, `%x.1`).
    pub fn fresh(&mut self, prefix: &str) -> Symbol {
        let n = self.fresh;
        self.fresh += 1;
        self.intern(&format!("%{prefix}.{n}"))
    }

    pub fn resolve(&self, symbol: Symbol) -> &str {
        &self.strings[symbol.0 as usize]
    }

    /// All interned strings in index order, so the table can be persisted
    /// and rebuilt with identical symbol values.
    pub fn strings(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut interner = Interner::new();
        let a = interner.intern("ComputeFac");
        let b = interner.intern("ComputeFac");
        assert_eq!(a, b);
        assert_eq!(interner.resolve(a), "ComputeFac");
    }

    #[test]
    fn fresh_names_never_collide() {
        let mut interner = Interner::new();
        let a = interner.fresh("t");
        let b = interner.fresh("t");
        assert_ne!(a, b);
    }
}
