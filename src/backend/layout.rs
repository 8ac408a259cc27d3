//! Object and vtable layout. Everything is one machine word: an object is a
//! vtable pointer at offset 0 followed by its fields, and a vtable is an
//! array of code pointers indexed by the method's fixed dispatch offset.
//! The prefixing discipline upstream guarantees a method keeps its offset
//! in every subclass, so dispatch never needs the runtime class.

use hashbrown::HashMap;

use crate::{
    backend::x64::WORD,
    fatal::ice,
    intern::Symbol,
    middle::cfg::Program,
};

pub const VTABLE_PTR_OFFSET: i64 = 0;

pub struct Layout {
    classes: HashMap<Symbol, ClassLayout>,
}

struct ClassLayout {
    /// Allocation size in bytes, vtable pointer included.
    size: i64,
    /// Byte offset of each method's slot within the vtable.
    methods: HashMap<Symbol, i64>,
    /// Byte offset of each field within the object.
    fields: HashMap<Symbol, i64>,
}

impl Layout {
    pub fn of_program(program: &Program) -> Self {
        let mut classes = HashMap::new();
        for vtable in &program.vtables {
            let struct_def = program
                .struct_def(vtable.class)
                .unwrap_or_else(|| ice!("class has a vtable but no struct layout"));

            let methods = vtable
                .entries
                .iter()
                .enumerate()
                .map(|(i, entry)| (entry.method, i as i64 * WORD))
                .collect();
            let fields = struct_def
                .fields
                .iter()
                .enumerate()
                .map(|(i, field)| (field.name, (i as i64 + 1) * WORD))
                .collect();

            classes.insert(
                vtable.class,
                ClassLayout {
                    size: (struct_def.fields.len() as i64 + 1) * WORD,
                    methods,
                    fields,
                },
            );
        }
        Self { classes }
    }

    fn class(&self, class: Symbol) -> &ClassLayout {
        self.classes
            .get(&class)
            .unwrap_or_else(|| ice!("layout query for an unknown class"))
    }

    pub fn size_of(&self, class: Symbol) -> i64 {
        self.class(class).size
    }

    pub fn method_offset(&self, class: Symbol, method: Symbol) -> i64 {
        match self.class(class).methods.get(&method) {
            Some(&offset) => offset,
            None => ice!("dispatch offset for a method the class does not have"),
        }
    }

    pub fn field_offset(&self, class: Symbol, field: Symbol) -> i64 {
        match self.class(class).fields.get(&field) {
            Some(&offset) => offset,
            None => ice!("offset for a field the class does not have"),
        }
    }
}
