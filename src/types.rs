//! Shared type table and layout engine
//!
//! The table is produced by the upstream checker and mutated in place by
//! the generator: the first size or alignment query for a type triggers
//! recursive layout and the results are memoised onto the entry. Struct
//! field offsets are recorded alongside, in declaration order.

use std::collections::HashMap;

use crate::diag::n_error;
use crate::Result;

/// Index into the shared [`TypeTable`].
pub type TypeId = usize;

// Well-known entries, in the order `TypeTable::new` registers them.
pub const VOID: TypeId = 0;
pub const I8: TypeId = 1;
pub const I16: TypeId = 2;
pub const INT: TypeId = 3;
pub const I64: TypeId = 4;
pub const U8: TypeId = 5;
pub const U16: TypeId = 6;
pub const U32: TypeId = 7;
pub const U64: TypeId = 8;
pub const ISIZE: TypeId = 9;
pub const USIZE: TypeId = 10;
pub const BOOL: TypeId = 11;
pub const CHAR: TypeId = 12;
pub const RUNE: TypeId = 13;
pub const F32: TypeId = 14;
pub const F64: TypeId = 15;
pub const FLOAT_LITERAL: TypeId = 16;
pub const INT_LITERAL: TypeId = 17;
pub const STRING: TypeId = 18;

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Void,
    I8,
    I16,
    /// Default integer, 32 bits.
    Int,
    I64,
    U8,
    U16,
    U32,
    U64,
    Isize,
    Usize,
    Bool,
    Char,
    Rune,
    F32,
    F64,
    /// Untyped float literal, treated as f64.
    FloatLiteral,
    /// Untyped integer literal, treated as i64.
    IntLiteral,
    /// String payload address; the bytes live in the string pool.
    String,
    Ptr {
        base: TypeId,
    },
    Struct {
        fields: Vec<StructField>,
    },
    Enum {
        is_flag: bool,
        variants: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub typ: TypeId,
}

/// One entry of the shared table. Layout results are memoised here.
#[derive(Debug, Clone)]
pub struct TypeSym {
    pub name: String,
    pub kind: TypeKind,
    size: Option<u32>,
    align: Option<u32>,
    /// Field byte offsets in declaration order, filled on first layout.
    offsets: Vec<u32>,
}

impl TypeSym {
    fn new(name: &str, kind: TypeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            size: None,
            align: None,
            offsets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeTable {
    syms: Vec<TypeSym>,
    by_name: HashMap<String, TypeId>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    /// A table pre-seeded with the primitive types at their well-known
    /// indices.
    pub fn new() -> Self {
        let mut table = Self {
            syms: Vec::new(),
            by_name: HashMap::new(),
        };
        table.register("void", TypeKind::Void);
        table.register("i8", TypeKind::I8);
        table.register("i16", TypeKind::I16);
        table.register("int", TypeKind::Int);
        table.register("i64", TypeKind::I64);
        table.register("u8", TypeKind::U8);
        table.register("u16", TypeKind::U16);
        table.register("u32", TypeKind::U32);
        table.register("u64", TypeKind::U64);
        table.register("isize", TypeKind::Isize);
        table.register("usize", TypeKind::Usize);
        table.register("bool", TypeKind::Bool);
        table.register("char", TypeKind::Char);
        table.register("rune", TypeKind::Rune);
        table.register("f32", TypeKind::F32);
        table.register("f64", TypeKind::F64);
        table.register("float literal", TypeKind::FloatLiteral);
        table.register("int literal", TypeKind::IntLiteral);
        table.register("string", TypeKind::String);
        table
    }

    /// Register a named type and return its index.
    pub fn register(&mut self, name: &str, kind: TypeKind) -> TypeId {
        let id = self.syms.len();
        self.syms.push(TypeSym::new(name, kind));
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn sym(&self, id: TypeId) -> &TypeSym {
        &self.syms[id]
    }

    pub fn name(&self, id: TypeId) -> &str {
        &self.syms[id].name
    }

    /// Strip pointer indirection: `&Point` resolves to `Point`.
    pub fn base_type(&self, id: TypeId) -> TypeId {
        match self.syms[id].kind {
            TypeKind::Ptr { base } => self.base_type(base),
            _ => id,
        }
    }

    pub fn is_struct(&self, id: TypeId) -> bool {
        matches!(self.syms[id].kind, TypeKind::Struct { .. })
    }

    pub fn is_enum(&self, id: TypeId) -> bool {
        matches!(self.syms[id].kind, TypeKind::Enum { .. })
    }

    pub fn is_float(&self, id: TypeId) -> bool {
        matches!(
            self.syms[id].kind,
            TypeKind::F32 | TypeKind::F64 | TypeKind::FloatLiteral
        )
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(
            self.syms[id].kind,
            TypeKind::Ptr { .. } | TypeKind::String | TypeKind::Usize | TypeKind::Isize
        )
    }

    pub fn is_signed(&self, id: TypeId) -> bool {
        matches!(
            self.syms[id].kind,
            TypeKind::I8
                | TypeKind::I16
                | TypeKind::Int
                | TypeKind::I64
                | TypeKind::Isize
                | TypeKind::IntLiteral
        )
    }

    /// Size of a type in bytes. First query lays the type out.
    pub fn size_of(&mut self, id: TypeId) -> Result<u32> {
        Ok(self.layout(id, &mut Vec::new())?.0)
    }

    /// Alignment of a type in bytes.
    pub fn align_of(&mut self, id: TypeId) -> Result<u32> {
        Ok(self.layout(id, &mut Vec::new())?.1)
    }

    /// Byte offset of struct field `index`, in declaration order.
    pub fn field_offset(&mut self, id: TypeId, index: usize) -> Result<u32> {
        self.layout(id, &mut Vec::new())?;
        self.syms[id]
            .offsets
            .get(index)
            .copied()
            .ok_or_else(|| n_error(format!("field index {index} out of range for {}", self.name(id))))
    }

    /// Resolve a struct field by name to (index, type).
    pub fn find_field(&self, id: TypeId, field: &str) -> Result<(usize, TypeId)> {
        match &self.syms[id].kind {
            TypeKind::Struct { fields } => fields
                .iter()
                .position(|f| f.name == field)
                .map(|i| (i, fields[i].typ))
                .ok_or_else(|| {
                    n_error(format!("struct {} has no field {field}", self.name(id)))
                }),
            _ => Err(n_error(format!(
                "field access on non-struct type {}",
                self.name(id)
            ))),
        }
    }

    fn layout(&mut self, id: TypeId, visiting: &mut Vec<TypeId>) -> Result<(u32, u32)> {
        if let (Some(size), Some(align)) = (self.syms[id].size, self.syms[id].align) {
            return Ok((size, align));
        }
        if visiting.contains(&id) {
            // Upstream must reject cyclic struct types; meeting one here
            // is a generator bug.
            return Err(n_error(format!("cyclic struct type: {}", self.name(id))));
        }
        visiting.push(id);
        let (size, align) = match self.syms[id].kind.clone() {
            TypeKind::Void => (0, 1),
            TypeKind::I8 | TypeKind::U8 | TypeKind::Bool | TypeKind::Char => (1, 1),
            TypeKind::I16 | TypeKind::U16 => (2, 2),
            TypeKind::Int | TypeKind::U32 | TypeKind::F32 | TypeKind::Rune => (4, 4),
            TypeKind::I64
            | TypeKind::U64
            | TypeKind::Isize
            | TypeKind::Usize
            | TypeKind::F64
            | TypeKind::FloatLiteral
            | TypeKind::IntLiteral => (8, 8),
            TypeKind::String | TypeKind::Ptr { .. } => (8, 8),
            TypeKind::Enum { .. } => (4, 4),
            TypeKind::Struct { fields } => {
                let mut offset = 0u32;
                let mut max_align = 1u32;
                let mut offsets = Vec::with_capacity(fields.len());
                for field in &fields {
                    let (fsize, falign) = self.layout(field.typ, visiting)?;
                    offset = align_up(offset, falign);
                    offsets.push(offset);
                    offset += fsize;
                    max_align = max_align.max(falign);
                }
                let size = align_up(offset.max(1), max_align);
                self.syms[id].offsets = offsets;
                (size, max_align)
            }
        };
        visiting.pop();
        self.syms[id].size = Some(size);
        self.syms[id].align = Some(align);
        Ok((size, align))
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_sizes() {
        let mut t = TypeTable::new();
        assert_eq!(t.size_of(I8).unwrap(), 1);
        assert_eq!(t.size_of(U16).unwrap(), 2);
        assert_eq!(t.size_of(INT).unwrap(), 4);
        assert_eq!(t.size_of(U32).unwrap(), 4);
        assert_eq!(t.size_of(F32).unwrap(), 4);
        assert_eq!(t.size_of(I64).unwrap(), 8);
        assert_eq!(t.size_of(USIZE).unwrap(), 8);
        assert_eq!(t.size_of(FLOAT_LITERAL).unwrap(), 8);
        assert_eq!(t.size_of(INT_LITERAL).unwrap(), 8);
        assert_eq!(t.size_of(BOOL).unwrap(), 1);
        assert_eq!(t.size_of(CHAR).unwrap(), 1);
        assert_eq!(t.size_of(RUNE).unwrap(), 4);
    }

    #[test]
    fn test_size_multiple_of_align() {
        let mut t = TypeTable::new();
        let point = t.register(
            "Point",
            TypeKind::Struct {
                fields: vec![
                    StructField { name: "x".into(), typ: I8 },
                    StructField { name: "y".into(), typ: I64 },
                    StructField { name: "z".into(), typ: INT },
                ],
            },
        );
        for id in 0..=point {
            let size = t.size_of(id).unwrap();
            let align = t.align_of(id).unwrap();
            assert_eq!(size % align, 0, "type {}", t.name(id));
        }
    }

    #[test]
    fn test_struct_field_offsets_padded_and_monotonic() {
        let mut t = TypeTable::new();
        let s = t.register(
            "Mixed",
            TypeKind::Struct {
                fields: vec![
                    StructField { name: "a".into(), typ: I8 },
                    StructField { name: "b".into(), typ: INT },
                    StructField { name: "c".into(), typ: I8 },
                    StructField { name: "d".into(), typ: I64 },
                ],
            },
        );
        assert_eq!(t.field_offset(s, 0).unwrap(), 0);
        assert_eq!(t.field_offset(s, 1).unwrap(), 4);
        assert_eq!(t.field_offset(s, 2).unwrap(), 8);
        assert_eq!(t.field_offset(s, 3).unwrap(), 16);
        assert_eq!(t.size_of(s).unwrap(), 24);
        assert_eq!(t.align_of(s).unwrap(), 8);

        // Offsets are monotonic with no overlap.
        let fields = match &t.sym(s).kind {
            TypeKind::Struct { fields } => fields.clone(),
            _ => unreachable!(),
        };
        for i in 0..fields.len() - 1 {
            let off = t.field_offset(s, i).unwrap();
            let next = t.field_offset(s, i + 1).unwrap();
            let fsize = t.size_of(fields[i].typ).unwrap();
            assert!(next >= off + fsize);
            let falign = t.align_of(fields[i + 1].typ).unwrap();
            assert_eq!(next % falign, 0);
        }
    }

    #[test]
    fn test_enum_is_four_bytes() {
        let mut t = TypeTable::new();
        let e = t.register(
            "Color",
            TypeKind::Enum {
                is_flag: false,
                variants: vec!["red".into(), "green".into()],
            },
        );
        assert_eq!(t.size_of(e).unwrap(), 4);
        assert_eq!(t.align_of(e).unwrap(), 4);
    }

    #[test]
    fn test_nested_struct_layout() {
        let mut t = TypeTable::new();
        let inner = t.register(
            "Inner",
            TypeKind::Struct {
                fields: vec![
                    StructField { name: "a".into(), typ: I64 },
                    StructField { name: "b".into(), typ: I8 },
                ],
            },
        );
        let outer = t.register(
            "Outer",
            TypeKind::Struct {
                fields: vec![
                    StructField { name: "flag".into(), typ: BOOL },
                    StructField { name: "inner".into(), typ: inner },
                ],
            },
        );
        assert_eq!(t.size_of(inner).unwrap(), 16);
        assert_eq!(t.field_offset(outer, 1).unwrap(), 8);
        assert_eq!(t.size_of(outer).unwrap(), 24);
    }

    #[test]
    fn test_cyclic_struct_is_fatal() {
        let mut t = TypeTable::new();
        let id = t.syms.len();
        t.register(
            "Loop",
            TypeKind::Struct {
                fields: vec![StructField { name: "next".into(), typ: id }],
            },
        );
        assert!(t.size_of(id).is_err());
    }

    #[test]
    fn test_pointer_breaks_cycle() {
        let mut t = TypeTable::new();
        let id = t.syms.len() + 1;
        let ptr = t.register("&Node", TypeKind::Ptr { base: id });
        let node = t.register(
            "Node",
            TypeKind::Struct {
                fields: vec![
                    StructField { name: "val".into(), typ: I64 },
                    StructField { name: "next".into(), typ: ptr },
                ],
            },
        );
        assert_eq!(node, id);
        assert_eq!(t.size_of(node).unwrap(), 16);
        assert_eq!(t.base_type(ptr), node);
    }
}
