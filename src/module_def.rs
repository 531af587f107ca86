//! The decoded-but-not-yet-linked module representation (spec.md §3
//! "Module", "before linking" half). This is what `crate::binary::decode`
//! produces and `crate::linker` consumes.
//!
//! Index spaces here are module-local and follow the binary format's own
//! convention: each of the function/table/memory/global spaces is the
//! imports of that kind (in import-section order) followed by the module's
//! own definitions of that kind (in their own section's order).

use crate::types::{GlobalDescriptor, MemoryDescriptor, Signature, TableDescriptor};
use crate::value::TaggedValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Function,
    Table,
    Memory,
    Global,
}

#[derive(Debug, Clone)]
pub enum ImportKind {
    Function(u32),
    Table(TableDescriptor),
    Memory(MemoryDescriptor),
    Global(GlobalDescriptor),
}

#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub field: String,
    pub kind: ExternalKind,
    /// Module-local index within `kind`'s index space.
    pub index: u32,
}

/// A constant initializer expression (spec.md §3 invariant 2): either a
/// `const` or a `get_global` referencing an already-initialized imported
/// global.
#[derive(Debug, Clone)]
pub enum InitExpr {
    Const(TaggedValue),
    /// Module-local global index, which must name an import.
    GetGlobal(u32),
}

#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub descriptor: GlobalDescriptor,
    pub init: InitExpr,
}

#[derive(Debug, Clone)]
pub struct ElementSegment {
    pub table_index: u32,
    pub offset: InitExpr,
    pub func_indices: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub memory_index: u32,
    pub offset: InitExpr,
    pub bytes: Vec<u8>,
}

/// One function's locals declaration and raw, not-yet-rewritten
/// instruction bytes (spec.md §4.2 "Code (10)").
#[derive(Debug, Clone)]
pub struct FunctionBody {
    pub locals: Vec<crate::types::ValueType>,
    pub code: Vec<u8>,
}

/// A fully decoded module, prior to linking.
#[derive(Debug, Clone, Default)]
pub struct ModuleDef {
    pub types: Vec<Signature>,
    pub imports: Vec<Import>,
    /// Type index of each of the module's own functions (Function section).
    pub functions: Vec<u32>,
    pub tables: Vec<TableDescriptor>,
    pub memories: Vec<MemoryDescriptor>,
    pub globals: Vec<GlobalDef>,
    pub exports: Vec<Export>,
    /// Module-local function index of the start function, if any.
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    /// Parallel to `functions`: body `i` belongs to the function that is
    /// the `i`-th *own* (non-imported) function.
    pub code: Vec<FunctionBody>,
}

impl ModuleDef {
    /// Number of imported functions, i.e. the index of the first own
    /// function in the function index space.
    pub fn imported_function_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Function(_)))
            .count() as u32
    }

    pub fn imported_table_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Table(_)))
            .count() as u32
    }

    pub fn imported_memory_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Memory(_)))
            .count() as u32
    }

    pub fn imported_global_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Global(_)))
            .count() as u32
    }

    /// Total functions (imported + own) in this module's local index space.
    pub fn total_functions(&self) -> u32 {
        self.imported_function_count() + self.functions.len() as u32
    }

    pub fn total_tables(&self) -> u32 {
        self.imported_table_count() + self.tables.len() as u32
    }

    pub fn total_memories(&self) -> u32 {
        self.imported_memory_count() + self.memories.len() as u32
    }

    pub fn total_globals(&self) -> u32 {
        self.imported_global_count() + self.globals.len() as u32
    }

    /// Type index of the function at local index `idx`, whether imported
    /// or own.
    pub fn function_type_index(&self, idx: u32) -> Option<u32> {
        let imported = self.imported_function_count();
        if idx < imported {
            let mut seen = 0u32;
            for imp in &self.imports {
                if let ImportKind::Function(ty) = imp.kind {
                    if seen == idx {
                        return Some(ty);
                    }
                    seen += 1;
                }
            }
            None
        } else {
            self.functions.get((idx - imported) as usize).copied()
        }
    }
}
