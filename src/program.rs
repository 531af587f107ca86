//! The linked program (spec.md §3 "Program", §4.5 "Runtime state"): the
//! four program-wide index spaces, the resolved start function, and each
//! module's export map. This is what `crate::linker` builds and
//! `crate::runner`/`crate::engine` operate on.

use std::collections::HashMap;

use crate::func::FuncKind;
use crate::global::GlobalInstance;
use crate::memory::MemoryInstance;
use crate::signature::SignatureRegistry;
use crate::table::TableInstance;

/// One linked module's exported names, resolved to program-wide indices.
#[derive(Debug, Clone, Default)]
pub struct ExportMap {
    pub functions: HashMap<String, u32>,
    pub tables: HashMap<String, u32>,
    pub memories: HashMap<String, u32>,
    pub globals: HashMap<String, u32>,
}

/// The fully linked, instantiated aggregate a running program operates on.
/// Function code and signatures are immutable for the program's lifetime;
/// globals, memories, and table contents are the only runtime-mutable state
/// (spec.md §5).
pub struct Program {
    pub signatures: SignatureRegistry,
    pub functions: Vec<FuncKind>,
    pub tables: Vec<TableInstance>,
    pub memories: Vec<MemoryInstance>,
    pub globals: Vec<GlobalInstance>,
    /// Program-wide function index of the main module's start function, if
    /// it declared one.
    pub start: Option<u32>,
    /// Per-module export maps, in link order (module 0 is "main").
    pub exports: Vec<ExportMap>,
}

impl Program {
    pub fn function(&self, index: u32) -> &FuncKind {
        &self.functions[index as usize]
    }

    pub fn table(&self, index: u32) -> &TableInstance {
        &self.tables[index as usize]
    }

    pub fn memory(&self, index: u32) -> &MemoryInstance {
        &self.memories[index as usize]
    }

    pub fn global(&self, index: u32) -> &GlobalInstance {
        &self.globals[index as usize]
    }

    /// Look up an export by name in a specific linked module, the shape the
    /// CLI driver and tests both want ("call the export named X").
    pub fn export_function(&self, module: usize, name: &str) -> Option<u32> {
        self.exports.get(module)?.functions.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{DropKeep, Instruction, InstructionsBuilder, Keep};
    use crate::types::{Limits, Signature, ValueType};
    use crate::value::TaggedValue;

    fn one_function_program() -> Program {
        let mut signatures = SignatureRegistry::new();
        let sig = Signature::new(vec![], None);
        let sig_id = signatures.get_or_intern(sig.clone()).unwrap();
        signatures.freeze();

        let mut b = InstructionsBuilder::new();
        b.push(Instruction::Return(DropKeep {
            drop: 0,
            keep: Keep::None,
        }));
        let wasm = crate::func::WasmFunc {
            signature: sig,
            sig_id,
            locals: vec![],
            code: b.finish(),
        };

        let mut exports = ExportMap::default();
        exports.functions.insert("run".to_string(), 0);

        Program {
            signatures,
            functions: vec![FuncKind::Wasm(wasm)],
            tables: vec![TableInstance::new(Limits {
                initial: 0,
                maximum: None,
            })],
            memories: vec![MemoryInstance::new(Limits {
                initial: 1,
                maximum: None,
            })],
            globals: vec![GlobalInstance::new(TaggedValue::I32(7), false)],
            start: Some(0),
            exports: vec![exports],
        }
    }

    #[test]
    fn accessors_index_into_their_own_space() {
        let p = one_function_program();
        assert!(p.function(0).as_wasm().is_some());
        assert_eq!(p.table(0).get(0), None);
        assert_eq!(p.memory(0).current_pages(), 1);
        assert_eq!(p.global(0).get(), TaggedValue::I32(7));
    }

    #[test]
    fn export_function_resolves_by_module_and_name() {
        let p = one_function_program();
        assert_eq!(p.export_function(0, "run"), Some(0));
        assert_eq!(p.export_function(0, "missing"), None);
        assert_eq!(p.export_function(1, "run"), None);
    }
}
