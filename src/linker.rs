//! The module linker (spec.md §4.4): merges imports and exports across
//! modules into the program-wide index spaces, rewrites every own function
//! body, evaluates constant initializers in dependency order, applies
//! element and data segments, and resolves the start function. One private
//! function per algorithm step, run in the order spec.md lays out.
//!
//! Cross-module import resolution has no host-supplied import object in
//! this core, so an import's declared module name is kept only for
//! diagnostics; imports and exports are unified purely by field name plus
//! kind across the whole set of linked modules (see DESIGN.md).

use std::collections::HashMap;

use crate::error::LoadError;
use crate::func::{FuncKind, WasmFunc};
use crate::global::GlobalInstance;
use crate::memory::MemoryInstance;
use crate::module_def::{ExternalKind, ImportKind, InitExpr, ModuleDef};
use crate::program::{ExportMap, Program};
use crate::rewrite::{rewrite_function, RewriteContext};
use crate::signature::{SigId, SignatureRegistry};
use crate::table::TableInstance;
use crate::types::{GlobalDescriptor, Limits, Signature};
use crate::value::TaggedValue;

/// Link one or more decoded modules into a running `Program`. `modules[0]`
/// is "main": its start function (if any) becomes the program's start.
pub fn link(modules: &[ModuleDef]) -> Result<Program, LoadError> {
    let mut l = Linker::new(modules);
    l.intern_signatures();
    l.declare()?;
    l.define()?;
    let exports = l.export();
    l.rewrite_code()?;
    let resolved_globals = l.evaluate_initializers()?;
    l.apply_segments(&resolved_globals)?;
    let start = l.resolve_start()?;

    l.signatures.freeze();
    Ok(Program {
        signatures: l.signatures,
        functions: l.functions.into_iter().collect::<Option<Vec<_>>>().ok_or_else(|| {
            LoadError::ImportTypeMismatch("an imported function was never defined".into())
        })?,
        tables: l.tables.into_iter().collect::<Option<Vec<_>>>().ok_or_else(|| {
            LoadError::ImportTypeMismatch("an imported table was never defined".into())
        })?,
        memories: l.memories.into_iter().collect::<Option<Vec<_>>>().ok_or_else(|| {
            LoadError::ImportTypeMismatch("an imported memory was never defined".into())
        })?,
        globals: l
            .globals
            .into_iter()
            .zip(resolved_globals)
            .map(|(desc, value)| desc.map(|d| GlobalInstance::new(value, d.mutable)))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| LoadError::ImportTypeMismatch("an imported global was never defined".into()))?,
        start,
        exports,
    })
}

/// A resolved (module-local index -> program-wide index) map, one per
/// index space, one per module.
#[derive(Default, Clone)]
struct IndexMaps {
    functions: Vec<u32>,
    tables: Vec<u32>,
    memories: Vec<u32>,
    globals: Vec<u32>,
}

/// A global initializer once every reference has been resolved to a
/// program-wide index, ready for the dependency-ordered evaluation pass.
enum ResolvedInit {
    Const(TaggedValue),
    Ref(u32),
}

struct Linker<'m> {
    modules: &'m [ModuleDef],
    maps: Vec<IndexMaps>,
    sig_maps: Vec<Vec<SigId>>,
    signatures: SignatureRegistry,

    functions: Vec<Option<FuncKind>>,
    func_required: Vec<Signature>,
    func_placeholders: HashMap<String, u32>,

    tables: Vec<Option<TableInstance>>,
    table_required: Vec<Limits>,
    table_placeholders: HashMap<String, u32>,

    memories: Vec<Option<MemoryInstance>>,
    memory_required: Vec<Limits>,
    memory_placeholders: HashMap<String, u32>,

    globals: Vec<Option<GlobalDescriptor>>,
    global_required: Vec<GlobalDescriptor>,
    global_placeholders: HashMap<String, u32>,
    /// Owner-supplied initializer for each program-wide global index,
    /// filled in during `define`.
    global_inits: Vec<Option<ResolvedInit>>,

    /// (module index, local code index, program function index) awaiting
    /// `rewrite_code`.
    pending_funcs: Vec<(usize, usize, u32)>,
    /// (module index, element/data segment) deferred to `apply_segments`.
    pending_elements: Vec<(usize, usize)>,
    pending_data: Vec<(usize, usize)>,
}

fn malformed_import(msg: impl Into<String>) -> LoadError {
    LoadError::ImportTypeMismatch(msg.into())
}

/// Most-restrictive merge of two declared minimums for the same name:
/// the larger initial, the smaller maximum. `None` if unsatisfiable (a
/// maximum below some other import's required initial).
fn merge_limits(a: Limits, b: Limits) -> Option<Limits> {
    let initial = a.initial.max(b.initial);
    let maximum = match (a.maximum, b.maximum) {
        (None, None) => None,
        (Some(m), None) | (None, Some(m)) => Some(m),
        (Some(x), Some(y)) => Some(x.min(y)),
    };
    if let Some(max) = maximum {
        if max < initial {
            return None;
        }
    }
    Some(Limits { initial, maximum })
}

impl<'m> Linker<'m> {
    fn new(modules: &'m [ModuleDef]) -> Linker<'m> {
        Linker {
            modules,
            maps: vec![IndexMaps::default(); modules.len()],
            sig_maps: vec![Vec::new(); modules.len()],
            signatures: SignatureRegistry::new(),
            functions: Vec::new(),
            func_required: Vec::new(),
            func_placeholders: HashMap::new(),
            tables: Vec::new(),
            table_required: Vec::new(),
            table_placeholders: HashMap::new(),
            memories: Vec::new(),
            memory_required: Vec::new(),
            memory_placeholders: HashMap::new(),
            globals: Vec::new(),
            global_required: Vec::new(),
            global_placeholders: HashMap::new(),
            global_inits: Vec::new(),
            pending_funcs: Vec::new(),
            pending_elements: Vec::new(),
            pending_data: Vec::new(),
        }
    }

    /// Intern every module's signature table up front (spec.md §4.3); every
    /// later step needs a `SigId` for a module-local type index.
    fn intern_signatures(&mut self) {
        for (m, module) in self.modules.iter().enumerate() {
            for sig in &module.types {
                let id = self
                    .signatures
                    .get_or_intern(sig.clone())
                    .expect("registry is not frozen during linking");
                self.sig_maps[m].push(id);
            }
        }
    }

    /// Step 1: walk every module's imports, creating or reusing placeholder
    /// slots in each index space.
    fn declare(&mut self) -> Result<(), LoadError> {
        for (m, module) in self.modules.iter().enumerate() {
            for import in &module.imports {
                match &import.kind {
                    ImportKind::Function(type_idx) => {
                        let sig = module.types[*type_idx as usize].clone();
                        let idx = if let Some(&existing) = self.func_placeholders.get(&import.field) {
                            if self.func_required[existing as usize] != sig {
                                return Err(malformed_import(format!(
                                    "import {}.{} signature mismatch",
                                    import.module, import.field
                                )));
                            }
                            existing
                        } else {
                            let idx = self.functions.len() as u32;
                            self.functions.push(None);
                            self.func_required.push(sig);
                            self.func_placeholders.insert(import.field.clone(), idx);
                            idx
                        };
                        self.maps[m].functions.push(idx);
                    }
                    ImportKind::Table(desc) => {
                        let idx = if let Some(&existing) = self.table_placeholders.get(&import.field) {
                            let merged = merge_limits(self.table_required[existing as usize], desc.limits)
                                .ok_or_else(|| {
                                    malformed_import(format!(
                                        "import {}.{} table limits incompatible",
                                        import.module, import.field
                                    ))
                                })?;
                            self.table_required[existing as usize] = merged;
                            existing
                        } else {
                            let idx = self.tables.len() as u32;
                            self.tables.push(None);
                            self.table_required.push(desc.limits);
                            self.table_placeholders.insert(import.field.clone(), idx);
                            idx
                        };
                        self.maps[m].tables.push(idx);
                    }
                    ImportKind::Memory(desc) => {
                        let idx = if let Some(&existing) = self.memory_placeholders.get(&import.field) {
                            let merged =
                                merge_limits(self.memory_required[existing as usize], desc.limits)
                                    .ok_or_else(|| {
                                        malformed_import(format!(
                                            "import {}.{} memory limits incompatible",
                                            import.module, import.field
                                        ))
                                    })?;
                            self.memory_required[existing as usize] = merged;
                            existing
                        } else {
                            let idx = self.memories.len() as u32;
                            self.memories.push(None);
                            self.memory_required.push(desc.limits);
                            self.memory_placeholders.insert(import.field.clone(), idx);
                            idx
                        };
                        self.maps[m].memories.push(idx);
                    }
                    ImportKind::Global(desc) => {
                        if desc.mutable {
                            return Err(malformed_import(format!(
                                "import {}.{} is a mutable global, forbidden in MVP",
                                import.module, import.field
                            )));
                        }
                        let idx = if let Some(&existing) = self.global_placeholders.get(&import.field) {
                            if self.global_required[existing as usize] != *desc {
                                return Err(malformed_import(format!(
                                    "import {}.{} global type mismatch",
                                    import.module, import.field
                                )));
                            }
                            existing
                        } else {
                            let idx = self.globals.len() as u32;
                            self.globals.push(None);
                            self.global_inits.push(None);
                            self.global_required.push(*desc);
                            self.global_placeholders.insert(import.field.clone(), idx);
                            idx
                        };
                        self.maps[m].globals.push(idx);
                    }
                }
            }
        }
        Ok(())
    }

    /// Step 2: walk every module's own definitions, installing into a
    /// matching placeholder or appending fresh.
    fn define(&mut self) -> Result<(), LoadError> {
        for (m, module) in self.modules.iter().enumerate() {
            let exported_name_for = |kind: ExternalKind, local_index: u32| -> Option<&str> {
                module
                    .exports
                    .iter()
                    .find(|e| e.kind == kind && e.index == local_index)
                    .map(|e| e.field.as_str())
            };

            // Functions.
            let imported_funcs = module.imported_function_count();
            for (i, &type_idx) in module.functions.iter().enumerate() {
                let local_index = imported_funcs + i as u32;
                let sig = module.types[type_idx as usize].clone();
                let sig_id = self.sig_maps[m][type_idx as usize];
                let program_index =
                    if let Some(name) = exported_name_for(ExternalKind::Function, local_index) {
                        if let Some(&existing) = self.func_placeholders.get(name) {
                            if self.func_required[existing as usize] != sig {
                                return Err(malformed_import(format!(
                                    "export {name} signature mismatch with its import"
                                )));
                            }
                            existing
                        } else {
                            self.append_function(sig.clone())
                        }
                    } else {
                        self.append_function(sig.clone())
                    };
                self.maps[m].functions.push(program_index);
                self.pending_funcs.push((m, i, program_index));
            }

            // Tables.
            for (i, desc) in module.tables.iter().enumerate() {
                let local_index = module.imported_table_count() + i as u32;
                let program_index =
                    if let Some(name) = exported_name_for(ExternalKind::Table, local_index) {
                        if let Some(&existing) = self.table_placeholders.get(name) {
                            if !desc.limits.is_compatible_with(&self.table_required[existing as usize]) {
                                return Err(malformed_import(format!(
                                    "export {name} table limits incompatible with its import"
                                )));
                            }
                            self.tables[existing as usize] = Some(TableInstance::new(desc.limits));
                            existing
                        } else {
                            self.append_table(desc.limits)
                        }
                    } else {
                        self.append_table(desc.limits)
                    };
                self.maps[m].tables.push(program_index);
            }

            // Memories.
            for (i, desc) in module.memories.iter().enumerate() {
                let local_index = module.imported_memory_count() + i as u32;
                let program_index =
                    if let Some(name) = exported_name_for(ExternalKind::Memory, local_index) {
                        if let Some(&existing) = self.memory_placeholders.get(name) {
                            if !desc.limits.is_compatible_with(&self.memory_required[existing as usize]) {
                                return Err(malformed_import(format!(
                                    "export {name} memory limits incompatible with its import"
                                )));
                            }
                            self.memories[existing as usize] = Some(MemoryInstance::new(desc.limits));
                            existing
                        } else {
                            self.append_memory(desc.limits)
                        }
                    } else {
                        self.append_memory(desc.limits)
                    };
                self.maps[m].memories.push(program_index);
            }

            // Globals.
            let imported_globals = module.imported_global_count();
            for (i, def) in module.globals.iter().enumerate() {
                let local_index = imported_globals + i as u32;
                let program_index =
                    if let Some(name) = exported_name_for(ExternalKind::Global, local_index) {
                        if let Some(&existing) = self.global_placeholders.get(name) {
                            if self.global_required[existing as usize] != def.descriptor {
                                return Err(malformed_import(format!(
                                    "export {name} global type mismatch with its import"
                                )));
                            }
                            existing
                        } else {
                            self.append_global(def.descriptor)
                        }
                    } else {
                        self.append_global(def.descriptor)
                    };
                self.maps[m].globals.push(program_index);

                let resolved = match &def.init {
                    InitExpr::Const(v) => ResolvedInit::Const(*v),
                    InitExpr::GetGlobal(idx) => ResolvedInit::Ref(self.maps[m].globals[*idx as usize]),
                };
                self.global_inits[program_index as usize] = Some(resolved);
            }

            for (i, _) in module.elements.iter().enumerate() {
                self.pending_elements.push((m, i));
            }
            for (i, _) in module.data.iter().enumerate() {
                self.pending_data.push((m, i));
            }
        }
        Ok(())
    }

    fn append_function(&mut self, sig: Signature) -> u32 {
        let idx = self.functions.len() as u32;
        self.functions.push(None);
        self.func_required.push(sig);
        idx
    }

    fn append_table(&mut self, limits: Limits) -> u32 {
        let idx = self.tables.len() as u32;
        self.tables.push(Some(TableInstance::new(limits)));
        self.table_required.push(limits);
        idx
    }

    fn append_memory(&mut self, limits: Limits) -> u32 {
        let idx = self.memories.len() as u32;
        self.memories.push(Some(MemoryInstance::new(limits)));
        self.memory_required.push(limits);
        idx
    }

    fn append_global(&mut self, desc: GlobalDescriptor) -> u32 {
        let idx = self.globals.len() as u32;
        self.globals.push(None);
        self.global_inits.push(None);
        self.global_required.push(desc);
        idx
    }

    /// Step 3: publish each module's export-name -> program-index map.
    fn export(&self) -> Vec<ExportMap> {
        self.modules
            .iter()
            .enumerate()
            .map(|(m, module)| {
                let mut map = ExportMap::default();
                for export in &module.exports {
                    match export.kind {
                        ExternalKind::Function => {
                            map.functions
                                .insert(export.field.clone(), self.maps[m].functions[export.index as usize]);
                        }
                        ExternalKind::Table => {
                            map.tables
                                .insert(export.field.clone(), self.maps[m].tables[export.index as usize]);
                        }
                        ExternalKind::Memory => {
                            map.memories
                                .insert(export.field.clone(), self.maps[m].memories[export.index as usize]);
                        }
                        ExternalKind::Global => {
                            map.globals
                                .insert(export.field.clone(), self.maps[m].globals[export.index as usize]);
                        }
                    }
                }
                map
            })
            .collect()
    }

    /// Step 4: rewrite every own function body into its dispatchable form.
    fn rewrite_code(&mut self) -> Result<(), LoadError> {
        let jobs = std::mem::take(&mut self.pending_funcs);
        for (m, local_code_index, program_index) in jobs {
            let module = &self.modules[m];
            let body = &module.code[local_code_index];
            let type_idx = module.functions[local_code_index];
            let sig = &module.types[type_idx as usize];
            let sig_id = self.sig_maps[m][type_idx as usize];

            let ctx = ModuleRewriteContext {
                module,
                maps: &self.maps[m],
                sig_map: &self.sig_maps[m],
            };
            let code = rewrite_function(body, sig, &ctx)?;
            self.functions[program_index as usize] = Some(FuncKind::Wasm(WasmFunc {
                signature: sig.clone(),
                sig_id,
                locals: body.locals.clone(),
                code,
            }));
        }
        Ok(())
    }

    /// Step 5: evaluate every global's initializer in dependency order,
    /// detecting cycles with white/gray/black coloring.
    fn evaluate_initializers(&self) -> Result<Vec<TaggedValue>, LoadError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let n = self.global_inits.len();
        let mut color = vec![Color::White; n];
        let mut resolved: Vec<Option<TaggedValue>> = vec![None; n];

        fn visit(
            idx: usize,
            inits: &[Option<ResolvedInit>],
            color: &mut [Color],
            resolved: &mut [Option<TaggedValue>],
        ) -> Result<TaggedValue, LoadError> {
            if let Some(v) = resolved[idx] {
                return Ok(v);
            }
            match color[idx] {
                Color::Black => unreachable!("resolved value missing for black node"),
                Color::Gray => return Err(LoadError::InitializerCycle),
                Color::White => {}
            }
            color[idx] = Color::Gray;
            let value = match &inits[idx] {
                None => {
                    return Err(malformed_import("a global was imported but never defined"));
                }
                Some(ResolvedInit::Const(v)) => *v,
                Some(ResolvedInit::Ref(target)) => visit(*target as usize, inits, color, resolved)?,
            };
            color[idx] = Color::Black;
            resolved[idx] = Some(value);
            Ok(value)
        }

        for idx in 0..n {
            visit(idx, &self.global_inits, &mut color, &mut resolved)?;
        }
        Ok(resolved.into_iter().map(|v| v.unwrap()).collect())
    }

    fn eval_offset(&self, expr: &InitExpr, map: &IndexMaps, globals: &[TaggedValue]) -> i32 {
        match expr {
            InitExpr::Const(TaggedValue::I32(v)) => *v,
            InitExpr::Const(_) => unreachable!("offset initializer must be i32, enforced at decode"),
            InitExpr::GetGlobal(idx) => match globals[map.globals[*idx as usize] as usize] {
                TaggedValue::I32(v) => v,
                _ => unreachable!("offset initializer must be i32, enforced at decode"),
            },
        }
    }

    /// Step 6: write element and data segments into their target table or
    /// memory.
    fn apply_segments(&mut self, globals: &[TaggedValue]) -> Result<(), LoadError> {
        let elements = std::mem::take(&mut self.pending_elements);
        for (m, i) in elements {
            let module = &self.modules[m];
            let seg = &module.elements[i];
            let map = self.maps[m].clone();
            let offset = self.eval_offset(&seg.offset, &map, globals) as u32;
            let table_index = map.tables[seg.table_index as usize];
            let table = self.tables[table_index as usize].as_ref().ok_or_else(|| {
                malformed_import("element segment targets a table import that was never defined")
            })?;
            if offset as u64 + seg.func_indices.len() as u64 > table.current_size() as u64 {
                return Err(LoadError::SegmentOutOfBounds);
            }
            for (j, &func_idx) in seg.func_indices.iter().enumerate() {
                let target = map.functions[func_idx as usize];
                table.set(offset + j as u32, Some(target));
            }
        }

        let data = std::mem::take(&mut self.pending_data);
        for (m, i) in data {
            let module = &self.modules[m];
            let seg = &module.data[i];
            let map = self.maps[m].clone();
            let offset = self.eval_offset(&seg.offset, &map, globals) as u32;
            let memory_index = map.memories[seg.memory_index as usize];
            let memory = self.memories[memory_index as usize].as_ref().ok_or_else(|| {
                malformed_import("data segment targets a memory import that was never defined")
            })?;
            if !memory.write_segment(offset, &seg.bytes) {
                return Err(LoadError::SegmentOutOfBounds);
            }
        }
        Ok(())
    }

    /// Step 7: resolve the main module's start function, checking its
    /// signature is `() -> ()`.
    fn resolve_start(&self) -> Result<Option<u32>, LoadError> {
        let Some(local_index) = self.modules[0].start else {
            return Ok(None);
        };
        let program_index = self.maps[0].functions[local_index as usize];
        let sig = self.func_required[program_index as usize].clone();
        if !sig.is_nullary() {
            return Err(LoadError::BadStartSignature);
        }
        Ok(Some(program_index))
    }
}

/// `RewriteContext` scoped to one module, backed by the linker's already
/// fully-populated index maps.
struct ModuleRewriteContext<'a> {
    module: &'a ModuleDef,
    maps: &'a IndexMaps,
    sig_map: &'a [SigId],
}

impl RewriteContext for ModuleRewriteContext<'_> {
    fn resolve_func(&self, module_local_index: u32) -> Option<u32> {
        self.maps.functions.get(module_local_index as usize).copied()
    }

    fn resolve_global(&self, module_local_index: u32) -> Option<u32> {
        self.maps.globals.get(module_local_index as usize).copied()
    }

    fn func_signature(&self, module_local_index: u32) -> Option<&Signature> {
        let type_idx = self.module.function_type_index(module_local_index)?;
        self.module.types.get(type_idx as usize)
    }

    fn type_signature(&self, module_local_type_index: u32) -> Option<&Signature> {
        self.module.types.get(module_local_type_index as usize)
    }

    fn sig_id(&self, module_local_type_index: u32) -> Option<SigId> {
        self.sig_map.get(module_local_type_index as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::decode_module;

    const MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
    const VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

    fn section(id: u8, payload: Vec<u8>) -> Vec<u8> {
        let mut v = vec![id];
        v.push(payload.len() as u8);
        v.extend(payload);
        v
    }

    fn leb(mut v: u32) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out
    }

    /// One function `() -> i32` returning `2 + 3`, set as the module's only
    /// export *and* the program's effective entry point for tests.
    fn add_module() -> Vec<u8> {
        let mut v = MAGIC.to_vec();
        v.extend_from_slice(&VERSION);
        // Type section: one signature () -> i32.
        v.extend(section(1, vec![1, 0x60, 0, 1, 0x7f]));
        // Function section: one function of type 0.
        v.extend(section(3, vec![1, 0]));
        // Export section: export it as "add".
        let mut exp = vec![1, 3];
        exp.extend(b"add");
        exp.push(0); // external kind Function
        exp.push(0); // index 0
        v.extend(section(7, exp));
        // Code section: i32.const 2; i32.const 3; i32.add; end
        let body = vec![0, 0x41, 2, 0x41, 3, 0x6a, 0x0b];
        let mut code = vec![1];
        code.push(body.len() as u8);
        code.extend(body);
        v.extend(section(10, code));
        v
    }

    #[test]
    fn links_single_module_and_exports_function() {
        let module = decode_module(&add_module()).unwrap();
        let program = link(&[module]).unwrap();
        let idx = program.export_function(0, "add").unwrap();
        let f = program.function(idx).as_wasm().unwrap();
        assert_eq!(f.signature.result(), Some(crate::types::ValueType::I32));
        assert_eq!(f.code.len(), 4);
    }

    #[test]
    fn cross_module_global_cycle_is_detected() {
        // Each module imports the other's global "b"/"g" and exports its own
        // (i32, immutable), initialized from the import. Global local index
        // 0 is the import, so the module's own global is local index 1, and
        // the export must point at index 1.
        fn global_module(export_name: &[u8], import_name: &[u8]) -> Vec<u8> {
            let mut v = MAGIC.to_vec();
            v.extend_from_slice(&VERSION);
            let mut imp = vec![1, 3];
            imp.extend(b"mod");
            imp.push(import_name.len() as u8);
            imp.extend(import_name);
            imp.push(3); // external kind Global
            imp.push(0x7f); // i32
            imp.push(0); // immutable
            v.extend(section(2, imp));
            let mut glob = vec![1, 0x7f, 0, 0x23];
            glob.extend(leb(0)); // get_global 0 (the import)
            glob.push(0x0b);
            v.extend(section(6, glob));
            let mut exp = vec![1, export_name.len() as u8];
            exp.extend(export_name);
            exp.push(3); // external kind Global
            exp.push(1); // own global is local index 1
            v.extend(section(7, exp));
            v
        }
        let a = decode_module(&global_module(b"g", b"b")).unwrap();
        let b = decode_module(&global_module(b"b", b"g")).unwrap();
        let err = link(&[a, b]).unwrap_err();
        assert!(matches!(err, LoadError::InitializerCycle));
    }
}
