//! Section parsing (spec.md §4.2). Consumes the 8-byte module header, then
//! every section in order, rejecting anything that doesn't fit the grammar
//! spec.md lays out.

use super::Reader;
use crate::error::LoadError;
use crate::module_def::{
    DataSegment, ElementSegment, Export, ExternalKind, FunctionBody, GlobalDef, Import,
    ImportKind, InitExpr, ModuleDef,
};
use crate::types::{GlobalDescriptor, Limits, MemoryDescriptor, Signature, TableDescriptor, ValueType};
use crate::value::TaggedValue;

const MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
const VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

const SEC_CUSTOM: u8 = 0;
const SEC_TYPE: u8 = 1;
const SEC_IMPORT: u8 = 2;
const SEC_FUNCTION: u8 = 3;
const SEC_TABLE: u8 = 4;
const SEC_MEMORY: u8 = 5;
const SEC_GLOBAL: u8 = 6;
const SEC_EXPORT: u8 = 7;
const SEC_START: u8 = 8;
const SEC_ELEMENT: u8 = 9;
const SEC_CODE: u8 = 10;
const SEC_DATA: u8 = 11;

/// Decode a complete `.wasm` byte stream into a `ModuleDef`.
pub fn decode_module(bytes: &[u8]) -> Result<ModuleDef, LoadError> {
    let mut r = Reader::new(bytes);
    let magic = r.bytes(4)?;
    if magic != MAGIC {
        return Err(LoadError::MalformedModule("bad magic number".into()));
    }
    let version = r.bytes(4)?;
    if version != VERSION {
        return Err(LoadError::MalformedModule("unsupported version".into()));
    }

    let mut module = ModuleDef::default();
    let mut last_known_id: Option<u8> = None;

    while !r.is_empty() {
        let id = r.u8()?;
        let payload_len = r.leb_u32()? as usize;
        let payload = r.bytes(payload_len)?;
        let mut sr = Reader::new(payload);

        if id != SEC_CUSTOM {
            if let Some(last) = last_known_id {
                if id <= last {
                    return Err(LoadError::MalformedModule(format!(
                        "section id {id} out of order after {last}"
                    )));
                }
            }
            last_known_id = Some(id);
        }

        match id {
            SEC_CUSTOM => {
                // Decoded far enough to read the name, then discarded.
                let _name = sr.name()?;
                log::trace!("skipping custom section");
            }
            SEC_TYPE => parse_type_section(&mut sr, &mut module)?,
            SEC_IMPORT => parse_import_section(&mut sr, &mut module)?,
            SEC_FUNCTION => parse_function_section(&mut sr, &mut module)?,
            SEC_TABLE => parse_table_section(&mut sr, &mut module)?,
            SEC_MEMORY => parse_memory_section(&mut sr, &mut module)?,
            SEC_GLOBAL => parse_global_section(&mut sr, &mut module)?,
            SEC_EXPORT => parse_export_section(&mut sr, &mut module)?,
            SEC_START => {
                module.start = Some(sr.leb_u32()?);
            }
            SEC_ELEMENT => parse_element_section(&mut sr, &mut module)?,
            SEC_CODE => parse_code_section(&mut sr, &mut module)?,
            SEC_DATA => parse_data_section(&mut sr, &mut module)?,
            other => {
                return Err(LoadError::MalformedModule(format!("unknown section id {other}")));
            }
        }

        if !sr.is_empty() {
            return Err(LoadError::MalformedModule(format!(
                "section {id} payload length mismatch: {} bytes unconsumed",
                sr.remaining()
            )));
        }
    }

    if module.functions.len() != module.code.len() {
        return Err(LoadError::MalformedModule(
            "function and code section entry counts differ".into(),
        ));
    }

    Ok(module)
}

fn parse_type_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        let form = r.u8()?;
        if form != 0x60 {
            return Err(LoadError::MalformedModule(format!("bad type form 0x{form:x}")));
        }
        let param_count = r.leb_u32()?;
        let mut params = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            params.push(r.value_type()?);
        }
        let has_result = r.flag()?;
        let result = if has_result { Some(r.value_type()?) } else { None };
        module.types.push(Signature::new(params, result));
    }
    Ok(())
}

fn parse_external_kind(r: &mut Reader) -> Result<ExternalKind, LoadError> {
    Ok(match r.u8()? {
        0 => ExternalKind::Function,
        1 => ExternalKind::Table,
        2 => ExternalKind::Memory,
        3 => ExternalKind::Global,
        other => {
            return Err(LoadError::MalformedModule(format!("bad external kind {other}")));
        }
    })
}

fn parse_limits(r: &mut Reader) -> Result<Limits, LoadError> {
    let has_max = r.flag()?;
    let initial = r.leb_u32()?;
    let maximum = if has_max { Some(r.leb_u32()?) } else { None };
    Ok(Limits { initial, maximum })
}

fn parse_table_descriptor(r: &mut Reader) -> Result<TableDescriptor, LoadError> {
    let elem_type = r.u8()?;
    if elem_type != 0x70 {
        return Err(LoadError::MalformedModule(format!(
            "unsupported table element type 0x{elem_type:x}, only anyfunc is supported"
        )));
    }
    Ok(TableDescriptor {
        limits: parse_limits(r)?,
    })
}

fn parse_import_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        let module_name = r.name()?;
        let field = r.name()?;
        let kind = match parse_external_kind(r)? {
            ExternalKind::Function => ImportKind::Function(r.leb_u32()?),
            ExternalKind::Table => ImportKind::Table(parse_table_descriptor(r)?),
            ExternalKind::Memory => ImportKind::Memory(MemoryDescriptor {
                limits: parse_limits(r)?,
            }),
            ExternalKind::Global => {
                let value_type = r.value_type()?;
                let mutable = r.flag()?;
                ImportKind::Global(GlobalDescriptor { value_type, mutable })
            }
        };
        module.imports.push(Import {
            module: module_name,
            field,
            kind,
        });
    }
    Ok(())
}

fn parse_function_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        module.functions.push(r.leb_u32()?);
    }
    Ok(())
}

fn parse_table_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        module.tables.push(parse_table_descriptor(r)?);
    }
    Ok(())
}

fn parse_memory_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        module.memories.push(MemoryDescriptor {
            limits: parse_limits(r)?,
        });
    }
    Ok(())
}

/// A `const`/`get_global` initializer expression, terminated by `end`
/// (spec.md §3 invariant 2).
fn parse_init_expr(r: &mut Reader) -> Result<InitExpr, LoadError> {
    let opcode = r.u8()?;
    let expr = match opcode {
        0x41 => InitExpr::Const(TaggedValue::I32(r.leb_i32()?)),
        0x42 => InitExpr::Const(TaggedValue::I64(r.leb_i64()?)),
        0x43 => {
            let bits = u32::from_le_bytes(r.bytes(4)?.try_into().unwrap());
            InitExpr::Const(TaggedValue::F32(crate::nan_preserving_float::F32::from_bits(bits)))
        }
        0x44 => {
            let bits = u64::from_le_bytes(r.bytes(8)?.try_into().unwrap());
            InitExpr::Const(TaggedValue::F64(crate::nan_preserving_float::F64::from_bits(bits)))
        }
        0x23 => InitExpr::GetGlobal(r.leb_u32()?),
        other => {
            return Err(LoadError::MalformedModule(format!(
                "invalid initializer expression opcode 0x{other:x}"
            )));
        }
    };
    let end = r.u8()?;
    if end != 0x0b {
        return Err(LoadError::MalformedModule("initializer expression missing end".into()));
    }
    Ok(expr)
}

fn parse_global_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        let value_type = r.value_type()?;
        let mutable = r.flag()?;
        let init = parse_init_expr(r)?;
        module.globals.push(GlobalDef {
            descriptor: GlobalDescriptor { value_type, mutable },
            init,
        });
    }
    Ok(())
}

fn parse_export_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        let field = r.name()?;
        let kind = parse_external_kind(r)?;
        let index = r.leb_u32()?;
        module.exports.push(Export { field, kind, index });
    }
    Ok(())
}

fn parse_element_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        let table_index = r.leb_u32()?;
        let offset = parse_init_expr(r)?;
        let n = r.leb_u32()?;
        let mut func_indices = Vec::with_capacity(n as usize);
        for _ in 0..n {
            func_indices.push(r.leb_u32()?);
        }
        module.elements.push(ElementSegment {
            table_index,
            offset,
            func_indices,
        });
    }
    Ok(())
}

fn parse_data_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        let memory_index = r.leb_u32()?;
        let offset = parse_init_expr(r)?;
        let n = r.leb_u32()? as usize;
        let bytes = r.bytes(n)?.to_vec();
        module.data.push(DataSegment {
            memory_index,
            offset,
            bytes,
        });
    }
    Ok(())
}

fn parse_code_section(r: &mut Reader, module: &mut ModuleDef) -> Result<(), LoadError> {
    let count = r.leb_u32()?;
    for _ in 0..count {
        let body_len = r.leb_u32()? as usize;
        let body_bytes = r.bytes(body_len)?;
        let mut br = Reader::new(body_bytes);

        let local_entry_count = br.leb_u32()?;
        let mut locals = Vec::new();
        for _ in 0..local_entry_count {
            let n = br.leb_u32()?;
            let ty = br.value_type()?;
            for _ in 0..n {
                locals.push(ty);
            }
        }
        if locals.len() > u32::MAX as usize {
            return Err(LoadError::MalformedCode("too many locals".into()));
        }
        let code = br.bytes(br.remaining())?.to_vec();
        module.code.push(FunctionBody { locals, code });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_module() -> Vec<u8> {
        let mut v = MAGIC.to_vec();
        v.extend_from_slice(&VERSION);
        v
    }

    #[test]
    fn decodes_empty_module() {
        let m = decode_module(&empty_module()).unwrap();
        assert!(m.types.is_empty());
        assert!(m.functions.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut v = vec![0x00, 0x00, 0x00, 0x00];
        v.extend_from_slice(&VERSION);
        assert!(matches!(decode_module(&v), Err(LoadError::MalformedModule(_))));
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(decode_module(&[0x00, 0x61]), Err(LoadError::UnexpectedEof)));
    }

    #[test]
    fn rejects_out_of_order_sections() {
        let mut v = empty_module();
        // Function section (id 3) followed by Type section (id 1): out of order.
        v.push(3);
        v.push(1); // payload len 1
        v.push(0); // count = 0
        v.push(1);
        v.push(1);
        v.push(0);
        assert!(matches!(decode_module(&v), Err(LoadError::MalformedModule(_))));
    }

    #[test]
    fn decodes_one_signature() {
        let mut v = empty_module();
        v.push(1); // type section
        v.push(6); // payload len
        v.push(1); // 1 type
        v.push(0x60);
        v.push(1); // 1 param
        v.push(0x7f); // i32
        v.push(1); // has_result
        v.push(0x7f); // i32
        let m = decode_module(&v).unwrap();
        assert_eq!(m.types.len(), 1);
        assert_eq!(m.types[0].params(), &[ValueType::I32]);
        assert_eq!(m.types[0].result(), Some(ValueType::I32));
    }
}
