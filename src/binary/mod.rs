//! The binary decoder (spec.md §4.2): a byte cursor plus the per-section
//! parsers that build a `ModuleDef`.

mod decode;
mod reader;

pub use decode::decode_module;
pub use reader::Reader;
