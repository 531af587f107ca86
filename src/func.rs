//! The function index space (spec.md §3 "Function"): every function the
//! runtime can call, whether a WASM body or a host callback. Host calls are
//! kept as an inert extension point - `FuncKind::Host` exists so the type
//! is shaped for it, but nothing in this crate ever constructs one. Reaching
//! it from the dispatch loop would be a logic error, not a trap.

use std::fmt;
use std::rc::Rc;

use crate::isa::Instructions;
use crate::signature::SigId;
use crate::types::{Signature, ValueType};
use crate::value::TaggedValue;

/// A function body already rewritten into directly-dispatchable form.
#[derive(Debug, Clone)]
pub struct WasmFunc {
    pub signature: Signature,
    pub sig_id: SigId,
    /// Declared locals, in order, *excluding* parameters. A call frame's
    /// full locals array is the callee's arguments followed by these,
    /// zero-initialized (spec.md §4.6 "A function call proceeds by...").
    pub locals: Vec<ValueType>,
    pub code: Instructions,
}

impl WasmFunc {
    /// Size of the per-call-frame locals array: parameters plus declared
    /// locals.
    pub fn frame_locals_count(&self) -> u32 {
        self.signature.params().len() as u32 + self.locals.len() as u32
    }
}

/// A host-supplied function: an embedder callback plus the signature
/// `call`/`call_indirect` check against. Never invoked by this core.
#[derive(Clone)]
pub struct HostFunc {
    pub signature: Signature,
    pub sig_id: SigId,
    pub call: Rc<dyn Fn(&[TaggedValue]) -> Option<TaggedValue>>,
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// One entry in the program-wide function vector.
#[derive(Debug, Clone)]
pub enum FuncKind {
    Wasm(WasmFunc),
    Host(HostFunc),
}

impl FuncKind {
    pub fn signature(&self) -> &Signature {
        match self {
            FuncKind::Wasm(f) => &f.signature,
            FuncKind::Host(f) => &f.signature,
        }
    }

    pub fn sig_id(&self) -> SigId {
        match self {
            FuncKind::Wasm(f) => f.sig_id,
            FuncKind::Host(f) => f.sig_id,
        }
    }

    pub fn as_wasm(&self) -> Option<&WasmFunc> {
        match self {
            FuncKind::Wasm(f) => Some(f),
            FuncKind::Host(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{Instruction, InstructionsBuilder};

    fn nullary_wasm() -> WasmFunc {
        let mut b = InstructionsBuilder::new();
        b.push(Instruction::Return(crate::isa::DropKeep {
            drop: 0,
            keep: crate::isa::Keep::None,
        }));
        WasmFunc {
            signature: Signature::new(vec![], None),
            sig_id: crate::signature::SignatureRegistry::new()
                .get_or_intern(Signature::new(vec![], None))
                .unwrap(),
            locals: vec![],
            code: b.finish(),
        }
    }

    #[test]
    fn frame_locals_count_is_params_plus_declared_locals() {
        let mut f = nullary_wasm();
        f.signature = Signature::new(vec![ValueType::I32, ValueType::I32], None);
        f.locals = vec![ValueType::I64];
        assert_eq!(f.frame_locals_count(), 3);
    }

    #[test]
    fn func_kind_exposes_wasm_body() {
        let kind = FuncKind::Wasm(nullary_wasm());
        assert!(kind.as_wasm().is_some());
    }
}
