//! Signature interning (spec.md §4.3): distinct function signatures receive
//! a small integer id, so `call_indirect`'s type check is integer equality
//! rather than a structural `Signature` comparison on every indirect call.

use std::collections::HashMap;
use std::fmt;

use crate::error::LogicError;
use crate::types::Signature;

/// A program-wide interned signature id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SigId(u32);

impl fmt::Display for SigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig#{}", self.0)
    }
}

impl SigId {
    /// The raw interned index, as `call_indirect`'s rewritten immediate and
    /// the dispatch loop's equality check both need a plain integer.
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Interns signatures while a program is being linked, then freezes: the
/// linker's `call_indirect` checks and the rewriter's own signature lookups
/// both go through `resolve`, never a structural comparison.
#[derive(Debug, Default)]
pub struct SignatureRegistry {
    signatures: Vec<Signature>,
    index: HashMap<Signature, SigId>,
    frozen: bool,
}

impl SignatureRegistry {
    pub fn new() -> SignatureRegistry {
        SignatureRegistry::default()
    }

    /// Intern `signature`, returning its existing id if an equal one was
    /// already registered. Fails if the registry has been frozen.
    pub fn get_or_intern(&mut self, signature: Signature) -> Result<SigId, LogicError> {
        if self.frozen {
            return Err(LogicError::LateRegistration);
        }
        if let Some(&id) = self.index.get(&signature) {
            return Ok(id);
        }
        let id = SigId(self.signatures.len() as u32);
        self.signatures.push(signature.clone());
        self.index.insert(signature, id);
        Ok(id)
    }

    /// Forbid further interning. Called once linking completes; a program's
    /// `call_indirect` signature checks are only valid against a frozen
    /// registry.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn resolve(&self, id: SigId) -> &Signature {
        &self.signatures[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    #[test]
    fn interns_equal_signatures_once() {
        let mut reg = SignatureRegistry::new();
        let a = reg
            .get_or_intern(Signature::new(vec![ValueType::I32], Some(ValueType::I32)))
            .unwrap();
        let b = reg
            .get_or_intern(Signature::new(vec![ValueType::I32], Some(ValueType::I32)))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn distinct_signatures_get_distinct_ids() {
        let mut reg = SignatureRegistry::new();
        let a = reg.get_or_intern(Signature::new(vec![], None)).unwrap();
        let b = reg
            .get_or_intern(Signature::new(vec![ValueType::I64], None))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn frozen_registry_rejects_new_interning() {
        let mut reg = SignatureRegistry::new();
        reg.freeze();
        assert!(matches!(
            reg.get_or_intern(Signature::new(vec![], None)),
            Err(LogicError::LateRegistration)
        ));
    }
}
