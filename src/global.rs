//! Global variables (spec.md §3 "Global"): a typed cell with a mutability
//! bit, adapted from the teacher's `Cell`-based `GlobalInstance`.

use std::cell::Cell;

use crate::types::{GlobalDescriptor, ValueType};
use crate::value::TaggedValue;

#[derive(Debug)]
pub struct GlobalInstance {
    value: Cell<TaggedValue>,
    mutable: bool,
}

impl GlobalInstance {
    pub fn new(value: TaggedValue, mutable: bool) -> GlobalInstance {
        GlobalInstance {
            value: Cell::new(value),
            mutable,
        }
    }

    pub fn get(&self) -> TaggedValue {
        self.value.get()
    }

    /// Overwrite the stored value. `set_global` on an immutable global is
    /// unreachable in validated input but is checked defensively by the
    /// dispatch loop before calling this, not here.
    pub fn set(&self, value: TaggedValue) {
        self.value.set(value);
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn value_type(&self) -> ValueType {
        self.value.get().value_type()
    }

    pub fn descriptor(&self) -> GlobalDescriptor {
        GlobalDescriptor {
            value_type: self.value_type(),
            mutable: self.mutable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_reflects_last_set() {
        let g = GlobalInstance::new(TaggedValue::I32(1), true);
        g.set(TaggedValue::I32(2));
        assert_eq!(g.get(), TaggedValue::I32(2));
    }

    #[test]
    fn descriptor_matches_construction() {
        let g = GlobalInstance::new(TaggedValue::F64(crate::nan_preserving_float::F64::from(0.0)), false);
        let d = g.descriptor();
        assert_eq!(d.value_type, ValueType::F64);
        assert!(!d.mutable);
    }
}
