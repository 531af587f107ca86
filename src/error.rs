//! The error taxonomy from spec.md §7: load errors, runtime traps, and the
//! one logic error reachable through public API misuse. Modeled as
//! hand-rolled enums with manual `Display`/`Error` impls, matching the
//! teacher's `Error`/`TrapKind` pair in its `src/lib.rs` rather than reaching
//! for a derive-macro error crate.

use core::fmt;
use std::error;

/// Errors that can occur while decoding a module's byte stream or linking
/// decoded modules together. A `LoadError` aborts the load; no `Program` is
/// ever built when one occurs.
#[derive(Debug)]
pub enum LoadError {
    /// A stream offset ran past the available bytes.
    UnexpectedEof,
    /// A LEB128 encoding was overlong for its declared bit-width.
    MalformedLeb128,
    /// The module header, a section id/order, a section length budget, or
    /// an opcode was invalid.
    MalformedModule(String),
    /// The code rewriter found malformed control flow or an unknown opcode.
    MalformedCode(String),
    /// Two modules declared the same import with incompatible types.
    ImportTypeMismatch(String),
    /// A global's initializer expression formed a dependency cycle.
    InitializerCycle,
    /// The main module's start function did not have signature `() -> ()`.
    BadStartSignature,
    /// An element or data segment's `offset + len` exceeded its target's
    /// bounds.
    SegmentOutOfBounds,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::UnexpectedEof => write!(f, "unexpected end of input"),
            LoadError::MalformedLeb128 => write!(f, "malformed LEB128 integer"),
            LoadError::MalformedModule(s) => write!(f, "malformed module: {s}"),
            LoadError::MalformedCode(s) => write!(f, "malformed code: {s}"),
            LoadError::ImportTypeMismatch(s) => write!(f, "import type mismatch: {s}"),
            LoadError::InitializerCycle => write!(f, "initializer expression cycle"),
            LoadError::BadStartSignature => {
                write!(f, "start function must have signature () -> ()")
            }
            LoadError::SegmentOutOfBounds => write!(f, "element or data segment out of bounds"),
        }
    }
}

impl error::Error for LoadError {}

/// Runtime trap kinds (spec.md §7, middle row). A trap unwinds every frame
/// and terminates the running program; the engine itself survives and may
/// be re-invoked with a different program.
#[derive(Debug, Clone, PartialEq)]
pub enum TrapKind {
    /// `unreachable` was executed.
    Unreachable,
    /// Integer division or remainder by zero.
    IntegerDivideByZero,
    /// Signed division overflow: `INT_MIN / -1`.
    IntegerOverflow,
    /// A `trunc` conversion's float operand was NaN or out of the target's
    /// representable range.
    InvalidConversionToInteger,
    /// A memory load or store's address range exceeded the current memory
    /// size.
    OutOfBoundsMemoryAccess,
    /// `call_indirect` read an empty table entry.
    UndefinedElement,
    /// `call_indirect`'s target function had a different signature than the
    /// instruction expected.
    IndirectCallSignatureMismatch,
    /// The call-frame stack is full.
    CallStackExhausted,
    /// The value stack is full.
    ValueStackExhausted,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A trap, carrying the kind and the location at which it occurred, as
/// spec.md §6 requires for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Trap {
    kind: TrapKind,
    /// Program-wide function index in which the trap occurred.
    pub func_index: u32,
    /// Instruction index (not byte offset, since our rewritten code is a
    /// `Vec<Instruction>` rather than a raw byte stream) within that
    /// function's rewritten code.
    pub inst_index: u32,
}

impl Trap {
    pub fn new(kind: TrapKind, func_index: u32, inst_index: u32) -> Trap {
        log::warn!(
            "trap {kind:?} at function {func_index} instruction {inst_index}, unwinding"
        );
        Trap {
            kind,
            func_index,
            inst_index,
        }
    }

    pub fn kind(&self) -> &TrapKind {
        &self.kind
    }

    pub fn into_kind(self) -> TrapKind {
        self.kind
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trap {:?} at function {} instruction {}",
            self.kind, self.func_index, self.inst_index
        )
    }
}

impl error::Error for Trap {}

/// A call-stack walk attached to a trap when the caller asks for one
/// (spec.md §6: "if budget permits, a call-stack walk").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStackEntry {
    pub func_index: u32,
    pub return_inst_index: u32,
}

/// Logic errors: these indicate the engine itself is misused or has a bug,
/// never a property of the input module. Not recoverable.
#[derive(Debug)]
pub enum LogicError {
    /// `SignatureRegistry::get_or_intern` was called after the registry was
    /// frozen by program initialization.
    LateRegistration,
}

impl fmt::Display for LogicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicError::LateRegistration => {
                write!(f, "attempted to intern a signature after the registry was frozen")
            }
        }
    }
}

impl error::Error for LogicError {}
