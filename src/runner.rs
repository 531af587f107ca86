//! The dispatch loop (spec.md §4.6 "Execution"): walks a `WasmFunc`'s
//! rewritten `Instruction`s against the shared operand stack and a
//! per-frame locals array, grounded in the teacher's
//! `Interpreter`/`FunctionContext` split but stripped of all tracer
//! instrumentation and resumable-invocation state, and reworked around
//! pre-resolved jump targets instead of scanning for `end`.
//!
//! Locals live in `FunctionContext::locals`, never on the operand stack
//! (see `crate::isa`'s module doc comment), so a call only needs to move
//! the callee's arguments from the caller's operand stack into the new
//! frame's locals array; the rest of the frame protocol - `Return`'s
//! drop/keep leaving the stack exactly where the caller found it, plus one
//! optional result value - falls out of how `crate::rewrite` computed
//! every `DropKeep` relative to each function's own zero height.
//!
//! A WASM 1.0 module has at most one memory and one table, so the loop
//! always addresses `program.memories[0]`/`program.tables[0]`; a linked
//! program with more than one of either (possible only via unresolved
//! imports across modules) can still be built but isn't reachable from
//! code that never names which one it means - not a concern MVP programs
//! raise in practice.

use crate::error::{Trap, TrapKind};
use crate::func::{FuncKind, WasmFunc};
use crate::isa::{Instruction, Keep};
use crate::memory::MemoryInstance;
use crate::nan_preserving_float::{F32, F64};
use crate::program::Program;
use crate::stack::{CallStack, ValueStack, DEFAULT_CALL_STACK_LIMIT, DEFAULT_VALUE_STACK_LIMIT};
use crate::types::Signature;
use crate::value::{convert, f32_ops, f64_ops, i32_ops, i64_ops, TaggedValue, Value};

struct FunctionContext {
    func_index: u32,
    locals: Vec<Value>,
    pc: u32,
}

/// What one `step` did, for the inspection hook and for `call`'s loop
/// condition.
pub enum StepOutcome {
    Continue,
    /// The call stack emptied: the outermost call returned, with this
    /// result if its signature names one.
    Finished(Option<TaggedValue>),
}

/// Executes one program. Cheap to construct per call; holds no state a
/// fresh call can't discard.
pub struct Runner<'p> {
    program: &'p Program,
    value_stack: ValueStack,
    call_stack: CallStack<FunctionContext>,
}

impl<'p> Runner<'p> {
    pub fn new(program: &'p Program) -> Runner<'p> {
        Runner {
            program,
            value_stack: ValueStack::new(DEFAULT_VALUE_STACK_LIMIT),
            call_stack: CallStack::new(DEFAULT_CALL_STACK_LIMIT),
        }
    }

    /// Call `func_index` with `args` already matching its signature's
    /// parameter types, running to completion or a trap.
    pub fn call(&mut self, func_index: u32, args: &[TaggedValue]) -> Result<Option<TaggedValue>, Trap> {
        let wasm = self.as_wasm_panicking(func_index);
        self.push_frame(func_index, wasm, args)
            .map_err(|kind| Trap::new(kind, func_index, 0))?;
        loop {
            match self.step()? {
                StepOutcome::Continue => {}
                StepOutcome::Finished(result) => return Ok(result),
            }
        }
    }

    fn push_frame(&mut self, func_index: u32, wasm: &WasmFunc, args: &[TaggedValue]) -> Result<(), TrapKind> {
        let mut locals = Vec::with_capacity(wasm.frame_locals_count() as usize);
        locals.extend(args.iter().map(|v| v.untag()));
        locals.extend(wasm.locals.iter().map(|ty| TaggedValue::default_of(*ty).untag()));
        self.call_stack.push(FunctionContext { func_index, locals, pc: 0 })
    }

    /// Execute exactly one rewritten instruction. Exposed so embedders can
    /// single-step a program (spec.md §3's optional inspection hook).
    pub fn step(&mut self) -> Result<StepOutcome, Trap> {
        let (func_index, pc) = {
            let frame = self.call_stack.top().expect("step called with no active call");
            (frame.func_index, frame.pc)
        };
        let wasm = self.as_wasm_panicking(func_index);
        let instr = wasm
            .code
            .get(pc)
            .unwrap_or_else(|| panic!("pc {pc} out of range for function {func_index}"))
            .clone();

        self.execute(func_index, &instr).map_err(|kind| Trap::new(kind, func_index, pc))
    }

    fn execute(&mut self, func_index: u32, instr: &Instruction) -> Result<StepOutcome, TrapKind> {
        macro_rules! unop {
            ($get:ident, $make:ident, $f:expr) => {{
                let a = self.value_stack.pop().$get();
                self.value_stack.push(Value::$make($f(a)))?;
            }};
        }
        macro_rules! binop {
            ($get:ident, $make:ident, $f:expr) => {{
                let (a, b) = self.value_stack.pop_pair();
                self.value_stack.push(Value::$make($f(a.$get(), b.$get())))?;
            }};
        }
        macro_rules! binop_trap {
            ($get:ident, $make:ident, $f:expr) => {{
                let (a, b) = self.value_stack.pop_pair();
                self.value_stack.push(Value::$make($f(a.$get(), b.$get())?))?;
            }};
        }
        macro_rules! relop {
            ($get:ident, $f:expr) => {{
                let (a, b) = self.value_stack.pop_pair();
                self.value_stack.push(Value::i32($f(a.$get(), b.$get()) as i32))?;
            }};
        }
        macro_rules! convert_op {
            ($get:ident, $make:ident, $f:expr) => {{
                let a = self.value_stack.pop().$get();
                self.value_stack.push(Value::$make($f(a)))?;
            }};
        }
        macro_rules! convert_op_trap {
            ($get:ident, $make:ident, $f:expr) => {{
                let a = self.value_stack.pop().$get();
                self.value_stack.push(Value::$make($f(a)?))?;
            }};
        }

        match instr {
            Instruction::GetLocal(idx) => {
                let v = self.frame().locals[*idx as usize];
                self.value_stack.push(v)?;
            }
            Instruction::SetLocal(idx) => {
                let v = self.value_stack.pop();
                self.frame_mut().locals[*idx as usize] = v;
            }
            Instruction::TeeLocal(idx) => {
                let v = self.value_stack.top();
                self.frame_mut().locals[*idx as usize] = v;
            }

            Instruction::Br(target) => {
                self.value_stack.drop_keep(target.drop_keep);
                self.frame_mut().pc = target.dst_pc;
                return Ok(StepOutcome::Continue);
            }
            Instruction::BrIfEqz(target) => {
                let cond = self.value_stack.pop().as_i32();
                if cond == 0 {
                    self.value_stack.drop_keep(target.drop_keep);
                    self.frame_mut().pc = target.dst_pc;
                    return Ok(StepOutcome::Continue);
                }
            }
            Instruction::BrIfNez(target) => {
                let cond = self.value_stack.pop().as_i32();
                if cond != 0 {
                    self.value_stack.drop_keep(target.drop_keep);
                    self.frame_mut().pc = target.dst_pc;
                    return Ok(StepOutcome::Continue);
                }
            }
            Instruction::BrTable(targets) => {
                let idx = self.value_stack.pop().as_u32() as usize;
                let target = targets.get(idx).unwrap_or_else(|| targets.last().unwrap());
                self.value_stack.drop_keep(target.drop_keep);
                self.frame_mut().pc = target.dst_pc;
                return Ok(StepOutcome::Continue);
            }

            Instruction::Unreachable => return Err(TrapKind::Unreachable),

            Instruction::Return(drop_keep) => {
                self.value_stack.drop_keep(*drop_keep);
                let keep = drop_keep.keep;
                self.call_stack.pop();
                if self.call_stack.is_empty() {
                    let result = match keep {
                        Keep::Single => Some(self.pop_tagged_result(func_index)),
                        Keep::None => None,
                    };
                    return Ok(StepOutcome::Finished(result));
                }
                return Ok(StepOutcome::Continue);
            }

            Instruction::Call(target) => {
                let callee_index = *target;
                let wasm = self.as_wasm_panicking(callee_index);
                let n = wasm.signature.params().len();
                let args = self.pop_n_tagged(n, &wasm.signature);
                // Advance past this instruction in the caller's frame before
                // pushing the callee's, so returning resumes after the call
                // rather than re-executing it.
                self.frame_mut().pc += 1;
                self.push_frame(callee_index, wasm, &args)?;
                return Ok(StepOutcome::Continue);
            }
            Instruction::CallIndirect(expected_sig) => {
                let elem_index = self.value_stack.pop().as_u32();
                let callee_index = self.table().get(elem_index).ok_or(TrapKind::UndefinedElement)?;
                let wasm = self.as_wasm_panicking(callee_index);
                if wasm.sig_id.index() != *expected_sig {
                    return Err(TrapKind::IndirectCallSignatureMismatch);
                }
                let n = wasm.signature.params().len();
                let args = self.pop_n_tagged(n, &wasm.signature);
                self.frame_mut().pc += 1;
                self.push_frame(callee_index, wasm, &args)?;
                return Ok(StepOutcome::Continue);
            }

            Instruction::Drop => {
                self.value_stack.pop();
            }
            Instruction::Select => {
                let (a, b, cond) = self.value_stack.pop_triple();
                self.value_stack.push(if cond.as_i32() != 0 { a } else { b })?;
            }

            Instruction::GetGlobal(idx) => {
                let v = self.program.global(*idx).get();
                self.value_stack.push(v.untag())?;
            }
            Instruction::SetGlobal(idx) => {
                let v = self.value_stack.pop();
                let global = self.program.global(*idx);
                global.set(v.tagged(global.value_type()));
            }

            Instruction::I32Load(off) => self.load(*off, |m, a| m.load_u32(a).map(|v| Value::i32(v as i32)))?,
            Instruction::I64Load(off) => self.load(*off, |m, a| m.load_u64(a).map(|v| Value::i64(v as i64)))?,
            Instruction::F32Load(off) => {
                self.load(*off, |m, a| m.load_u32(a).map(|v| Value::f32(F32::from_bits(v))))?
            }
            Instruction::F64Load(off) => {
                self.load(*off, |m, a| m.load_u64(a).map(|v| Value::f64(F64::from_bits(v))))?
            }
            Instruction::I32Load8S(off) => self.load(*off, |m, a| m.load_u8(a).map(|v| Value::i32(v as i8 as i32)))?,
            Instruction::I32Load8U(off) => self.load(*off, |m, a| m.load_u8(a).map(|v| Value::i32(v as i32)))?,
            Instruction::I32Load16S(off) => {
                self.load(*off, |m, a| m.load_u16(a).map(|v| Value::i32(v as i16 as i32)))?
            }
            Instruction::I32Load16U(off) => self.load(*off, |m, a| m.load_u16(a).map(|v| Value::i32(v as i32)))?,
            Instruction::I64Load8S(off) => self.load(*off, |m, a| m.load_u8(a).map(|v| Value::i64(v as i8 as i64)))?,
            Instruction::I64Load8U(off) => self.load(*off, |m, a| m.load_u8(a).map(|v| Value::i64(v as i64)))?,
            Instruction::I64Load16S(off) => {
                self.load(*off, |m, a| m.load_u16(a).map(|v| Value::i64(v as i16 as i64)))?
            }
            Instruction::I64Load16U(off) => self.load(*off, |m, a| m.load_u16(a).map(|v| Value::i64(v as i64)))?,
            Instruction::I64Load32S(off) => {
                self.load(*off, |m, a| m.load_u32(a).map(|v| Value::i64(v as i32 as i64)))?
            }
            Instruction::I64Load32U(off) => self.load(*off, |m, a| m.load_u32(a).map(|v| Value::i64(v as i64)))?,

            Instruction::I32Store(off) => self.store(*off, |m, a, v| m.store_u32(a, v.as_u32()))?,
            Instruction::I64Store(off) => self.store(*off, |m, a, v| m.store_u64(a, v.as_u64()))?,
            Instruction::F32Store(off) => self.store(*off, |m, a, v| m.store_u32(a, v.as_f32().to_bits()))?,
            Instruction::F64Store(off) => self.store(*off, |m, a, v| m.store_u64(a, v.as_f64().to_bits()))?,
            Instruction::I32Store8(off) => self.store(*off, |m, a, v| m.store_u8(a, v.as_u32() as u8))?,
            Instruction::I32Store16(off) => self.store(*off, |m, a, v| m.store_u16(a, v.as_u32() as u16))?,
            Instruction::I64Store8(off) => self.store(*off, |m, a, v| m.store_u8(a, v.as_u64() as u8))?,
            Instruction::I64Store16(off) => self.store(*off, |m, a, v| m.store_u16(a, v.as_u64() as u16))?,
            Instruction::I64Store32(off) => self.store(*off, |m, a, v| m.store_u32(a, v.as_u64() as u32))?,

            Instruction::CurrentMemory => {
                let pages = self.memory().current_pages();
                self.value_stack.push(Value::i32(pages as i32))?;
            }
            Instruction::GrowMemory => {
                let delta = self.value_stack.pop().as_u32();
                let prev = self.memory().grow(delta);
                self.value_stack.push(Value::i32(prev))?;
            }

            Instruction::I32Const(v) => self.value_stack.push(Value::i32(*v))?,
            Instruction::I64Const(v) => self.value_stack.push(Value::i64(*v))?,
            Instruction::F32Const(bits) => self.value_stack.push(Value::f32(F32::from_bits(*bits)))?,
            Instruction::F64Const(bits) => self.value_stack.push(Value::f64(F64::from_bits(*bits)))?,

            Instruction::I32Eqz => {
                let a = self.value_stack.pop().as_i32();
                self.value_stack.push(Value::i32((a == 0) as i32))?;
            }
            Instruction::I32Eq => relop!(as_i32, |a, b| a == b),
            Instruction::I32Ne => relop!(as_i32, |a, b| a != b),
            Instruction::I32LtS => relop!(as_i32, |a, b| a < b),
            Instruction::I32LtU => relop!(as_u32, |a, b| a < b),
            Instruction::I32GtS => relop!(as_i32, |a, b| a > b),
            Instruction::I32GtU => relop!(as_u32, |a, b| a > b),
            Instruction::I32LeS => relop!(as_i32, |a, b| a <= b),
            Instruction::I32LeU => relop!(as_u32, |a, b| a <= b),
            Instruction::I32GeS => relop!(as_i32, |a, b| a >= b),
            Instruction::I32GeU => relop!(as_u32, |a, b| a >= b),

            Instruction::I64Eqz => {
                let a = self.value_stack.pop().as_i64();
                self.value_stack.push(Value::i32((a == 0) as i32))?;
            }
            Instruction::I64Eq => relop!(as_i64, |a, b| a == b),
            Instruction::I64Ne => relop!(as_i64, |a, b| a != b),
            Instruction::I64LtS => relop!(as_i64, |a, b| a < b),
            Instruction::I64LtU => relop!(as_u64, |a, b| a < b),
            Instruction::I64GtS => relop!(as_i64, |a, b| a > b),
            Instruction::I64GtU => relop!(as_u64, |a, b| a > b),
            Instruction::I64LeS => relop!(as_i64, |a, b| a <= b),
            Instruction::I64LeU => relop!(as_u64, |a, b| a <= b),
            Instruction::I64GeS => relop!(as_i64, |a, b| a >= b),
            Instruction::I64GeU => relop!(as_u64, |a, b| a >= b),

            Instruction::F32Eq => relop!(as_f32, |a: F32, b: F32| a.to_float() == b.to_float()),
            Instruction::F32Ne => relop!(as_f32, |a: F32, b: F32| a.to_float() != b.to_float()),
            Instruction::F32Lt => relop!(as_f32, |a: F32, b: F32| a.to_float() < b.to_float()),
            Instruction::F32Gt => relop!(as_f32, |a: F32, b: F32| a.to_float() > b.to_float()),
            Instruction::F32Le => relop!(as_f32, |a: F32, b: F32| a.to_float() <= b.to_float()),
            Instruction::F32Ge => relop!(as_f32, |a: F32, b: F32| a.to_float() >= b.to_float()),

            Instruction::F64Eq => relop!(as_f64, |a: F64, b: F64| a.to_float() == b.to_float()),
            Instruction::F64Ne => relop!(as_f64, |a: F64, b: F64| a.to_float() != b.to_float()),
            Instruction::F64Lt => relop!(as_f64, |a: F64, b: F64| a.to_float() < b.to_float()),
            Instruction::F64Gt => relop!(as_f64, |a: F64, b: F64| a.to_float() > b.to_float()),
            Instruction::F64Le => relop!(as_f64, |a: F64, b: F64| a.to_float() <= b.to_float()),
            Instruction::F64Ge => relop!(as_f64, |a: F64, b: F64| a.to_float() >= b.to_float()),

            Instruction::I32Clz => unop!(as_u32, i32, |a: u32| i32_ops::clz(a) as i32),
            Instruction::I32Ctz => unop!(as_u32, i32, |a: u32| i32_ops::ctz(a) as i32),
            Instruction::I32Popcnt => unop!(as_u32, i32, |a: u32| i32_ops::popcnt(a) as i32),
            Instruction::I32Add => binop!(as_i32, i32, i32_ops::add),
            Instruction::I32Sub => binop!(as_i32, i32, i32_ops::sub),
            Instruction::I32Mul => binop!(as_i32, i32, i32_ops::mul),
            Instruction::I32DivS => binop_trap!(as_i32, i32, i32_ops::div_s),
            Instruction::I32DivU => {
                let (a, b) = self.value_stack.pop_pair();
                let v = i32_ops::div_u(a.as_u32(), b.as_u32())?;
                self.value_stack.push(Value::i32(v as i32))?;
            }
            Instruction::I32RemS => binop_trap!(as_i32, i32, i32_ops::rem_s),
            Instruction::I32RemU => {
                let (a, b) = self.value_stack.pop_pair();
                let v = i32_ops::rem_u(a.as_u32(), b.as_u32())?;
                self.value_stack.push(Value::i32(v as i32))?;
            }
            Instruction::I32And => binop!(as_u32, i32, |a, b| i32_ops::and(a, b) as i32),
            Instruction::I32Or => binop!(as_u32, i32, |a, b| i32_ops::or(a, b) as i32),
            Instruction::I32Xor => binop!(as_u32, i32, |a, b| i32_ops::xor(a, b) as i32),
            Instruction::I32Shl => binop!(as_u32, i32, |a, b| i32_ops::shl(a, b) as i32),
            Instruction::I32ShrS => binop!(as_i32, i32, |a, b| i32_ops::shr_s(a, b as u32)),
            Instruction::I32ShrU => binop!(as_u32, i32, |a, b| i32_ops::shr_u(a, b) as i32),
            Instruction::I32Rotl => binop!(as_u32, i32, |a, b| i32_ops::rotl(a, b) as i32),
            Instruction::I32Rotr => binop!(as_u32, i32, |a, b| i32_ops::rotr(a, b) as i32),

            Instruction::I64Clz => unop!(as_u64, i64, |a: u64| i64_ops::clz(a) as i64),
            Instruction::I64Ctz => unop!(as_u64, i64, |a: u64| i64_ops::ctz(a) as i64),
            Instruction::I64Popcnt => unop!(as_u64, i64, |a: u64| i64_ops::popcnt(a) as i64),
            Instruction::I64Add => binop!(as_i64, i64, i64_ops::add),
            Instruction::I64Sub => binop!(as_i64, i64, i64_ops::sub),
            Instruction::I64Mul => binop!(as_i64, i64, i64_ops::mul),
            Instruction::I64DivS => binop_trap!(as_i64, i64, i64_ops::div_s),
            Instruction::I64DivU => {
                let (a, b) = self.value_stack.pop_pair();
                let v = i64_ops::div_u(a.as_u64(), b.as_u64())?;
                self.value_stack.push(Value::i64(v as i64))?;
            }
            Instruction::I64RemS => binop_trap!(as_i64, i64, i64_ops::rem_s),
            Instruction::I64RemU => {
                let (a, b) = self.value_stack.pop_pair();
                let v = i64_ops::rem_u(a.as_u64(), b.as_u64())?;
                self.value_stack.push(Value::i64(v as i64))?;
            }
            Instruction::I64And => binop!(as_u64, i64, |a, b| i64_ops::and(a, b) as i64),
            Instruction::I64Or => binop!(as_u64, i64, |a, b| i64_ops::or(a, b) as i64),
            Instruction::I64Xor => binop!(as_u64, i64, |a, b| i64_ops::xor(a, b) as i64),
            Instruction::I64Shl => binop!(as_u64, i64, |a, b| i64_ops::shl(a, b) as i64),
            Instruction::I64ShrS => binop!(as_i64, i64, |a, b| i64_ops::shr_s(a, b as u64)),
            Instruction::I64ShrU => binop!(as_u64, i64, |a, b| i64_ops::shr_u(a, b) as i64),
            Instruction::I64Rotl => binop!(as_u64, i64, |a, b| i64_ops::rotl(a, b) as i64),
            Instruction::I64Rotr => binop!(as_u64, i64, |a, b| i64_ops::rotr(a, b) as i64),

            Instruction::F32Abs => unop!(as_f32, f32, f32_ops::abs),
            Instruction::F32Neg => unop!(as_f32, f32, f32_ops::neg),
            Instruction::F32Ceil => unop!(as_f32, f32, f32_ops::ceil),
            Instruction::F32Floor => unop!(as_f32, f32, f32_ops::floor),
            Instruction::F32Trunc => unop!(as_f32, f32, f32_ops::trunc),
            Instruction::F32Nearest => unop!(as_f32, f32, f32_ops::nearest),
            Instruction::F32Sqrt => unop!(as_f32, f32, f32_ops::sqrt),
            Instruction::F32Add => binop!(as_f32, f32, f32_ops::add),
            Instruction::F32Sub => binop!(as_f32, f32, f32_ops::sub),
            Instruction::F32Mul => binop!(as_f32, f32, f32_ops::mul),
            Instruction::F32Div => binop!(as_f32, f32, f32_ops::div),
            Instruction::F32Min => binop!(as_f32, f32, f32_ops::min),
            Instruction::F32Max => binop!(as_f32, f32, f32_ops::max),
            Instruction::F32Copysign => binop!(as_f32, f32, f32_ops::copysign),

            Instruction::F64Abs => unop!(as_f64, f64, f64_ops::abs),
            Instruction::F64Neg => unop!(as_f64, f64, f64_ops::neg),
            Instruction::F64Ceil => unop!(as_f64, f64, f64_ops::ceil),
            Instruction::F64Floor => unop!(as_f64, f64, f64_ops::floor),
            Instruction::F64Trunc => unop!(as_f64, f64, f64_ops::trunc),
            Instruction::F64Nearest => unop!(as_f64, f64, f64_ops::nearest),
            Instruction::F64Sqrt => unop!(as_f64, f64, f64_ops::sqrt),
            Instruction::F64Add => binop!(as_f64, f64, f64_ops::add),
            Instruction::F64Sub => binop!(as_f64, f64, f64_ops::sub),
            Instruction::F64Mul => binop!(as_f64, f64, f64_ops::mul),
            Instruction::F64Div => binop!(as_f64, f64, f64_ops::div),
            Instruction::F64Min => binop!(as_f64, f64, f64_ops::min),
            Instruction::F64Max => binop!(as_f64, f64, f64_ops::max),
            Instruction::F64Copysign => binop!(as_f64, f64, f64_ops::copysign),

            Instruction::I32WrapI64 => convert_op!(as_i64, i32, convert::i32_wrap_i64),
            Instruction::I32TruncSF32 => convert_op_trap!(as_f32, i32, convert::i32_trunc_s_f32),
            Instruction::I32TruncUF32 => {
                let a = self.value_stack.pop().as_f32();
                self.value_stack.push(Value::i32(convert::i32_trunc_u_f32(a)? as i32))?;
            }
            Instruction::I32TruncSF64 => convert_op_trap!(as_f64, i32, convert::i32_trunc_s_f64),
            Instruction::I32TruncUF64 => {
                let a = self.value_stack.pop().as_f64();
                self.value_stack.push(Value::i32(convert::i32_trunc_u_f64(a)? as i32))?;
            }
            Instruction::I64ExtendSI32 => convert_op!(as_i32, i64, convert::i64_extend_s_i32),
            Instruction::I64ExtendUI32 => convert_op!(as_u32, i64, convert::i64_extend_u_i32),
            Instruction::I64TruncSF32 => convert_op_trap!(as_f32, i64, convert::i64_trunc_s_f32),
            Instruction::I64TruncUF32 => {
                let a = self.value_stack.pop().as_f32();
                self.value_stack.push(Value::i64(convert::i64_trunc_u_f32(a)? as i64))?;
            }
            Instruction::I64TruncSF64 => convert_op_trap!(as_f64, i64, convert::i64_trunc_s_f64),
            Instruction::I64TruncUF64 => {
                let a = self.value_stack.pop().as_f64();
                self.value_stack.push(Value::i64(convert::i64_trunc_u_f64(a)? as i64))?;
            }
            Instruction::F32ConvertSI32 => convert_op!(as_i32, f32, convert::f32_convert_s_i32),
            Instruction::F32ConvertUI32 => convert_op!(as_u32, f32, convert::f32_convert_u_i32),
            Instruction::F32ConvertSI64 => convert_op!(as_i64, f32, convert::f32_convert_s_i64),
            Instruction::F32ConvertUI64 => convert_op!(as_u64, f32, convert::f32_convert_u_i64),
            Instruction::F32DemoteF64 => convert_op!(as_f64, f32, convert::f32_demote_f64),
            Instruction::F64ConvertSI32 => convert_op!(as_i32, f64, convert::f64_convert_s_i32),
            Instruction::F64ConvertUI32 => convert_op!(as_u32, f64, convert::f64_convert_u_i32),
            Instruction::F64ConvertSI64 => convert_op!(as_i64, f64, convert::f64_convert_s_i64),
            Instruction::F64ConvertUI64 => convert_op!(as_u64, f64, convert::f64_convert_u_i64),
            Instruction::F64PromoteF32 => convert_op!(as_f32, f64, convert::f64_promote_f32),

            Instruction::I32ReinterpretF32 => {
                let a = self.value_stack.pop().as_f32();
                self.value_stack.push(Value::i32(a.to_bits() as i32))?;
            }
            Instruction::I64ReinterpretF64 => {
                let a = self.value_stack.pop().as_f64();
                self.value_stack.push(Value::i64(a.to_bits() as i64))?;
            }
            Instruction::F32ReinterpretI32 => {
                let a = self.value_stack.pop().as_u32();
                self.value_stack.push(Value::f32(F32::from_bits(a)))?;
            }
            Instruction::F64ReinterpretI64 => {
                let a = self.value_stack.pop().as_u64();
                self.value_stack.push(Value::f64(F64::from_bits(a)))?;
            }
        }

        self.frame_mut().pc += 1;
        Ok(StepOutcome::Continue)
    }

    fn frame(&self) -> &FunctionContext {
        self.call_stack.top().expect("instruction executed with no active frame")
    }

    fn frame_mut(&mut self) -> &mut FunctionContext {
        self.call_stack.top_mut().expect("instruction executed with no active frame")
    }

    fn memory(&self) -> &MemoryInstance {
        self.program.memory(0)
    }

    fn table(&self) -> &crate::table::TableInstance {
        self.program.table(0)
    }

    fn load_addr(&mut self, offset: u32) -> Result<u32, TrapKind> {
        let base = self.value_stack.pop().as_u32();
        base.checked_add(offset).ok_or(TrapKind::OutOfBoundsMemoryAccess)
    }

    fn load(&mut self, offset: u32, f: impl FnOnce(&MemoryInstance, u32) -> Result<Value, TrapKind>) -> Result<(), TrapKind> {
        let addr = self.load_addr(offset)?;
        let v = f(self.memory(), addr)?;
        self.value_stack.push(v)?;
        Ok(())
    }

    fn store(
        &mut self,
        offset: u32,
        f: impl FnOnce(&MemoryInstance, u32, Value) -> Result<(), TrapKind>,
    ) -> Result<(), TrapKind> {
        let (base_value, value) = self.value_stack.pop_pair();
        let addr = base_value.as_u32().checked_add(offset).ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        f(self.memory(), addr, value)
    }

    fn as_wasm_panicking(&self, func_index: u32) -> &'p WasmFunc {
        match self.program.function(func_index) {
            FuncKind::Wasm(f) => f,
            FuncKind::Host(_) => unreachable!("no HostFunc is ever constructed; reaching one is a logic error"),
        }
    }

    fn pop_n_tagged(&mut self, n: usize, sig: &Signature) -> Vec<TaggedValue> {
        let mut raw = Vec::with_capacity(n);
        for _ in 0..n {
            raw.push(self.value_stack.pop());
        }
        raw.reverse();
        raw.into_iter().zip(sig.params()).map(|(v, ty)| v.tagged(*ty)).collect()
    }

    fn pop_tagged_result(&mut self, func_index: u32) -> TaggedValue {
        let ty = self
            .as_wasm_panicking(func_index)
            .signature
            .result()
            .expect("Keep::Single implies a result type");
        self.value_stack.pop().tagged(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::decode_module;
    use crate::linker::link;

    /// A single module exporting `run`, a nullary function whose body is
    /// `expr` (must end with the `end` opcode 0x0b) returning i32.
    fn module_with_expr(expr: &[u8]) -> Vec<u8> {
        let mut v = vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
        v.extend([1, 5, 1, 0x60, 0, 1, 0x7f]); // type section: () -> i32
        v.extend([3, 2, 1, 0]); // function section
        let mut exp = vec![1, 3];
        exp.extend(b"run");
        exp.push(0);
        exp.push(0);
        v.push(7);
        v.push(exp.len() as u8);
        v.extend(exp);
        let mut body = vec![0]; // zero local-declaration groups
        body.extend_from_slice(expr);
        let mut code = vec![10, (body.len() + 2) as u8, 1, body.len() as u8];
        code.extend(body);
        v.extend(code);
        v
    }

    #[test]
    fn runs_simple_arithmetic_to_completion() {
        // i32.const 41; i32.const 1; i32.add; end
        let module = decode_module(&module_with_expr(&[0x41, 41, 0x41, 1, 0x6a, 0x0b])).unwrap();
        let program = link(&[module]).unwrap();
        let func = program.export_function(0, "run").unwrap();
        let mut runner = Runner::new(&program);
        let result = runner.call(func, &[]).unwrap();
        assert_eq!(result, Some(TaggedValue::I32(42)));
    }

    #[test]
    fn division_by_zero_traps() {
        // i32.const 1; i32.const 0; i32.div_s; end
        let module = decode_module(&module_with_expr(&[0x41, 1, 0x41, 0, 0x6d, 0x0b])).unwrap();
        let program = link(&[module]).unwrap();
        let func = program.export_function(0, "run").unwrap();
        let mut runner = Runner::new(&program);
        let trap = runner.call(func, &[]).unwrap_err();
        assert_eq!(*trap.kind(), TrapKind::IntegerDivideByZero);
    }
}
