//! The code rewriter (spec.md §4.2 "Rewriting", §3 invariants 3-4):
//! converts one function's raw, structured-control-flow instruction bytes
//! into a flat `isa::Instructions` sequence with every branch resolved to an
//! absolute instruction index up front.
//!
//! The rewriter walks the byte stream once, maintaining an open-block stack
//! that mirrors the decoder's view of `block`/`loop`/`if`/`else` nesting.
//! Each open frame remembers the operand-stack height at its entry and its
//! result arity (0 or 1, since WASM 1.0 has no multi-value); branches whose
//! destination isn't known yet (anything targeting a `block`/`if`'s `end`)
//! are recorded as a pending `Reloc` and patched in once that `end` is
//! reached. Branches to a `loop`'s header are resolved immediately, since
//! the header's position is already on the builder's tape.

use crate::binary::Reader;
use crate::error::LoadError;
use crate::isa::{DropKeep, Instruction, Instructions, InstructionsBuilder, Keep, Reloc, Target};
use crate::module_def::FunctionBody;
use crate::signature::SigId;
use crate::types::{Signature, ValueType};

/// What the rewriter needs from the program being linked: how a module-local
/// index maps onto the program-wide index spaces, and the signatures those
/// indices name. Implemented by the linker while it builds a `Program`.
pub trait RewriteContext {
    fn resolve_func(&self, module_local_index: u32) -> Option<u32>;
    fn resolve_global(&self, module_local_index: u32) -> Option<u32>;
    fn func_signature(&self, module_local_index: u32) -> Option<&Signature>;
    fn type_signature(&self, module_local_type_index: u32) -> Option<&Signature>;
    fn sig_id(&self, module_local_type_index: u32) -> Option<SigId>;
}

enum FrameKind {
    Block,
    Loop { header_pc: u32 },
    If { branch_over_pc: u32, has_else: bool },
}

struct Frame {
    kind: FrameKind,
    result: Option<ValueType>,
    start_height: u32,
    /// Pending relocations targeting this frame's `end`.
    end_relocs: Vec<Reloc>,
}

fn frame_arity(frame: &Frame) -> u32 {
    match frame.kind {
        // A branch to a loop's header re-enters it with no values carried
        // in (WASM 1.0 loops take no block-entry parameters).
        FrameKind::Loop { .. } => 0,
        _ => frame.result.map_or(0, |_| 1),
    }
}

fn frame_known_dst(frame: &Frame) -> Option<u32> {
    match frame.kind {
        FrameKind::Loop { header_pc } => Some(header_pc),
        _ => None,
    }
}

fn malformed(msg: impl Into<String>) -> LoadError {
    LoadError::MalformedCode(msg.into())
}

fn pop(height: &mut u32, n: u32, unreachable: bool) -> Result<(), LoadError> {
    match height.checked_sub(n) {
        Some(h) => {
            *height = h;
            Ok(())
        }
        None if unreachable => {
            *height = 0;
            Ok(())
        }
        None => Err(malformed("operand stack underflow")),
    }
}

fn push(height: &mut u32, n: u32) {
    *height += n;
}

/// Resolve a `br`/`br_if`/`br_table` arm's destination: the drop/keep to
/// apply plus either a known absolute pc (branching to a loop header) or the
/// open-frame index to register a pending relocation against.
fn compute_branch(
    frames: &[Frame],
    depth: u32,
    height: u32,
) -> Result<(DropKeep, Option<u32>, usize), LoadError> {
    let idx = (frames.len())
        .checked_sub(1 + depth as usize)
        .ok_or_else(|| malformed("branch depth exceeds the open block nesting"))?;
    let frame = &frames[idx];
    let arity = frame_arity(frame);
    let keep = if arity == 1 { Keep::Single } else { Keep::None };
    let drop = height
        .checked_sub(frame.start_height + arity)
        .ok_or_else(|| malformed("operand stack underflow at branch"))?;
    Ok((DropKeep { drop, keep }, frame_known_dst(frame), idx))
}

fn parse_blocktype(r: &mut Reader) -> Result<Option<ValueType>, LoadError> {
    let byte = r.u8()?;
    if byte == 0x40 {
        return Ok(None);
    }
    ValueType::from_byte(byte)
        .map(Some)
        .ok_or_else(|| malformed(format!("invalid block type byte 0x{byte:x}")))
}

fn memarg_offset(r: &mut Reader) -> Result<u32, LoadError> {
    let _align = r.leb_u32()?;
    r.leb_u32()
}

fn check_local(idx: u32, num_locals: u32) -> Result<(), LoadError> {
    if idx >= num_locals {
        return Err(malformed(format!("local index {idx} out of range")));
    }
    Ok(())
}

/// Rewrite one function body into its flat instruction sequence. `sig` is
/// the function's own signature, needed to size `return`'s drop/keep.
pub fn rewrite_function(
    body: &FunctionBody,
    sig: &Signature,
    ctx: &dyn RewriteContext,
) -> Result<Instructions, LoadError> {
    let num_locals = sig.params().len() as u32 + body.locals.len() as u32;
    let mut r = Reader::new(&body.code);
    let mut b = InstructionsBuilder::new();
    // The function body is itself an implicit top-level block, terminated
    // by its own `end` byte just like any other - without this frame, a
    // nested block's `end` would be indistinguishable from the function's.
    let mut frames: Vec<Frame> = vec![Frame {
        kind: FrameKind::Block,
        result: sig.result(),
        start_height: 0,
        end_relocs: Vec::new(),
    }];
    let mut height: u32 = 0;
    let mut unreachable = false;

    loop {
        if r.is_empty() {
            return Err(malformed("function body ended without a matching `end`"));
        }
        let op = r.u8()?;
        match op {
            0x00 => {
                b.push(Instruction::Unreachable);
                unreachable = true;
            }
            0x01 => {}
            0x02 => {
                let result = parse_blocktype(&mut r)?;
                frames.push(Frame {
                    kind: FrameKind::Block,
                    result,
                    start_height: height,
                    end_relocs: Vec::new(),
                });
                unreachable = false;
            }
            0x03 => {
                let result = parse_blocktype(&mut r)?;
                let header_pc = b.current_pc();
                frames.push(Frame {
                    kind: FrameKind::Loop { header_pc },
                    result,
                    start_height: height,
                    end_relocs: Vec::new(),
                });
                unreachable = false;
            }
            0x04 => {
                let result = parse_blocktype(&mut r)?;
                pop(&mut height, 1, unreachable)?;
                let placeholder = Target {
                    dst_pc: u32::MAX,
                    drop_keep: DropKeep { drop: 0, keep: Keep::None },
                };
                let branch_over_pc = b.push(Instruction::BrIfEqz(placeholder));
                frames.push(Frame {
                    kind: FrameKind::If { branch_over_pc, has_else: false },
                    result,
                    start_height: height,
                    end_relocs: Vec::new(),
                });
                unreachable = false;
            }
            0x05 => {
                let frame = frames.last_mut().ok_or_else(|| malformed("`else` outside an `if`"))?;
                let (branch_over_pc, has_else) = match &mut frame.kind {
                    FrameKind::If { branch_over_pc, has_else } => (*branch_over_pc, has_else),
                    _ => return Err(malformed("`else` without a matching `if`")),
                };
                if *has_else {
                    return Err(malformed("duplicate `else` in one `if`"));
                }
                let arity = frame.result.map_or(0, |_| 1);
                let keep = if arity == 1 { Keep::Single } else { Keep::None };
                let drop = height
                    .checked_sub(frame.start_height + arity)
                    .ok_or_else(|| malformed("operand stack underflow at `else`"))?;
                let jump_to_end = b.push(Instruction::Br(Target {
                    dst_pc: u32::MAX,
                    drop_keep: DropKeep { drop, keep },
                }));
                frame.end_relocs.push(Reloc::Br { pc: jump_to_end });
                let else_start = b.current_pc();
                b.patch_relocation(Reloc::Br { pc: branch_over_pc }, else_start);
                *has_else = true;
                height = frame.start_height;
                unreachable = false;
            }
            0x0b => {
                let frame = frames.pop().ok_or_else(|| malformed("`end` with no open block"))?;
                let end_pc = b.current_pc();
                if let FrameKind::If { branch_over_pc, has_else: false } = &frame.kind {
                    b.patch_relocation(Reloc::Br { pc: *branch_over_pc }, end_pc);
                }
                for reloc in frame.end_relocs {
                    b.patch_relocation(reloc, end_pc);
                }
                height = frame.start_height + frame.result.map_or(0, |_| 1);
                unreachable = false;
                if frames.is_empty() {
                    let arity = sig.result().map_or(0, |_| 1);
                    let keep = if arity == 1 { Keep::Single } else { Keep::None };
                    let drop = height
                        .checked_sub(arity)
                        .ok_or_else(|| malformed("operand stack underflow at function end"))?;
                    b.push(Instruction::Return(DropKeep { drop, keep }));
                    break;
                }
            }
            0x0c | 0x0d => {
                if op == 0x0d {
                    pop(&mut height, 1, unreachable)?;
                }
                let depth = r.leb_u32()?;
                let (drop_keep, known_dst, idx) = compute_branch(&frames, depth, height)?;
                let target = Target { dst_pc: known_dst.unwrap_or(u32::MAX), drop_keep };
                let instr = if op == 0x0c { Instruction::Br(target) } else { Instruction::BrIfNez(target) };
                let pc = b.push(instr);
                if known_dst.is_none() {
                    frames[idx].end_relocs.push(Reloc::Br { pc });
                }
                if op == 0x0c {
                    unreachable = true;
                }
            }
            0x0e => {
                pop(&mut height, 1, unreachable)?;
                let n = r.leb_u32()?;
                let mut depths = Vec::with_capacity(n as usize + 1);
                for _ in 0..n {
                    depths.push(r.leb_u32()?);
                }
                depths.push(r.leb_u32()?);

                let mut targets = Vec::with_capacity(depths.len());
                let mut pending = Vec::new();
                for depth in depths {
                    let (drop_keep, known_dst, idx) = compute_branch(&frames, depth, height)?;
                    let ti = targets.len();
                    targets.push(Target { dst_pc: known_dst.unwrap_or(u32::MAX), drop_keep });
                    if known_dst.is_none() {
                        pending.push((ti, idx));
                    }
                }
                let pc = b.push(Instruction::BrTable(targets.into_boxed_slice()));
                for (ti, idx) in pending {
                    frames[idx].end_relocs.push(Reloc::BrTable { pc, idx: ti });
                }
                unreachable = true;
            }
            0x0f => {
                let arity = sig.result().map_or(0, |_| 1);
                let keep = if arity == 1 { Keep::Single } else { Keep::None };
                let drop = height
                    .checked_sub(arity)
                    .ok_or_else(|| malformed("operand stack underflow at `return`"))?;
                b.push(Instruction::Return(DropKeep { drop, keep }));
                unreachable = true;
            }
            0x10 => {
                let func_idx = r.leb_u32()?;
                let callee = ctx
                    .func_signature(func_idx)
                    .ok_or_else(|| malformed(format!("call to unknown function {func_idx}")))?;
                pop(&mut height, callee.params().len() as u32, unreachable)?;
                if callee.result().is_some() {
                    push(&mut height, 1);
                }
                let target = ctx
                    .resolve_func(func_idx)
                    .ok_or_else(|| malformed(format!("call to unknown function {func_idx}")))?;
                b.push(Instruction::Call(target));
            }
            0x11 => {
                let type_idx = r.leb_u32()?;
                let reserved = r.u8()?;
                if reserved != 0x00 {
                    return Err(malformed("call_indirect reserved byte must be zero"));
                }
                pop(&mut height, 1, unreachable)?;
                let callee = ctx
                    .type_signature(type_idx)
                    .ok_or_else(|| malformed(format!("call_indirect to unknown type {type_idx}")))?;
                pop(&mut height, callee.params().len() as u32, unreachable)?;
                if callee.result().is_some() {
                    push(&mut height, 1);
                }
                let sig_id = ctx
                    .sig_id(type_idx)
                    .ok_or_else(|| malformed(format!("call_indirect to unknown type {type_idx}")))?;
                b.push(Instruction::CallIndirect(sig_id.index()));
            }
            0x1a => {
                pop(&mut height, 1, unreachable)?;
                b.push(Instruction::Drop);
            }
            0x1b => {
                pop(&mut height, 3, unreachable)?;
                push(&mut height, 1);
                b.push(Instruction::Select);
            }
            0x20 => {
                let idx = r.leb_u32()?;
                check_local(idx, num_locals)?;
                push(&mut height, 1);
                b.push(Instruction::GetLocal(idx));
            }
            0x21 => {
                let idx = r.leb_u32()?;
                check_local(idx, num_locals)?;
                pop(&mut height, 1, unreachable)?;
                b.push(Instruction::SetLocal(idx));
            }
            0x22 => {
                let idx = r.leb_u32()?;
                check_local(idx, num_locals)?;
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                b.push(Instruction::TeeLocal(idx));
            }
            0x23 => {
                let idx = r.leb_u32()?;
                push(&mut height, 1);
                let global = ctx
                    .resolve_global(idx)
                    .ok_or_else(|| malformed(format!("get_global of unknown global {idx}")))?;
                b.push(Instruction::GetGlobal(global));
            }
            0x24 => {
                let idx = r.leb_u32()?;
                pop(&mut height, 1, unreachable)?;
                let global = ctx
                    .resolve_global(idx)
                    .ok_or_else(|| malformed(format!("set_global of unknown global {idx}")))?;
                b.push(Instruction::SetGlobal(global));
            }
            0x28..=0x35 => {
                let offset = memarg_offset(&mut r)?;
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x28 => Instruction::I32Load(offset),
                    0x29 => Instruction::I64Load(offset),
                    0x2a => Instruction::F32Load(offset),
                    0x2b => Instruction::F64Load(offset),
                    0x2c => Instruction::I32Load8S(offset),
                    0x2d => Instruction::I32Load8U(offset),
                    0x2e => Instruction::I32Load16S(offset),
                    0x2f => Instruction::I32Load16U(offset),
                    0x30 => Instruction::I64Load8S(offset),
                    0x31 => Instruction::I64Load8U(offset),
                    0x32 => Instruction::I64Load16S(offset),
                    0x33 => Instruction::I64Load16U(offset),
                    0x34 => Instruction::I64Load32S(offset),
                    0x35 => Instruction::I64Load32U(offset),
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x36..=0x3e => {
                let offset = memarg_offset(&mut r)?;
                pop(&mut height, 2, unreachable)?;
                let instr = match op {
                    0x36 => Instruction::I32Store(offset),
                    0x37 => Instruction::I64Store(offset),
                    0x38 => Instruction::F32Store(offset),
                    0x39 => Instruction::F64Store(offset),
                    0x3a => Instruction::I32Store8(offset),
                    0x3b => Instruction::I32Store16(offset),
                    0x3c => Instruction::I64Store8(offset),
                    0x3d => Instruction::I64Store16(offset),
                    0x3e => Instruction::I64Store32(offset),
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x3f => {
                if r.u8()? != 0x00 {
                    return Err(malformed("current_memory reserved byte must be zero"));
                }
                push(&mut height, 1);
                b.push(Instruction::CurrentMemory);
            }
            0x40 => {
                if r.u8()? != 0x00 {
                    return Err(malformed("grow_memory reserved byte must be zero"));
                }
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                b.push(Instruction::GrowMemory);
            }
            0x41 => {
                push(&mut height, 1);
                b.push(Instruction::I32Const(r.leb_i32()?));
            }
            0x42 => {
                push(&mut height, 1);
                b.push(Instruction::I64Const(r.leb_i64()?));
            }
            0x43 => {
                push(&mut height, 1);
                let bits = u32::from_le_bytes(r.bytes(4)?.try_into().unwrap());
                b.push(Instruction::F32Const(bits));
            }
            0x44 => {
                push(&mut height, 1);
                let bits = u64::from_le_bytes(r.bytes(8)?.try_into().unwrap());
                b.push(Instruction::F64Const(bits));
            }
            0x45 => {
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                b.push(Instruction::I32Eqz);
            }
            0x46..=0x4f => {
                pop(&mut height, 2, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x46 => Instruction::I32Eq,
                    0x47 => Instruction::I32Ne,
                    0x48 => Instruction::I32LtS,
                    0x49 => Instruction::I32LtU,
                    0x4a => Instruction::I32GtS,
                    0x4b => Instruction::I32GtU,
                    0x4c => Instruction::I32LeS,
                    0x4d => Instruction::I32LeU,
                    0x4e => Instruction::I32GeS,
                    0x4f => Instruction::I32GeU,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x50 => {
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                b.push(Instruction::I64Eqz);
            }
            0x51..=0x5a => {
                pop(&mut height, 2, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x51 => Instruction::I64Eq,
                    0x52 => Instruction::I64Ne,
                    0x53 => Instruction::I64LtS,
                    0x54 => Instruction::I64LtU,
                    0x55 => Instruction::I64GtS,
                    0x56 => Instruction::I64GtU,
                    0x57 => Instruction::I64LeS,
                    0x58 => Instruction::I64LeU,
                    0x59 => Instruction::I64GeS,
                    0x5a => Instruction::I64GeU,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x5b..=0x66 => {
                pop(&mut height, 2, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x5b => Instruction::F32Eq,
                    0x5c => Instruction::F32Ne,
                    0x5d => Instruction::F32Lt,
                    0x5e => Instruction::F32Gt,
                    0x5f => Instruction::F32Le,
                    0x60 => Instruction::F32Ge,
                    0x61 => Instruction::F64Eq,
                    0x62 => Instruction::F64Ne,
                    0x63 => Instruction::F64Lt,
                    0x64 => Instruction::F64Gt,
                    0x65 => Instruction::F64Le,
                    0x66 => Instruction::F64Ge,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x67..=0x69 => {
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x67 => Instruction::I32Clz,
                    0x68 => Instruction::I32Ctz,
                    0x69 => Instruction::I32Popcnt,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x6a..=0x78 => {
                pop(&mut height, 2, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x6a => Instruction::I32Add,
                    0x6b => Instruction::I32Sub,
                    0x6c => Instruction::I32Mul,
                    0x6d => Instruction::I32DivS,
                    0x6e => Instruction::I32DivU,
                    0x6f => Instruction::I32RemS,
                    0x70 => Instruction::I32RemU,
                    0x71 => Instruction::I32And,
                    0x72 => Instruction::I32Or,
                    0x73 => Instruction::I32Xor,
                    0x74 => Instruction::I32Shl,
                    0x75 => Instruction::I32ShrS,
                    0x76 => Instruction::I32ShrU,
                    0x77 => Instruction::I32Rotl,
                    0x78 => Instruction::I32Rotr,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x79..=0x7b => {
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x79 => Instruction::I64Clz,
                    0x7a => Instruction::I64Ctz,
                    0x7b => Instruction::I64Popcnt,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x7c..=0x8a => {
                pop(&mut height, 2, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x7c => Instruction::I64Add,
                    0x7d => Instruction::I64Sub,
                    0x7e => Instruction::I64Mul,
                    0x7f => Instruction::I64DivS,
                    0x80 => Instruction::I64DivU,
                    0x81 => Instruction::I64RemS,
                    0x82 => Instruction::I64RemU,
                    0x83 => Instruction::I64And,
                    0x84 => Instruction::I64Or,
                    0x85 => Instruction::I64Xor,
                    0x86 => Instruction::I64Shl,
                    0x87 => Instruction::I64ShrS,
                    0x88 => Instruction::I64ShrU,
                    0x89 => Instruction::I64Rotl,
                    0x8a => Instruction::I64Rotr,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x8b..=0x91 => {
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x8b => Instruction::F32Abs,
                    0x8c => Instruction::F32Neg,
                    0x8d => Instruction::F32Ceil,
                    0x8e => Instruction::F32Floor,
                    0x8f => Instruction::F32Trunc,
                    0x90 => Instruction::F32Nearest,
                    0x91 => Instruction::F32Sqrt,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x92..=0x98 => {
                pop(&mut height, 2, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x92 => Instruction::F32Add,
                    0x93 => Instruction::F32Sub,
                    0x94 => Instruction::F32Mul,
                    0x95 => Instruction::F32Div,
                    0x96 => Instruction::F32Min,
                    0x97 => Instruction::F32Max,
                    0x98 => Instruction::F32Copysign,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0x99..=0x9f => {
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0x99 => Instruction::F64Abs,
                    0x9a => Instruction::F64Neg,
                    0x9b => Instruction::F64Ceil,
                    0x9c => Instruction::F64Floor,
                    0x9d => Instruction::F64Trunc,
                    0x9e => Instruction::F64Nearest,
                    0x9f => Instruction::F64Sqrt,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0xa0..=0xa6 => {
                pop(&mut height, 2, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0xa0 => Instruction::F64Add,
                    0xa1 => Instruction::F64Sub,
                    0xa2 => Instruction::F64Mul,
                    0xa3 => Instruction::F64Div,
                    0xa4 => Instruction::F64Min,
                    0xa5 => Instruction::F64Max,
                    0xa6 => Instruction::F64Copysign,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            0xa7..=0xbf => {
                pop(&mut height, 1, unreachable)?;
                push(&mut height, 1);
                let instr = match op {
                    0xa7 => Instruction::I32WrapI64,
                    0xa8 => Instruction::I32TruncSF32,
                    0xa9 => Instruction::I32TruncUF32,
                    0xaa => Instruction::I32TruncSF64,
                    0xab => Instruction::I32TruncUF64,
                    0xac => Instruction::I64ExtendSI32,
                    0xad => Instruction::I64ExtendUI32,
                    0xae => Instruction::I64TruncSF32,
                    0xaf => Instruction::I64TruncUF32,
                    0xb0 => Instruction::I64TruncSF64,
                    0xb1 => Instruction::I64TruncUF64,
                    0xb2 => Instruction::F32ConvertSI32,
                    0xb3 => Instruction::F32ConvertUI32,
                    0xb4 => Instruction::F32ConvertSI64,
                    0xb5 => Instruction::F32ConvertUI64,
                    0xb6 => Instruction::F32DemoteF64,
                    0xb7 => Instruction::F64ConvertSI32,
                    0xb8 => Instruction::F64ConvertUI32,
                    0xb9 => Instruction::F64ConvertSI64,
                    0xba => Instruction::F64ConvertUI64,
                    0xbb => Instruction::F64PromoteF32,
                    0xbc => Instruction::I32ReinterpretF32,
                    0xbd => Instruction::I64ReinterpretF64,
                    0xbe => Instruction::F32ReinterpretI32,
                    0xbf => Instruction::F64ReinterpretI64,
                    _ => unreachable!(),
                };
                b.push(instr);
            }
            other => return Err(malformed(format!("unknown opcode 0x{other:x}"))),
        }
    }

    if !r.is_empty() {
        return Err(malformed("trailing bytes after function body's final `end`"));
    }
    Ok(b.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signature;

    struct NullContext;
    impl RewriteContext for NullContext {
        fn resolve_func(&self, _: u32) -> Option<u32> {
            None
        }
        fn resolve_global(&self, _: u32) -> Option<u32> {
            None
        }
        fn func_signature(&self, _: u32) -> Option<&Signature> {
            None
        }
        fn type_signature(&self, _: u32) -> Option<&Signature> {
            None
        }
        fn sig_id(&self, _: u32) -> Option<SigId> {
            None
        }
    }

    fn body(code: Vec<u8>) -> FunctionBody {
        FunctionBody { locals: vec![], code }
    }

    #[test]
    fn straight_line_add() {
        // (i32.add (get_local 0) (get_local 1))
        let sig = Signature::new(vec![ValueType::I32, ValueType::I32], Some(ValueType::I32));
        let code = body(vec![0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b]);
        let instrs = rewrite_function(&code, &sig, &NullContext).unwrap();
        assert_eq!(instrs.len(), 4); // GetLocal, GetLocal, Add, Return
        assert_eq!(instrs.get(0), Some(&Instruction::GetLocal(0)));
        assert_eq!(instrs.get(2), Some(&Instruction::I32Add));
        assert_eq!(
            instrs.get(3),
            Some(&Instruction::Return(DropKeep { drop: 0, keep: Keep::Single }))
        );
    }

    #[test]
    fn if_without_else_branches_past_then() {
        // (if (get_local 0) (then (unreachable)))
        let sig = Signature::new(vec![ValueType::I32], None);
        let code = body(vec![0x20, 0x00, 0x04, 0x40, 0x00, 0x0b, 0x0b]);
        let instrs = rewrite_function(&code, &sig, &NullContext).unwrap();
        // GetLocal, BrIfEqz(-> end), Unreachable, Return
        assert_eq!(instrs.len(), 4);
        match instrs.get(1) {
            Some(Instruction::BrIfEqz(t)) => assert_eq!(t.dst_pc, 3),
            other => panic!("expected BrIfEqz, got {other:?}"),
        }
    }

    #[test]
    fn loop_branch_targets_header() {
        // (loop (br 0))
        let sig = Signature::new(vec![], None);
        let code = body(vec![0x03, 0x40, 0x0c, 0x00, 0x0b, 0x0b]);
        let instrs = rewrite_function(&code, &sig, &NullContext).unwrap();
        match instrs.get(0) {
            Some(Instruction::Br(t)) => assert_eq!(t.dst_pc, 0),
            other => panic!("expected Br, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unbalanced_end() {
        let sig = Signature::new(vec![], None);
        let code = body(vec![0x0b, 0x0b]);
        assert!(matches!(rewrite_function(&code, &sig, &NullContext), Err(LoadError::MalformedCode(_))));
    }

    #[test]
    fn rejects_else_without_if() {
        let sig = Signature::new(vec![], None);
        let code = body(vec![0x05, 0x0b]);
        assert!(matches!(rewrite_function(&code, &sig, &NullContext), Err(LoadError::MalformedCode(_))));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let sig = Signature::new(vec![], None);
        let code = body(vec![0xff, 0x0b]);
        assert!(matches!(rewrite_function(&code, &sig, &NullContext), Err(LoadError::MalformedCode(_))));
    }
}
