//! Linear memory (spec.md §3 "Linear memory", §4.5 "Runtime state"): a
//! page-granular byte buffer with bounds-checked little-endian loads and
//! stores, adapted from the teacher's `MemoryInstance` with
//! `memory_units`/`LittleEndianConvert` dropped in favor of plain `u32` page
//! counts and direct byte-slice conversions. MVP has no `memory.copy` or
//! `memory.fill`, so the teacher's region/transfer machinery for those isn't
//! carried over - see DESIGN.md.

use std::cell::RefCell;

use crate::error::TrapKind;
use crate::types::Limits;

/// Bytes per page, fixed by the binary format.
pub const PAGE_SIZE: u32 = 65536;

#[derive(Debug)]
pub struct MemoryInstance {
    limits: Limits,
    buffer: RefCell<Vec<u8>>,
}

impl MemoryInstance {
    pub fn new(limits: Limits) -> MemoryInstance {
        let bytes = limits.initial as usize * PAGE_SIZE as usize;
        MemoryInstance {
            limits,
            buffer: RefCell::new(vec![0u8; bytes]),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn current_pages(&self) -> u32 {
        (self.buffer.borrow().len() / PAGE_SIZE as usize) as u32
    }

    /// Attempt to grow by `delta` pages. Returns the previous page count on
    /// success, or `-1` if growth would exceed the declared maximum or
    /// overflow an address (spec.md §4.6 `grow_memory`); failure never
    /// mutates the buffer.
    pub fn grow(&self, delta: u32) -> i32 {
        let mut buf = self.buffer.borrow_mut();
        let current_pages = (buf.len() / PAGE_SIZE as usize) as u32;
        let new_pages = match current_pages.checked_add(delta) {
            Some(p) => p,
            None => return -1,
        };
        if let Some(max) = self.limits.maximum {
            if new_pages > max {
                return -1;
            }
        }
        let new_len = match (new_pages as usize).checked_mul(PAGE_SIZE as usize) {
            Some(n) => n,
            None => return -1,
        };
        buf.resize(new_len, 0);
        current_pages as i32
    }

    fn checked_range(&self, addr: u32, len: u32) -> Result<(usize, usize), TrapKind> {
        let start = addr as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        if end > self.buffer.borrow().len() {
            return Err(TrapKind::OutOfBoundsMemoryAccess);
        }
        Ok((start, end))
    }

    pub fn load_u8(&self, addr: u32) -> Result<u8, TrapKind> {
        let (start, _) = self.checked_range(addr, 1)?;
        Ok(self.buffer.borrow()[start])
    }

    pub fn load_u16(&self, addr: u32) -> Result<u16, TrapKind> {
        let (start, end) = self.checked_range(addr, 2)?;
        Ok(u16::from_le_bytes(self.buffer.borrow()[start..end].try_into().unwrap()))
    }

    pub fn load_u32(&self, addr: u32) -> Result<u32, TrapKind> {
        let (start, end) = self.checked_range(addr, 4)?;
        Ok(u32::from_le_bytes(self.buffer.borrow()[start..end].try_into().unwrap()))
    }

    pub fn load_u64(&self, addr: u32) -> Result<u64, TrapKind> {
        let (start, end) = self.checked_range(addr, 8)?;
        Ok(u64::from_le_bytes(self.buffer.borrow()[start..end].try_into().unwrap()))
    }

    pub fn store_u8(&self, addr: u32, value: u8) -> Result<(), TrapKind> {
        let (start, _) = self.checked_range(addr, 1)?;
        self.buffer.borrow_mut()[start] = value;
        Ok(())
    }

    pub fn store_u16(&self, addr: u32, value: u16) -> Result<(), TrapKind> {
        let (start, end) = self.checked_range(addr, 2)?;
        self.buffer.borrow_mut()[start..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn store_u32(&self, addr: u32, value: u32) -> Result<(), TrapKind> {
        let (start, end) = self.checked_range(addr, 4)?;
        self.buffer.borrow_mut()[start..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn store_u64(&self, addr: u32, value: u64) -> Result<(), TrapKind> {
        let (start, end) = self.checked_range(addr, 8)?;
        self.buffer.borrow_mut()[start..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a data segment's raw bytes at load time. Out-of-bounds here is
    /// a load-time error, not a trap, so this reports failure as a bool and
    /// leaves translating it to `LoadError::SegmentOutOfBounds` to the
    /// linker.
    pub fn write_segment(&self, addr: u32, bytes: &[u8]) -> bool {
        let start = addr as usize;
        let end = match start.checked_add(bytes.len()) {
            Some(e) => e,
            None => return false,
        };
        let mut buf = self.buffer.borrow_mut();
        if end > buf.len() {
            return false;
        }
        buf[start..end].copy_from_slice(bytes);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(initial: u32, maximum: Option<u32>) -> MemoryInstance {
        MemoryInstance::new(Limits { initial, maximum })
    }

    #[test]
    fn fresh_memory_is_zeroed_and_sized_in_pages() {
        let m = mem(1, None);
        assert_eq!(m.current_pages(), 1);
        assert_eq!(m.load_u32(0).unwrap(), 0);
    }

    #[test]
    fn store_then_load_round_trips() {
        let m = mem(1, None);
        m.store_u32(100, 0xdead_beef).unwrap();
        assert_eq!(m.load_u32(100).unwrap(), 0xdead_beef);
    }

    #[test]
    fn load_past_end_of_memory_traps() {
        let m = mem(1, None);
        assert_eq!(m.load_u32(PAGE_SIZE - 2), Err(TrapKind::OutOfBoundsMemoryAccess));
    }

    #[test]
    fn grow_within_maximum_succeeds_and_returns_previous_size() {
        let m = mem(1, Some(4));
        assert_eq!(m.grow(2), 1);
        assert_eq!(m.current_pages(), 3);
    }

    #[test]
    fn grow_past_maximum_fails_without_mutating() {
        let m = mem(1, Some(1));
        assert_eq!(m.grow(1), -1);
        assert_eq!(m.current_pages(), 1);
    }

    #[test]
    fn write_segment_rejects_out_of_bounds() {
        let m = mem(1, None);
        assert!(!m.write_segment(PAGE_SIZE - 1, &[1, 2, 3]));
    }
}
