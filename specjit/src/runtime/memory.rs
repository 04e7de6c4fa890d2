//! Simulated memory: a sparse, paged, little-endian address space with a bump-allocated heap and
//! a downward-growing stack.

use super::SimError;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;

const PAGE_SIZE: u64 = 4096;
/// The lowest heap address. Cells are 8-byte aligned and far above the immediate encodings.
pub(crate) const HEAP_BASE: u64 = 0x1000_0000;
/// The address just past the top of the stack.
pub(crate) const STACK_TOP: u64 = 0x7000_0000;
pub(crate) const STACK_SIZE: u64 = 1024 * 1024;

pub struct Memory {
    pages: HashMap<u64, Box<[u8]>>,
    /// The next free heap address.
    brk: u64,
}

impl Memory {
    pub(crate) fn new() -> Self {
        let mut m = Self {
            pages: HashMap::new(),
            brk: HEAP_BASE,
        };
        m.map(STACK_TOP - STACK_SIZE, STACK_SIZE);
        m
    }

    /// The lowest address the stack may grow down to.
    pub fn stack_limit(&self) -> u64 {
        STACK_TOP - STACK_SIZE
    }

    fn map(&mut self, start: u64, len: u64) {
        let mut p = start / PAGE_SIZE;
        while p * PAGE_SIZE < start + len {
            self.pages
                .entry(p)
                .or_insert_with(|| vec![0; PAGE_SIZE as usize].into_boxed_slice());
            p += 1;
        }
    }

    /// Allocate `len` zeroed bytes aligned to 8.
    pub fn alloc(&mut self, len: usize) -> u64 {
        let len = (len.max(1) as u64).next_multiple_of(8);
        let addr = self.brk;
        self.brk += len;
        self.map(addr, len);
        addr
    }

    fn with_bytes<const N: usize>(&self, addr: u64) -> Result<[u8; N], SimError> {
        let mut out = [0; N];
        for (i, b) in out.iter_mut().enumerate() {
            let a = addr.wrapping_add(i as u64);
            let page = self
                .pages
                .get(&(a / PAGE_SIZE))
                .ok_or(SimError::BadAccess(addr))?;
            *b = page[(a % PAGE_SIZE) as usize];
        }
        Ok(out)
    }

    fn put_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<(), SimError> {
        for (i, b) in bytes.iter().enumerate() {
            let a = addr.wrapping_add(i as u64);
            let page = self
                .pages
                .get_mut(&(a / PAGE_SIZE))
                .ok_or(SimError::BadAccess(addr))?;
            page[(a % PAGE_SIZE) as usize] = *b;
        }
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, SimError> {
        Ok(self.with_bytes::<1>(addr)?[0])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, SimError> {
        Ok(LittleEndian::read_u16(&self.with_bytes::<2>(addr)?))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, SimError> {
        Ok(LittleEndian::read_u32(&self.with_bytes::<4>(addr)?))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, SimError> {
        Ok(LittleEndian::read_u64(&self.with_bytes::<8>(addr)?))
    }

    pub fn write_u8(&mut self, addr: u64, v: u8) -> Result<(), SimError> {
        self.put_bytes(addr, &[v])
    }

    pub fn write_u16(&mut self, addr: u64, v: u16) -> Result<(), SimError> {
        let mut b = [0; 2];
        LittleEndian::write_u16(&mut b, v);
        self.put_bytes(addr, &b)
    }

    pub fn write_u32(&mut self, addr: u64, v: u32) -> Result<(), SimError> {
        let mut b = [0; 4];
        LittleEndian::write_u32(&mut b, v);
        self.put_bytes(addr, &b)
    }

    pub fn write_u64(&mut self, addr: u64, v: u64) -> Result<(), SimError> {
        let mut b = [0; 8];
        LittleEndian::write_u64(&mut b, v);
        self.put_bytes(addr, &b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_and_access() {
        let mut m = Memory::new();
        let a = m.alloc(3);
        let b = m.alloc(16);
        assert_eq!(a % 8, 0);
        assert_eq!(b, a + 8);
        m.write_u64(b, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(m.read_u8(b).unwrap(), 0x08);
        assert_eq!(m.read_u16(b).unwrap(), 0x0708);
        assert_eq!(m.read_u32(b + 4).unwrap(), 0x0102_0304);
        assert!(matches!(m.read_u64(8), Err(SimError::BadAccess(8))));
        // Accesses may straddle pages.
        let s = STACK_TOP - 4;
        m.write_u32(s, 0xAABBCCDD).unwrap();
        assert_eq!(m.read_u32(s).unwrap(), 0xAABBCCDD);
        assert!(m.read_u64(s).is_err());
    }
}
