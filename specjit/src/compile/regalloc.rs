//! Register banks.
//!
//! A [RegisterBank] tracks, for each allocatable register of one class, which value slot (if any)
//! it holds and how costly that value would be to spill. Independently of ownership, registers
//! can be *locked*: a locked register is never chosen as a spill victim. Locks are handed out as
//! [RegLock] guards which unlock on drop, so every early return out of a lowering routine releases
//! the registers it was using.

use crate::compile::{
    CompilationError,
    gen_info::SpillOrder,
    graph::VirtualRegister,
    machine::{
        Fpr, Gpr,
        abi::{ALLOCATABLE_FPRS, ALLOCATABLE_GPRS},
    },
};
use std::{
    cell::Cell,
    fmt::{Debug, Display},
    rc::Rc,
};

/// A register class the allocator can manage.
pub(crate) trait RegT: Clone + Copy + Debug + Display + Eq + 'static {
    /// The registers available for allocation, in preference order.
    fn allocatable() -> &'static [Self];
    /// This register's index into [Self::allocatable].
    fn bank_idx(self) -> Option<usize>;
}

impl RegT for Gpr {
    fn allocatable() -> &'static [Self] {
        &ALLOCATABLE_GPRS
    }

    fn bank_idx(self) -> Option<usize> {
        ALLOCATABLE_GPRS.iter().position(|x| *x == self)
    }
}

impl RegT for Fpr {
    fn allocatable() -> &'static [Self] {
        &ALLOCATABLE_FPRS
    }

    fn bank_idx(self) -> Option<usize> {
        ALLOCATABLE_FPRS.iter().position(|x| *x == self)
    }
}

/// Per-register lock counts, shared between a bank and the [RegLock]s it hands out.
#[derive(Debug)]
struct LockTable(Vec<Cell<u32>>);

/// A claim on a register: while any `RegLock` for a register is alive, the register will not be
/// chosen as a spill victim.
#[derive(Debug)]
pub(crate) struct RegLock<R: RegT> {
    reg: R,
    idx: usize,
    table: Rc<LockTable>,
}

impl<R: RegT> RegLock<R> {
    pub(crate) fn reg(&self) -> R {
        self.reg
    }
}

impl<R: RegT> Clone for RegLock<R> {
    fn clone(&self) -> Self {
        let c = &self.table.0[self.idx];
        c.set(c.get() + 1);
        Self {
            reg: self.reg,
            idx: self.idx,
            table: Rc::clone(&self.table),
        }
    }
}

impl<R: RegT> Drop for RegLock<R> {
    fn drop(&mut self) {
        let c = &self.table.0[self.idx];
        debug_assert!(c.get() > 0);
        c.set(c.get() - 1);
    }
}

#[derive(Clone, Copy, Debug)]
struct BankEntry {
    owner: Option<VirtualRegister>,
    spill_order: SpillOrder,
    /// When this entry was last bound: used to break ties between equal spill orders in favour of
    /// evicting the least recently bound value.
    stamp: u64,
}

pub(crate) struct RegisterBank<R: RegT> {
    entries: Vec<BankEntry>,
    locks: Rc<LockTable>,
    clock: u64,
    _phantom: std::marker::PhantomData<R>,
}

impl<R: RegT> RegisterBank<R> {
    pub(crate) fn new() -> Self {
        let n = R::allocatable().len();
        Self {
            entries: vec![
                BankEntry {
                    owner: None,
                    spill_order: SpillOrder::Free,
                    stamp: 0,
                };
                n
            ],
            locks: Rc::new(LockTable((0..n).map(|_| Cell::new(0)).collect())),
            clock: 0,
            _phantom: std::marker::PhantomData,
        }
    }

    fn idx(reg: R) -> Result<usize, CompilationError> {
        reg.bank_idx().ok_or_else(|| {
            CompilationError::InternalError(format!("{reg} is not an allocatable register"))
        })
    }

    fn lock_idx(&self, idx: usize) -> RegLock<R> {
        let c = &self.locks.0[idx];
        c.set(c.get() + 1);
        RegLock {
            reg: R::allocatable()[idx],
            idx,
            table: Rc::clone(&self.locks),
        }
    }

    pub(crate) fn is_locked(&self, reg: R) -> bool {
        reg.bank_idx()
            .map(|i| self.locks.0[i].get() > 0)
            .unwrap_or(false)
    }

    pub(crate) fn owner(&self, reg: R) -> Option<VirtualRegister> {
        reg.bank_idx().and_then(|i| self.entries[i].owner)
    }

    /// Lock `reg`, which must be an allocatable register.
    pub(crate) fn lock(&self, reg: R) -> Result<RegLock<R>, CompilationError> {
        Ok(self.lock_idx(Self::idx(reg)?))
    }

    /// Allocate and lock a register. If no register is free, the victim with the lowest spill
    /// order (and, among equals, the least recently bound) is unbound and its previous owner is
    /// returned: the caller must spill that value before using the register.
    pub(crate) fn allocate(
        &mut self,
    ) -> Result<(RegLock<R>, Option<VirtualRegister>), CompilationError> {
        if let Some(i) = (0..self.entries.len())
            .find(|i| self.entries[*i].owner.is_none() && self.locks.0[*i].get() == 0)
        {
            return Ok((self.lock_idx(i), None));
        }
        let victim = (0..self.entries.len())
            .filter(|i| self.locks.0[*i].get() == 0)
            .min_by_key(|i| (self.entries[*i].spill_order, self.entries[*i].stamp))
            .ok_or_else(|| {
                CompilationError::InternalError("All registers are locked".to_owned())
            })?;
        let owner = self.entries[victim].owner.take();
        self.entries[victim].spill_order = SpillOrder::Free;
        Ok((self.lock_idx(victim), owner))
    }

    /// Allocate and lock `preferred` unless it is already locked, in which case behave as
    /// [Self::allocate]. As with [Self::allocate], an evicted owner must be spilled by the caller.
    pub(crate) fn allocate_preferring(
        &mut self,
        preferred: R,
    ) -> Result<(RegLock<R>, Option<VirtualRegister>), CompilationError> {
        let i = Self::idx(preferred)?;
        if self.locks.0[i].get() > 0 {
            return self.allocate();
        }
        let owner = self.entries[i].owner.take();
        self.entries[i].spill_order = SpillOrder::Free;
        Ok((self.lock_idx(i), owner))
    }

    /// Bind `reg` to `vreg`.
    pub(crate) fn retain(&mut self, reg: R, vreg: VirtualRegister, spill_order: SpillOrder) {
        if let Some(i) = reg.bank_idx() {
            self.clock += 1;
            self.entries[i] = BankEntry {
                owner: Some(vreg),
                spill_order,
                stamp: self.clock,
            };
        }
    }

    /// Update the spill order of a bound register (e.g. after its value has been spilled).
    pub(crate) fn set_spill_order(&mut self, reg: R, spill_order: SpillOrder) {
        if let Some(i) = reg.bank_idx() {
            self.entries[i].spill_order = spill_order;
        }
    }

    /// Unbind `reg`.
    pub(crate) fn release(&mut self, reg: R) {
        if let Some(i) = reg.bank_idx() {
            self.entries[i].owner = None;
            self.entries[i].spill_order = SpillOrder::Free;
        }
    }

    /// Iterate over `(register, owner)` for every bound register.
    pub(crate) fn bound(&self) -> impl Iterator<Item = (R, VirtualRegister)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.owner.map(|o| (R::allocatable()[i], o)))
    }

    /// Is any register locked? At the end of every node the answer must be no.
    pub(crate) fn any_locked(&self) -> bool {
        self.locks.0.iter().any(|c| c.get() > 0)
    }

    /// Unbind every register. Locks are unaffected.
    pub(crate) fn release_all(&mut self) {
        for e in &mut self.entries {
            e.owner = None;
            e.spill_order = SpillOrder::Free;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_prefers_free_then_lowest_order() {
        let mut b = RegisterBank::<Gpr>::new();
        let mut held = Vec::new();
        for i in 0..ALLOCATABLE_GPRS.len() {
            let (l, ev) = b.allocate().unwrap();
            assert!(ev.is_none());
            let order = if i == 5 {
                SpillOrder::Spilled
            } else {
                SpillOrder::Int32
            };
            b.retain(l.reg(), VirtualRegister::local(i), order);
            held.push(l);
        }
        // Everything is locked.
        assert!(matches!(
            b.allocate(),
            Err(CompilationError::InternalError(_))
        ));
        held.clear();
        assert!(!b.any_locked());
        // Everything is bound, so we must evict: the spilled value goes first.
        let (l, ev) = b.allocate().unwrap();
        assert_eq!(l.reg(), Gpr::R5);
        assert_eq!(ev, Some(VirtualRegister::local(5)));
        drop(l);
        // Then the least recently bound of the rest.
        let (l, ev) = b.allocate().unwrap();
        // R5 is now free, so it is reused without eviction.
        assert_eq!(l.reg(), Gpr::R5);
        assert!(ev.is_none());
        b.retain(l.reg(), VirtualRegister::local(20), SpillOrder::Double);
        let (l2, ev) = b.allocate().unwrap();
        assert_eq!(l2.reg(), Gpr::R0);
        assert_eq!(ev, Some(VirtualRegister::local(0)));
    }

    #[test]
    fn allocate_preferring() {
        let mut b = RegisterBank::<Gpr>::new();
        let (l, ev) = b.allocate_preferring(Gpr::R3).unwrap();
        assert_eq!(l.reg(), Gpr::R3);
        assert!(ev.is_none());
        b.retain(Gpr::R3, VirtualRegister::local(1), SpillOrder::Int32);
        // A locked preference falls back to the first free register.
        let (l2, ev) = b.allocate_preferring(Gpr::R3).unwrap();
        assert_eq!(l2.reg(), Gpr::R0);
        assert!(ev.is_none());
        drop((l, l2));
        // An unlocked but bound preference is taken and its owner handed back.
        let (l, ev) = b.allocate_preferring(Gpr::R3).unwrap();
        assert_eq!(l.reg(), Gpr::R3);
        assert_eq!(ev, Some(VirtualRegister::local(1)));
        assert_eq!(b.owner(Gpr::R3), None);
        assert!(b.allocate_preferring(Gpr::R12).is_err());
    }

    #[test]
    fn locks_are_scoped() {
        let b = RegisterBank::<Fpr>::new();
        {
            let l = b.lock(Fpr::F3).unwrap();
            let l2 = l.clone();
            drop(l);
            assert!(b.is_locked(Fpr::F3));
            drop(l2);
        }
        assert!(!b.is_locked(Fpr::F3));
        assert!(b.lock(Fpr::F8).is_err());
    }
}
