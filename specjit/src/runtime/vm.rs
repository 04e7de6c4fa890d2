//! The VM record and the exception state it carries.

use super::{Runtime, SimError};
use crate::{
    compile::machine::abi::{VM_EXCEPTION, VM_SINGLE_CHAR_STRINGS, VM_SIZE, VM_STACK_LIMIT},
    value::JSValue,
};

impl Runtime {
    pub(super) fn init_vm(&mut self) -> Result<(), SimError> {
        self.vm = self.mem.alloc(VM_SIZE);
        let limit = self.mem.stack_limit();
        self.mem.write_u64(self.vm + VM_STACK_LIMIT as u64, limit)?;
        let table = self.mem.alloc(256 * 8);
        for c in 0..256u16 {
            let s = self.new_string_from_units(&[c])?;
            self.mem.write_u64(table + u64::from(c) * 8, s.bits())?;
        }
        self.mem
            .write_u64(self.vm + VM_SINGLE_CHAR_STRINGS as u64, table)
    }

    /// Lower the stack limit generated code checks against, so that stack overflow can be
    /// provoked without exhausting the real stack.
    pub fn set_stack_limit(&mut self, limit: u64) -> Result<(), SimError> {
        self.mem.write_u64(self.vm + VM_STACK_LIMIT as u64, limit)
    }

    pub fn stack_limit(&self) -> Result<u64, SimError> {
        self.mem.read_u64(self.vm + VM_STACK_LIMIT as u64)
    }

    /// The pending exception, if there is one.
    pub fn pending_exception(&self) -> Result<Option<JSValue>, SimError> {
        let v = self.mem.read_u64(self.vm + VM_EXCEPTION as u64)?;
        Ok(if v == 0 {
            None
        } else {
            Some(JSValue::from_bits(v))
        })
    }

    pub(crate) fn set_exception(&mut self, v: JSValue) -> Result<(), SimError> {
        // An empty exception would read back as "no exception".
        let v = if v.is_empty() { JSValue::UNDEFINED } else { v };
        self.mem.write_u64(self.vm + VM_EXCEPTION as u64, v.bits())
    }

    pub(crate) fn clear_exception(&mut self) -> Result<(), SimError> {
        self.mem.write_u64(self.vm + VM_EXCEPTION as u64, 0)
    }

    /// Throw a `TypeError`-like exception: a string describing the problem.
    pub(crate) fn throw_type_error(&mut self, msg: &str) -> Result<(), SimError> {
        let s = self.new_string(&format!("TypeError: {msg}"))?;
        self.set_exception(s)
    }

    pub(crate) fn single_char_string(&self, c: u16) -> Result<Option<JSValue>, SimError> {
        if c >= 256 {
            return Ok(None);
        }
        let table = self.mem.read_u64(self.vm + VM_SINGLE_CHAR_STRINGS as u64)?;
        Ok(Some(JSValue::from_bits(
            self.mem.read_u64(table + u64::from(c) * 8)?,
        )))
    }
}
