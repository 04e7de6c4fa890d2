//! Support for code buffers.
//!
//! When creating a code buffer, one starts with [CodeBufInProgress]: this allocates memory, but
//! does not require anything meaningful to have been written into it. When code has been
//! assembled and linked, [CodeBufInProgress::into_execodebuf] turns it into an [ExeCodeBuf]. An
//! [ExeCodeBuf] is complete: although it might be patched, the quantity of memory it contains
//! will not change.

use crate::compile::CompilationError;
use memmap2::{MmapMut, MmapOptions};

/// A code buffer that has backing memory allocated but no actual code stored in it.
#[derive(Debug)]
pub(super) struct CodeBufInProgress {
    map: MmapMut,
}

impl CodeBufInProgress {
    /// Create a new code buffer at least `len` bytes big. Buffers larger than `limit` are refused
    /// in the same way as a failed mapping.
    pub(super) fn new(len: usize, limit: usize) -> Result<Self, CompilationError> {
        if len > limit {
            return Err(CompilationError::ResourceExhausted(
                format!("code buffer of {len} bytes exceeds the limit of {limit} bytes").into(),
            ));
        }
        let map = MmapOptions::new()
            .len(len.max(1))
            .map_anon()
            .map_err(|e| CompilationError::ResourceExhausted(Box::new(e)))?;
        Ok(Self { map })
    }

    /// The address of the start of the buffer.
    pub(super) fn base(&self) -> u64 {
        self.map.as_ptr() as u64
    }

    /// Copy `code` into the buffer and produce an [ExeCodeBuf].
    ///
    /// # Panics
    ///
    /// If `code` is bigger than the buffer.
    pub(super) fn into_execodebuf(mut self, code: &[u8]) -> ExeCodeBuf {
        assert!(code.len() <= self.map.len());
        self.map[..code.len()].copy_from_slice(code);
        ExeCodeBuf {
            map: self.map,
            len: code.len(),
        }
    }
}

/// A finished code buffer.
#[derive(Debug)]
pub(crate) struct ExeCodeBuf {
    map: MmapMut,
    /// How many bytes of the mapping hold code?
    len: usize,
}

impl ExeCodeBuf {
    pub(crate) fn base(&self) -> u64 {
        self.map.as_ptr() as u64
    }

    pub(crate) fn code(&self) -> &[u8] {
        &self.map[..self.len]
    }

    /// Overwrite `bytes.len()` bytes starting at `off`.
    ///
    /// # Panics
    ///
    /// If the patch extends beyond the code.
    pub(crate) fn patch(&mut self, off: usize, bytes: &[u8]) {
        assert!(off + bytes.len() <= self.len);
        self.map[off..off + bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn limits() {
        assert!(matches!(
            CodeBufInProgress::new(4097, 4096),
            Err(CompilationError::ResourceExhausted(_))
        ));
        let cb = CodeBufInProgress::new(16, 4096).unwrap();
        let base = cb.base();
        let mut exe = cb.into_execodebuf(&[1, 2, 3]);
        assert_eq!(exe.base(), base);
        assert_eq!(exe.code(), &[1, 2, 3]);
        exe.patch(1, &[9]);
        assert_eq!(exe.code(), &[1, 9, 3]);
    }
}
