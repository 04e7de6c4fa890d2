//! The SJM64 assembler.
//!
//! Code is assembled front-to-back into a growable byte buffer. Anything whose final value is not
//! known at emission time (a branch to a label which has not yet been attached, a call to a
//! runtime helper, a jump to a shared trampoline) is emitted with a placeholder and recorded as a
//! relocation. Relocations are only ever resolved by the linker, once the code has been copied
//! into its final code buffer: the assembler itself never patches anything.

use super::{
    Inst,
    abi::{HelperId, ThunkId},
    encode::{abs64_field, encode, rel32_field},
};
use crate::compile::CompilationError;
use index_vec::{IndexVec, index_vec};

pub(crate) struct Asm {
    buf: Vec<u8>,
    /// Labels. New labels start with a value of `None`; when they are attached to an offset, this
    /// will become `Some(...)`.
    labels: IndexVec<LabelIdx, Option<u32>>,
    /// Instructions which need relocating. These are stored in emission order.
    relocs: Vec<Reloc>,
    /// If `Some(...)`, log instructions.
    log: Option<Vec<String>>,
}

impl Asm {
    pub(crate) fn new(log: bool) -> Self {
        Asm {
            buf: Vec::new(),
            labels: index_vec![],
            relocs: Vec::new(),
            log: if log { Some(Vec::new()) } else { None },
        }
    }

    pub(crate) fn is_logging(&self) -> bool {
        self.log.is_some()
    }

    pub(crate) fn log(&mut self, s: String) {
        if let Some(x) = &mut self.log {
            x.push(format!("; {s}"))
        }
    }

    /// Create a new free-floating label: it will only be attached when `attach_label` is called on
    /// the label.
    pub(crate) fn mk_label(&mut self) -> LabelIdx {
        self.labels.push(None)
    }

    /// Attach `lidx` to the current offset, i.e. the next instruction pushed.
    ///
    /// # Panics
    ///
    /// If `lidx` has already been attached.
    pub(crate) fn attach_label(&mut self, lidx: LabelIdx) {
        assert!(self.labels[lidx].is_none());
        if let Some(log) = &mut self.log {
            log.push(format!("; l{}", usize::from(lidx)));
        }
        self.labels[lidx] = Some(self.off());
    }

    /// Create a label and immediately attach it to the current offset.
    pub(crate) fn here(&mut self) -> LabelIdx {
        let l = self.mk_label();
        self.attach_label(l);
        l
    }

    /// The current offset from the start of the code.
    pub(crate) fn off(&self) -> u32 {
        // Code buffers are checked against a limit far below 4GiB before this can overflow.
        self.buf.len() as u32
    }

    /// Push `inst`, returning the offset at which it starts.
    pub(crate) fn push_inst(&mut self, inst: Inst) -> u32 {
        let off = self.off();
        encode(&inst, &mut self.buf);
        if let Some(log) = &mut self.log {
            log.push(inst.to_string());
        }
        off
    }

    /// Push `inst` with an associated [RelocKind], returning the offset at which it starts.
    ///
    /// # Panics
    ///
    /// If `inst` has no field that `reloc` can patch.
    pub(crate) fn push_reloc(&mut self, inst: Inst, reloc: RelocKind) -> u32 {
        match reloc {
            RelocKind::Label(_) => assert!(rel32_field(&inst).is_some()),
            RelocKind::Abs(_) | RelocKind::LabelAbs(_) => assert!(abs64_field(&inst).is_some()),
        }
        let off = self.off();
        encode(&inst, &mut self.buf);
        // No instruction is longer than 10 bytes.
        let len = (self.buf.len() - off as usize) as u8;
        if let Some(log) = &mut self.log {
            let tgt = match reloc {
                RelocKind::Label(l) | RelocKind::LabelAbs(l) => format!("l{}", usize::from(l)),
                RelocKind::Abs(AbsTarget::Helper(h)) => format!("helper:{h}"),
                RelocKind::Abs(AbsTarget::Thunk(t)) => format!("thunk:{t}"),
            };
            log.push(inst.render(Some(&tgt)));
        }
        self.relocs.push(Reloc { off, len, reloc });
        off
    }

    /// Align the current offset to `align` bytes by padding with `nop`s.
    pub(crate) fn align(&mut self, align: usize) {
        while self.buf.len() % align != 0 {
            self.buf.push(0);
        }
    }

    /// Push raw data (e.g. a constant pool entry). Data is not logged.
    pub(crate) fn push_data(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Finish assembly.
    pub(crate) fn finish(self) -> AssembledCode {
        AssembledCode {
            code: self.buf,
            labels: self.labels,
            relocs: self.relocs,
            log: self.log.map(|x| x.join("\n")),
        }
    }
}

/// Assembled, but not yet linked, code.
pub(crate) struct AssembledCode {
    pub(crate) code: Vec<u8>,
    pub(crate) labels: IndexVec<LabelIdx, Option<u32>>,
    pub(crate) relocs: Vec<Reloc>,
    pub(crate) log: Option<String>,
}

impl AssembledCode {
    /// Return the offset `lidx` was attached to.
    pub(crate) fn label_off(&self, lidx: LabelIdx) -> Result<u32, CompilationError> {
        self.labels[lidx].ok_or_else(|| {
            CompilationError::InternalError(format!("Label l{} never attached", usize::from(lidx)))
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Reloc {
    /// The offset of the instruction.
    pub(crate) off: u32,
    /// The length of the instruction in bytes.
    pub(crate) len: u8,
    pub(crate) reloc: RelocKind,
}

/// A relocation kind.
#[derive(Clone, Copy, Debug)]
pub(crate) enum RelocKind {
    /// A pc-relative reference to a label.
    Label(LabelIdx),
    /// An absolute reference to a label (e.g. a code address materialised into a register).
    LabelAbs(LabelIdx),
    /// An absolute reference to something outside the code buffer.
    Abs(AbsTarget),
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum AbsTarget {
    Helper(HelperId),
    Thunk(ThunkId),
}

index_vec::define_index_type! {
    pub(crate) struct LabelIdx = u32;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::machine::{Cc, Gpr};

    #[test]
    fn labels_and_relocs() {
        let mut asm = Asm::new(true);
        let l = asm.mk_label();
        asm.push_reloc(Inst::Jcc { cc: Cc::E, rel: 0 }, RelocKind::Label(l));
        asm.push_inst(Inst::Mov {
            dst: Gpr::R0,
            src: Gpr::R1,
        });
        asm.attach_label(l);
        asm.push_reloc(
            Inst::Call { target: 0 },
            RelocKind::Abs(AbsTarget::Helper(HelperId::ValueAdd)),
        );
        let ac = asm.finish();
        assert_eq!(ac.relocs.len(), 2);
        assert_eq!(ac.relocs[0].off, 0);
        assert_eq!(ac.relocs[0].len, 6);
        assert_eq!(ac.label_off(l).unwrap(), 9);
        assert_eq!(
            ac.log.unwrap(),
            "je l0\nmov r0, r1\n; l0\ncall helper:ValueAdd"
        );
    }
}
