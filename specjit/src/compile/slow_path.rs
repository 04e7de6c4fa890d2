//! Out-of-line slow paths.
//!
//! A node whose fast path can fail in a way that does not warrant an OSR exit branches to a slow
//! path, which does the operation the expensive way (usually by calling a runtime helper) and
//! jumps back. Slow paths are registered while their node is lowered and emitted after every
//! block, so they must not disturb the register state the main path assumes: every register live
//! at registration time is saved to the frame's save area around the call and restored
//! afterwards.

use crate::compile::{
    CompilationError,
    graph::NodeIdx,
    machine::{
        Fpr, Gpr, Inst,
        abi::{HelperId, RET_GPR},
        asm::LabelIdx,
    },
    regalloc::RegT,
    speculative_jit::{CallArg, SpeculativeJit},
};

/// The registers a slow path must preserve.
#[derive(Clone, Debug, Default)]
pub(crate) struct SilentRegisters {
    gprs: Vec<Gpr>,
    fprs: Vec<Fpr>,
}

pub(crate) type SlowPathGen =
    Box<dyn FnOnce(&mut SpeculativeJit<'_>, &SilentRegisters) -> Result<(), CompilationError>>;

pub(crate) struct SlowPath {
    entry: LabelIdx,
    done: LabelIdx,
    silent: SilentRegisters,
    node: NodeIdx,
    /// The length of the variable event stream at registration: exits taken from the slow path
    /// see the registers as they were then.
    stream_index: usize,
    generator: SlowPathGen,
}

impl SpeculativeJit<'_> {
    /// Register a slow path for the current node, entered at `entry` and returning to `done`.
    /// Registers in `exclude` (typically the node's result) are not preserved.
    pub(crate) fn add_slow_path(
        &mut self,
        entry: LabelIdx,
        done: LabelIdx,
        exclude: &[Gpr],
        generator: SlowPathGen,
    ) {
        let silent = SilentRegisters {
            gprs: self
                .gprs
                .bound()
                .map(|(r, _)| r)
                .filter(|r| !exclude.contains(r))
                .collect(),
            fprs: self.fprs.bound().map(|(r, _)| r).collect(),
        };
        self.slow_paths.push(SlowPath {
            entry,
            done,
            silent,
            node: self.cur,
            stream_index: self.events.len(),
            generator,
        });
    }

    pub(crate) fn silent_spill(&mut self, silent: &SilentRegisters) {
        for r in &silent.gprs {
            if let Some(i) = r.bank_idx() {
                let addr = self.frame.gpr_save(i);
                self.store64(*r, addr);
            }
        }
        for r in &silent.fprs {
            if let Some(i) = r.bank_idx() {
                let addr = self.frame.fpr_save(i);
                self.emit(Inst::StoreD { src: *r, addr });
            }
        }
    }

    pub(crate) fn silent_fill(&mut self, silent: &SilentRegisters) {
        for r in &silent.gprs {
            if let Some(i) = r.bank_idx() {
                let addr = self.frame.gpr_save(i);
                self.load64(*r, addr);
            }
        }
        for r in &silent.fprs {
            if let Some(i) = r.bank_idx() {
                let addr = self.frame.fpr_save(i);
                self.emit(Inst::LoadD { dst: *r, addr });
            }
        }
    }

    /// Call `h` from a slow path, moving its result (if any) into `result`.
    pub(crate) fn slow_path_call(
        &mut self,
        silent: &SilentRegisters,
        h: HelperId,
        args: &[CallArg],
        result: Option<Gpr>,
    ) -> Result<(), CompilationError> {
        self.silent_spill(silent);
        self.setup_args(args)?;
        self.emit_call(h);
        if h.may_throw() {
            self.exception_check();
        }
        if let Some(r) = result {
            self.mov(r, RET_GPR);
        }
        self.silent_fill(silent);
        Ok(())
    }

    /// Emit every registered slow path.
    pub(crate) fn emit_slow_paths(&mut self) -> Result<(), CompilationError> {
        for sp in std::mem::take(&mut self.slow_paths) {
            self.asm.attach_label(sp.entry);
            if self.asm.is_logging() {
                self.asm
                    .log(format!("slow path for @{}", usize::from(sp.node)));
            }
            self.cur = sp.node;
            self.exit_stream_index = Some(sp.stream_index);
            (sp.generator)(self, &sp.silent)?;
            self.jmp_label(sp.done);
        }
        self.exit_stream_index = None;
        Ok(())
    }
}
