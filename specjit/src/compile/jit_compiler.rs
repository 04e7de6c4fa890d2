//! The emission driver: lays out a compile's code (entry, blocks, slow paths, the arity check,
//! exception handling, OSR entries, exit stubs, and the constant pool), then links it into a
//! code buffer.

use crate::{
    compile::{
        CompilationError, CompiledCode,
        codebuf::CodeBufInProgress,
        compiled_code::{CallLinkInfo, CompiledParts, IcSite, JumpReplacement},
        graph::{BlockIdx, GraphKind},
        link,
        machine::{
            Addr, AluOp, Cc, Inst,
            abi::{
                FRAME, HEADER_ARG_COUNT, HelperId, RET_GPR, SCRATCH_GPR, TAG_MASK_REG,
                TAG_TYPE_NUMBER_REG, ThunkId, VM_STACK_LIMIT,
            },
            asm::{AbsTarget, Asm, LabelIdx, RelocKind},
        },
        plan::{CompilationPlan, ProfilerReport},
        speculative_jit::SpeculativeJit,
    },
    log::{IRPhase, log_ir, should_log_ir},
    value::{TAG_MASK, TAG_TYPE_NUMBER},
};
use std::{collections::HashMap, mem, sync::Arc};

pub(super) struct JitCompiler<'a> {
    plan: &'a CompilationPlan,
    sj: SpeculativeJit<'a>,
}

impl<'a> JitCompiler<'a> {
    pub(super) fn new(plan: &'a CompilationPlan) -> Self {
        Self {
            plan,
            sj: SpeculativeJit::new(plan),
        }
    }

    pub(super) fn compile(mut self) -> Result<Arc<CompiledCode>, CompilationError> {
        let plan = self.plan;
        let g = &plan.graph;
        if should_log_ir(IRPhase::Graph) {
            log_ir(&format!(
                "--- Begin graph: {} ---\n{g}\n--- End graph ---\n",
                g.name
            ));
        }

        let entry = self.sj.asm.here();
        self.emit_pinned_registers();
        let stack_overflow = self.sj.asm.mk_label();
        self.emit_stack_check(stack_overflow);
        self.sj.begin_entry();
        self.sj.compile_argument_checks();
        for bidx in g.blocks.indices() {
            self.sj.compile_block(bidx)?;
        }
        self.sj.emit_slow_paths()?;

        let arity_entry = match g.kind {
            GraphKind::Function => Some(self.emit_arity_check(entry)),
            GraphKind::Program => None,
        };
        self.emit_stack_overflow(stack_overflow);
        self.emit_exception_handlers();
        let osr_entries = self.emit_osr_entries();
        self.emit_exit_stubs();
        let insts_len = self.sj.asm.off() as usize;
        self.emit_double_pool();

        let mut ac = mem::replace(&mut self.sj.asm, Asm::new(false)).finish();
        let cb = CodeBufInProgress::new(ac.code.len(), self.plan.options.code_buffer_limit)?;
        let base = cb.base();
        link::apply_relocs(&mut ac, base)?;
        let block_labels = &self.sj.block_labels;
        link::link_jump_tables(g, &self.plan.code_block, &self.sj.switches, |bidx| {
            Ok(base + u64::from(ac.label_off(block_labels[bidx])?))
        })?;
        let buf = cb.into_execodebuf(&ac.code);

        let mut exits = Vec::with_capacity(self.sj.exits.len());
        for x in mem::take(&mut self.sj.exits).into_vec() {
            let stub_off = ac.label_off(x.stub)?;
            exits.push((x, stub_off));
        }
        let jump_replacements = self
            .sj
            .watchpoint_sites
            .iter()
            .map(|w| JumpReplacement {
                source: w.off,
                dest: exits[w.exit.index()].1,
                exit: w.exit,
            })
            .collect::<Vec<_>>();
        let ic_sites = self
            .sj
            .ic_sites
            .iter()
            .map(|r| {
                IcSite::new(
                    r.kind,
                    Arc::clone(&g.identifiers[r.ident]),
                    r.origin,
                    r.structure_imm,
                    r.access,
                )
            })
            .collect();
        let call_links = self
            .sj
            .call_sites
            .iter()
            .map(|c| CallLinkInfo::new(c.origin, c.call_off))
            .collect();
        let exit_sites = exits.iter().map(|(x, off)| (*off, x.kind)).collect();
        let asm_log = ac.log.take();
        if should_log_ir(IRPhase::Asm)
            && let Some(s) = &asm_log
        {
            log_ir(&format!(
                "--- Begin asm: {} ---\n{s}\n--- End asm ---\n",
                g.name
            ));
        }

        let cc = CompiledCode::new(
            g.name.clone(),
            CompiledParts {
                graph: g.clone(),
                code_block: Arc::clone(&self.plan.code_block),
                buf,
                insts_len,
                entry: ac.label_off(entry)?,
                arity_entry: arity_entry
                    .map(|l| ac.label_off(l))
                    .transpose()?,
                exits,
                events: mem::take(&mut self.sj.events),
                ic_sites,
                call_links,
                jump_replacements,
                osr_entries: osr_entries
                    .into_iter()
                    .map(|(b, l)| Ok((b, ac.label_off(l)?)))
                    .collect::<Result<HashMap<_, _>, CompilationError>>()?,
                frame_slots: self.sj.frame.frame_slots,
                exit_threshold: self.plan.options.exit_threshold,
                asm_log,
            },
        );
        if should_log_ir(IRPhase::AsmFull) {
            log_ir(&format!(
                "--- Begin asm-full: {} ---\n{}--- End asm-full ---\n",
                g.name,
                cc.disassemble(true)
            ));
        }
        if let Some(p) = &self.plan.profiler {
            p.report(ProfilerReport {
                name: g.name.clone(),
                disassembly: cc.disassemble(true),
                exit_sites,
            });
        }
        Ok(Arc::new(cc))
    }

    /// Generated code assumes the tag registers always hold their constants.
    fn emit_pinned_registers(&mut self) {
        self.sj.movimm(TAG_TYPE_NUMBER_REG, TAG_TYPE_NUMBER);
        self.sj.movimm(TAG_MASK_REG, TAG_MASK);
    }

    /// Branch to `overflow` if the bottom of this frame (including any outgoing call frame) is
    /// below the VM's stack limit.
    fn emit_stack_check(&mut self, overflow: LabelIdx) {
        let sj = &mut self.sj;
        let off = sj.frame.outgoing_frame_offset();
        sj.asm.log("stack check".into());
        sj.mov(RET_GPR, FRAME);
        sj.alu64(AluOp::Add, RET_GPR, off);
        sj.movimm(SCRATCH_GPR, self.plan.vm);
        sj.load64(SCRATCH_GPR, Addr::base(SCRATCH_GPR, VM_STACK_LIMIT));
        sj.cmp64(RET_GPR, SCRATCH_GPR);
        sj.jcc_label(Cc::B, overflow);
    }

    /// Callers that may have passed too few arguments enter here: pad the frame out with
    /// `undefined`s and then run the normal entry.
    fn emit_arity_check(&mut self, entry: LabelIdx) -> LabelIdx {
        let sj = &mut self.sj;
        let arity = sj.asm.here();
        sj.asm.log("arity check".into());
        let nparams = i32::try_from(self.plan.code_block.num_parameters).unwrap_or(i32::MAX);
        sj.load64(SCRATCH_GPR, Addr::base(FRAME, HEADER_ARG_COUNT * 8));
        sj.cmp64(SCRATCH_GPR, nparams);
        sj.jcc_label(Cc::AE, entry);
        sj.mov(RET_GPR, FRAME);
        sj.emit_call(HelperId::ArityFixup);
        sj.test64(RET_GPR, RET_GPR);
        let rollback = sj.rollback_exception_label;
        sj.jcc_label(Cc::E, rollback);
        sj.mov(FRAME, RET_GPR);
        sj.jmp_label(entry);
        arity
    }

    fn emit_stack_overflow(&mut self, l: LabelIdx) {
        let sj = &mut self.sj;
        sj.asm.attach_label(l);
        sj.asm.log("stack overflow".into());
        sj.mov(RET_GPR, FRAME);
        sj.emit_call(HelperId::StackOverflow);
        let rollback = sj.rollback_exception_label;
        sj.jmp_label(rollback);
    }

    /// Find the handler for a pending exception and jump to it. Exceptions raised before this
    /// frame is fully set up are handled as if thrown by the caller.
    fn emit_exception_handlers(&mut self) {
        let sj = &mut self.sj;
        for (l, h) in [
            (sj.exception_label, HelperId::LookupExceptionHandler),
            (
                sj.rollback_exception_label,
                HelperId::LookupExceptionHandlerFromCaller,
            ),
        ] {
            sj.asm.attach_label(l);
            sj.mov(RET_GPR, FRAME);
            sj.emit_call(h);
            sj.emit(Inst::JmpReg { src: RET_GPR });
        }
    }

    /// The lower tier enters loop headers with values already in their frame slots, which is
    /// exactly the state every block starts in: an OSR entry only has to set the pinned
    /// registers up.
    fn emit_osr_entries(&mut self) -> Vec<(BlockIdx, LabelIdx)> {
        let plan = self.plan;
        let g = &plan.graph;
        let mut entries = Vec::new();
        for (bidx, b) in g.blocks.iter_enumerated() {
            if !b.is_osr_target || !b.is_reachable {
                continue;
            }
            let l = self.sj.asm.here();
            self.sj
                .asm
                .log(format!("osr entry to bb{}", usize::from(bidx)));
            self.emit_pinned_registers();
            let target = self.sj.block_labels[bidx];
            self.sj.jmp_label(target);
            entries.push((bidx, l));
        }
        entries
    }

    /// Every exit gets a stub which records the exit's index and jumps to the shared OSR exit
    /// trampoline.
    fn emit_exit_stubs(&mut self) {
        let sj = &mut self.sj;
        let stubs = sj
            .exits
            .iter_enumerated()
            .map(|(i, x)| (i, x.stub))
            .collect::<Vec<_>>();
        for (i, stub) in stubs {
            sj.asm.attach_label(stub);
            sj.emit(Inst::SetExitIndex {
                index: u32::try_from(i.index()).unwrap_or(u32::MAX),
            });
            sj.asm.push_reloc(
                Inst::JmpAbs { target: 0 },
                RelocKind::Abs(AbsTarget::Thunk(ThunkId::OsrExit)),
            );
        }
    }

    fn emit_double_pool(&mut self) {
        let sj = &mut self.sj;
        sj.asm.align(8);
        let values = self.plan.double_constants.lock().values().to_vec();
        for (i, bits) in values.into_iter().enumerate() {
            if let Some(l) = sj.double_labels.get(&i) {
                sj.asm.attach_label(*l);
            }
            sj.asm.push_data(&bits.to_le_bytes());
        }
    }
}
