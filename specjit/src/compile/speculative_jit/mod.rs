//! The node lowering engine.
//!
//! [SpeculativeJit] walks the graph one block at a time and lowers each node with the pattern
//! *speculate, compute, guard*: operands are filled into registers in the representation the
//! node's use kinds require (emitting type checks where the abstract state cannot prove them),
//! the operation is emitted, and any remaining preconditions (overflow, negative zero, bounds) are
//! guarded with OSR exits.
//!
//! Register state never survives a block boundary: every block starts with nothing in registers
//! and values only flow between blocks through their frame slots. Within a block the
//! [GenerationInfo] ledger records where each live value is, the two [RegisterBank]s record which
//! value each register holds, and every change of either is mirrored into the
//! [VariableEventStream] so that OSR exits can later work out where interpreter-visible values
//! were.

mod arith;
mod compare;
mod control;
mod convert;
mod heap;
mod operands;
#[cfg(test)]
mod test;

pub(crate) use operands::GprOperand;

use crate::{
    compile::{
        CompilationError, LowerError,
        abstract_state::AbstractState,
        compiled_code::IcKind,
        gen_info::{DataFormat, GenerationInfo, RegLoc, SpillOrder},
        graph::{BlockIdx, CodeOrigin, Edge, Graph, IdentIdx, NodeIdx, Op, VirtualRegister},
        machine::{
            Addr, AluOp, Cc, Fpr, Gpr, Inst, OpSize, Operand, Width,
            abi::{
                ARG_FPRS, ARG_GPRS, CALL_FRAME_HEADER_SIZE, FRAME, HelperId, RET_FPR, RET_GPR,
                SCRATCH_FPR, SCRATCH_GPR, VM_EXCEPTION,
            },
            asm::{AbsTarget, Asm, LabelIdx, RelocKind},
        },
        osr_exit::{
            ExitIdx, ExitKind, OsrExit, OsrExitList, SpeculationRecovery, ValueOverride,
            find_forward_set_local, forward_resume,
        },
        plan::CompilationPlan,
        regalloc::{RegLock, RegisterBank},
        slow_path::SlowPath,
        variable_event::{ValueRecovery, VariableEvent, VariableEventStream, flush_data_format},
    },
    log::{IRPhase, should_log_ir},
    value::VALUE_UNDEFINED,
};
use index_vec::IndexVec;
use std::collections::HashMap;

/// The number of frame slots reserved for saving registers around slow-path calls.
const SAVE_AREA_SLOTS: usize = 20;

/// Where things live in an optimised frame.
///
/// Below the frame register are the graph's locals (interpreter-visible variables followed by one
/// temporary per value), then a save area used by slow paths, then the header and arguments of
/// the frame of any outgoing call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameLayout {
    num_locals: usize,
    /// The total number of slots below the frame register.
    pub(crate) frame_slots: usize,
}

impl FrameLayout {
    fn new(g: &Graph) -> Self {
        Self {
            num_locals: g.num_locals,
            frame_slots: g.num_locals
                + SAVE_AREA_SLOTS
                + CALL_FRAME_HEADER_SIZE as usize
                + g.max_call_args(),
        }
    }

    pub(crate) fn gpr_save(&self, bank_idx: usize) -> Addr {
        Addr::base(FRAME, VirtualRegister::local(self.num_locals + bank_idx).offset())
    }

    pub(crate) fn fpr_save(&self, bank_idx: usize) -> Addr {
        Addr::base(
            FRAME,
            VirtualRegister::local(self.num_locals + 12 + bank_idx).offset(),
        )
    }

    /// The byte offset of the frame register of an outgoing call.
    pub(crate) fn outgoing_frame_offset(&self) -> i32 {
        -((self.frame_slots * 8) as i32)
    }

    /// The address of slot `slot` of an outgoing call's frame.
    pub(crate) fn outgoing(&self, slot: i32) -> Addr {
        Addr::base(FRAME, self.outgoing_frame_offset() + slot * 8)
    }
}

/// An argument to a runtime helper.
#[derive(Clone, Copy, Debug)]
pub(crate) enum CallArg {
    Gpr(Gpr),
    Fpr(Fpr),
    Imm(u64),
}

/// An inline cache emitted during lowering. Offsets are from the start of the code.
#[derive(Clone, Debug)]
pub(crate) struct IcRecord {
    pub(crate) kind: IcKind,
    pub(crate) ident: IdentIdx,
    /// The [Inst::MovImm] holding the expected structure.
    pub(crate) structure_imm: u32,
    /// The [Inst::Load] / [Inst::Store] accessing the property.
    pub(crate) access: u32,
    pub(crate) origin: CodeOrigin,
}

#[derive(Clone, Debug)]
pub(crate) struct CallRecord {
    pub(crate) call_off: u32,
    pub(crate) origin: CodeOrigin,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct WatchpointSite {
    pub(crate) off: u32,
    pub(crate) exit: ExitIdx,
}

pub(crate) struct SpeculativeJit<'a> {
    pub(crate) plan: &'a CompilationPlan,
    pub(crate) g: &'a Graph,
    pub(crate) asm: Asm,
    /// The ledger, indexed by the local index of each value's frame slot.
    gen_info: Vec<GenerationInfo>,
    pub(crate) gprs: RegisterBank<Gpr>,
    pub(crate) fprs: RegisterBank<Fpr>,
    pub(crate) events: VariableEventStream,
    pub(crate) exits: OsrExitList,
    pub(crate) state: AbstractState,
    pub(crate) slow_paths: Vec<SlowPath>,
    pub(crate) block_labels: IndexVec<BlockIdx, LabelIdx>,
    pub(crate) frame: FrameLayout,
    pub(crate) cur_block: BlockIdx,
    /// The position of [Self::cur] within [Self::cur_block].
    pub(crate) pos: usize,
    /// The node being lowered.
    pub(crate) cur: NodeIdx,
    /// Set when a node has fused itself with the node that follows it.
    pub(crate) skip_next: bool,
    /// While emitting slow paths, exits must see the event stream as it was when the slow path
    /// was registered.
    pub(crate) exit_stream_index: Option<usize>,
    pub(crate) exception_label: LabelIdx,
    /// For exceptions thrown before this frame is fully set up.
    pub(crate) rollback_exception_label: LabelIdx,
    /// Double constant pool indexes to the labels of their pool entries.
    pub(crate) double_labels: HashMap<usize, LabelIdx>,
    pub(crate) ic_sites: Vec<IcRecord>,
    pub(crate) call_sites: Vec<CallRecord>,
    pub(crate) watchpoint_sites: Vec<WatchpointSite>,
    /// `Switch` nodes, so the linker can fill their jump tables.
    pub(crate) switches: Vec<NodeIdx>,
}

impl<'a> SpeculativeJit<'a> {
    pub(crate) fn new(plan: &'a CompilationPlan) -> Self {
        let g = &plan.graph;
        let mut asm = Asm::new(
            cfg!(test)
                || should_log_ir(IRPhase::Asm)
                || should_log_ir(IRPhase::AsmFull)
                || plan.profiler.is_some(),
        );
        let block_labels = g.blocks.iter().map(|_| asm.mk_label()).collect();
        let exception_label = asm.mk_label();
        let rollback_exception_label = asm.mk_label();
        Self {
            plan,
            g,
            asm,
            gen_info: vec![GenerationInfo::default(); g.num_locals],
            gprs: RegisterBank::new(),
            fprs: RegisterBank::new(),
            events: VariableEventStream::new(),
            exits: OsrExitList::default(),
            state: AbstractState::new(g),
            slow_paths: Vec::new(),
            block_labels,
            frame: FrameLayout::new(g),
            cur_block: BlockIdx::new(0),
            pos: 0,
            cur: NodeIdx::new(0),
            skip_next: false,
            exit_stream_index: None,
            exception_label,
            rollback_exception_label,
            double_labels: HashMap::new(),
            ic_sites: Vec::new(),
            call_sites: Vec::new(),
            watchpoint_sites: Vec::new(),
            switches: Vec::new(),
        }
    }

    //
    // The ledger.
    //

    pub(crate) fn vreg(&self, nidx: NodeIdx) -> Result<VirtualRegister, CompilationError> {
        self.g.nodes[nidx].vreg.ok_or_else(|| {
            CompilationError::InternalError(format!("@{} has no value slot", usize::from(nidx)))
        })
    }

    fn gi_idx(&self, vreg: VirtualRegister) -> Result<usize, CompilationError> {
        vreg.to_local()
            .filter(|x| *x < self.gen_info.len())
            .ok_or_else(|| CompilationError::InternalError(format!("{vreg} is not a value slot")))
    }

    pub(crate) fn gi(&self, nidx: NodeIdx) -> Result<&GenerationInfo, CompilationError> {
        let i = self.gi_idx(self.vreg(nidx)?)?;
        Ok(&self.gen_info[i])
    }

    pub(crate) fn gi_mut(
        &mut self,
        nidx: NodeIdx,
    ) -> Result<&mut GenerationInfo, CompilationError> {
        let i = self.gi_idx(self.vreg(nidx)?)?;
        Ok(&mut self.gen_info[i])
    }

    //
    // Emission.
    //

    pub(crate) fn emit(&mut self, inst: Inst) -> u32 {
        self.asm.push_inst(inst)
    }

    pub(crate) fn jcc_label(&mut self, cc: Cc, l: LabelIdx) {
        self.asm
            .push_reloc(Inst::Jcc { cc, rel: 0 }, RelocKind::Label(l));
    }

    pub(crate) fn jmp_label(&mut self, l: LabelIdx) {
        self.asm.push_reloc(Inst::Jmp { rel: 0 }, RelocKind::Label(l));
    }

    pub(crate) fn mov(&mut self, dst: Gpr, src: Gpr) {
        if dst != src {
            self.emit(Inst::Mov { dst, src });
        }
    }

    pub(crate) fn dmov(&mut self, dst: Fpr, src: Fpr) {
        if dst != src {
            self.emit(Inst::DMov { dst, src });
        }
    }

    pub(crate) fn movimm(&mut self, dst: Gpr, imm: u64) -> u32 {
        self.emit(Inst::MovImm { dst, imm })
    }

    pub(crate) fn alu32(&mut self, op: AluOp, dst: Gpr, src: impl Into<Operand>) {
        self.emit(Inst::Alu {
            size: OpSize::S32,
            op,
            dst,
            src: src.into(),
        });
    }

    pub(crate) fn alu64(&mut self, op: AluOp, dst: Gpr, src: impl Into<Operand>) {
        self.emit(Inst::Alu {
            size: OpSize::S64,
            op,
            dst,
            src: src.into(),
        });
    }

    pub(crate) fn cmp32(&mut self, lhs: Gpr, rhs: impl Into<Operand>) {
        self.emit(Inst::Cmp {
            size: OpSize::S32,
            lhs,
            rhs: rhs.into(),
        });
    }

    pub(crate) fn cmp64(&mut self, lhs: Gpr, rhs: impl Into<Operand>) {
        self.emit(Inst::Cmp {
            size: OpSize::S64,
            lhs,
            rhs: rhs.into(),
        });
    }

    pub(crate) fn test32(&mut self, lhs: Gpr, rhs: impl Into<Operand>) {
        self.emit(Inst::Test {
            size: OpSize::S32,
            lhs,
            rhs: rhs.into(),
        });
    }

    pub(crate) fn test64(&mut self, lhs: Gpr, rhs: impl Into<Operand>) {
        self.emit(Inst::Test {
            size: OpSize::S64,
            lhs,
            rhs: rhs.into(),
        });
    }

    pub(crate) fn load(&mut self, width: Width, dst: Gpr, addr: Addr) -> u32 {
        self.emit(Inst::Load {
            width,
            signed: false,
            dst,
            addr,
        })
    }

    pub(crate) fn load64(&mut self, dst: Gpr, addr: Addr) -> u32 {
        self.load(Width::B64, dst, addr)
    }

    pub(crate) fn store64(&mut self, src: Gpr, addr: Addr) -> u32 {
        self.emit(Inst::Store {
            width: Width::B64,
            src,
            addr,
        })
    }

    pub(crate) fn frame_addr(vreg: VirtualRegister) -> Addr {
        Addr::base(FRAME, vreg.offset())
    }

    /// Load the double `d` into `dst` from the constant pool.
    pub(crate) fn load_double_constant(&mut self, dst: Fpr, d: f64) {
        let idx = self.plan.double_constants.lock().intern(d);
        let l = match self.double_labels.get(&idx) {
            Some(l) => *l,
            None => {
                let l = self.asm.mk_label();
                self.double_labels.insert(idx, l);
                l
            }
        };
        self.asm
            .push_reloc(Inst::LoadDConst { dst, rel: 0 }, RelocKind::Label(l));
    }

    //
    // Register allocation.
    //

    /// Allocate and lock a GPR, spilling its previous value if necessary.
    pub(crate) fn alloc_gpr(&mut self) -> Result<RegLock<Gpr>, CompilationError> {
        let (l, evicted) = self.gprs.allocate()?;
        if let Some(vreg) = evicted {
            self.spill_vreg(vreg, RegLoc::Gpr(l.reg()))?;
        }
        Ok(l)
    }

    pub(crate) fn alloc_fpr(&mut self) -> Result<RegLock<Fpr>, CompilationError> {
        let (l, evicted) = self.fprs.allocate()?;
        if let Some(vreg) = evicted {
            self.spill_vreg(vreg, RegLoc::Fpr(l.reg()))?;
        }
        Ok(l)
    }

    /// As [Self::alloc_gpr], but hand out `reg` if it is not locked.
    pub(crate) fn alloc_gpr_preferring(&mut self, reg: Gpr) -> Result<RegLock<Gpr>, CompilationError> {
        let (l, evicted) = self.gprs.allocate_preferring(reg)?;
        if let Some(vreg) = evicted {
            self.spill_vreg(vreg, RegLoc::Gpr(l.reg()))?;
        }
        Ok(l)
    }

    pub(crate) fn alloc_fpr_preferring(&mut self, reg: Fpr) -> Result<RegLock<Fpr>, CompilationError> {
        let (l, evicted) = self.fprs.allocate_preferring(reg)?;
        if let Some(vreg) = evicted {
            self.spill_vreg(vreg, RegLoc::Fpr(l.reg()))?;
        }
        Ok(l)
    }

    /// Store the value in slot `vreg`, currently in `loc`, to its frame slot. The caller must
    /// already have unbound `loc` in its bank.
    fn spill_vreg(&mut self, vreg: VirtualRegister, loc: RegLoc) -> Result<(), CompilationError> {
        let i = self.gi_idx(vreg)?;
        let gi = &self.gen_info[i];
        let node = gi.node().ok_or_else(|| {
            CompilationError::InternalError(format!("{vreg} is bound but not alive"))
        })?;
        if gi.loc() != loc {
            return Err(CompilationError::InternalError(format!(
                "{vreg} is bound to {loc:?} but the ledger says {:?}",
                gi.loc()
            )));
        }
        let format = if gi.is_spilled() {
            let f = gi.spill_format();
            self.gen_info[i].release_registers();
            f
        } else {
            let f = gi.register_format();
            match loc {
                RegLoc::Gpr(r) => {
                    self.store64(r, Self::frame_addr(vreg));
                }
                RegLoc::Fpr(r) => {
                    self.emit(Inst::StoreD {
                        src: r,
                        addr: Self::frame_addr(vreg),
                    });
                }
                RegLoc::None => {
                    return Err(CompilationError::InternalError(format!(
                        "{vreg} is not in a register"
                    )));
                }
            }
            self.gen_info[i].spill(f);
            f
        };
        self.events.append(VariableEvent::Spill {
            node,
            slot: vreg,
            format,
        });
        Ok(())
    }

    /// Spill every value currently in a register. Used before calls, which clobber every
    /// allocatable register.
    pub(crate) fn flush_registers(&mut self) -> Result<(), CompilationError> {
        let gprs = self.gprs.bound().collect::<Vec<_>>();
        for (r, vreg) in gprs {
            self.gprs.release(r);
            self.spill_vreg(vreg, RegLoc::Gpr(r))?;
        }
        let fprs = self.fprs.bound().collect::<Vec<_>>();
        for (r, vreg) in fprs {
            self.fprs.release(r);
            self.spill_vreg(vreg, RegLoc::Fpr(r))?;
        }
        Ok(())
    }

    /// Bind the current node's result to `reg` in format `format`.
    pub(crate) fn gpr_result(&mut self, reg: Gpr, format: DataFormat) -> Result<(), CompilationError> {
        let nidx = self.cur;
        let rc = self.g.nodes[nidx].ref_count;
        if rc == 0 {
            return Ok(());
        }
        let vreg = self.vreg(nidx)?;
        self.gi_mut(nidx)?.init_gpr(nidx, rc, reg, format);
        self.gprs
            .retain(reg, vreg, SpillOrder::for_format(format));
        self.events.append(VariableEvent::Birth {
            node: nidx,
            loc: RegLoc::Gpr(reg),
            format,
        });
        Ok(())
    }

    pub(crate) fn fpr_result(&mut self, reg: Fpr) -> Result<(), CompilationError> {
        let nidx = self.cur;
        let rc = self.g.nodes[nidx].ref_count;
        if rc == 0 {
            return Ok(());
        }
        let vreg = self.vreg(nidx)?;
        self.gi_mut(nidx)?.init_fpr(nidx, rc, reg);
        self.fprs.retain(reg, vreg, SpillOrder::Double);
        self.events.append(VariableEvent::Birth {
            node: nidx,
            loc: RegLoc::Fpr(reg),
            format: DataFormat::Double,
        });
        Ok(())
    }

    /// Consume one use of `nidx`'s value, releasing its register if that was the last use.
    fn use_node(&mut self, nidx: NodeIdx) -> Result<(), CompilationError> {
        let Some(vreg) = self.g.nodes[nidx].vreg else {
            return Ok(());
        };
        let i = self.gi_idx(vreg)?;
        let gi = &mut self.gen_info[i];
        if !gi.is_alive() || gi.use_count() == 0 {
            // The value's producer was cut short by an unconditional exit.
            return Ok(());
        }
        if !gi.use_value() {
            return Ok(());
        }
        match gi.loc() {
            RegLoc::Gpr(r) if self.gprs.owner(r) == Some(vreg) => self.gprs.release(r),
            RegLoc::Fpr(r) if self.fprs.owner(r) == Some(vreg) => self.fprs.release(r),
            _ => (),
        }
        let is_constant = gi.is_constant();
        gi.kill();
        if !is_constant {
            self.events.append(VariableEvent::Death { node: nidx });
        }
        Ok(())
    }

    fn use_children(&mut self, nidx: NodeIdx) -> Result<(), CompilationError> {
        let g = self.g;
        for e in &g.nodes[nidx].children {
            self.use_node(e.node)?;
        }
        Ok(())
    }

    /// Is this node the last user of `e`'s value, so that its register may be overwritten?
    pub(crate) fn can_reuse(&self, e: Edge) -> bool {
        self.gi(e.node)
            .map(|gi| gi.is_alive() && !gi.is_constant() && gi.use_count() == 1)
            .unwrap_or(false)
    }

    //
    // OSR exits.
    //

    pub(crate) fn new_exit(&mut self, kind: ExitKind) -> ExitIdx {
        let stub = self.asm.mk_label();
        let stream_index = self.exit_stream_index.unwrap_or(self.events.len());
        self.exits.push(OsrExit {
            kind,
            origin: self.g.nodes[self.cur].origin,
            stream_index,
            value_override: None,
            recovery: None,
            node: self.cur,
            is_forward: false,
            is_watchpoint: false,
            stub,
        })
    }

    /// Branch to an existing exit if `cc` holds.
    pub(crate) fn jcc_exit(&mut self, cc: Cc, exit: ExitIdx) {
        let stub = self.exits.get(exit).stub;
        self.jcc_label(cc, stub);
    }

    /// Exit with `kind` if `cc` holds.
    pub(crate) fn speculation_check(&mut self, kind: ExitKind, cc: Cc) -> ExitIdx {
        let x = self.new_exit(kind);
        self.jcc_exit(cc, x);
        x
    }

    pub(crate) fn speculation_check_with_recovery(
        &mut self,
        kind: ExitKind,
        cc: Cc,
        recovery: SpeculationRecovery,
    ) -> ExitIdx {
        let x = self.new_exit(kind);
        self.exits.get_mut(x).recovery = Some(recovery);
        self.jcc_exit(cc, x);
        x
    }

    /// The current node's speculation can never succeed: exit unconditionally and stop lowering
    /// the node.
    pub(crate) fn terminate<T>(&mut self, kind: ExitKind) -> Result<T, LowerError> {
        let x = self.new_exit(kind);
        let stub = self.exits.get(x).stub;
        self.jmp_label(stub);
        Err(LowerError::Terminated)
    }

    /// Emit a patchable no-op which, if the watchpoint it stands for is fired, is overwritten
    /// with a jump to a new exit.
    pub(crate) fn watchpoint_check(&mut self, kind: ExitKind) -> ExitIdx {
        let x = self.new_exit(kind);
        self.exits.get_mut(x).is_watchpoint = true;
        let off = self.emit(Inst::WatchpointLabel {
            id: u32::try_from(x.index()).unwrap_or(u32::MAX),
        });
        self.watchpoint_sites.push(WatchpointSite { off, exit: x });
        x
    }

    /// Try to convert `exit` into a forward exit which resumes after the `SetLocal` storing the
    /// current node's value, with that local recovered by `recovery`. Returns `false` (leaving the
    /// exit as a backward exit) if there is no safe place to resume.
    pub(crate) fn convert_to_forward(&mut self, exit: ExitIdx, recovery: ValueRecovery) -> bool {
        let n = &self.g.nodes[self.cur];
        let sl_pos = match n.forward_target {
            Some(t) => self.g.block_position(self.cur_block, t),
            None => find_forward_set_local(self.g, self.cur_block, self.pos),
        };
        let Some((origin, operand)) =
            sl_pos.and_then(|sl| forward_resume(self.g, self.cur_block, self.pos, sl))
        else {
            return false;
        };
        let x = self.exits.get_mut(exit);
        x.origin = origin;
        x.is_forward = true;
        x.value_override = Some(ValueOverride { operand, recovery });
        true
    }

    //
    // Calls.
    //

    /// Move `args` into the argument registers.
    pub(crate) fn setup_args(&mut self, args: &[CallArg]) -> Result<(), CompilationError> {
        let mut gmoves = Vec::new();
        let mut fmoves = Vec::new();
        let mut imms = Vec::new();
        let mut ngprs = 0;
        let mut nfprs = 0;
        for a in args {
            match *a {
                CallArg::Gpr(_) | CallArg::Imm(_) if ngprs == ARG_GPRS.len() => {
                    return Err(CompilationError::InternalError(
                        "Too many integer arguments".into(),
                    ));
                }
                CallArg::Gpr(r) => {
                    gmoves.push((ARG_GPRS[ngprs], r));
                    ngprs += 1;
                }
                CallArg::Imm(x) => {
                    imms.push((ARG_GPRS[ngprs], x));
                    ngprs += 1;
                }
                CallArg::Fpr(_) if nfprs == ARG_FPRS.len() => {
                    return Err(CompilationError::InternalError(
                        "Too many double arguments".into(),
                    ));
                }
                CallArg::Fpr(r) => {
                    fmoves.push((ARG_FPRS[nfprs], r));
                    nfprs += 1;
                }
            }
        }
        self.parallel_moves(gmoves, SCRATCH_GPR, |dst, src| Inst::Mov { dst, src });
        self.parallel_moves(fmoves, SCRATCH_FPR, |dst, src| Inst::DMov { dst, src });
        for (r, x) in imms {
            self.movimm(r, x);
        }
        Ok(())
    }

    /// Emit `moves` (each `(dst, src)`) so that every destination receives its source's original
    /// value.
    fn parallel_moves<R: Copy + Eq>(
        &mut self,
        mut moves: Vec<(R, R)>,
        scratch: R,
        mk: impl Fn(R, R) -> Inst,
    ) {
        moves.retain(|(d, s)| d != s);
        while !moves.is_empty() {
            if let Some(i) = moves
                .iter()
                .position(|(d, _)| !moves.iter().any(|(_, s)| s == d))
            {
                let (d, s) = moves.remove(i);
                self.emit(mk(d, s));
            } else {
                // Every remaining destination is also a source: break the cycle.
                let (_, s) = moves[0];
                self.emit(mk(scratch, s));
                for m in moves.iter_mut() {
                    if m.1 == s {
                        m.1 = scratch;
                    }
                }
            }
        }
    }

    pub(crate) fn emit_call(&mut self, h: HelperId) {
        self.asm.push_reloc(
            Inst::Call { target: 0 },
            RelocKind::Abs(AbsTarget::Helper(h)),
        );
    }

    /// Branch to the exception handler if the last call left an exception pending.
    pub(crate) fn exception_check(&mut self) {
        self.movimm(SCRATCH_GPR, self.plan.vm);
        self.load64(SCRATCH_GPR, Addr::base(SCRATCH_GPR, VM_EXCEPTION));
        self.test64(SCRATCH_GPR, SCRATCH_GPR);
        let l = self.exception_label;
        self.jcc_label(Cc::NE, l);
    }

    /// Call helper `h` from the main path. Every live register is flushed first: the operands
    /// passed in `args` remain valid only until the call.
    pub(crate) fn call_helper(
        &mut self,
        h: HelperId,
        args: &[CallArg],
    ) -> Result<(), CompilationError> {
        self.flush_registers()?;
        self.setup_args(args)?;
        self.emit_call(h);
        if h.may_throw() {
            self.exception_check();
        }
        Ok(())
    }

    /// After [Self::call_helper], claim the register holding the helper's integer result. The
    /// result stays in [RET_GPR] unless an operand still holds that register.
    pub(crate) fn call_result_gpr(&mut self) -> Result<RegLock<Gpr>, CompilationError> {
        let r = self.alloc_gpr_preferring(RET_GPR)?;
        self.mov(r.reg(), RET_GPR);
        Ok(r)
    }

    /// As [Self::call_result_gpr] for a double result in [RET_FPR].
    pub(crate) fn call_result_fpr(&mut self) -> Result<RegLock<Fpr>, CompilationError> {
        let r = self.alloc_fpr_preferring(RET_FPR)?;
        self.dmov(r.reg(), RET_FPR);
        Ok(r)
    }

    //
    // Control flow.
    //

    /// Jump to `target` unless it is the block emitted next.
    pub(crate) fn jump_to_block(&mut self, target: BlockIdx) {
        if usize::from(target) != usize::from(self.cur_block) + 1 {
            let l = self.block_labels[target];
            self.jmp_label(l);
        }
    }

    /// Branch to `taken` if `cc` holds, otherwise to `not_taken`, falling through where possible.
    pub(crate) fn branch_cc(&mut self, cc: Cc, taken: BlockIdx, not_taken: BlockIdx) {
        if usize::from(taken) == usize::from(self.cur_block) + 1 {
            let l = self.block_labels[not_taken];
            self.jcc_label(cc.invert(), l);
        } else {
            let l = self.block_labels[taken];
            self.jcc_label(cc, l);
            self.jump_to_block(not_taken);
        }
    }

    //
    // The per-block driver.
    //

    /// Forget all register state and record the canonical block-entry state: every argument and
    /// every variable live at the head of the block is in its frame slot.
    fn reset_block(&mut self, bidx: BlockIdx) {
        for gi in self.gen_info.iter_mut() {
            gi.kill();
        }
        self.gprs.release_all();
        self.fprs.release_all();
        self.state.begin_block(self.g);
        self.events.append(VariableEvent::Reset);
        for v in &self.g.arguments {
            let var = &self.g.variables[*v];
            self.events.append(VariableEvent::SetLocal {
                operand: var.operand,
                format: flush_data_format(var.flush_format),
            });
        }
        for v in &self.g.blocks[bidx].variables_at_head {
            let var = &self.g.variables[*v];
            if var.operand.is_local() {
                self.events.append(VariableEvent::SetLocal {
                    operand: var.operand,
                    format: flush_data_format(var.flush_format),
                });
            }
        }
    }

    pub(crate) fn compile_block(&mut self, bidx: BlockIdx) -> Result<(), CompilationError> {
        let g = self.g;
        let b = &g.blocks[bidx];
        self.cur_block = bidx;
        let l = self.block_labels[bidx];
        self.asm.attach_label(l);
        if !b.is_reachable {
            if self.plan.options.breakpoint_unreachable {
                self.emit(Inst::Breakpoint);
            }
            return Ok(());
        }
        self.asm.log(format!("bb{}", usize::from(bidx)));
        self.reset_block(bidx);
        self.skip_next = false;
        for (pos, nidx) in b.nodes.iter().enumerate() {
            let nidx = *nidx;
            if self.skip_next {
                // Already lowered as part of the previous node.
                self.skip_next = false;
                self.state.execute(g, nidx);
                continue;
            }
            self.pos = pos;
            self.cur = nidx;
            let n = &g.nodes[nidx];
            match n.op {
                Op::JSConstant(_) | Op::DoubleConstant(_) => {
                    if n.vreg.is_some() {
                        self.gi_mut(nidx)?.init_constant(nidx, n.ref_count);
                    }
                    continue;
                }
                Op::MovHint(v) => {
                    self.events.append(VariableEvent::MovHint {
                        node: n.children[0].node,
                        operand: g.variables[v].operand,
                    });
                    continue;
                }
                _ => (),
            }
            if !n.should_generate() {
                continue;
            }
            if self.asm.is_logging() {
                self.asm.log(format!("@{}: {}", usize::from(nidx), n.op));
            }
            match self.compile_node(nidx) {
                Ok(()) => (),
                Err(LowerError::Terminated) => self.bind_placeholder()?,
                Err(LowerError::Compile(e)) => return Err(e),
            }
            if !matches!(n.op, Op::Phi(_)) {
                self.use_children(nidx)?;
            }
            self.state.execute(g, nidx);
            if self.plan.options.assert_state {
                self.check_state()?;
            }
        }
        Ok(())
    }

    fn compile_node(&mut self, nidx: NodeIdx) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[nidx];
        match &n.op {
            Op::JSConstant(_) | Op::DoubleConstant(_) | Op::MovHint(_) => Ok(()),
            Op::Flush(_) | Op::Phantom | Op::Phi(_) => Ok(()),
            Op::GetLocal(v) => self.compile_get_local(*v),
            Op::SetLocal(v) => self.compile_set_local(*v),
            Op::ArithAdd | Op::ValueAdd => self.compile_add(),
            Op::ArithSub => self.compile_sub(),
            Op::ArithMul => self.compile_mul(),
            Op::ArithNegate => self.compile_negate(),
            Op::ArithDiv => self.compile_div(),
            Op::ArithMod => self.compile_mod(),
            Op::ArithAbs => self.compile_abs(),
            Op::ArithMin => self.compile_min_max(true),
            Op::ArithMax => self.compile_min_max(false),
            Op::ArithSqrt => self.compile_sqrt(),
            Op::BitAnd => self.compile_bitop(AluOp::And),
            Op::BitOr => self.compile_bitop(AluOp::Or),
            Op::BitXor => self.compile_bitop(AluOp::Xor),
            Op::BitLShift => self.compile_bitop(AluOp::Shl),
            Op::BitRShift => self.compile_bitop(AluOp::Sar),
            Op::BitURShift => self.compile_bitop(AluOp::Shr),
            Op::ValueToInt32 => self.compile_value_to_int32(),
            Op::UInt32ToNumber => self.compile_uint32_to_number(),
            Op::Int32ToDouble => self.compile_int32_to_double(),
            Op::DoubleAsInt32 => self.compile_double_as_int32(),
            Op::CompareLess
            | Op::CompareLessEq
            | Op::CompareGreater
            | Op::CompareGreaterEq
            | Op::CompareEq
            | Op::CompareStrictEq => self.compile_compare(),
            Op::LogicalNot => self.compile_logical_not(),
            Op::CheckStructure(set) => self.compile_check_structure(set),
            Op::CheckArray(mode) => self.compile_check_array(*mode),
            Op::Arrayify(mode) => self.compile_arrayify(*mode),
            Op::GetIndexedPropertyStorage(mode) => self.compile_get_storage(*mode),
            Op::GetByVal(mode) => self.compile_get_by_val(*mode),
            Op::PutByVal(mode) => self.compile_put_by_val(*mode),
            Op::GetArrayLength(mode) => self.compile_get_array_length(*mode),
            Op::StringCharCodeAt => self.compile_string_char_code_at(),
            Op::StringCharAt => self.compile_string_char_at(),
            Op::GetById(ident) => self.compile_get_by_id(*ident),
            Op::PutById(ident) => self.compile_put_by_id(*ident),
            Op::CheckHasInstance => self.compile_check_has_instance(),
            Op::InstanceOf => self.compile_instance_of(),
            Op::Call => self.compile_call(),
            Op::Jump(t) => {
                self.jump_to_block(*t);
                Ok(())
            }
            Op::Branch { taken, not_taken } => self.compile_branch(*taken, *not_taken),
            Op::Switch(data) => self.compile_switch(data),
            Op::Return => self.compile_return(),
            Op::Throw => self.compile_throw(),
            Op::ForceOSRExit => self.terminate(ExitKind::InadequateCoverage),
        }
    }

    /// After an unconditional exit, later nodes may still refer to the current node's result:
    /// give them something well formed to consume. The code doing so is unreachable.
    fn bind_placeholder(&mut self) -> Result<(), CompilationError> {
        let n = &self.g.nodes[self.cur];
        if !n.op.has_result() || n.ref_count == 0 || self.gi(self.cur)?.is_alive() {
            return Ok(());
        }
        let r = self.alloc_gpr()?;
        self.movimm(r.reg(), VALUE_UNDEFINED);
        self.gpr_result(r.reg(), DataFormat::JS)
    }

    /// Check that the ledger and the register banks agree and that no register is still locked.
    pub(crate) fn check_state(&self) -> Result<(), CompilationError> {
        let err = |s: String| {
            Err(CompilationError::InternalError(format!(
                "After @{}: {s}",
                usize::from(self.cur)
            )))
        };
        if self.gprs.any_locked() || self.fprs.any_locked() {
            return err("registers remain locked".into());
        }
        for (r, vreg) in self.gprs.bound() {
            let i = self.gi_idx(vreg)?;
            if self.gen_info[i].loc() != RegLoc::Gpr(r) {
                return err(format!("{r} is bound to {vreg} which is not in it"));
            }
        }
        for (r, vreg) in self.fprs.bound() {
            let i = self.gi_idx(vreg)?;
            if self.gen_info[i].loc() != RegLoc::Fpr(r) {
                return err(format!("{r} is bound to {vreg} which is not in it"));
            }
        }
        for (i, gi) in self.gen_info.iter().enumerate() {
            let vreg = VirtualRegister::local(i);
            match gi.loc() {
                RegLoc::Gpr(r) if self.gprs.owner(r) != Some(vreg) => {
                    return err(format!("{vreg} claims {r} which is not bound to it"));
                }
                RegLoc::Fpr(r) if self.fprs.owner(r) != Some(vreg) => {
                    return err(format!("{vreg} claims {r} which is not bound to it"));
                }
                RegLoc::Gpr(_) | RegLoc::Fpr(_) if !gi.is_alive() => {
                    return err(format!("{vreg} is dead but in a register"));
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// Does any value slot have a register? At the start of every block the answer must be no.
    #[cfg(test)]
    pub(crate) fn any_register_resident(&self) -> bool {
        self.gen_info.iter().any(|gi| gi.loc() != RegLoc::None)
    }
}
