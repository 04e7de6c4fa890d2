//! Locals, calls, switches, returns and the checks done on entry.

use super::{CallArg, CallRecord, SpeculativeJit};
use crate::{
    compile::{
        CompilationError, LowerError,
        gen_info::DataFormat,
        graph::{FlushFormat, SwitchData, SwitchKind, UseKind, VariableIdx},
        machine::{
            AluOp, Cc, Inst, Operand,
            abi::{
                CALL_FRAME_HEADER_SIZE, FRAME, HEADER_ARG_COUNT, HEADER_CALLEE,
                HEADER_CALLER_FRAME, HelperId, RET_GPR, SCRATCH_GPR, TAG_MASK_REG,
                TAG_TYPE_NUMBER_REG, ThunkId,
            },
            asm::{AbsTarget, RelocKind},
        },
        osr_exit::ExitKind,
        variable_event::{VariableEvent, flush_data_format},
    },
    value::{VALUE_FALSE, VALUE_UNDEFINED},
};

impl SpeculativeJit<'_> {
    pub(super) fn compile_get_local(&mut self, v: VariableIdx) -> Result<(), LowerError> {
        let g = self.g;
        let var = &g.variables[v];
        let addr = Self::frame_addr(var.operand);
        match var.flush_format {
            FlushFormat::Double => {
                let res = self.alloc_fpr()?;
                self.emit(Inst::LoadD {
                    dst: res.reg(),
                    addr,
                });
                Ok(self.fpr_result(res.reg())?)
            }
            ff => {
                let res = self.alloc_gpr()?;
                self.load64(res.reg(), addr);
                Ok(self.gpr_result(res.reg(), flush_data_format(ff))?)
            }
        }
    }

    pub(super) fn compile_set_local(&mut self, v: VariableIdx) -> Result<(), LowerError> {
        let g = self.g;
        let var = &g.variables[v];
        let child = g.nodes[self.cur].child(0);
        let addr = Self::frame_addr(var.operand);
        match var.flush_format {
            FlushFormat::JSValue => {
                let j = self.fill_js(child)?;
                self.store64(j.gpr(), addr);
            }
            FlushFormat::Int32 => {
                let op = self.fill_int(child)?;
                if op.format() == DataFormat::Int32 {
                    self.mov(SCRATCH_GPR, op.gpr());
                    self.alu64(AluOp::Or, SCRATCH_GPR, TAG_TYPE_NUMBER_REG);
                    self.store64(SCRATCH_GPR, addr);
                } else {
                    self.store64(op.gpr(), addr);
                }
            }
            FlushFormat::Double => {
                let f = self.fill_double(child)?;
                self.emit(Inst::StoreD { src: f.fpr(), addr });
            }
            FlushFormat::Boolean => {
                let op = self.fill_boolean(child)?;
                if op.format() == DataFormat::Boolean {
                    self.mov(SCRATCH_GPR, op.gpr());
                    self.alu64(AluOp::Or, SCRATCH_GPR, Operand::Imm(VALUE_FALSE as i32));
                    self.store64(SCRATCH_GPR, addr);
                } else {
                    self.store64(op.gpr(), addr);
                }
            }
            FlushFormat::Cell => {
                let c = self.fill_cell(child)?;
                self.store64(c.gpr(), addr);
            }
        }
        self.events.append(VariableEvent::SetLocal {
            operand: var.operand,
            format: flush_data_format(var.flush_format),
        });
        Ok(())
    }

    /// `(callee, this, args...)`: build the callee's frame below ours and call through the
    /// virtual call thunk.
    pub(super) fn compile_call(&mut self) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let frame = self.frame;
        for (i, e) in n.children.iter().enumerate() {
            let slot = if i == 0 {
                HEADER_CALLEE
            } else {
                CALL_FRAME_HEADER_SIZE + i as i32 - 1
            };
            let j = self.fill_js(*e)?;
            self.store64(j.gpr(), frame.outgoing(slot));
        }
        self.flush_registers()?;
        let argc = n.children.len() - 1;
        self.movimm(SCRATCH_GPR, argc as u64);
        self.store64(SCRATCH_GPR, frame.outgoing(HEADER_ARG_COUNT));
        self.store64(FRAME, frame.outgoing(HEADER_CALLER_FRAME));
        self.mov(RET_GPR, FRAME);
        self.alu64(
            AluOp::Add,
            RET_GPR,
            Operand::Imm(frame.outgoing_frame_offset()),
        );
        let call_off = self.asm.push_reloc(
            Inst::Call { target: 0 },
            RelocKind::Abs(AbsTarget::Thunk(ThunkId::VirtualCall)),
        );
        self.call_sites.push(CallRecord {
            call_off,
            origin: n.origin,
        });
        self.exception_check();
        let res = self.call_result_gpr()?;
        Ok(self.gpr_result(res.reg(), DataFormat::JS)?)
    }

    pub(super) fn compile_switch(&mut self, data: &SwitchData) -> Result<(), LowerError> {
        self.switches.push(self.cur);
        let e = self.g.nodes[self.cur].child(0);
        let table = data.table;
        match data.kind {
            SwitchKind::Imm if matches!(e.use_kind, UseKind::Int32 | UseKind::KnownInt32) => {
                let (min, len) = {
                    let tables = self.plan.code_block.tables();
                    let t = tables.imm.get(table).ok_or_else(|| {
                        CompilationError::General(format!("No jump table {table}"))
                    })?;
                    (t.min, t.len)
                };
                let len = i32::try_from(len).map_err(|_| {
                    CompilationError::LimitExceeded(format!("Jump table {table} is too big"))
                })?;
                let table16 = u16::try_from(table).map_err(|_| {
                    CompilationError::LimitExceeded(format!("Too many jump tables ({table})"))
                })?;
                let v = self.fill_int(e)?;
                self.mov(SCRATCH_GPR, v.gpr());
                self.alu32(AluOp::Sub, SCRATCH_GPR, Operand::Imm(min));
                self.cmp32(SCRATCH_GPR, Operand::Imm(len));
                let l = self.block_labels[data.fallthrough];
                self.jcc_label(Cc::AE, l);
                self.emit(Inst::JmpTable {
                    table: table16,
                    index: SCRATCH_GPR,
                });
            }
            SwitchKind::Imm | SwitchKind::String => {
                let h = match data.kind {
                    SwitchKind::Imm => HelperId::SwitchImm,
                    SwitchKind::String => HelperId::SwitchString,
                };
                let j = self.fill_js(e)?;
                self.call_helper(h, &[CallArg::Imm(table as u64), CallArg::Gpr(j.gpr())])?;
                self.emit(Inst::JmpReg { src: RET_GPR });
            }
        }
        Ok(())
    }

    pub(super) fn compile_return(&mut self) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        match n.children.first() {
            Some(e) => {
                let j = self.fill_js(*e)?;
                self.mov(RET_GPR, j.gpr());
            }
            None => {
                self.movimm(RET_GPR, VALUE_UNDEFINED);
            }
        }
        self.emit(Inst::Ret);
        Ok(())
    }

    pub(super) fn compile_throw(&mut self) -> Result<(), LowerError> {
        let e = self.g.nodes[self.cur].child(0);
        let j = self.fill_js(e)?;
        self.call_helper(HelperId::Throw, &[CallArg::Gpr(j.gpr())])?;
        let l = self.exception_label;
        self.jmp_label(l);
        Ok(())
    }

    /// Record that, on entry, every argument is in its frame slot. Until the argument checks
    /// have run nothing is known about an argument beyond it being boxed.
    pub(crate) fn begin_entry(&mut self) {
        let g = self.g;
        self.events.append(VariableEvent::Reset);
        for v in &g.arguments {
            self.events.append(VariableEvent::SetLocal {
                operand: g.variables[*v].operand,
                format: DataFormat::JS,
            });
        }
    }

    /// Check that every argument has the type its flush format promises.
    pub(crate) fn compile_argument_checks(&mut self) {
        let g = self.g;
        let Some(first) = g.blocks.first().and_then(|b| b.nodes.first()) else {
            return;
        };
        self.cur = *first;
        for v in &g.arguments {
            let var = &g.variables[*v];
            let addr = Self::frame_addr(var.operand);
            match var.flush_format {
                FlushFormat::Int32 => {
                    self.load64(SCRATCH_GPR, addr);
                    self.cmp64(SCRATCH_GPR, TAG_TYPE_NUMBER_REG);
                    self.speculation_check(ExitKind::ArgumentTypeCheck, Cc::B);
                }
                FlushFormat::Boolean => {
                    self.load64(SCRATCH_GPR, addr);
                    self.alu64(AluOp::Xor, SCRATCH_GPR, Operand::Imm(VALUE_FALSE as i32));
                    self.test64(SCRATCH_GPR, Operand::Imm(!1));
                    self.speculation_check(ExitKind::ArgumentTypeCheck, Cc::NE);
                }
                FlushFormat::Cell => {
                    self.load64(SCRATCH_GPR, addr);
                    self.test64(SCRATCH_GPR, TAG_MASK_REG);
                    self.speculation_check(ExitKind::ArgumentTypeCheck, Cc::NE);
                }
                FlushFormat::JSValue | FlushFormat::Double => (),
            }
        }
        for v in &g.arguments {
            let var = &g.variables[*v];
            let format = flush_data_format(var.flush_format);
            if format != DataFormat::JS {
                self.events.append(VariableEvent::SetLocal {
                    operand: var.operand,
                    format,
                });
            }
        }
    }
}
