//! Conversions between integer, double and boxed representations.

use super::{CallArg, SpeculativeJit};
use crate::compile::{
    LowerError,
    gen_info::DataFormat,
    graph::UseKind,
    machine::{
        Cc, DAluOp, Inst, Operand,
        abi::{HelperId, SCRATCH_FPR, SCRATCH_GPR, TAG_TYPE_NUMBER_REG},
    },
    osr_exit::ExitKind,
    spec_type::SpecType,
    variable_event::ValueRecovery,
};

impl SpeculativeJit<'_> {
    pub(super) fn compile_value_to_int32(&mut self) -> Result<(), LowerError> {
        let a = self.g.nodes[self.cur].child(0);
        match a.use_kind {
            UseKind::Int32 | UseKind::KnownInt32 => {
                let op = self.fill_int(a)?;
                let res = self.alloc_gpr()?;
                self.emit(Inst::Zext32 {
                    dst: res.reg(),
                    src: op.gpr(),
                });
                Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
            }
            UseKind::Number => {
                let f = self.fill_double(a)?;
                let res = self.alloc_gpr()?;
                let slow = self.asm.mk_label();
                let done = self.asm.mk_label();
                self.emit(Inst::CvtTDToI32 {
                    dst: res.reg(),
                    src: f.fpr(),
                });
                // Out of range truncations produce `i32::MIN`.
                self.cmp32(res.reg(), Operand::Imm(i32::MIN));
                self.jcc_label(Cc::E, slow);
                self.asm.attach_label(done);
                let (fr, rr) = (f.fpr(), res.reg());
                self.add_slow_path(
                    slow,
                    done,
                    &[rr],
                    Box::new(move |jit, silent| {
                        jit.slow_path_call(silent, HelperId::ToInt32, &[CallArg::Fpr(fr)], Some(rr))
                    }),
                );
                Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
            }
            _ => {
                let j = self.fill_js(a)?;
                let res = self.alloc_gpr()?;
                let slow = self.asm.mk_label();
                let done = self.asm.mk_label();
                self.cmp64(j.gpr(), TAG_TYPE_NUMBER_REG);
                self.jcc_label(Cc::B, slow);
                self.emit(Inst::Zext32 {
                    dst: res.reg(),
                    src: j.gpr(),
                });
                self.asm.attach_label(done);
                let (jr, rr) = (j.gpr(), res.reg());
                self.add_slow_path(
                    slow,
                    done,
                    &[rr],
                    Box::new(move |jit, silent| {
                        jit.slow_path_call(
                            silent,
                            HelperId::ToInt32Generic,
                            &[CallArg::Gpr(jr)],
                            Some(rr),
                        )
                    }),
                );
                Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
            }
        }
    }

    /// Reinterpret an int32 as unsigned.
    pub(super) fn compile_uint32_to_number(&mut self) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let a = n.child(0);
        let op = self.fill_int(a)?;
        if n.can_truncate() {
            let res = self.alloc_gpr()?;
            self.emit(Inst::Zext32 {
                dst: res.reg(),
                src: op.gpr(),
            });
            return Ok(self.gpr_result(res.reg(), DataFormat::Int32)?);
        }
        if !n.prediction.is_empty() && n.prediction.is_subset_of(SpecType::INT32) {
            let res = self.alloc_gpr()?;
            self.emit(Inst::Zext32 {
                dst: res.reg(),
                src: op.gpr(),
            });
            self.test32(res.reg(), res.reg());
            let x = self.speculation_check(ExitKind::Overflow, Cc::S);
            self.convert_to_forward(x, ValueRecovery::Uint32InGpr(res.reg()));
            return Ok(self.gpr_result(res.reg(), DataFormat::Int32)?);
        }
        let res = self.alloc_fpr()?;
        let done = self.asm.mk_label();
        self.emit(Inst::CvtI32ToD {
            dst: res.reg(),
            src: op.gpr(),
        });
        self.test32(op.gpr(), op.gpr());
        self.jcc_label(Cc::NS, done);
        self.load_double_constant(SCRATCH_FPR, 4294967296.0);
        self.emit(Inst::DAlu {
            op: DAluOp::Add,
            dst: res.reg(),
            src: SCRATCH_FPR,
        });
        self.asm.attach_label(done);
        Ok(self.fpr_result(res.reg())?)
    }

    pub(super) fn compile_int32_to_double(&mut self) -> Result<(), LowerError> {
        let a = self.g.nodes[self.cur].child(0);
        let f = self.fill_double(a)?;
        let res = self.alloc_fpr()?;
        self.dmov(res.reg(), f.fpr());
        Ok(self.fpr_result(res.reg())?)
    }

    /// Convert a double to an int32, exiting if that loses information.
    pub(super) fn compile_double_as_int32(&mut self) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let a = n.child(0);
        let f = self.fill_double(a)?;
        let res = self.alloc_gpr()?;
        self.emit(Inst::CvtTDToI32 {
            dst: res.reg(),
            src: f.fpr(),
        });
        self.emit(Inst::CvtI32ToD {
            dst: SCRATCH_FPR,
            src: res.reg(),
        });
        self.emit(Inst::DCmp {
            lhs: f.fpr(),
            rhs: SCRATCH_FPR,
        });
        let x = self.speculation_check(ExitKind::Overflow, Cc::DNeOrUnordered);
        if n.needs_neg_zero_check() {
            let done = self.asm.mk_label();
            self.test32(res.reg(), res.reg());
            self.jcc_label(Cc::NE, done);
            self.emit(Inst::MovDToG {
                dst: SCRATCH_GPR,
                src: f.fpr(),
            });
            self.test64(SCRATCH_GPR, SCRATCH_GPR);
            self.jcc_exit(Cc::S, x);
            self.asm.attach_label(done);
        }
        self.convert_to_forward(x, ValueRecovery::InFpr(f.fpr()));
        Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
    }
}

