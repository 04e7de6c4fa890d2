//! Arithmetic and bitwise operations.

use super::{CallArg, SpeculativeJit};
use crate::compile::{
    LowerError,
    gen_info::DataFormat,
    graph::{Edge, UseKind},
    machine::{
        AluOp, Cc, DAluOp, DUnaryOp, Gpr, Inst, Operand,
        abi::{GenericArithOp, HelperId, SCRATCH_GPR},
    },
    osr_exit::{ExitKind, SpeculationRecovery},
    regalloc::RegLock,
};

/// How a binary arithmetic node is lowered, decided by its children's use kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ArithMode {
    Int32,
    Number,
    Generic,
}

fn is_int(e: Edge) -> bool {
    matches!(e.use_kind, UseKind::Int32 | UseKind::KnownInt32)
}

fn arith_mode(a: Edge, b: Edge) -> ArithMode {
    if is_int(a) && is_int(b) {
        ArithMode::Int32
    } else if (is_int(a) || a.use_kind == UseKind::Number)
        && (is_int(b) || b.use_kind == UseKind::Number)
    {
        ArithMode::Number
    } else {
        ArithMode::Generic
    }
}

impl SpeculativeJit<'_> {
    fn binary_children(&self) -> (Edge, Edge) {
        let g = self.g;
        let n = &g.nodes[self.cur];
        (n.child(0), n.child(1))
    }

    /// A register for a 32-bit result computed from `e`'s value in `op`: `op`'s own register if
    /// this is its last use, otherwise a fresh register holding a copy. Returns `true` in the
    /// first case.
    fn int_result_from(
        &mut self,
        e: Edge,
        op: &super::GprOperand,
    ) -> Result<(RegLock<Gpr>, bool), LowerError> {
        if self.can_reuse(e) {
            Ok((op.reuse(), true))
        } else {
            let r = self.alloc_gpr()?;
            self.mov(r.reg(), op.gpr());
            Ok((r, false))
        }
    }

    /// The right-hand operand of an int32 operation: an immediate if `e` is an int32 constant.
    fn int_rhs(&mut self, e: Edge) -> Result<(Operand, Option<super::GprOperand>), LowerError> {
        match self.g.as_int32_constant(e.node) {
            Some(c) => Ok((Operand::Imm(c), None)),
            None => {
                let op = self.fill_int(e)?;
                Ok((Operand::Reg(op.gpr()), Some(op)))
            }
        }
    }

    fn compile_double_binop(&mut self, op: DAluOp, a: Edge, b: Edge) -> Result<(), LowerError> {
        let fa = self.fill_double(a)?;
        let fb = self.fill_double(b)?;
        let res = if self.can_reuse(a) && fa.fpr() != fb.fpr() {
            fa.reuse()
        } else {
            let r = self.alloc_fpr()?;
            self.dmov(r.reg(), fa.fpr());
            r
        };
        self.emit(Inst::DAlu {
            op,
            dst: res.reg(),
            src: fb.fpr(),
        });
        Ok(self.fpr_result(res.reg())?)
    }

    fn compile_double_unop(&mut self, op: DUnaryOp, a: Edge) -> Result<(), LowerError> {
        let fa = self.fill_double(a)?;
        let res = self.alloc_fpr()?;
        self.emit(Inst::DUnary {
            op,
            dst: res.reg(),
            src: fa.fpr(),
        });
        Ok(self.fpr_result(res.reg())?)
    }

    /// Call a generic arithmetic helper on two boxed values.
    fn compile_generic_arith(&mut self, op: Option<GenericArithOp>) -> Result<(), LowerError> {
        let (a, b) = self.binary_children();
        let ja = self.fill_js(a)?;
        let jb = self.fill_js(b)?;
        match op {
            None => self.call_helper(
                HelperId::ValueAdd,
                &[CallArg::Gpr(ja.gpr()), CallArg::Gpr(jb.gpr())],
            )?,
            Some(op) => self.call_helper(
                HelperId::ValueArith,
                &[
                    CallArg::Gpr(ja.gpr()),
                    CallArg::Gpr(jb.gpr()),
                    CallArg::Imm(op as u64),
                ],
            )?,
        }
        drop((ja, jb));
        let res = self.call_result_gpr()?;
        Ok(self.gpr_result(res.reg(), DataFormat::JS)?)
    }

    pub(super) fn compile_add(&mut self) -> Result<(), LowerError> {
        let (a, b) = self.binary_children();
        match arith_mode(a, b) {
            ArithMode::Int32 => {
                let truncate = self.g.nodes[self.cur].can_truncate();
                // Addition commutes: prefer an immediate on the right.
                let (a, b) = if self.g.as_int32_constant(a.node).is_some()
                    && self.g.as_int32_constant(b.node).is_none()
                {
                    (b, a)
                } else {
                    (a, b)
                };
                let op1 = self.fill_int(a)?;
                let (src, _op2) = self.int_rhs(b)?;
                let (res, reused) = self.int_result_from(a, &op1)?;
                self.alu32(AluOp::Add, res.reg(), src);
                if !truncate {
                    if reused {
                        self.speculation_check_with_recovery(
                            ExitKind::Overflow,
                            Cc::O,
                            SpeculationRecovery::SpeculativeAdd {
                                dst: res.reg(),
                                src,
                            },
                        );
                    } else {
                        self.speculation_check(ExitKind::Overflow, Cc::O);
                    }
                }
                Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
            }
            ArithMode::Number => self.compile_double_binop(DAluOp::Add, a, b),
            ArithMode::Generic => self.compile_generic_arith(None),
        }
    }

    pub(super) fn compile_sub(&mut self) -> Result<(), LowerError> {
        let (a, b) = self.binary_children();
        match arith_mode(a, b) {
            ArithMode::Int32 => {
                let truncate = self.g.nodes[self.cur].can_truncate();
                let op1 = self.fill_int(a)?;
                let (src, _op2) = self.int_rhs(b)?;
                let res = if truncate {
                    self.int_result_from(a, &op1)?.0
                } else {
                    let r = self.alloc_gpr()?;
                    self.mov(r.reg(), op1.gpr());
                    r
                };
                self.alu32(AluOp::Sub, res.reg(), src);
                if !truncate {
                    self.speculation_check(ExitKind::Overflow, Cc::O);
                }
                Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
            }
            ArithMode::Number => self.compile_double_binop(DAluOp::Sub, a, b),
            ArithMode::Generic => self.compile_generic_arith(Some(GenericArithOp::Sub)),
        }
    }

    pub(super) fn compile_mul(&mut self) -> Result<(), LowerError> {
        let (a, b) = self.binary_children();
        match arith_mode(a, b) {
            ArithMode::Int32 => {
                let g = self.g;
                let n = &g.nodes[self.cur];
                let truncate = n.can_truncate();
                let neg_zero = n.needs_neg_zero_check() && !truncate;
                let op1 = self.fill_int(a)?;
                let (src, _op2) = self.int_rhs(b)?;
                let res = self.alloc_gpr()?;
                self.mov(res.reg(), op1.gpr());
                self.alu32(AluOp::Mul, res.reg(), src);
                if !truncate {
                    self.speculation_check(ExitKind::Overflow, Cc::O);
                }
                if neg_zero {
                    // A zero result is -0 if either operand was negative.
                    let done = self.asm.mk_label();
                    self.test32(res.reg(), res.reg());
                    self.jcc_label(Cc::NE, done);
                    self.mov(SCRATCH_GPR, op1.gpr());
                    self.alu32(AluOp::Or, SCRATCH_GPR, src);
                    self.speculation_check(ExitKind::NegativeZero, Cc::S);
                    self.asm.attach_label(done);
                }
                Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
            }
            ArithMode::Number => self.compile_double_binop(DAluOp::Mul, a, b),
            ArithMode::Generic => self.compile_generic_arith(Some(GenericArithOp::Mul)),
        }
    }

    pub(super) fn compile_negate(&mut self) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let a = n.child(0);
        match a.use_kind {
            UseKind::Int32 | UseKind::KnownInt32 => {
                let truncate = n.can_truncate();
                let neg_zero = n.needs_neg_zero_check() && !truncate;
                let op1 = self.fill_int(a)?;
                let res = self.alloc_gpr()?;
                self.mov(res.reg(), op1.gpr());
                self.emit(Inst::Neg32 { dst: res.reg() });
                if !truncate {
                    self.speculation_check(ExitKind::Overflow, Cc::O);
                }
                if neg_zero {
                    self.test32(res.reg(), res.reg());
                    self.speculation_check(ExitKind::NegativeZero, Cc::E);
                }
                Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
            }
            UseKind::Number => self.compile_double_unop(DUnaryOp::Neg, a),
            _ => {
                let ja = self.fill_js(a)?;
                self.call_helper(
                    HelperId::ValueArith,
                    &[
                        CallArg::Gpr(ja.gpr()),
                        CallArg::Gpr(ja.gpr()),
                        CallArg::Imm(GenericArithOp::Negate as u64),
                    ],
                )?;
                drop(ja);
                let res = self.call_result_gpr()?;
                Ok(self.gpr_result(res.reg(), DataFormat::JS)?)
            }
        }
    }

    /// Guard against a zero divisor and `INT_MIN / -1` for non-truncating division and
    /// remainder.
    fn int_division_guards(&mut self, dividend: Gpr, divisor: Gpr) {
        self.test32(divisor, divisor);
        let x = self.speculation_check(ExitKind::Overflow, Cc::E);
        let ok = self.asm.mk_label();
        self.cmp32(divisor, Operand::Imm(-1));
        self.jcc_label(Cc::NE, ok);
        self.cmp32(dividend, Operand::Imm(i32::MIN));
        self.jcc_exit(Cc::E, x);
        self.asm.attach_label(ok);
    }

    pub(super) fn compile_div(&mut self) -> Result<(), LowerError> {
        let (a, b) = self.binary_children();
        match arith_mode(a, b) {
            ArithMode::Int32 => {
                let g = self.g;
                let n = &g.nodes[self.cur];
                let truncate = n.can_truncate();
                let neg_zero = n.needs_neg_zero_check() && !truncate;
                let op1 = self.fill_int(a)?;
                let op2 = self.fill_int(b)?;
                let (x, y) = (op1.gpr(), op2.gpr());
                let res = self.alloc_gpr()?;
                let r = res.reg();
                if truncate {
                    // (x / 0) | 0 == 0 and (x / -1) | 0 == -x, wrapping.
                    let nonzero = self.asm.mk_label();
                    let do_div = self.asm.mk_label();
                    let done = self.asm.mk_label();
                    self.test32(y, y);
                    self.jcc_label(Cc::NE, nonzero);
                    self.movimm(r, 0);
                    self.jmp_label(done);
                    self.asm.attach_label(nonzero);
                    self.cmp32(y, Operand::Imm(-1));
                    self.jcc_label(Cc::NE, do_div);
                    self.mov(r, x);
                    self.emit(Inst::Neg32 { dst: r });
                    self.jmp_label(done);
                    self.asm.attach_label(do_div);
                    self.mov(r, x);
                    self.emit(Inst::Div32 {
                        rem: false,
                        dst: r,
                        src: y,
                    });
                    self.asm.attach_label(done);
                } else {
                    self.int_division_guards(x, y);
                    if neg_zero {
                        // 0 / negative is -0.
                        let nz = self.asm.mk_label();
                        self.test32(x, x);
                        self.jcc_label(Cc::NE, nz);
                        self.test32(y, y);
                        self.speculation_check(ExitKind::NegativeZero, Cc::S);
                        self.asm.attach_label(nz);
                    }
                    self.mov(r, x);
                    self.emit(Inst::Div32 {
                        rem: false,
                        dst: r,
                        src: y,
                    });
                    // The result must be exact to be an int32.
                    self.mov(SCRATCH_GPR, x);
                    self.emit(Inst::Div32 {
                        rem: true,
                        dst: SCRATCH_GPR,
                        src: y,
                    });
                    self.test32(SCRATCH_GPR, SCRATCH_GPR);
                    self.speculation_check(ExitKind::Overflow, Cc::NE);
                }
                Ok(self.gpr_result(r, DataFormat::Int32)?)
            }
            ArithMode::Number => self.compile_double_binop(DAluOp::Div, a, b),
            ArithMode::Generic => self.compile_generic_arith(Some(GenericArithOp::Div)),
        }
    }

    pub(super) fn compile_mod(&mut self) -> Result<(), LowerError> {
        let (a, b) = self.binary_children();
        match arith_mode(a, b) {
            ArithMode::Int32 => {
                let g = self.g;
                let n = &g.nodes[self.cur];
                let truncate = n.can_truncate();
                let neg_zero = n.needs_neg_zero_check() && !truncate;
                let op1 = self.fill_int(a)?;
                let op2 = self.fill_int(b)?;
                let (x, y) = (op1.gpr(), op2.gpr());
                let res = self.alloc_gpr()?;
                let r = res.reg();
                if truncate {
                    // (x % 0) | 0 == 0 and x % -1 is always (possibly negative) zero.
                    let do_rem = self.asm.mk_label();
                    let zero = self.asm.mk_label();
                    let done = self.asm.mk_label();
                    self.test32(y, y);
                    self.jcc_label(Cc::E, zero);
                    self.cmp32(y, Operand::Imm(-1));
                    self.jcc_label(Cc::NE, do_rem);
                    self.asm.attach_label(zero);
                    self.movimm(r, 0);
                    self.jmp_label(done);
                    self.asm.attach_label(do_rem);
                    self.mov(r, x);
                    self.emit(Inst::Div32 {
                        rem: true,
                        dst: r,
                        src: y,
                    });
                    self.asm.attach_label(done);
                } else {
                    self.int_division_guards(x, y);
                    self.mov(r, x);
                    self.emit(Inst::Div32 {
                        rem: true,
                        dst: r,
                        src: y,
                    });
                    if neg_zero {
                        // A zero remainder of a negative dividend is -0.
                        let done = self.asm.mk_label();
                        self.test32(r, r);
                        self.jcc_label(Cc::NE, done);
                        self.test32(x, x);
                        self.speculation_check(ExitKind::NegativeZero, Cc::S);
                        self.asm.attach_label(done);
                    }
                }
                Ok(self.gpr_result(r, DataFormat::Int32)?)
            }
            ArithMode::Number => {
                let fa = self.fill_double(a)?;
                let fb = self.fill_double(b)?;
                self.call_helper(
                    HelperId::FMod,
                    &[CallArg::Fpr(fa.fpr()), CallArg::Fpr(fb.fpr())],
                )?;
                drop((fa, fb));
                let res = self.call_result_fpr()?;
                Ok(self.fpr_result(res.reg())?)
            }
            ArithMode::Generic => self.compile_generic_arith(Some(GenericArithOp::Mod)),
        }
    }

    pub(super) fn compile_abs(&mut self) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let a = n.child(0);
        if !is_int(a) {
            return self.compile_double_unop(DUnaryOp::Abs, a);
        }
        let truncate = n.can_truncate();
        let op1 = self.fill_int(a)?;
        let res = self.alloc_gpr()?;
        let r = res.reg();
        // abs(x) == (x + (x >> 31)) ^ (x >> 31).
        self.mov(r, op1.gpr());
        self.mov(SCRATCH_GPR, op1.gpr());
        self.alu32(AluOp::Sar, SCRATCH_GPR, Operand::Imm(31));
        self.alu32(AluOp::Add, r, SCRATCH_GPR);
        self.alu32(AluOp::Xor, r, SCRATCH_GPR);
        if !truncate {
            // abs(INT_MIN) does not fit.
            self.test32(r, r);
            self.speculation_check(ExitKind::Overflow, Cc::S);
        }
        Ok(self.gpr_result(r, DataFormat::Int32)?)
    }

    pub(super) fn compile_min_max(&mut self, is_min: bool) -> Result<(), LowerError> {
        let (a, b) = self.binary_children();
        if arith_mode(a, b) != ArithMode::Int32 {
            let op = if is_min { DAluOp::Min } else { DAluOp::Max };
            return self.compile_double_binop(op, a, b);
        }
        let op1 = self.fill_int(a)?;
        let op2 = self.fill_int(b)?;
        let res = self.alloc_gpr()?;
        let r = res.reg();
        let done = self.asm.mk_label();
        self.emit(Inst::Zext32 {
            dst: r,
            src: op1.gpr(),
        });
        self.cmp32(op1.gpr(), op2.gpr());
        self.jcc_label(if is_min { Cc::LE } else { Cc::GE }, done);
        self.emit(Inst::Zext32 {
            dst: r,
            src: op2.gpr(),
        });
        self.asm.attach_label(done);
        Ok(self.gpr_result(r, DataFormat::Int32)?)
    }

    pub(super) fn compile_sqrt(&mut self) -> Result<(), LowerError> {
        let a = self.g.nodes[self.cur].child(0);
        self.compile_double_unop(DUnaryOp::Sqrt, a)
    }

    /// Bitwise operations and shifts. Both children are int32s: anything else has already been
    /// converted upstream with `ValueToInt32`.
    pub(super) fn compile_bitop(&mut self, op: AluOp) -> Result<(), LowerError> {
        let (a, b) = self.binary_children();
        let is_shift = matches!(op, AluOp::Shl | AluOp::Sar | AluOp::Shr);
        let op1 = self.fill_int(a)?;
        let (src, _op2) = match self.g.as_int32_constant(b.node) {
            Some(c) if is_shift => (Operand::Imm(c & 31), None),
            _ => self.int_rhs(b)?,
        };
        let (res, _) = self.int_result_from(a, &op1)?;
        self.alu32(op, res.reg(), src);
        Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
    }
}
