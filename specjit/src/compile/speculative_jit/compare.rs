//! Comparisons, logical not and conditional branches.
//!
//! A compare whose only user is the `Branch` immediately after it is fused with that branch: the
//! flags it sets are branched on directly and no boolean is ever materialised.

use super::{CallArg, GprOperand, SpeculativeJit};
use crate::{
    compile::{
        LowerError,
        gen_info::DataFormat,
        graph::{BlockIdx, Edge, Op, UseKind},
        machine::{
            Addr, AluOp, Cc, Fpr, Gpr, Inst, Operand, Width,
            abi::{
                CELL_STRUCTURE, CellType, GenericCompareOp, HelperId, RET_GPR, SCRATCH_FPR,
                SCRATCH_GPR, STRUCTURE_TYPE_FLAGS, TAG_MASK_REG, TYPE_FLAG_MASQUERADES_AS_UNDEFINED,
            },
        },
        osr_exit::ExitKind,
        regalloc::RegLock,
    },
    value::{TAG_BIT_UNDEFINED, VALUE_FALSE, VALUE_NULL},
};

fn is_int(e: Edge) -> bool {
    matches!(e.use_kind, UseKind::Int32 | UseKind::KnownInt32)
}

fn is_number(e: Edge) -> bool {
    is_int(e) || e.use_kind == UseKind::Number
}

fn int_cc(op: &Op) -> Cc {
    match op {
        Op::CompareLess => Cc::L,
        Op::CompareLessEq => Cc::LE,
        Op::CompareGreater => Cc::G,
        Op::CompareGreaterEq => Cc::GE,
        _ => Cc::E,
    }
}

/// Doubles compare false whenever either side is NaN, which these conditions all honour.
fn double_cc(op: &Op) -> Cc {
    match op {
        Op::CompareLess => Cc::DLt,
        Op::CompareLessEq => Cc::DLe,
        Op::CompareGreater => Cc::DGt,
        Op::CompareGreaterEq => Cc::DGe,
        _ => Cc::DEq,
    }
}

fn generic_op(op: &Op) -> GenericCompareOp {
    match op {
        Op::CompareLess => GenericCompareOp::Less,
        Op::CompareLessEq => GenericCompareOp::LessEq,
        Op::CompareGreater => GenericCompareOp::Greater,
        Op::CompareGreaterEq => GenericCompareOp::GreaterEq,
        Op::CompareEq => GenericCompareOp::Eq,
        _ => GenericCompareOp::StrictEq,
    }
}

/// Where a compare's outcome goes.
enum CompareTarget {
    /// Fused with the following branch.
    Branch(BlockIdx, BlockIdx),
    /// Materialised as a boxed boolean in this register.
    Value(RegLock<Gpr>),
}

impl SpeculativeJit<'_> {
    /// If the current node's only user is a `Branch` directly after it, return the branch's
    /// targets.
    fn fusable_branch(&self) -> Option<(BlockIdx, BlockIdx)> {
        let g = self.g;
        if g.nodes[self.cur].ref_count != 1 {
            return None;
        }
        let next = *g.blocks[self.cur_block].nodes.get(self.pos + 1)?;
        match g.nodes[next].op {
            Op::Branch { taken, not_taken } if g.nodes[next].child(0).node == self.cur => {
                Some((taken, not_taken))
            }
            _ => None,
        }
    }

    fn finish_compare(&mut self, cc: Cc, target: CompareTarget) -> Result<(), LowerError> {
        match target {
            CompareTarget::Branch(taken, not_taken) => {
                self.branch_cc(cc, taken, not_taken);
                Ok(())
            }
            CompareTarget::Value(res) => {
                self.emit(Inst::SetCc { cc, dst: res.reg() });
                self.alu64(AluOp::Or, res.reg(), Operand::Imm(VALUE_FALSE as i32));
                Ok(self.gpr_result(res.reg(), DataFormat::JSBoolean)?)
            }
        }
    }

    pub(super) fn compile_compare(&mut self) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let (a, b) = (n.child(0), n.child(1));
        let is_eq = matches!(n.op, Op::CompareEq | Op::CompareStrictEq);
        let fused = self.fusable_branch();
        if fused.is_some() {
            self.skip_next = true;
        }
        let is_generic = !(is_number(a) && is_number(b))
            && !(is_eq
                && matches!(
                    (a.use_kind, b.use_kind),
                    (UseKind::Object, UseKind::Object)
                        | (UseKind::Object, UseKind::ObjectOrOther)
                        | (UseKind::ObjectOrOther, UseKind::Object)
                ));
        if is_generic {
            return self.compile_generic_compare(a, b, fused);
        }
        // Flags must survive from the compare to the `SetCc`, so allocate first.
        let target = match fused {
            Some((taken, not_taken)) => CompareTarget::Branch(taken, not_taken),
            None => CompareTarget::Value(self.alloc_gpr()?),
        };
        if is_int(a) && is_int(b) {
            let op1 = self.fill_int(a)?;
            let (rhs, _op2) = match g.as_int32_constant(b.node) {
                Some(c) => (Operand::Imm(c), None),
                None => {
                    let o = self.fill_int(b)?;
                    (Operand::Reg(o.gpr()), Some(o))
                }
            };
            self.cmp32(op1.gpr(), rhs);
            self.finish_compare(int_cc(&n.op), target)
        } else if is_number(a) && is_number(b) {
            let fa = self.fill_double(a)?;
            let fb = self.fill_double(b)?;
            self.emit(Inst::DCmp {
                lhs: fa.fpr(),
                rhs: fb.fpr(),
            });
            self.finish_compare(double_cc(&n.op), target)
        } else if is_eq && a.use_kind == UseKind::Object && b.use_kind == UseKind::Object {
            let oa = self.speculate_object(a)?;
            let ob = self.speculate_object(b)?;
            self.masquerade_guard(&[oa.gpr(), ob.gpr()]);
            self.cmp64(oa.gpr(), ob.gpr());
            self.finish_compare(Cc::E, target)
        } else if a.use_kind == UseKind::Object && b.use_kind == UseKind::ObjectOrOther {
            self.compile_object_or_other_eq(a, b, target)
        } else {
            self.compile_object_or_other_eq(b, a, target)
        }
    }

    fn compile_generic_compare(
        &mut self,
        a: Edge,
        b: Edge,
        fused: Option<(BlockIdx, BlockIdx)>,
    ) -> Result<(), LowerError> {
        let op = generic_op(&self.g.nodes[self.cur].op);
        let ja = self.fill_js(a)?;
        let jb = self.fill_js(b)?;
        self.call_helper(
            HelperId::CompareGeneric,
            &[
                CallArg::Gpr(ja.gpr()),
                CallArg::Gpr(jb.gpr()),
                CallArg::Imm(op as u64),
            ],
        )?;
        drop((ja, jb));
        match fused {
            Some((taken, not_taken)) => {
                self.test32(RET_GPR, RET_GPR);
                self.branch_cc(Cc::NE, taken, not_taken);
                Ok(())
            }
            None => {
                let res = self.call_result_gpr()?;
                self.alu64(AluOp::Or, res.reg(), Operand::Imm(VALUE_FALSE as i32));
                Ok(self.gpr_result(res.reg(), DataFormat::JSBoolean)?)
            }
        }
    }

    /// Objects that masquerade as undefined compare equal to `null` and `undefined`, so equality
    /// can only be decided by identity if none of `cells` do.
    fn masquerade_guard(&mut self, cells: &[Gpr]) {
        if self.plan.masquerades_watchpoint.is_valid() {
            self.watchpoint_check(ExitKind::UncountableWatchpoint);
            return;
        }
        for c in cells {
            self.load64(SCRATCH_GPR, Addr::base(*c, CELL_STRUCTURE));
            self.load(
                Width::B8,
                SCRATCH_GPR,
                Addr::base(SCRATCH_GPR, STRUCTURE_TYPE_FLAGS),
            );
            self.test32(
                SCRATCH_GPR,
                Operand::Imm(i32::from(TYPE_FLAG_MASQUERADES_AS_UNDEFINED)),
            );
            self.speculation_check(ExitKind::BadType, Cc::NE);
        }
    }

    /// `obj == other` where `other` is an object, `null` or `undefined`.
    fn compile_object_or_other_eq(
        &mut self,
        obj: Edge,
        other: Edge,
        target: CompareTarget,
    ) -> Result<(), LowerError> {
        let o = self.speculate_object(obj)?;
        let v = self.fill_js(other)?;
        let not_cell = self.asm.mk_label();
        let done = self.asm.mk_label();
        self.test64(v.gpr(), TAG_MASK_REG);
        self.jcc_label(Cc::NE, not_cell);
        self.check_cell_type(v.gpr(), CellType::String, false, ExitKind::BadType);
        self.masquerade_guard(&[o.gpr(), v.gpr()]);
        self.cmp64(o.gpr(), v.gpr());
        match target {
            CompareTarget::Branch(taken, not_taken) => {
                let (lt, lnt) = (self.block_labels[taken], self.block_labels[not_taken]);
                self.jcc_label(Cc::E, lt);
                // The not-cell case follows, so this jump can never fall through.
                self.jmp_label(lnt);
                self.asm.attach_label(not_cell);
                self.other_check(&v);
                self.jump_to_block(not_taken);
                Ok(())
            }
            CompareTarget::Value(r) => {
                self.emit(Inst::SetCc {
                    cc: Cc::E,
                    dst: r.reg(),
                });
                self.jmp_label(done);
                self.asm.attach_label(not_cell);
                self.other_check(&v);
                self.movimm(r.reg(), 0);
                self.asm.attach_label(done);
                self.alu64(AluOp::Or, r.reg(), Operand::Imm(VALUE_FALSE as i32));
                Ok(self.gpr_result(r.reg(), DataFormat::JSBoolean)?)
            }
        }
    }

    /// Exit unless the non-cell in `v` is `null` or `undefined`.
    fn other_check(&mut self, v: &GprOperand) {
        self.mov(SCRATCH_GPR, v.gpr());
        self.alu64(
            AluOp::And,
            SCRATCH_GPR,
            Operand::Imm(!(TAG_BIT_UNDEFINED as i32)),
        );
        self.cmp64(SCRATCH_GPR, Operand::Imm(VALUE_NULL as i32));
        self.speculation_check(ExitKind::BadType, Cc::NE);
    }

    /// Set the flags from comparing the double in `f` against zero.
    fn double_zero_compare(&mut self, f: Fpr) {
        self.movimm(SCRATCH_GPR, 0);
        self.emit(Inst::MovGToD {
            dst: SCRATCH_FPR,
            src: SCRATCH_GPR,
        });
        self.emit(Inst::DCmp {
            lhs: f,
            rhs: SCRATCH_FPR,
        });
    }

    pub(super) fn compile_logical_not(&mut self) -> Result<(), LowerError> {
        let a = self.g.nodes[self.cur].child(0);
        match a.use_kind {
            UseKind::Boolean => {
                let res = self.alloc_gpr()?;
                let op = self.fill_boolean(a)?;
                self.mov(res.reg(), op.gpr());
                self.alu64(AluOp::Xor, res.reg(), Operand::Imm(1));
                if op.format() == DataFormat::Boolean {
                    self.alu64(AluOp::Or, res.reg(), Operand::Imm(VALUE_FALSE as i32));
                }
                Ok(self.gpr_result(res.reg(), DataFormat::JSBoolean)?)
            }
            UseKind::Int32 | UseKind::KnownInt32 => {
                let res = self.alloc_gpr()?;
                let op = self.fill_int(a)?;
                self.test32(op.gpr(), op.gpr());
                self.emit(Inst::SetCc {
                    cc: Cc::E,
                    dst: res.reg(),
                });
                self.alu64(AluOp::Or, res.reg(), Operand::Imm(VALUE_FALSE as i32));
                Ok(self.gpr_result(res.reg(), DataFormat::JSBoolean)?)
            }
            UseKind::Number => {
                let res = self.alloc_gpr()?;
                let f = self.fill_double(a)?;
                self.double_zero_compare(f.fpr());
                // Both zero and NaN are falsy.
                self.emit(Inst::SetCc {
                    cc: Cc::DEq,
                    dst: res.reg(),
                });
                self.emit(Inst::SetCc {
                    cc: Cc::DUnordered,
                    dst: SCRATCH_GPR,
                });
                self.alu64(AluOp::Or, res.reg(), SCRATCH_GPR);
                self.alu64(AluOp::Or, res.reg(), Operand::Imm(VALUE_FALSE as i32));
                Ok(self.gpr_result(res.reg(), DataFormat::JSBoolean)?)
            }
            _ => {
                let j = self.fill_js(a)?;
                self.call_helper(HelperId::ToBoolean, &[CallArg::Gpr(j.gpr())])?;
                drop(j);
                let res = self.call_result_gpr()?;
                self.alu64(AluOp::Xor, res.reg(), Operand::Imm(1));
                self.alu64(AluOp::Or, res.reg(), Operand::Imm(VALUE_FALSE as i32));
                Ok(self.gpr_result(res.reg(), DataFormat::JSBoolean)?)
            }
        }
    }

    pub(super) fn compile_branch(
        &mut self,
        taken: BlockIdx,
        not_taken: BlockIdx,
    ) -> Result<(), LowerError> {
        let a = self.g.nodes[self.cur].child(0);
        match a.use_kind {
            UseKind::Boolean => {
                let op = self.fill_boolean(a)?;
                self.test32(op.gpr(), Operand::Imm(1));
                self.branch_cc(Cc::NE, taken, not_taken);
            }
            UseKind::Int32 | UseKind::KnownInt32 => {
                let op = self.fill_int(a)?;
                self.test32(op.gpr(), op.gpr());
                self.branch_cc(Cc::NE, taken, not_taken);
            }
            UseKind::Number => {
                let f = self.fill_double(a)?;
                self.double_zero_compare(f.fpr());
                let l = self.block_labels[not_taken];
                self.jcc_label(Cc::DEq, l);
                self.jcc_label(Cc::DUnordered, l);
                self.jump_to_block(taken);
            }
            _ => {
                let j = self.fill_js(a)?;
                self.call_helper(HelperId::ToBoolean, &[CallArg::Gpr(j.gpr())])?;
                drop(j);
                self.test32(RET_GPR, RET_GPR);
                self.branch_cc(Cc::NE, taken, not_taken);
            }
        }
        Ok(())
    }
}
