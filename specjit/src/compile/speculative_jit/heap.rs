//! Heap accesses: structure and array checks, indexed and named property access, strings and
//! `instanceof`.

use super::{CallArg, GprOperand, IcRecord, SpeculativeJit};
use crate::{
    compile::{
        CompilationError, LowerError,
        compiled_code::IcKind,
        gen_info::DataFormat,
        graph::{ArrayMode, IdentIdx, UseKind},
        machine::{
            Addr, AluOp, Cc, Gpr, Inst, Operand, Width,
            abi::{
                BUTTERFLY_PUBLIC_LENGTH, CELL_INLINE_STORAGE, CELL_LENGTH, CELL_STORAGE,
                CELL_STRUCTURE, CellType, HelperId, INDEXING_CONTIGUOUS, INDEXING_DOUBLE,
                INDEXING_SHAPE_MASK, SCRATCH_GPR, STRUCTURE_INDEXING_TYPE, STRUCTURE_PROTOTYPE,
                STRUCTURE_TYPE_FLAGS, TAG_MASK_REG, TYPE_FLAG_IMPLEMENTS_DEFAULT_HAS_INSTANCE,
                TYPE_FLAG_INTERCEPTS_INDEXING, VM_SINGLE_CHAR_STRINGS,
            },
            asm::LabelIdx,
        },
        osr_exit::ExitKind,
        spec_type::SpecType,
    },
    value::{VALUE_FALSE, VALUE_TRUE},
};

/// The indexing shape a butterfly array mode requires.
fn indexing_shape(mode: ArrayMode) -> Option<u8> {
    match mode {
        ArrayMode::Contiguous => Some(INDEXING_CONTIGUOUS),
        ArrayMode::Double => Some(INDEXING_DOUBLE),
        _ => None,
    }
}

fn cell_type(mode: ArrayMode) -> Option<CellType> {
    match mode {
        ArrayMode::Int32Array => Some(CellType::Int32Array),
        ArrayMode::Float64Array => Some(CellType::Float64Array),
        ArrayMode::String => Some(CellType::String),
        _ => None,
    }
}

fn not_lowered_here(mode: ArrayMode) -> LowerError {
    CompilationError::InternalError(format!("{mode} accesses are lowered elsewhere")).into()
}

impl SpeculativeJit<'_> {
    /// Load the indexing shape of the object in `cell` into the scratch register and compare it
    /// against `shape`.
    fn cmp_indexing_shape(&mut self, cell: Gpr, shape: u8) {
        self.load64(SCRATCH_GPR, Addr::base(cell, CELL_STRUCTURE));
        self.load(
            Width::B8,
            SCRATCH_GPR,
            Addr::base(SCRATCH_GPR, STRUCTURE_INDEXING_TYPE),
        );
        self.alu32(
            AluOp::And,
            SCRATCH_GPR,
            Operand::Imm(i32::from(INDEXING_SHAPE_MASK)),
        );
        self.cmp32(SCRATCH_GPR, Operand::Imm(i32::from(shape)));
    }

    /// Test the type flags of the object in `cell` against `flags`.
    fn test_type_flags(&mut self, cell: Gpr, flags: u8) {
        self.load64(SCRATCH_GPR, Addr::base(cell, CELL_STRUCTURE));
        self.load(
            Width::B8,
            SCRATCH_GPR,
            Addr::base(SCRATCH_GPR, STRUCTURE_TYPE_FLAGS),
        );
        self.test32(SCRATCH_GPR, Operand::Imm(i32::from(flags)));
    }

    pub(super) fn compile_check_structure(&mut self, set: &[u64]) -> Result<(), LowerError> {
        let base = self.g.nodes[self.cur].child(0);
        if self.state.is_structure_checked(base.node, set) {
            return Ok(());
        }
        if set.is_empty() {
            return self.terminate(ExitKind::BadCache);
        }
        let c = self.fill_cell(base)?;
        let t = self.alloc_gpr()?;
        let ok = self.asm.mk_label();
        self.load64(SCRATCH_GPR, Addr::base(c.gpr(), CELL_STRUCTURE));
        for (i, s) in set.iter().enumerate() {
            self.movimm(t.reg(), *s);
            self.cmp64(SCRATCH_GPR, t.reg());
            if i + 1 < set.len() {
                self.jcc_label(Cc::E, ok);
            } else {
                self.speculation_check(ExitKind::BadCache, Cc::NE);
            }
        }
        self.asm.attach_label(ok);
        Ok(())
    }

    pub(super) fn compile_check_array(&mut self, mode: ArrayMode) -> Result<(), LowerError> {
        let base = self.g.nodes[self.cur].child(0);
        if self.state.is_array_validated(base.node, mode) {
            return Ok(());
        }
        if !self.state.proven(base.node).intersects(mode.spec_type()) {
            return self.terminate(ExitKind::BadType);
        }
        let c = self.fill_cell(base)?;
        if let Some(shape) = indexing_shape(mode) {
            self.cmp_indexing_shape(c.gpr(), shape);
            self.speculation_check(ExitKind::BadIndexingType, Cc::NE);
        } else if let Some(ty) = cell_type(mode)
            && !self.state.proven(base.node).is_subset_of(mode.spec_type())
        {
            self.check_cell_type(c.gpr(), ty, true, ExitKind::BadType);
        }
        Ok(())
    }

    /// Make sure an object has the storage `mode` requires, converting it out of line if it
    /// does not.
    pub(super) fn compile_arrayify(&mut self, mode: ArrayMode) -> Result<(), LowerError> {
        let (shape, helper) = match mode {
            ArrayMode::Contiguous => (INDEXING_CONTIGUOUS, HelperId::EnsureContiguous),
            ArrayMode::Double => (INDEXING_DOUBLE, HelperId::EnsureDouble),
            _ => {
                return Err(CompilationError::General(format!(
                    "Cannot arrayify to {mode}"
                ))
                .into());
            }
        };
        let base = self.g.nodes[self.cur].child(0);
        let c = self.fill_cell(base)?;
        let slow = self.asm.mk_label();
        let done = self.asm.mk_label();
        self.cmp_indexing_shape(c.gpr(), shape);
        self.jcc_label(Cc::NE, slow);
        self.asm.attach_label(done);
        let cr = c.gpr();
        self.add_slow_path(
            slow,
            done,
            &[],
            Box::new(move |jit, silent| {
                jit.test_type_flags(cr, TYPE_FLAG_INTERCEPTS_INDEXING);
                jit.speculation_check(ExitKind::BadIndexingType, Cc::NE);
                jit.slow_path_call(silent, helper, &[CallArg::Gpr(cr)], Some(SCRATCH_GPR))?;
                jit.alu32(
                    AluOp::And,
                    SCRATCH_GPR,
                    Operand::Imm(i32::from(INDEXING_SHAPE_MASK)),
                );
                jit.cmp32(SCRATCH_GPR, Operand::Imm(i32::from(shape)));
                jit.speculation_check(ExitKind::BadIndexingType, Cc::NE);
                Ok(())
            }),
        );
        Ok(())
    }

    pub(super) fn compile_get_storage(&mut self, _mode: ArrayMode) -> Result<(), LowerError> {
        let base = self.g.nodes[self.cur].child(0);
        let c = self.fill_cell(base)?;
        let res = self.alloc_gpr()?;
        self.load64(res.reg(), Addr::base(c.gpr(), CELL_STORAGE));
        Ok(self.gpr_result(res.reg(), DataFormat::Storage)?)
    }

    pub(super) fn compile_get_array_length(&mut self, mode: ArrayMode) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let res = self.alloc_gpr()?;
        if mode.uses_butterfly() {
            let st = self.fill_storage(n.child(1))?;
            self.load(
                Width::B32,
                res.reg(),
                Addr::base(st.gpr(), BUTTERFLY_PUBLIC_LENGTH),
            );
        } else {
            let c = self.fill_cell(n.child(0))?;
            self.load(Width::B32, res.reg(), Addr::base(c.gpr(), CELL_LENGTH));
        }
        Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
    }

    /// Exit unless `index` (a raw int32) is within the bounds of the indexed object.
    fn bounds_check(&mut self, mode: ArrayMode, base: Gpr, storage: Gpr, index: Gpr) {
        if mode.uses_butterfly() {
            self.load(
                Width::B32,
                SCRATCH_GPR,
                Addr::base(storage, BUTTERFLY_PUBLIC_LENGTH),
            );
        } else {
            self.load(Width::B32, SCRATCH_GPR, Addr::base(base, CELL_LENGTH));
        }
        // Unsigned, so negative indexes are out of bounds too.
        self.cmp32(index, SCRATCH_GPR);
        self.speculation_check(ExitKind::OutOfBounds, Cc::AE);
    }

    pub(super) fn compile_get_by_val(&mut self, mode: ArrayMode) -> Result<(), LowerError> {
        if mode == ArrayMode::String {
            return self.compile_string_char_at();
        }
        let g = self.g;
        let n = &g.nodes[self.cur];
        let b = self.fill_cell(n.child(0))?;
        let idx = self.fill_strict_int(n.child(1))?;
        let st = self.fill_storage(n.child(2))?;
        self.bounds_check(mode, b.gpr(), st.gpr(), idx.gpr());
        match mode {
            ArrayMode::Contiguous => {
                let res = self.alloc_gpr()?;
                self.load64(res.reg(), Addr::indexed(st.gpr(), idx.gpr(), 3, 0));
                self.test64(res.reg(), res.reg());
                self.speculation_check(ExitKind::LoadFromHole, Cc::E);
                Ok(self.gpr_result(res.reg(), DataFormat::JS)?)
            }
            ArrayMode::Double => {
                let res = self.alloc_fpr()?;
                self.emit(Inst::LoadD {
                    dst: res.reg(),
                    addr: Addr::indexed(st.gpr(), idx.gpr(), 3, 0),
                });
                self.emit(Inst::DCmp {
                    lhs: res.reg(),
                    rhs: res.reg(),
                });
                self.speculation_check(ExitKind::LoadFromHole, Cc::DUnordered);
                Ok(self.fpr_result(res.reg())?)
            }
            ArrayMode::Int32Array => {
                let res = self.alloc_gpr()?;
                self.load(
                    Width::B32,
                    res.reg(),
                    Addr::indexed(st.gpr(), idx.gpr(), 2, 0),
                );
                Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
            }
            ArrayMode::Float64Array => {
                let res = self.alloc_fpr()?;
                self.emit(Inst::LoadD {
                    dst: res.reg(),
                    addr: Addr::indexed(st.gpr(), idx.gpr(), 3, 0),
                });
                Ok(self.fpr_result(res.reg())?)
            }
            ArrayMode::String => Err(not_lowered_here(mode)),
        }
    }

    pub(super) fn compile_put_by_val(&mut self, mode: ArrayMode) -> Result<(), LowerError> {
        if mode == ArrayMode::String {
            return self.terminate(ExitKind::BadType);
        }
        let g = self.g;
        let n = &g.nodes[self.cur];
        let b = self.fill_cell(n.child(0))?;
        let idx = self.fill_strict_int(n.child(1))?;
        let st = self.fill_storage(n.child(3))?;
        let v = n.child(2);
        let addr = |scale| Addr::indexed(st.gpr(), idx.gpr(), scale, 0);
        match mode {
            ArrayMode::Contiguous => {
                let j = self.fill_js(v)?;
                self.bounds_check(mode, b.gpr(), st.gpr(), idx.gpr());
                self.store64(j.gpr(), addr(3));
            }
            ArrayMode::Double | ArrayMode::Float64Array => {
                let f = self.fill_double(v)?;
                if mode == ArrayMode::Double {
                    // NaN is how holes are represented.
                    self.emit(Inst::DCmp {
                        lhs: f.fpr(),
                        rhs: f.fpr(),
                    });
                    self.speculation_check(ExitKind::BadType, Cc::DUnordered);
                }
                self.bounds_check(mode, b.gpr(), st.gpr(), idx.gpr());
                self.emit(Inst::StoreD {
                    src: f.fpr(),
                    addr: addr(3),
                });
            }
            ArrayMode::Int32Array => {
                let i = self.fill_int(v)?;
                self.bounds_check(mode, b.gpr(), st.gpr(), idx.gpr());
                self.emit(Inst::Store {
                    width: Width::B32,
                    src: i.gpr(),
                    addr: addr(2),
                });
            }
            ArrayMode::String => return Err(not_lowered_here(mode)),
        }
        Ok(())
    }

    /// Fill a string, its index and its storage, and check the index is in bounds.
    fn string_access(&mut self) -> Result<(GprOperand, GprOperand), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let s = self.speculate_string(n.child(0))?;
        let idx = self.fill_strict_int(n.child(1))?;
        let st = self.fill_storage(n.child(2))?;
        self.load(Width::B32, SCRATCH_GPR, Addr::base(s.gpr(), CELL_LENGTH));
        self.cmp32(idx.gpr(), SCRATCH_GPR);
        self.speculation_check(ExitKind::OutOfBounds, Cc::AE);
        Ok((idx, st))
    }

    pub(super) fn compile_string_char_code_at(&mut self) -> Result<(), LowerError> {
        let (idx, st) = self.string_access()?;
        let res = self.alloc_gpr()?;
        self.load(
            Width::B16,
            res.reg(),
            Addr::indexed(st.gpr(), idx.gpr(), 1, 0),
        );
        Ok(self.gpr_result(res.reg(), DataFormat::Int32)?)
    }

    pub(super) fn compile_string_char_at(&mut self) -> Result<(), LowerError> {
        let (idx, st) = self.string_access()?;
        let res = self.alloc_gpr()?;
        let slow = self.asm.mk_label();
        let done = self.asm.mk_label();
        self.load(
            Width::B16,
            SCRATCH_GPR,
            Addr::indexed(st.gpr(), idx.gpr(), 1, 0),
        );
        self.cmp32(SCRATCH_GPR, Operand::Imm(0x100));
        self.jcc_label(Cc::AE, slow);
        self.movimm(res.reg(), self.plan.vm);
        self.load64(res.reg(), Addr::base(res.reg(), VM_SINGLE_CHAR_STRINGS));
        self.load64(res.reg(), Addr::indexed(res.reg(), SCRATCH_GPR, 3, 0));
        self.asm.attach_label(done);
        let rr = res.reg();
        self.add_slow_path(
            slow,
            done,
            &[rr],
            Box::new(move |jit, silent| {
                jit.slow_path_call(
                    silent,
                    HelperId::SingleCharacterString,
                    &[CallArg::Gpr(SCRATCH_GPR)],
                    Some(rr),
                )
            }),
        );
        Ok(self.gpr_result(res.reg(), DataFormat::JSCell)?)
    }

    /// Emit the structure check of an inline cache: the expected structure starts out as 0,
    /// which matches no object, and is patched in when the cache is filled. Returns the offset
    /// of the patchable immediate.
    fn ic_structure_check(&mut self, base: Gpr, tmp: Gpr, slow: LabelIdx) -> u32 {
        self.load64(SCRATCH_GPR, Addr::base(base, CELL_STRUCTURE));
        let imm = self.movimm(tmp, 0);
        self.cmp64(SCRATCH_GPR, tmp);
        self.jcc_label(Cc::NE, slow);
        imm
    }

    pub(super) fn compile_get_by_id(&mut self, ident: IdentIdx) -> Result<(), LowerError> {
        let base = self.g.nodes[self.cur].child(0);
        let ident_imm = ident.index() as u64;
        if !matches!(base.use_kind, UseKind::Cell | UseKind::KnownCell) {
            let j = self.fill_js(base)?;
            self.call_helper(
                HelperId::GetByIdGeneric,
                &[CallArg::Gpr(j.gpr()), CallArg::Imm(ident_imm)],
            )?;
            drop(j);
            let res = self.call_result_gpr()?;
            return Ok(self.gpr_result(res.reg(), DataFormat::JS)?);
        }
        let b = self.fill_cell(base)?;
        let res = self.alloc_gpr()?;
        let slow = self.asm.mk_label();
        let done = self.asm.mk_label();
        let structure_imm = self.ic_structure_check(b.gpr(), res.reg(), slow);
        let access = self.load64(res.reg(), Addr::base(b.gpr(), CELL_INLINE_STORAGE));
        self.asm.attach_label(done);
        self.ic_sites.push(IcRecord {
            kind: IcKind::GetById,
            ident,
            structure_imm,
            access,
            origin: self.g.nodes[self.cur].origin,
        });
        let (br, rr) = (b.gpr(), res.reg());
        self.add_slow_path(
            slow,
            done,
            &[rr],
            Box::new(move |jit, silent| {
                jit.slow_path_call(
                    silent,
                    HelperId::GetById,
                    &[CallArg::Gpr(br), CallArg::Imm(ident_imm)],
                    Some(rr),
                )
            }),
        );
        Ok(self.gpr_result(res.reg(), DataFormat::JS)?)
    }

    pub(super) fn compile_put_by_id(&mut self, ident: IdentIdx) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let (base, value) = (n.child(0), n.child(1));
        let ident_imm = ident.index() as u64;
        if !matches!(base.use_kind, UseKind::Cell | UseKind::KnownCell) {
            let jb = self.fill_js(base)?;
            let jv = self.fill_js(value)?;
            self.call_helper(
                HelperId::PutById,
                &[
                    CallArg::Gpr(jb.gpr()),
                    CallArg::Imm(ident_imm),
                    CallArg::Gpr(jv.gpr()),
                ],
            )?;
            return Ok(());
        }
        let b = self.fill_cell(base)?;
        let v = self.fill_js(value)?;
        let t = self.alloc_gpr()?;
        let slow = self.asm.mk_label();
        let done = self.asm.mk_label();
        let structure_imm = self.ic_structure_check(b.gpr(), t.reg(), slow);
        let access = self.store64(v.gpr(), Addr::base(b.gpr(), CELL_INLINE_STORAGE));
        self.asm.attach_label(done);
        self.ic_sites.push(IcRecord {
            kind: IcKind::PutById,
            ident,
            structure_imm,
            access,
            origin: n.origin,
        });
        let (br, vr) = (b.gpr(), v.gpr());
        self.add_slow_path(
            slow,
            done,
            &[],
            Box::new(move |jit, silent| {
                jit.slow_path_call(
                    silent,
                    HelperId::PutById,
                    &[
                        CallArg::Gpr(br),
                        CallArg::Imm(ident_imm),
                        CallArg::Gpr(vr),
                    ],
                    None,
                )
            }),
        );
        Ok(())
    }

    pub(super) fn compile_check_has_instance(&mut self) -> Result<(), LowerError> {
        let base = self.g.nodes[self.cur].child(0);
        let c = self.fill_cell(base)?;
        self.test_type_flags(c.gpr(), TYPE_FLAG_IMPLEMENTS_DEFAULT_HAS_INSTANCE);
        self.speculation_check(ExitKind::BadType, Cc::E);
        Ok(())
    }

    /// Walk `value`'s prototype chain looking for `prototype`.
    pub(super) fn compile_instance_of(&mut self) -> Result<(), LowerError> {
        let g = self.g;
        let n = &g.nodes[self.cur];
        let (v, p) = (n.child(0), n.child(1));
        let proto = self.fill_cell(p)?;
        let res = self.alloc_gpr()?;
        let is_true = self.asm.mk_label();
        let is_false = self.asm.mk_label();
        let done = self.asm.mk_label();
        let val = if matches!(v.use_kind, UseKind::Cell | UseKind::KnownCell)
            || self.state.proven(v.node).is_subset_of(SpecType::CELL)
        {
            self.fill_cell(v)?
        } else {
            let j = self.fill_js(v)?;
            self.test64(j.gpr(), TAG_MASK_REG);
            self.jcc_label(Cc::NE, is_false);
            j
        };
        self.load64(res.reg(), Addr::base(val.gpr(), CELL_STRUCTURE));
        let lp = self.asm.here();
        self.load64(res.reg(), Addr::base(res.reg(), STRUCTURE_PROTOTYPE));
        self.cmp64(res.reg(), proto.gpr());
        self.jcc_label(Cc::E, is_true);
        // Reaching a non-cell (i.e. `null`) ends the chain.
        self.test64(res.reg(), TAG_MASK_REG);
        self.jcc_label(Cc::NE, is_false);
        self.load64(res.reg(), Addr::base(res.reg(), CELL_STRUCTURE));
        self.jmp_label(lp);
        self.asm.attach_label(is_true);
        self.movimm(res.reg(), VALUE_TRUE);
        self.jmp_label(done);
        self.asm.attach_label(is_false);
        self.movimm(res.reg(), VALUE_FALSE);
        self.asm.attach_label(done);
        Ok(self.gpr_result(res.reg(), DataFormat::JSBoolean)?)
    }
}
