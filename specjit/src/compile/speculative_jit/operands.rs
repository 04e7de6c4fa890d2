//! Filling operands into registers.
//!
//! Each `fill_*` function makes an edge's value available in a register in a particular
//! representation, emitting a type check (and so an OSR exit) when the abstract state cannot
//! already prove the value has the right type. If the abstract state proves the value can never
//! have the right type the node is terminated.
//!
//! A fill never moves a value between register classes: a value in a GPR that is needed as a
//! double is converted into a temporary FPR which is not recorded in the ledger. Representation
//! changes that leave the bits in place (e.g. learning that a `JS` value is an int32) are recorded
//! in the ledger and the event stream. Changes that alter the bits (e.g. boxing) happen in place
//! only if no other operand of the current node is using the same register.

use super::SpeculativeJit;
use crate::{
    compile::{
        CompilationError, LowerError,
        gen_info::{DataFormat, RegLoc},
        graph::{Edge, NodeIdx, UseKind},
        machine::{
            Addr, AluOp, Cc, Fpr, Gpr, Inst, Operand, Width,
            abi::{
                CELL_STRUCTURE, CellType, SCRATCH_GPR, STRUCTURE_CELL_TYPE, TAG_MASK_REG,
                TAG_TYPE_NUMBER_REG,
            },
        },
        osr_exit::{ExitKind, SpeculationRecovery},
        regalloc::RegLock,
        spec_type::SpecType,
        variable_event::VariableEvent,
    },
    value::{JSValue, VALUE_FALSE},
};

/// A value in a GPR, locked for as long as the operand lives.
#[derive(Debug)]
pub(crate) struct GprOperand {
    lock: RegLock<Gpr>,
    format: DataFormat,
}

impl GprOperand {
    pub(crate) fn gpr(&self) -> Gpr {
        self.lock.reg()
    }

    pub(crate) fn format(&self) -> DataFormat {
        self.format
    }

    /// Take another lock on this operand's register, so that a result can be computed into it.
    pub(crate) fn reuse(&self) -> RegLock<Gpr> {
        self.lock.clone()
    }
}

/// A double in an FPR, locked for as long as the operand lives.
#[derive(Debug)]
pub(crate) struct FprOperand {
    lock: RegLock<Fpr>,
}

impl FprOperand {
    pub(crate) fn fpr(&self) -> Fpr {
        self.lock.reg()
    }

    pub(crate) fn reuse(&self) -> RegLock<Fpr> {
        self.lock.clone()
    }
}

/// Where a value currently is.
#[derive(Clone, Copy, Debug)]
enum Location {
    Constant(JSValue),
    Gpr(Gpr, DataFormat),
    Fpr(Fpr),
    Spilled(DataFormat),
}

impl SpeculativeJit<'_> {
    fn locate(&self, nidx: NodeIdx) -> Result<Location, CompilationError> {
        if let Some(v) = self.g.as_js_constant(nidx) {
            return Ok(Location::Constant(v));
        }
        let gi = self.gi(nidx)?;
        if !gi.is_alive() {
            return Err(CompilationError::InternalError(format!(
                "@{} is used but not live",
                usize::from(nidx)
            )));
        }
        match gi.loc() {
            RegLoc::Gpr(r) => Ok(Location::Gpr(r, gi.register_format())),
            RegLoc::Fpr(r) => Ok(Location::Fpr(r)),
            RegLoc::None if gi.is_spilled() => Ok(Location::Spilled(gi.spill_format())),
            RegLoc::None => Err(CompilationError::InternalError(format!(
                "@{} is live but nowhere",
                usize::from(nidx)
            ))),
        }
    }

    /// Record that `nidx`'s value is now in `loc` in `format`.
    fn bind_fill(
        &mut self,
        nidx: NodeIdx,
        loc: RegLoc,
        format: DataFormat,
    ) -> Result<(), CompilationError> {
        let vreg = self.vreg(nidx)?;
        let gi = self.gi_mut(nidx)?;
        match loc {
            RegLoc::Gpr(r) => {
                gi.fill_gpr(r, format);
                let order = gi.spill_order();
                self.gprs.retain(r, vreg, order);
            }
            RegLoc::Fpr(r) => {
                gi.fill_fpr(r);
                let order = gi.spill_order();
                self.fprs.retain(r, vreg, order);
            }
            RegLoc::None => {
                return Err(CompilationError::InternalError(
                    "Cannot fill to nowhere".into(),
                ));
            }
        }
        self.events.append(VariableEvent::Fill {
            node: nidx,
            loc,
            format,
        });
        Ok(())
    }

    /// Change the recorded format of the value of `nidx`, already in `reg`.
    fn refine(
        &mut self,
        nidx: NodeIdx,
        reg: Gpr,
        format: DataFormat,
    ) -> Result<(), CompilationError> {
        if self.gi(nidx)?.register_format() == format {
            return Ok(());
        }
        let gi = self.gi_mut(nidx)?;
        gi.fill_gpr(reg, format);
        let order = gi.spill_order();
        self.gprs.set_spill_order(reg, order);
        self.events.append(VariableEvent::Fill {
            node: nidx,
            loc: RegLoc::Gpr(reg),
            format,
        });
        Ok(())
    }

    fn fill_spilled_gpr(
        &mut self,
        nidx: NodeIdx,
        format: DataFormat,
    ) -> Result<RegLock<Gpr>, CompilationError> {
        let l = self.alloc_gpr()?;
        let addr = Self::frame_addr(self.vreg(nidx)?);
        match format {
            DataFormat::Int32 | DataFormat::Boolean => self.load(Width::B32, l.reg(), addr),
            DataFormat::Double | DataFormat::None => {
                return Err(CompilationError::InternalError(format!(
                    "Cannot fill {format} into a GPR"
                )));
            }
            _ => self.load64(l.reg(), addr),
        };
        self.bind_fill(nidx, RegLoc::Gpr(l.reg()), format)?;
        Ok(l)
    }

    fn fill_spilled_fpr(&mut self, nidx: NodeIdx) -> Result<RegLock<Fpr>, CompilationError> {
        let l = self.alloc_fpr()?;
        let addr = Self::frame_addr(self.vreg(nidx)?);
        self.emit(Inst::LoadD { dst: l.reg(), addr });
        self.bind_fill(nidx, RegLoc::Fpr(l.reg()), DataFormat::Double)?;
        Ok(l)
    }

    fn proven_is(&self, e: Edge, t: SpecType) -> bool {
        self.state.proven(e.node).is_subset_of(t)
    }

    fn proven_may_be(&self, e: Edge, t: SpecType) -> bool {
        self.state.proven(e.node).intersects(t)
    }

    //
    // Integers.
    //

    /// Fill `e` as an int32. The result is either raw (`Int32`) or boxed (`JSInt32`): either way
    /// its low 32 bits are the integer, which is all 32-bit instructions look at.
    pub(crate) fn fill_int(&mut self, e: Edge) -> Result<GprOperand, LowerError> {
        if !self.proven_may_be(e, SpecType::INT32) {
            return self.terminate(ExitKind::BadType);
        }
        match self.locate(e.node)? {
            Location::Constant(v) => match v.as_int32() {
                Some(i) => {
                    let l = self.alloc_gpr()?;
                    self.movimm(l.reg(), u64::from(i as u32));
                    Ok(GprOperand {
                        lock: l,
                        format: DataFormat::Int32,
                    })
                }
                None => self.terminate(ExitKind::BadType),
            },
            Location::Gpr(r, fmt) => {
                let l = self.gprs.lock(r)?;
                self.int_from_gpr(e, l, fmt)
            }
            Location::Fpr(_) | Location::Spilled(DataFormat::Double) => {
                self.terminate(ExitKind::BadType)
            }
            Location::Spilled(fmt) => {
                let l = self.fill_spilled_gpr(e.node, fmt)?;
                self.int_from_gpr(e, l, fmt)
            }
        }
    }

    fn int_from_gpr(
        &mut self,
        e: Edge,
        l: RegLock<Gpr>,
        fmt: DataFormat,
    ) -> Result<GprOperand, LowerError> {
        match fmt {
            DataFormat::Int32 | DataFormat::JSInt32 => Ok(GprOperand { lock: l, format: fmt }),
            DataFormat::JS => {
                if e.use_kind != UseKind::KnownInt32 && !self.proven_is(e, SpecType::INT32) {
                    self.cmp64(l.reg(), TAG_TYPE_NUMBER_REG);
                    self.speculation_check(ExitKind::BadType, Cc::B);
                }
                self.refine(e.node, l.reg(), DataFormat::JSInt32)?;
                Ok(GprOperand {
                    lock: l,
                    format: DataFormat::JSInt32,
                })
            }
            _ => self.terminate(ExitKind::BadType),
        }
    }

    /// Fill `e` as a raw int32 whose upper 32 bits are zero.
    pub(crate) fn fill_strict_int(&mut self, e: Edge) -> Result<GprOperand, LowerError> {
        let shared = match self.locate(e.node)? {
            Location::Gpr(r, _) => self.gprs.is_locked(r),
            _ => false,
        };
        let op = self.fill_int(e)?;
        if op.format == DataFormat::Int32 {
            return Ok(op);
        }
        if shared {
            let t = self.alloc_gpr()?;
            self.emit(Inst::Zext32 {
                dst: t.reg(),
                src: op.gpr(),
            });
            Ok(GprOperand {
                lock: t,
                format: DataFormat::Int32,
            })
        } else {
            let r = op.gpr();
            self.emit(Inst::Zext32 { dst: r, src: r });
            self.refine(e.node, r, DataFormat::Int32)?;
            Ok(GprOperand {
                lock: op.lock,
                format: DataFormat::Int32,
            })
        }
    }

    //
    // Doubles.
    //

    /// Fill `e` as a double, converting int32s.
    pub(crate) fn fill_double(&mut self, e: Edge) -> Result<FprOperand, LowerError> {
        if !self.proven_may_be(e, SpecType::NUMBER) {
            return self.terminate(ExitKind::BadType);
        }
        match self.locate(e.node)? {
            Location::Constant(v) => match v.as_number() {
                Some(d) => {
                    let l = self.alloc_fpr()?;
                    self.load_double_constant(l.reg(), d);
                    Ok(FprOperand { lock: l })
                }
                None => self.terminate(ExitKind::BadType),
            },
            Location::Fpr(r) => Ok(FprOperand {
                lock: self.fprs.lock(r)?,
            }),
            Location::Spilled(DataFormat::Double) => Ok(FprOperand {
                lock: self.fill_spilled_fpr(e.node)?,
            }),
            Location::Gpr(r, fmt) => {
                let g = self.gprs.lock(r)?;
                self.double_from_gpr(e, &g, fmt)
            }
            Location::Spilled(fmt) => {
                let g = self.fill_spilled_gpr(e.node, fmt)?;
                self.double_from_gpr(e, &g, fmt)
            }
        }
    }

    fn double_from_gpr(
        &mut self,
        e: Edge,
        g: &RegLock<Gpr>,
        fmt: DataFormat,
    ) -> Result<FprOperand, LowerError> {
        let r = g.reg();
        match fmt {
            DataFormat::Int32 | DataFormat::JSInt32 => {
                let f = self.alloc_fpr()?;
                self.emit(Inst::CvtI32ToD {
                    dst: f.reg(),
                    src: r,
                });
                Ok(FprOperand { lock: f })
            }
            DataFormat::JS | DataFormat::JSDouble => {
                let f = self.alloc_fpr()?;
                let is_int = self.asm.mk_label();
                let done = self.asm.mk_label();
                if fmt == DataFormat::JS {
                    self.cmp64(r, TAG_TYPE_NUMBER_REG);
                    self.jcc_label(Cc::AE, is_int);
                    if !self.proven_is(e, SpecType::NUMBER) {
                        self.test64(r, TAG_TYPE_NUMBER_REG);
                        self.speculation_check(ExitKind::BadType, Cc::E);
                    }
                }
                self.mov(SCRATCH_GPR, r);
                self.alu64(AluOp::Add, SCRATCH_GPR, TAG_TYPE_NUMBER_REG);
                self.emit(Inst::MovGToD {
                    dst: f.reg(),
                    src: SCRATCH_GPR,
                });
                if fmt == DataFormat::JS {
                    self.jmp_label(done);
                    self.asm.attach_label(is_int);
                    self.emit(Inst::CvtI32ToD {
                        dst: f.reg(),
                        src: r,
                    });
                    self.asm.attach_label(done);
                }
                Ok(FprOperand { lock: f })
            }
            _ => self.terminate(ExitKind::BadType),
        }
    }

    //
    // Cells.
    //

    pub(crate) fn fill_cell(&mut self, e: Edge) -> Result<GprOperand, LowerError> {
        if !self.proven_may_be(e, SpecType::CELL) {
            return self.terminate(ExitKind::BadType);
        }
        match self.locate(e.node)? {
            Location::Constant(v) => match v.as_cell() {
                Some(c) => {
                    let l = self.alloc_gpr()?;
                    self.movimm(l.reg(), c);
                    Ok(GprOperand {
                        lock: l,
                        format: DataFormat::JSCell,
                    })
                }
                None => self.terminate(ExitKind::BadType),
            },
            Location::Gpr(r, fmt) => {
                let l = self.gprs.lock(r)?;
                self.cell_from_gpr(e, l, fmt)
            }
            Location::Fpr(_) | Location::Spilled(DataFormat::Double) => {
                self.terminate(ExitKind::BadType)
            }
            Location::Spilled(fmt) => {
                let l = self.fill_spilled_gpr(e.node, fmt)?;
                self.cell_from_gpr(e, l, fmt)
            }
        }
    }

    fn cell_from_gpr(
        &mut self,
        e: Edge,
        l: RegLock<Gpr>,
        fmt: DataFormat,
    ) -> Result<GprOperand, LowerError> {
        match fmt {
            DataFormat::Cell | DataFormat::JSCell => Ok(GprOperand { lock: l, format: fmt }),
            DataFormat::JS => {
                if e.use_kind != UseKind::KnownCell && !self.proven_is(e, SpecType::CELL) {
                    self.test64(l.reg(), TAG_MASK_REG);
                    self.speculation_check(ExitKind::BadType, Cc::NE);
                }
                self.refine(e.node, l.reg(), DataFormat::JSCell)?;
                Ok(GprOperand {
                    lock: l,
                    format: DataFormat::JSCell,
                })
            }
            _ => self.terminate(ExitKind::BadType),
        }
    }

    /// Emit a check that the cell in `cell` has (if `want`) or does not have (otherwise) cell
    /// type `ty`.
    pub(crate) fn check_cell_type(&mut self, cell: Gpr, ty: CellType, want: bool, kind: ExitKind) {
        self.load64(SCRATCH_GPR, Addr::base(cell, CELL_STRUCTURE));
        self.load(
            Width::B8,
            SCRATCH_GPR,
            Addr::base(SCRATCH_GPR, STRUCTURE_CELL_TYPE),
        );
        self.cmp32(SCRATCH_GPR, Operand::Imm(ty as i32));
        self.speculation_check(kind, if want { Cc::NE } else { Cc::E });
    }

    /// Fill `e` as a cell which is an object (i.e. not a string).
    pub(crate) fn speculate_object(&mut self, e: Edge) -> Result<GprOperand, LowerError> {
        if !self.proven_may_be(e, SpecType::OBJECT) {
            return self.terminate(ExitKind::BadType);
        }
        let c = self.fill_cell(e)?;
        if !self.proven_is(e, SpecType::OBJECT) {
            self.check_cell_type(c.gpr(), CellType::String, false, ExitKind::BadType);
        }
        Ok(c)
    }

    pub(crate) fn speculate_string(&mut self, e: Edge) -> Result<GprOperand, LowerError> {
        if !self.proven_may_be(e, SpecType::STRING) {
            return self.terminate(ExitKind::BadType);
        }
        let c = self.fill_cell(e)?;
        if !self.proven_is(e, SpecType::STRING) {
            self.check_cell_type(c.gpr(), CellType::String, true, ExitKind::BadType);
        }
        Ok(c)
    }

    //
    // Booleans.
    //

    /// Fill `e` as a boolean. The result is either raw (`Boolean`, 0 or 1) or boxed
    /// (`JSBoolean`): either way bit 0 is the truth value.
    pub(crate) fn fill_boolean(&mut self, e: Edge) -> Result<GprOperand, LowerError> {
        if !self.proven_may_be(e, SpecType::BOOLEAN) {
            return self.terminate(ExitKind::BadType);
        }
        match self.locate(e.node)? {
            Location::Constant(v) => match v.as_boolean() {
                Some(b) => {
                    let l = self.alloc_gpr()?;
                    self.movimm(l.reg(), JSValue::boolean(b).bits());
                    Ok(GprOperand {
                        lock: l,
                        format: DataFormat::JSBoolean,
                    })
                }
                None => self.terminate(ExitKind::BadType),
            },
            Location::Gpr(r, fmt) => {
                let shared = self.gprs.is_locked(r);
                let l = self.gprs.lock(r)?;
                self.boolean_from_gpr(e, l, fmt, shared)
            }
            Location::Fpr(_) | Location::Spilled(DataFormat::Double) => {
                self.terminate(ExitKind::BadType)
            }
            Location::Spilled(fmt) => {
                let l = self.fill_spilled_gpr(e.node, fmt)?;
                self.boolean_from_gpr(e, l, fmt, false)
            }
        }
    }

    fn boolean_from_gpr(
        &mut self,
        e: Edge,
        l: RegLock<Gpr>,
        fmt: DataFormat,
        shared: bool,
    ) -> Result<GprOperand, LowerError> {
        match fmt {
            DataFormat::Boolean | DataFormat::JSBoolean => Ok(GprOperand { lock: l, format: fmt }),
            DataFormat::JS if self.proven_is(e, SpecType::BOOLEAN) => {
                self.refine(e.node, l.reg(), DataFormat::JSBoolean)?;
                Ok(GprOperand {
                    lock: l,
                    format: DataFormat::JSBoolean,
                })
            }
            DataFormat::JS if shared => {
                self.mov(SCRATCH_GPR, l.reg());
                self.alu64(AluOp::Xor, SCRATCH_GPR, Operand::Imm(VALUE_FALSE as i32));
                self.test64(SCRATCH_GPR, Operand::Imm(!1));
                self.speculation_check(ExitKind::BadType, Cc::NE);
                self.refine(e.node, l.reg(), DataFormat::JSBoolean)?;
                Ok(GprOperand {
                    lock: l,
                    format: DataFormat::JSBoolean,
                })
            }
            DataFormat::JS => {
                let r = l.reg();
                self.alu64(AluOp::Xor, r, Operand::Imm(VALUE_FALSE as i32));
                self.test64(r, Operand::Imm(!1));
                self.speculation_check_with_recovery(
                    ExitKind::BadType,
                    Cc::NE,
                    SpeculationRecovery::BooleanCheck { gpr: r },
                );
                self.refine(e.node, r, DataFormat::Boolean)?;
                Ok(GprOperand {
                    lock: l,
                    format: DataFormat::Boolean,
                })
            }
            _ => self.terminate(ExitKind::BadType),
        }
    }

    //
    // Everything else.
    //

    pub(crate) fn fill_storage(&mut self, e: Edge) -> Result<GprOperand, LowerError> {
        let lock = match self.locate(e.node)? {
            Location::Gpr(r, DataFormat::Storage) => self.gprs.lock(r)?,
            Location::Spilled(DataFormat::Storage) => {
                self.fill_spilled_gpr(e.node, DataFormat::Storage)?
            }
            l => {
                return Err(CompilationError::InternalError(format!(
                    "@{} is not storage ({l:?})",
                    usize::from(e.node)
                ))
                .into());
            }
        };
        Ok(GprOperand {
            lock,
            format: DataFormat::Storage,
        })
    }

    /// Fill `e` as a boxed value.
    pub(crate) fn fill_js(&mut self, e: Edge) -> Result<GprOperand, LowerError> {
        let nidx = e.node;
        match self.locate(nidx)? {
            Location::Constant(v) => {
                let l = self.alloc_gpr()?;
                self.movimm(l.reg(), v.bits());
                Ok(GprOperand {
                    lock: l,
                    format: DataFormat::JS,
                })
            }
            Location::Gpr(r, fmt) => {
                let shared = self.gprs.is_locked(r);
                let l = self.gprs.lock(r)?;
                match fmt {
                    DataFormat::JS
                    | DataFormat::JSInt32
                    | DataFormat::JSDouble
                    | DataFormat::JSCell
                    | DataFormat::JSBoolean => Ok(GprOperand { lock: l, format: fmt }),
                    DataFormat::Cell => {
                        self.refine(nidx, r, DataFormat::JSCell)?;
                        Ok(GprOperand {
                            lock: l,
                            format: DataFormat::JSCell,
                        })
                    }
                    DataFormat::Int32 => Ok(self.box_gpr(
                        nidx,
                        l,
                        shared,
                        Operand::Reg(TAG_TYPE_NUMBER_REG),
                        DataFormat::JSInt32,
                    )?),
                    DataFormat::Boolean => Ok(self.box_gpr(
                        nidx,
                        l,
                        shared,
                        Operand::Imm(VALUE_FALSE as i32),
                        DataFormat::JSBoolean,
                    )?),
                    DataFormat::Double | DataFormat::Storage | DataFormat::None => {
                        Err(CompilationError::InternalError(format!(
                            "@{} cannot be boxed from {fmt}",
                            usize::from(nidx)
                        ))
                        .into())
                    }
                }
            }
            Location::Fpr(f) => {
                let _fl = self.fprs.lock(f)?;
                let t = self.alloc_gpr()?;
                self.emit(Inst::MovDToG {
                    dst: t.reg(),
                    src: f,
                });
                self.alu64(AluOp::Sub, t.reg(), TAG_TYPE_NUMBER_REG);
                Ok(GprOperand {
                    lock: t,
                    format: DataFormat::JSDouble,
                })
            }
            Location::Spilled(DataFormat::Double) => {
                let t = self.alloc_gpr()?;
                self.load64(t.reg(), Self::frame_addr(self.vreg(nidx)?));
                self.alu64(AluOp::Sub, t.reg(), TAG_TYPE_NUMBER_REG);
                Ok(GprOperand {
                    lock: t,
                    format: DataFormat::JSDouble,
                })
            }
            Location::Spilled(fmt) => {
                let l = self.fill_spilled_gpr(nidx, fmt)?;
                let r = l.reg();
                match fmt {
                    DataFormat::Int32 => {
                        Ok(self.box_gpr(
                            nidx,
                            l,
                            false,
                            Operand::Reg(TAG_TYPE_NUMBER_REG),
                            DataFormat::JSInt32,
                        )?)
                    }
                    DataFormat::Boolean => Ok(self.box_gpr(
                        nidx,
                        l,
                        false,
                        Operand::Imm(VALUE_FALSE as i32),
                        DataFormat::JSBoolean,
                    )?),
                    DataFormat::Cell => {
                        self.refine(nidx, r, DataFormat::JSCell)?;
                        Ok(GprOperand {
                            lock: l,
                            format: DataFormat::JSCell,
                        })
                    }
                    _ => Ok(GprOperand { lock: l, format: fmt }),
                }
            }
        }
    }

    /// Box the raw value in `l` by or-ing in `tag`.
    fn box_gpr(
        &mut self,
        nidx: NodeIdx,
        l: RegLock<Gpr>,
        shared: bool,
        tag: Operand,
        boxed: DataFormat,
    ) -> Result<GprOperand, CompilationError> {
        if shared {
            let t = self.alloc_gpr()?;
            self.mov(t.reg(), l.reg());
            self.alu64(AluOp::Or, t.reg(), tag);
            Ok(GprOperand {
                lock: t,
                format: boxed,
            })
        } else {
            self.alu64(AluOp::Or, l.reg(), tag);
            self.refine(nidx, l.reg(), boxed)?;
            Ok(GprOperand {
                lock: l,
                format: boxed,
            })
        }
    }
}
