//! An executor for SJM64 code.
//!
//! Generated code runs against simulated memory. Calls to helper addresses run the helper in
//! Rust; calls through the virtual call thunk (or directly linked calls) push a shadow frame
//! recording where to return to and what the caller's frame register was.

use super::{ExitState, Function, Runtime, SimError, memory::STACK_TOP};
use crate::{
    compile::{
        CompiledCode,
        graph::{BlockIdx, FlushFormat},
        machine::{
            Addr, AluOp, Cc, DAluOp, DUnaryOp, Fpr, Gpr, Inst, OpSize, Operand, Width,
            abi::{
                CALL_FRAME_HEADER_SIZE, FRAME, HEADER_ARG_COUNT, HEADER_CALLEE,
                HEADER_CALLER_FRAME, HEADER_CODE_BLOCK, HEADER_RETURN_PC, RET_GPR, ThunkId,
                helper_at, thunk_at,
            },
        },
    },
    value::JSValue,
};
use std::{cmp::Ordering, sync::Arc};
use strum::EnumCount;

/// How many instructions [Runtime::call] will execute before giving up.
const DEFAULT_STEP_LIMIT: u64 = 10_000_000;

/// How a run of generated code ended.
#[derive(Debug)]
pub enum Outcome {
    Returned(JSValue),
    /// An OSR exit was taken: execution should continue in the lower tier.
    Exited(Box<ExitState>),
    /// An exception propagated out of the outermost frame.
    Threw(JSValue),
}

/// Registers and flags.
#[derive(Clone, Debug)]
pub(crate) struct Machine {
    gprs: [u64; Gpr::COUNT],
    fprs: [f64; Fpr::COUNT],
    zf: bool,
    sf: bool,
    cf: bool,
    of: bool,
    /// The result of the last double comparison. `None` means unordered.
    dcmp: Option<Ordering>,
    pub(crate) exit_index: u32,
}

impl Machine {
    fn new() -> Self {
        Self {
            gprs: [0; Gpr::COUNT],
            fprs: [0.0; Fpr::COUNT],
            zf: false,
            sf: false,
            cf: false,
            of: false,
            dcmp: None,
            exit_index: 0,
        }
    }

    pub(crate) fn gpr(&self, r: Gpr) -> u64 {
        self.gprs[r as usize]
    }

    pub(crate) fn set_gpr(&mut self, r: Gpr, v: u64) {
        self.gprs[r as usize] = v;
    }

    pub(crate) fn fpr(&self, r: Fpr) -> f64 {
        self.fprs[r as usize]
    }

    pub(crate) fn set_fpr(&mut self, r: Fpr, v: f64) {
        self.fprs[r as usize] = v;
    }

    fn operand(&self, size: OpSize, o: Operand) -> u64 {
        match (o, size) {
            (Operand::Reg(r), OpSize::S32) => self.gpr(r) & 0xFFFF_FFFF,
            (Operand::Reg(r), OpSize::S64) => self.gpr(r),
            (Operand::Imm(x), OpSize::S32) => u64::from(x as u32),
            (Operand::Imm(x), OpSize::S64) => x as i64 as u64,
        }
    }

    fn set_result_flags(&mut self, size: OpSize, r: u64) {
        match size {
            OpSize::S32 => {
                self.zf = r as u32 == 0;
                self.sf = (r as u32 as i32) < 0;
            }
            OpSize::S64 => {
                self.zf = r == 0;
                self.sf = (r as i64) < 0;
            }
        }
    }

    /// Compute `a op b`, setting flags, and returning the (zero-extended, for 32-bit operations)
    /// result.
    fn alu(&mut self, size: OpSize, op: AluOp, a: u64, b: u64) -> u64 {
        let (r, cf, of) = match size {
            OpSize::S32 => {
                let (a, b) = (a as u32, b as u32);
                let (r, cf, of) = match op {
                    AluOp::Add => {
                        let (r, c) = a.overflowing_add(b);
                        (r, c, (a as i32).overflowing_add(b as i32).1)
                    }
                    AluOp::Sub => {
                        let (r, c) = a.overflowing_sub(b);
                        (r, c, (a as i32).overflowing_sub(b as i32).1)
                    }
                    AluOp::Mul => {
                        let (r, o) = (a as i32).overflowing_mul(b as i32);
                        (r as u32, o, o)
                    }
                    AluOp::And => (a & b, false, false),
                    AluOp::Or => (a | b, false, false),
                    AluOp::Xor => (a ^ b, false, false),
                    AluOp::Shl => (a.wrapping_shl(b & 31), false, false),
                    AluOp::Sar => (((a as i32).wrapping_shr(b & 31)) as u32, false, false),
                    AluOp::Shr => (a.wrapping_shr(b & 31), false, false),
                };
                (u64::from(r), cf, of)
            }
            OpSize::S64 => match op {
                AluOp::Add => {
                    let (r, c) = a.overflowing_add(b);
                    (r, c, (a as i64).overflowing_add(b as i64).1)
                }
                AluOp::Sub => {
                    let (r, c) = a.overflowing_sub(b);
                    (r, c, (a as i64).overflowing_sub(b as i64).1)
                }
                AluOp::Mul => {
                    let (r, o) = (a as i64).overflowing_mul(b as i64);
                    (r as u64, o, o)
                }
                AluOp::And => (a & b, false, false),
                AluOp::Or => (a | b, false, false),
                AluOp::Xor => (a ^ b, false, false),
                AluOp::Shl => (a.wrapping_shl((b & 63) as u32), false, false),
                AluOp::Sar => (
                    ((a as i64).wrapping_shr((b & 63) as u32)) as u64,
                    false,
                    false,
                ),
                AluOp::Shr => (a.wrapping_shr((b & 63) as u32), false, false),
            },
        };
        self.cf = cf;
        self.of = of;
        self.set_result_flags(size, r);
        r
    }

    fn cond(&self, cc: Cc) -> bool {
        let d = self.dcmp;
        match cc {
            Cc::E => self.zf,
            Cc::NE => !self.zf,
            Cc::L => self.sf != self.of,
            Cc::LE => self.zf || self.sf != self.of,
            Cc::G => !self.zf && self.sf == self.of,
            Cc::GE => self.sf == self.of,
            Cc::B => self.cf,
            Cc::BE => self.cf || self.zf,
            Cc::A => !self.cf && !self.zf,
            Cc::AE => !self.cf,
            Cc::O => self.of,
            Cc::NO => !self.of,
            Cc::S => self.sf,
            Cc::NS => !self.sf,
            Cc::DEq => d == Some(Ordering::Equal),
            Cc::DNeOrUnordered => d != Some(Ordering::Equal),
            Cc::DLt => d == Some(Ordering::Less),
            Cc::DGeOrUnordered => d != Some(Ordering::Less),
            Cc::DLe => matches!(d, Some(Ordering::Less | Ordering::Equal)),
            Cc::DGtOrUnordered => !matches!(d, Some(Ordering::Less | Ordering::Equal)),
            Cc::DGt => d == Some(Ordering::Greater),
            Cc::DLeOrUnordered => d != Some(Ordering::Greater),
            Cc::DGe => matches!(d, Some(Ordering::Greater | Ordering::Equal)),
            Cc::DLtOrUnordered => !matches!(d, Some(Ordering::Greater | Ordering::Equal)),
            Cc::DUnordered => d.is_none(),
            Cc::DOrdered => d.is_some(),
        }
    }
}

fn dmin_max(a: f64, b: f64, is_min: bool) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        // Distinguish the zeros: min(0, -0) is -0, max(0, -0) is 0.
        return if is_min == a.is_sign_negative() { a } else { b };
    }
    if (a < b) == is_min { a } else { b }
}

/// Truncate `d` to an int32, producing the "integer indefinite" value when that is impossible.
fn cvt_truncate(d: f64) -> u32 {
    let t = d.trunc();
    if t.is_nan() || t < f64::from(i32::MIN) || t > f64::from(i32::MAX) {
        0x8000_0000
    } else {
        t as i32 as u32
    }
}

/// A frame of generated code that has called another.
struct ShadowFrame {
    code: Arc<CompiledCode>,
    return_pc: u64,
    frame: u64,
}

/// The state of one run of generated code.
struct Execution {
    m: Machine,
    code: Arc<CompiledCode>,
    pc: u64,
    stack: Vec<ShadowFrame>,
    steps: u64,
}

impl Runtime {
    fn addr(m: &Machine, a: Addr) -> u64 {
        let mut x = m.gpr(a.base).wrapping_add(a.disp as i64 as u64);
        if let Some((i, scale)) = a.index {
            x = x.wrapping_add(m.gpr(i) << scale);
        }
        x
    }

    /// Call compiled function `code` with `this` and `args`, running until it returns, throws,
    /// or takes an OSR exit.
    pub fn call(
        &mut self,
        code: &Arc<CompiledCode>,
        this: JSValue,
        args: &[JSValue],
    ) -> Result<Outcome, SimError> {
        self.install(Arc::clone(code));
        let frame = self.push_entry_frame(code, this, args)?;
        let entry = code.arity_entry().unwrap_or_else(|| code.entry());
        self.execute(code, entry, frame)
    }

    /// Enter `code` at the OSR entry of block `bidx`, as the lower tier would from the head of a
    /// loop. `locals` are the values of the interpreter-visible locals, in order.
    pub fn call_osr(
        &mut self,
        code: &Arc<CompiledCode>,
        bidx: BlockIdx,
        this: JSValue,
        args: &[JSValue],
        locals: &[JSValue],
    ) -> Result<Outcome, SimError> {
        self.install(Arc::clone(code));
        let entry = code
            .osr_entry(bidx)
            .ok_or_else(|| SimError::Unsupported(format!("no OSR entry for bb{bidx:?}")))?;
        let frame = self.push_entry_frame(code, this, args)?;
        for v in &code.graph().variables {
            let Some(i) = v.operand.to_local() else {
                continue;
            };
            let Some(val) = locals.get(i) else {
                continue;
            };
            let bits = match v.flush_format {
                FlushFormat::Double => val
                    .as_number()
                    .ok_or(SimError::WrongType(*val, "number"))?
                    .to_bits(),
                _ => val.bits(),
            };
            self.mem
                .write_u64(frame.wrapping_add(v.operand.offset() as i64 as u64), bits)?;
        }
        self.execute(code, entry, frame)
    }

    /// Lay out the outermost frame at the top of the stack.
    fn push_entry_frame(
        &mut self,
        code: &CompiledCode,
        this: JSValue,
        args: &[JSValue],
    ) -> Result<u64, SimError> {
        let nargs = 1 + args.len();
        let frame = STACK_TOP - (CALL_FRAME_HEADER_SIZE as u64 + nargs as u64) * 8;
        let slot = |i: i32| frame + i as u64 * 8;
        self.mem.write_u64(slot(HEADER_CALLER_FRAME), 0)?;
        self.mem.write_u64(slot(HEADER_RETURN_PC), 0)?;
        self.mem
            .write_u64(slot(HEADER_CODE_BLOCK), code.code_block().id)?;
        self.mem
            .write_u64(slot(HEADER_CALLEE), JSValue::UNDEFINED.bits())?;
        self.mem
            .write_u64(slot(HEADER_ARG_COUNT), 1 + args.len() as u64)?;
        self.mem.write_u64(slot(CALL_FRAME_HEADER_SIZE), this.bits())?;
        for (i, a) in args.iter().enumerate() {
            self.mem
                .write_u64(slot(CALL_FRAME_HEADER_SIZE + 1 + i as i32), a.bits())?;
        }
        Ok(frame)
    }

    fn execute(
        &mut self,
        code: &Arc<CompiledCode>,
        entry: u64,
        frame: u64,
    ) -> Result<Outcome, SimError> {
        let mut ex = Execution {
            m: Machine::new(),
            code: Arc::clone(code),
            pc: entry,
            stack: Vec::new(),
            steps: 0,
        };
        ex.m.set_gpr(FRAME, frame);
        loop {
            if let Some(o) = self.step(&mut ex)? {
                return Ok(o);
            }
        }
    }

    /// Transfer control to `target`, which must be generated code or a thunk.
    fn jump(&mut self, ex: &mut Execution, target: u64) -> Result<Option<Outcome>, SimError> {
        match thunk_at(target) {
            Some(ThunkId::OsrExit) => {
                let st = self.take_exit(&ex.m, &ex.code)?;
                Ok(Some(Outcome::Exited(Box::new(st))))
            }
            Some(ThunkId::Throw) => match ex.stack.pop() {
                Some(sf) => {
                    // Unwind into the caller, which will find the exception still pending.
                    ex.m.set_gpr(FRAME, sf.frame);
                    ex.m.set_gpr(RET_GPR, JSValue::UNDEFINED.bits());
                    ex.code = sf.code;
                    ex.pc = sf.return_pc;
                    Ok(None)
                }
                None => {
                    let e = self.pending_exception()?.unwrap_or(JSValue::UNDEFINED);
                    self.clear_exception()?;
                    Ok(Some(Outcome::Threw(e)))
                }
            },
            Some(ThunkId::VirtualCall) => Err(SimError::Unsupported(
                "jump to the virtual call thunk".into(),
            )),
            None => {
                if !ex.code.contains(target) {
                    ex.code = Arc::clone(self.code_at(target).ok_or(SimError::NoCode(target))?);
                }
                ex.pc = target;
                Ok(None)
            }
        }
    }

    /// Enter `callee` at `target` with its frame at `frame`, returning to `return_pc`.
    fn enter(
        &mut self,
        ex: &mut Execution,
        callee: Arc<CompiledCode>,
        target: u64,
        frame: u64,
        return_pc: u64,
    ) -> Result<(), SimError> {
        self.mem
            .write_u64(frame + HEADER_RETURN_PC as u64 * 8, return_pc)?;
        self.mem
            .write_u64(frame + HEADER_CODE_BLOCK as u64 * 8, callee.code_block().id)?;
        ex.stack.push(ShadowFrame {
            code: std::mem::replace(&mut ex.code, callee),
            return_pc,
            frame: ex.m.gpr(FRAME),
        });
        ex.m.set_gpr(FRAME, frame);
        ex.pc = target;
        Ok(())
    }

    /// `r0` points at a frame whose header and arguments the caller has filled in.
    fn virtual_call(&mut self, ex: &mut Execution, return_pc: u64) -> Result<(), SimError> {
        let frame = ex.m.gpr(RET_GPR);
        let slot = |i: u64| frame + i * 8;
        let callee = JSValue::from_bits(self.mem.read_u64(slot(HEADER_CALLEE as u64))?);
        let f = match self.function_of(callee) {
            Ok(f) => f,
            Err(SimError::WrongType(..)) => {
                let msg = format!("{} is not a function", self.to_js_string(callee)?);
                self.throw_type_error(&msg)?;
                ex.m.set_gpr(RET_GPR, JSValue::UNDEFINED.bits());
                ex.pc = return_pc;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match f {
            Function::Compiled(c) => {
                self.install(Arc::clone(&c));
                let target = c.arity_entry().unwrap_or_else(|| c.entry());
                self.enter(ex, c, target, frame, return_pc)
            }
            Function::Host(h) => {
                let argc = self.mem.read_u64(slot(HEADER_ARG_COUNT as u64))?;
                let this =
                    JSValue::from_bits(self.mem.read_u64(slot(CALL_FRAME_HEADER_SIZE as u64))?);
                let args = (1..argc)
                    .map(|i| {
                        self.mem
                            .read_u64(slot(CALL_FRAME_HEADER_SIZE as u64 + i))
                            .map(JSValue::from_bits)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let r = h(self, this, &args)?;
                ex.m.set_gpr(RET_GPR, r.bits());
                ex.pc = return_pc;
                Ok(())
            }
        }
    }

    fn step(&mut self, ex: &mut Execution) -> Result<Option<Outcome>, SimError> {
        ex.steps += 1;
        if ex.steps > DEFAULT_STEP_LIMIT {
            return Err(SimError::StepLimit);
        }
        let pc = ex.pc;
        let (inst, len) = ex
            .code
            .decode_at(pc)
            .map_err(|e| SimError::Decode(pc, e.to_string()))?;
        let next = pc + len as u64;
        ex.pc = next;
        let m = &mut ex.m;
        match inst {
            Inst::Nop | Inst::WatchpointLabel { .. } => (),
            Inst::Breakpoint => return Err(SimError::Breakpoint(pc)),
            Inst::Ret => match ex.stack.pop() {
                Some(sf) => {
                    m.set_gpr(FRAME, sf.frame);
                    ex.code = sf.code;
                    ex.pc = sf.return_pc;
                }
                None => return Ok(Some(Outcome::Returned(JSValue::from_bits(m.gpr(RET_GPR))))),
            },
            Inst::Mov { dst, src } => m.set_gpr(dst, m.gpr(src)),
            Inst::Zext32 { dst, src } => m.set_gpr(dst, m.gpr(src) & 0xFFFF_FFFF),
            Inst::MovImm { dst, imm } => m.set_gpr(dst, imm),
            Inst::Load {
                width,
                signed,
                dst,
                addr,
            } => {
                let a = Self::addr(m, addr);
                let v = match (width, signed) {
                    (Width::B8, false) => u64::from(self.mem.read_u8(a)?),
                    (Width::B8, true) => self.mem.read_u8(a)? as i8 as i64 as u64,
                    (Width::B16, false) => u64::from(self.mem.read_u16(a)?),
                    (Width::B16, true) => self.mem.read_u16(a)? as i16 as i64 as u64,
                    (Width::B32, false) => u64::from(self.mem.read_u32(a)?),
                    (Width::B32, true) => self.mem.read_u32(a)? as i32 as i64 as u64,
                    (Width::B64, _) => self.mem.read_u64(a)?,
                };
                m.set_gpr(dst, v);
            }
            Inst::Store { width, src, addr } => {
                let a = Self::addr(m, addr);
                let v = m.gpr(src);
                match width {
                    Width::B8 => self.mem.write_u8(a, v as u8)?,
                    Width::B16 => self.mem.write_u16(a, v as u16)?,
                    Width::B32 => self.mem.write_u32(a, v as u32)?,
                    Width::B64 => self.mem.write_u64(a, v)?,
                }
            }
            Inst::LoadD { dst, addr } => {
                let a = Self::addr(m, addr);
                m.set_fpr(dst, f64::from_bits(self.mem.read_u64(a)?));
            }
            Inst::StoreD { src, addr } => {
                let a = Self::addr(m, addr);
                self.mem.write_u64(a, m.fpr(src).to_bits())?;
            }
            Inst::LoadDConst { dst, rel } => {
                let a = next.wrapping_add(rel as i64 as u64);
                let bits = ex.code.read_data(a).ok_or(SimError::BadAccess(a))?;
                m.set_fpr(dst, f64::from_bits(bits));
            }
            Inst::Alu { size, op, dst, src } => {
                let a = m.operand(size, Operand::Reg(dst));
                let b = m.operand(size, src);
                let r = m.alu(size, op, a, b);
                m.set_gpr(dst, r);
            }
            Inst::Neg32 { dst } => {
                let r = m.alu(OpSize::S32, AluOp::Sub, 0, m.gpr(dst) & 0xFFFF_FFFF);
                m.set_gpr(dst, r);
            }
            Inst::Div32 { rem, dst, src } => {
                let (a, b) = (m.gpr(dst) as u32 as i32, m.gpr(src) as u32 as i32);
                let r = if rem {
                    a.checked_rem(b)
                } else {
                    a.checked_div(b)
                }
                .ok_or(SimError::DivisionFault(pc))?;
                m.set_gpr(dst, u64::from(r as u32));
            }
            Inst::Cmp { size, lhs, rhs } => {
                let a = m.operand(size, Operand::Reg(lhs));
                let b = m.operand(size, rhs);
                m.alu(size, AluOp::Sub, a, b);
            }
            Inst::Test { size, lhs, rhs } => {
                let a = m.operand(size, Operand::Reg(lhs));
                let b = m.operand(size, rhs);
                m.alu(size, AluOp::And, a, b);
            }
            Inst::SetCc { cc, dst } => m.set_gpr(dst, u64::from(m.cond(cc))),
            Inst::Jcc { cc, rel } => {
                if m.cond(cc) {
                    ex.pc = next.wrapping_add(rel as i64 as u64);
                }
            }
            Inst::Jmp { rel } => ex.pc = next.wrapping_add(rel as i64 as u64),
            Inst::JmpAbs { target } => return self.jump(ex, target),
            Inst::JmpReg { src } => {
                let target = m.gpr(src);
                return self.jump(ex, target);
            }
            Inst::JmpTable { table, index } => {
                let i = m.gpr(index) as usize;
                let target = ex
                    .code
                    .code_block()
                    .tables()
                    .imm
                    .get(usize::from(table))
                    .and_then(|t| t.ctis.get(i).copied())
                    .ok_or_else(|| {
                        SimError::Unsupported(format!("entry {i} of jump table {table}"))
                    })?;
                return self.jump(ex, target);
            }
            Inst::Call { target } => {
                if let Some(h) = helper_at(target) {
                    let code = Arc::clone(&ex.code);
                    self.run_helper(h, &mut ex.m, &code)?;
                } else if thunk_at(target) == Some(ThunkId::VirtualCall) {
                    self.virtual_call(ex, next)?;
                } else {
                    let callee = Arc::clone(self.code_at(target).ok_or(SimError::NoCode(target))?);
                    let frame = m.gpr(RET_GPR);
                    self.enter(ex, callee, target, frame, next)?;
                }
            }
            Inst::SetExitIndex { index } => m.exit_index = index,
            Inst::DAlu { op, dst, src } => {
                let (a, b) = (m.fpr(dst), m.fpr(src));
                let r = match op {
                    DAluOp::Add => a + b,
                    DAluOp::Sub => a - b,
                    DAluOp::Mul => a * b,
                    DAluOp::Div => a / b,
                    DAluOp::Min => dmin_max(a, b, true),
                    DAluOp::Max => dmin_max(a, b, false),
                };
                m.set_fpr(dst, r);
            }
            Inst::DUnary { op, dst, src } => {
                let a = m.fpr(src);
                m.set_fpr(
                    dst,
                    match op {
                        DUnaryOp::Sqrt => a.sqrt(),
                        DUnaryOp::Abs => a.abs(),
                        DUnaryOp::Neg => -a,
                    },
                );
            }
            Inst::DMov { dst, src } => m.set_fpr(dst, m.fpr(src)),
            Inst::DCmp { lhs, rhs } => m.dcmp = m.fpr(lhs).partial_cmp(&m.fpr(rhs)),
            Inst::CvtI32ToD { dst, src } => m.set_fpr(dst, f64::from(m.gpr(src) as u32 as i32)),
            Inst::CvtTDToI32 { dst, src } => m.set_gpr(dst, u64::from(cvt_truncate(m.fpr(src)))),
            Inst::MovGToD { dst, src } => m.set_fpr(dst, f64::from_bits(m.gpr(src))),
            Inst::MovDToG { dst, src } => m.set_gpr(dst, m.fpr(src).to_bits()),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alu_flags() {
        let mut m = Machine::new();
        let r = m.alu(OpSize::S32, AluOp::Add, 0x7FFF_FFFF, 1);
        assert_eq!(r, 0x8000_0000);
        assert!(m.cond(Cc::O) && m.cond(Cc::S) && !m.cond(Cc::B));
        let r = m.alu(OpSize::S32, AluOp::Sub, 1, 2);
        assert_eq!(r, 0xFFFF_FFFF);
        assert!(m.cond(Cc::B) && m.cond(Cc::L) && !m.cond(Cc::O));
        m.alu(OpSize::S64, AluOp::Sub, 5, 5);
        assert!(m.cond(Cc::E) && m.cond(Cc::AE) && m.cond(Cc::LE));
        m.alu(OpSize::S32, AluOp::Mul, 0x10000, 0x10000);
        assert!(m.cond(Cc::O));
        m.dcmp = f64::NAN.partial_cmp(&1.0);
        assert!(m.cond(Cc::DUnordered) && m.cond(Cc::DNeOrUnordered) && !m.cond(Cc::DEq));
    }

    #[test]
    fn double_helpers() {
        assert_eq!(cvt_truncate(-1.5), (-1i32) as u32);
        assert_eq!(cvt_truncate(3e9), 0x8000_0000);
        assert_eq!(cvt_truncate(f64::NAN), 0x8000_0000);
        assert!(dmin_max(0.0, -0.0, true).is_sign_negative());
        assert!(dmin_max(-0.0, 0.0, false).is_sign_positive());
        assert!(dmin_max(1.0, f64::NAN, false).is_nan());
        assert_eq!(dmin_max(1.0, 2.0, true), 1.0);
    }
}
