//! Taking an OSR exit: undo any in-flight speculative arithmetic, then rebuild the value of every
//! interpreter-visible variable from the variable event stream.

use super::{Runtime, SimError, simulator::Machine};
use crate::{
    compile::{
        CompiledCode,
        gen_info::DataFormat,
        graph::CodeOrigin,
        machine::{Operand, abi::FRAME},
        osr_exit::{ExitIdx, ExitKind, SpeculationRecovery},
        variable_event::{ValueRecovery, reconstruct},
    },
    value::{JSValue, VALUE_FALSE},
};
use std::sync::Arc;

/// The interpreter state at an OSR exit.
#[derive(Clone, Debug)]
pub struct ExitState {
    pub exit: ExitIdx,
    pub kind: ExitKind,
    /// Where the lower tier resumes.
    pub origin: CodeOrigin,
    /// `this` first.
    pub arguments: Vec<JSValue>,
    pub locals: Vec<JSValue>,
    /// Have the exits of this code been taken often enough that it should be recompiled?
    pub recompile: bool,
}

impl Runtime {
    fn box_bits(bits: u64, format: DataFormat) -> JSValue {
        match format {
            // A boxed int32's payload survives a speculative 32-bit operation on its register,
            // its tag may not.
            DataFormat::Int32 | DataFormat::JSInt32 => JSValue::int32(bits as u32 as i32),
            DataFormat::Double => JSValue::number(f64::from_bits(bits)),
            DataFormat::Boolean => JSValue::boolean(bits & 1 != 0),
            DataFormat::None => JSValue::UNDEFINED,
            _ => JSValue::from_bits(bits),
        }
    }

    fn recover(&self, m: &Machine, r: ValueRecovery) -> Result<JSValue, SimError> {
        Ok(match r {
            ValueRecovery::InJSStack { slot, format } => {
                let a = m.gpr(FRAME).wrapping_add(slot.offset() as i64 as u64);
                Self::box_bits(self.mem.read_u64(a)?, format)
            }
            ValueRecovery::InGpr { gpr, format } => Self::box_bits(m.gpr(gpr), format),
            ValueRecovery::InFpr(f) => JSValue::number(m.fpr(f)),
            ValueRecovery::Uint32InGpr(r) => JSValue::number(f64::from(m.gpr(r) as u32)),
            ValueRecovery::Constant(v) => v,
            ValueRecovery::Dead => JSValue::UNDEFINED,
        })
    }

    pub(super) fn take_exit(
        &mut self,
        m: &Machine,
        code: &Arc<CompiledCode>,
    ) -> Result<ExitState, SimError> {
        let idx = ExitIdx::from_raw(m.exit_index);
        let ce = code
            .exits()
            .get(idx)
            .ok_or_else(|| SimError::Unsupported(format!("no exit {}", m.exit_index)))?;
        let x = &ce.exit;
        let mut m = m.clone();
        match x.recovery {
            Some(SpeculationRecovery::SpeculativeAdd { dst, src }) => {
                let b = match src {
                    Operand::Reg(r) => m.gpr(r) & 0xFFFF_FFFF,
                    Operand::Imm(i) => u64::from(i as u32),
                };
                let a = m.gpr(dst) & 0xFFFF_FFFF;
                m.set_gpr(dst, u64::from((a as u32).wrapping_sub(b as u32)));
            }
            Some(SpeculationRecovery::BooleanCheck { gpr }) => {
                m.set_gpr(gpr, m.gpr(gpr) ^ VALUE_FALSE);
            }
            None => (),
        }

        let mut recoveries = reconstruct(code.events().events(), x.stream_index, code.graph());
        if let Some(o) = x.value_override
            && let Some(r) = recoveries.get_mut(o.operand)
        {
            *r = o.recovery;
        }
        let arguments = recoveries
            .arguments
            .iter()
            .map(|r| self.recover(&m, *r))
            .collect::<Result<Vec<_>, _>>()?;
        let locals = recoveries
            .locals
            .iter()
            .map(|r| self.recover(&m, *r))
            .collect::<Result<Vec<_>, _>>()?;
        let recompile = code.note_exit(idx);
        Ok(ExitState {
            exit: idx,
            kind: x.kind,
            origin: x.origin,
            arguments,
            locals,
            recompile,
        })
    }
}
