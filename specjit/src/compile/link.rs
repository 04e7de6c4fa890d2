//! Linking: resolving relocations once the code's final address is known, and filling in the
//! jump tables of the switches the code contains.

use crate::compile::{
    CompilationError,
    code_block::CodeBlock,
    graph::{BlockIdx, Graph, NodeIdx, Op, SwitchCase, SwitchKind},
    machine::{
        Inst,
        abi::{helper_address, thunk_address},
        asm::{AbsTarget, AssembledCode, RelocKind},
        encode::{abs64_field, decode, rel32_field},
    },
};
use std::collections::HashMap;
use vob::Vob;

/// Patch every relocation in `ac.code`, which will be mapped at `base`.
pub(super) fn apply_relocs(ac: &mut AssembledCode, base: u64) -> Result<(), CompilationError> {
    for r in &ac.relocs {
        let off = r.off as usize;
        let (inst, _) = decode(&ac.code, off)
            .map_err(|e| CompilationError::InternalError(format!("At 0x{off:x}: {e}")))?;
        match r.reloc {
            RelocKind::Label(l) => {
                let field = rel32_field(&inst).ok_or_else(|| {
                    CompilationError::InternalError(format!("{inst} has no relative field"))
                })?;
                let target = i64::from(ac.label_off(l)?);
                let next = i64::from(r.off) + i64::from(r.len);
                let rel = i32::try_from(target - next).map_err(|_| {
                    CompilationError::LimitExceeded("Relative jump out of range".into())
                })?;
                ac.code[off + field..off + field + 4].copy_from_slice(&rel.to_le_bytes());
            }
            RelocKind::LabelAbs(l) => {
                let target = base + u64::from(ac.label_off(l)?);
                patch_abs64(&mut ac.code, off, &inst, target)?;
            }
            RelocKind::Abs(AbsTarget::Helper(h)) => {
                patch_abs64(&mut ac.code, off, &inst, helper_address(h))?
            }
            RelocKind::Abs(AbsTarget::Thunk(t)) => {
                patch_abs64(&mut ac.code, off, &inst, thunk_address(t))?
            }
        }
    }
    Ok(())
}

fn patch_abs64(
    code: &mut [u8],
    off: usize,
    inst: &Inst,
    target: u64,
) -> Result<(), CompilationError> {
    let field = abs64_field(inst)
        .ok_or_else(|| CompilationError::InternalError(format!("{inst} has no absolute field")))?;
    code[off + field..off + field + 8].copy_from_slice(&target.to_le_bytes());
    Ok(())
}

/// Fill the jump tables of every switch in `switches`. `block_addr` maps a block to its code
/// address. Dense tables no switch in this code uses are cleared, so that stale addresses from a
/// previous compile can never be jumped to.
pub(super) fn link_jump_tables(
    g: &Graph,
    code_block: &CodeBlock,
    switches: &[NodeIdx],
    block_addr: impl Fn(BlockIdx) -> Result<u64, CompilationError>,
) -> Result<(), CompilationError> {
    let mut tables = code_block.tables();
    let mut used = Vob::from_elem(false, tables.imm.len());
    for nidx in switches {
        let Op::Switch(data) = &g.nodes[*nidx].op else {
            return Err(CompilationError::InternalError(format!(
                "@{} is not a switch",
                usize::from(*nidx)
            )));
        };
        let fallthrough = block_addr(data.fallthrough)?;
        match data.kind {
            SwitchKind::Imm => {
                let t = tables.imm.get_mut(data.table).ok_or_else(|| {
                    CompilationError::General(format!("No jump table {}", data.table))
                })?;
                used.set(data.table, true);
                t.ctis = vec![fallthrough; t.len];
                t.default = fallthrough;
                for (case, target) in &data.cases {
                    let SwitchCase::Imm(v) = case else {
                        return Err(CompilationError::General(
                            "String case in an integer switch".into(),
                        ));
                    };
                    let i = usize::try_from(i64::from(*v) - i64::from(t.min))
                        .ok()
                        .filter(|i| *i < t.len)
                        .ok_or_else(|| {
                            CompilationError::General(format!(
                                "Case {v} is outside jump table {}",
                                data.table
                            ))
                        })?;
                    t.ctis[i] = block_addr(*target)?;
                }
            }
            SwitchKind::String => {
                let t = tables.string.get_mut(data.table).ok_or_else(|| {
                    CompilationError::General(format!("No string jump table {}", data.table))
                })?;
                // The key set belongs to the lower tier: a case it lacks means the switch was
                // built against a different table.
                let mut entries = HashMap::with_capacity(data.cases.len());
                for (case, target) in &data.cases {
                    let SwitchCase::String(s) = case else {
                        return Err(CompilationError::General(
                            "Integer case in a string switch".into(),
                        ));
                    };
                    if !t.entries.contains_key(s) {
                        return Err(CompilationError::General(format!(
                            "Case {s:?} is not in string jump table {}",
                            data.table
                        )));
                    }
                    entries.insert(s.clone(), block_addr(*target)?);
                }
                for (k, v) in t.entries.iter_mut() {
                    *v = entries.get(k).copied().unwrap_or(fallthrough);
                }
                t.default = fallthrough;
            }
        }
    }
    for (i, t) in tables.imm.iter_mut().enumerate() {
        if !used.get(i).unwrap_or(false) {
            t.ctis.clear();
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::machine::{Cc, Gpr, Inst, asm::Asm};

    #[test]
    fn relocs() {
        let mut asm = Asm::new(false);
        let l = asm.mk_label();
        asm.push_reloc(Inst::Jcc { cc: Cc::E, rel: 0 }, RelocKind::Label(l));
        asm.push_inst(Inst::Nop);
        asm.attach_label(l);
        asm.push_reloc(
            Inst::MovImm {
                dst: Gpr::R0,
                imm: 0,
            },
            RelocKind::LabelAbs(l),
        );
        let mut ac = asm.finish();
        apply_relocs(&mut ac, 0x1000).unwrap();
        let (jcc, len) = decode(&ac.code, 0).unwrap();
        assert_eq!(jcc, Inst::Jcc { cc: Cc::E, rel: 1 });
        let (mi, _) = decode(&ac.code, len + 1).unwrap();
        assert_eq!(
            mi,
            Inst::MovImm {
                dst: Gpr::R0,
                imm: 0x1000 + (len as u64) + 1
            }
        );
    }
}
