//! OSR exit records.
//!
//! Every guard that can fail at run-time creates exactly one [OsrExit]. The record does not
//! snapshot the frame: it remembers how far the [crate::compile::variable_event] stream had got
//! when the guard was emitted, so recovery can be computed lazily if the exit is ever taken.

use crate::compile::{
    graph::{BlockIdx, CodeOrigin, Graph, NodeIdx, Op, VirtualRegister},
    machine::{Gpr, Operand, asm::LabelIdx},
    variable_event::ValueRecovery,
};
use index_vec::IndexVec;
use strum::Display;

index_vec::define_index_type! {
    pub struct ExitIdx = u32;
}

/// Why an exit was taken.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum ExitKind {
    /// A value's type disagreed with the speculation.
    BadType,
    /// An object's structure did not match the expected set.
    BadCache,
    BadIndexingType,
    Overflow,
    NegativeZero,
    OutOfBounds,
    LoadFromHole,
    ArgumentTypeCheck,
    /// Upstream profiling never saw this code run.
    InadequateCoverage,
    /// A check whose failure is not tracked individually.
    Uncountable,
    /// A watchpoint this code relied on has been fired.
    UncountableWatchpoint,
}

/// A register-level operation that must be undone before an exit's state is reconstructed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SpeculationRecovery {
    /// `dst` holds the result of an overflowing `dst + src`: subtract `src` to recover the int32
    /// that was in `dst`.
    SpeculativeAdd { dst: Gpr, src: Operand },
    /// `gpr` has been xored with `false` as part of a boolean check.
    BooleanCheck { gpr: Gpr },
}

/// A special recovery for a single interpreter-visible operand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValueOverride {
    pub operand: VirtualRegister,
    pub recovery: ValueRecovery,
}

#[derive(Clone, Debug)]
pub struct OsrExit {
    pub kind: ExitKind,
    /// Where execution resumes in the lower tier.
    pub origin: CodeOrigin,
    /// How many variable events had been emitted when the guard was.
    pub stream_index: usize,
    pub value_override: Option<ValueOverride>,
    pub recovery: Option<SpeculationRecovery>,
    /// The node whose guard this is.
    pub node: NodeIdx,
    pub is_forward: bool,
    /// Is this exit reached by firing a watchpoint rather than a failing branch?
    pub is_watchpoint: bool,
    /// The exit stub every failure jump targets. Only attached (and so only reachable) once the
    /// main path and slow paths have been emitted.
    pub(crate) stub: LabelIdx,
}

/// The append-only list of exits created during a compile.
#[derive(Debug, Default)]
pub(crate) struct OsrExitList {
    exits: IndexVec<ExitIdx, OsrExit>,
}

impl OsrExitList {
    pub(crate) fn push(&mut self, exit: OsrExit) -> ExitIdx {
        self.exits.push(exit)
    }

    pub(crate) fn len(&self) -> usize {
        self.exits.len()
    }

    pub(crate) fn get(&self, idx: ExitIdx) -> &OsrExit {
        &self.exits[idx]
    }

    /// Records may only be altered while the node that created them is being lowered.
    pub(crate) fn get_mut(&mut self, idx: ExitIdx) -> &mut OsrExit {
        &mut self.exits[idx]
    }

    pub(crate) fn iter_enumerated(&self) -> impl Iterator<Item = (ExitIdx, &OsrExit)> {
        self.exits.iter_enumerated()
    }

    pub(crate) fn into_vec(self) -> IndexVec<ExitIdx, OsrExit> {
        self.exits
    }
}

/// Starting from the node at `pos` in `bidx`, find the position of the `SetLocal` that stores its
/// value. `MovHint`, `Flush`, and `Phantom` nodes may intervene, as may a single `Int32ToDouble`
/// of the value (in which case the `SetLocal` must store the converted value).
pub(crate) fn find_forward_set_local(g: &Graph, bidx: BlockIdx, pos: usize) -> Option<usize> {
    let nodes = &g.blocks[bidx].nodes;
    let mut value = *nodes.get(pos)?;
    let mut converted = false;
    for (i, nidx) in nodes.iter().enumerate().skip(pos + 1) {
        let n = &g.nodes[*nidx];
        match n.op {
            Op::MovHint(_) | Op::Flush(_) | Op::Phantom => (),
            Op::Int32ToDouble if !converted && n.children[0].node == value => {
                converted = true;
                value = *nidx;
            }
            Op::SetLocal(_) if n.children[0].node == value => return Some(i),
            _ => return None,
        }
    }
    None
}

/// If an exit guarding the node at `pos` in `bidx` can be converted into a forward exit that
/// resumes after the `SetLocal` at `set_local_pos`, return the origin to resume at and the
/// operand the `SetLocal` stores to.
pub(crate) fn forward_resume(
    g: &Graph,
    bidx: BlockIdx,
    pos: usize,
    set_local_pos: usize,
) -> Option<(CodeOrigin, VirtualRegister)> {
    let nodes = &g.blocks[bidx].nodes;
    let cur = &g.nodes[nodes[pos]];
    let sl = &g.nodes[*nodes.get(set_local_pos)?];
    let Op::SetLocal(var) = sl.op else {
        return None;
    };
    let next = nodes.get(set_local_pos + 1).map(|x| &g.nodes[*x]);
    // A same-origin jump after the store marks the return from an inlined call: there is no
    // safe place to resume after it.
    if let Some(n) = next
        && matches!(n.op, Op::Jump(_))
        && n.origin == cur.origin
    {
        return None;
    }
    let origin = if sl.origin != cur.origin {
        sl.origin
    } else {
        next.filter(|n| n.origin != cur.origin)?.origin
    };
    Some((origin, g.variables[var].operand))
}
