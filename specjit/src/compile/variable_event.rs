//! The variable event stream.
//!
//! Rather than snapshotting the location of every interpreter-visible value at every OSR exit, the
//! backend appends an event to a single stream whenever a value is born into a register, moves,
//! is spilled, or dies, and whenever an interpreter-visible local is hinted or stored. An exit
//! records only its position in the stream; [reconstruct] replays the stream from the start of the
//! exit's block to work out where each interpreter-visible value lives at that point.

use crate::{
    compile::{
        gen_info::{DataFormat, RegLoc},
        graph::{FlushFormat, Graph, NodeIdx, VirtualRegister},
        machine::{Fpr, Gpr},
    },
    value::JSValue,
};
use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VariableEvent {
    /// The start of a block: all register state is forgotten.
    Reset,
    /// A value was produced directly into a register.
    Birth {
        node: NodeIdx,
        loc: RegLoc,
        format: DataFormat,
    },
    /// A value was loaded into, or moved to, a register.
    Fill {
        node: NodeIdx,
        loc: RegLoc,
        format: DataFormat,
    },
    /// A value was stored to its spill slot and is no longer in a register.
    Spill {
        node: NodeIdx,
        slot: VirtualRegister,
        format: DataFormat,
    },
    Death { node: NodeIdx },
    /// The interpreter-visible `operand` now holds `node`'s value.
    MovHint {
        node: NodeIdx,
        operand: VirtualRegister,
    },
    /// `operand`'s frame slot now holds its value in `format`.
    SetLocal {
        operand: VirtualRegister,
        format: DataFormat,
    },
}

impl Display for VariableEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let loc = |l: &RegLoc| match l {
            RegLoc::Gpr(r) => r.to_string(),
            RegLoc::Fpr(r) => r.to_string(),
            RegLoc::None => "-".to_owned(),
        };
        match self {
            VariableEvent::Reset => write!(f, "reset"),
            VariableEvent::Birth { node, loc: l, format } => {
                write!(f, "birth @{} {} {format}", usize::from(*node), loc(l))
            }
            VariableEvent::Fill { node, loc: l, format } => {
                write!(f, "fill @{} {} {format}", usize::from(*node), loc(l))
            }
            VariableEvent::Spill { node, slot, format } => {
                write!(f, "spill @{} {slot} {format}", usize::from(*node))
            }
            VariableEvent::Death { node } => write!(f, "death @{}", usize::from(*node)),
            VariableEvent::MovHint { node, operand } => {
                write!(f, "movhint @{} {operand}", usize::from(*node))
            }
            VariableEvent::SetLocal { operand, format } => write!(f, "setlocal {operand} {format}"),
        }
    }
}

/// An append-only stream of [VariableEvent]s.
#[derive(Clone, Debug, Default)]
pub struct VariableEventStream {
    events: Vec<VariableEvent>,
}

impl VariableEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, e: VariableEvent) {
        self.events.push(e);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[VariableEvent] {
        &self.events
    }
}

/// The format a variable's frame slot holds its value in. Int32s, booleans, and cells are always
/// stored boxed; only doubles are stored raw.
pub fn flush_data_format(ff: FlushFormat) -> DataFormat {
    match ff {
        FlushFormat::JSValue => DataFormat::JS,
        FlushFormat::Int32 => DataFormat::JSInt32,
        FlushFormat::Double => DataFormat::Double,
        FlushFormat::Boolean => DataFormat::JSBoolean,
        FlushFormat::Cell => DataFormat::JSCell,
    }
}

/// How to recover an interpreter-visible value at an OSR exit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueRecovery {
    /// In frame slot `slot`, in `format`.
    InJSStack {
        slot: VirtualRegister,
        format: DataFormat,
    },
    InGpr {
        gpr: Gpr,
        format: DataFormat,
    },
    InFpr(Fpr),
    /// The low 32 bits of a GPR, to be interpreted as an unsigned integer.
    Uint32InGpr(Gpr),
    Constant(JSValue),
    /// The value is not live: `undefined` will do.
    Dead,
}

impl Display for ValueRecovery {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ValueRecovery::InJSStack { slot, format } => write!(f, "{slot}:{format}"),
            ValueRecovery::InGpr { gpr, format } => write!(f, "{gpr}:{format}"),
            ValueRecovery::InFpr(r) => write!(f, "{r}:Double"),
            ValueRecovery::Uint32InGpr(r) => write!(f, "{r}:UInt32"),
            ValueRecovery::Constant(v) => write!(f, "const({v})"),
            ValueRecovery::Dead => write!(f, "dead"),
        }
    }
}

/// Recoveries for every interpreter-visible value.
#[derive(Clone, Debug, PartialEq)]
pub struct Operands<T> {
    pub arguments: Vec<T>,
    pub locals: Vec<T>,
}

impl<T> Operands<T> {
    pub fn get_mut(&mut self, operand: VirtualRegister) -> Option<&mut T> {
        match (operand.to_argument(), operand.to_local()) {
            (Some(i), _) => self.arguments.get_mut(i),
            (_, Some(i)) => self.locals.get_mut(i),
            _ => None,
        }
    }

    pub fn get(&self, operand: VirtualRegister) -> Option<&T> {
        match (operand.to_argument(), operand.to_local()) {
            (Some(i), _) => self.arguments.get(i),
            (_, Some(i)) => self.locals.get(i),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Default)]
struct NodeState {
    reg: Option<(RegLoc, DataFormat)>,
    spill: Option<(VirtualRegister, DataFormat)>,
}

#[derive(Clone, Copy)]
enum OperandState {
    Hinted(NodeIdx),
    Stored(DataFormat),
}

/// Compute the recovery of every interpreter-visible value for an exit which saw the first
/// `index` events of `stream`.
pub fn reconstruct(stream: &[VariableEvent], index: usize, g: &Graph) -> Operands<ValueRecovery> {
    let index = index.min(stream.len());
    let start = stream[..index]
        .iter()
        .rposition(|e| *e == VariableEvent::Reset)
        .unwrap_or(0);
    let mut nodes: HashMap<NodeIdx, NodeState> = HashMap::new();
    let mut operands: HashMap<VirtualRegister, OperandState> = HashMap::new();
    for e in &stream[start..index] {
        match *e {
            VariableEvent::Reset => {
                nodes.clear();
                operands.clear();
            }
            VariableEvent::Birth { node, loc, format } => {
                nodes.insert(
                    node,
                    NodeState {
                        reg: Some((loc, format)),
                        spill: None,
                    },
                );
            }
            VariableEvent::Fill { node, loc, format } => {
                nodes.entry(node).or_default().reg = Some((loc, format));
            }
            VariableEvent::Spill { node, slot, format } => {
                let s = nodes.entry(node).or_default();
                s.reg = None;
                s.spill = Some((slot, format));
            }
            VariableEvent::Death { node } => {
                nodes.remove(&node);
            }
            VariableEvent::MovHint { node, operand } => {
                operands.insert(operand, OperandState::Hinted(node));
            }
            VariableEvent::SetLocal { operand, format } => {
                operands.insert(operand, OperandState::Stored(format));
            }
        }
    }

    let recover = |operand: VirtualRegister| match operands.get(&operand) {
        None => ValueRecovery::Dead,
        Some(OperandState::Stored(format)) => ValueRecovery::InJSStack {
            slot: operand,
            format: *format,
        },
        Some(OperandState::Hinted(node)) => {
            if let Some(v) = g.as_js_constant(*node) {
                return ValueRecovery::Constant(v);
            }
            match nodes.get(node) {
                Some(NodeState {
                    reg: Some((RegLoc::Gpr(gpr), format)),
                    ..
                }) => ValueRecovery::InGpr {
                    gpr: *gpr,
                    format: *format,
                },
                Some(NodeState {
                    reg: Some((RegLoc::Fpr(fpr), _)),
                    ..
                }) => ValueRecovery::InFpr(*fpr),
                Some(NodeState {
                    spill: Some((slot, format)),
                    ..
                }) => ValueRecovery::InJSStack {
                    slot: *slot,
                    format: *format,
                },
                _ => ValueRecovery::Dead,
            }
        }
    };

    Operands {
        arguments: (0..g.num_arguments())
            .map(|i| recover(VirtualRegister::argument(i)))
            .collect(),
        locals: (0..g.num_vars)
            .map(|i| recover(VirtualRegister::local(i)))
            .collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::{
        graph::{GraphKind, Op},
        graph_builder::GraphBuilder,
        spec_type::SpecType,
    };

    #[test]
    fn replay() {
        let mut gb = GraphBuilder::new("f", GraphKind::Function);
        gb.argument(SpecType::OTHER, FlushFormat::JSValue);
        let a = gb.argument(SpecType::INT32, FlushFormat::JSValue);
        let v0 = gb.variable(SpecType::INT32, FlushFormat::JSValue);
        let v1 = gb.variable(SpecType::INT32, FlushFormat::JSValue);
        let bb0 = gb.block();
        gb.switch_to(bb0);
        let x = gb.get_local(a);
        let c = gb.constant(crate::value::JSValue::int32(9));
        gb.node(Op::MovHint(v0), &[x], SpecType::EMPTY);
        gb.node(Op::MovHint(v1), &[c], SpecType::EMPTY);
        gb.node(Op::Return, &[x], SpecType::EMPTY);
        let g = gb.finish().unwrap();

        let arg0 = VirtualRegister::argument(0);
        let arg1 = VirtualRegister::argument(1);
        let mut s = VariableEventStream::new();
        s.append(VariableEvent::Reset);
        s.append(VariableEvent::SetLocal {
            operand: arg0,
            format: DataFormat::JS,
        });
        s.append(VariableEvent::SetLocal {
            operand: arg1,
            format: DataFormat::JS,
        });
        s.append(VariableEvent::Birth {
            node: x,
            loc: RegLoc::Gpr(Gpr::R3),
            format: DataFormat::JSInt32,
        });
        s.append(VariableEvent::MovHint {
            node: x,
            operand: VirtualRegister::local(0),
        });
        s.append(VariableEvent::MovHint {
            node: c,
            operand: VirtualRegister::local(1),
        });
        let at_hint = s.len();
        s.append(VariableEvent::Spill {
            node: x,
            slot: VirtualRegister::local(2),
            format: DataFormat::JSInt32,
        });
        let at_spill = s.len();
        s.append(VariableEvent::Death { node: x });

        let r = reconstruct(s.events(), at_hint, &g);
        assert_eq!(
            r.arguments[1],
            ValueRecovery::InJSStack {
                slot: arg1,
                format: DataFormat::JS
            }
        );
        assert_eq!(
            r.locals[0],
            ValueRecovery::InGpr {
                gpr: Gpr::R3,
                format: DataFormat::JSInt32
            }
        );
        assert_eq!(
            r.locals[1],
            ValueRecovery::Constant(crate::value::JSValue::int32(9))
        );
        let r = reconstruct(s.events(), at_spill, &g);
        assert_eq!(
            r.locals[0],
            ValueRecovery::InJSStack {
                slot: VirtualRegister::local(2),
                format: DataFormat::JSInt32
            }
        );
        let r = reconstruct(s.events(), s.len(), &g);
        assert_eq!(r.locals[0], ValueRecovery::Dead);
    }
}
