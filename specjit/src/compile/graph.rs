//! The dataflow graph consumed by the backend.
//!
//! A [Graph] is produced (and frozen) by upstream passes: by the time it reaches us every node has
//! a prediction, every edge has a [UseKind] telling us what the consumer requires of the producer,
//! and reference counts say how many generated nodes consume each value. Nodes live in a single
//! arena and refer to each other by [NodeIdx]; a [BasicBlock] is an ordered list of such indexes.
//!
//! Values never flow between blocks except through the frame: a value produced in one block and
//! needed in another must be stored with [Op::SetLocal] and reloaded with [Op::GetLocal].

use crate::{
    compile::{machine::abi::CALL_FRAME_HEADER_SIZE, spec_type::SpecType},
    value::JSValue,
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};
use strum::Display;

index_vec::define_index_type! {
    pub struct NodeIdx = u32;
}

index_vec::define_index_type! {
    pub struct BlockIdx = u16;
}

index_vec::define_index_type! {
    pub struct VariableIdx = u32;
}

index_vec::define_index_type! {
    /// An index into [Graph::identifiers].
    pub struct IdentIdx = u32;
}

index_vec::define_index_type! {
    pub struct InlineFrameIdx = u16;
}

/// A slot in the abstract frame. Arguments (`this` first) live after the call frame header at
/// non-negative indexes; locals and temporaries live at negative indexes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtualRegister(i32);

impl VirtualRegister {
    pub fn argument(i: usize) -> Self {
        Self(CALL_FRAME_HEADER_SIZE + i as i32)
    }

    pub fn local(i: usize) -> Self {
        Self(-(i as i32) - 1)
    }

    pub fn is_argument(self) -> bool {
        self.0 >= CALL_FRAME_HEADER_SIZE
    }

    pub fn is_local(self) -> bool {
        self.0 < 0
    }

    /// If this is an argument, return its index.
    pub fn to_argument(self) -> Option<usize> {
        if self.is_argument() {
            Some((self.0 - CALL_FRAME_HEADER_SIZE) as usize)
        } else {
            None
        }
    }

    /// If this is a local, return its index.
    pub fn to_local(self) -> Option<usize> {
        if self.is_local() {
            Some((-self.0 - 1) as usize)
        } else {
            None
        }
    }

    /// The byte offset of this slot from the call frame register.
    pub fn offset(self) -> i32 {
        self.0 * 8
    }
}

impl Display for VirtualRegister {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.to_argument(), self.to_local()) {
            (Some(i), _) => write!(f, "arg{i}"),
            (_, Some(i)) => write!(f, "loc{i}"),
            _ => write!(f, "hdr{}", self.0),
        }
    }
}

/// Where in the source program a node came from.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CodeOrigin {
    pub bytecode_index: u32,
    /// `None` for the outermost function.
    pub inline_frame: Option<InlineFrameIdx>,
}

impl CodeOrigin {
    pub fn new(bytecode_index: u32) -> Self {
        Self {
            bytecode_index,
            inline_frame: None,
        }
    }

    pub fn inlined(bytecode_index: u32, inline_frame: InlineFrameIdx) -> Self {
        Self {
            bytecode_index,
            inline_frame: Some(inline_frame),
        }
    }
}

impl Display for CodeOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.inline_frame {
            Some(x) => write!(f, "bc#{}@if{}", self.bytecode_index, usize::from(x)),
            None => write!(f, "bc#{}", self.bytecode_index),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InlineFrame {
    pub callee_name: String,
    pub caller: CodeOrigin,
}

/// What a consumer requires of a producer's value.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum UseKind {
    /// Anything: the value will be consumed boxed.
    Untyped,
    /// Speculate that the value is an int32.
    Int32,
    /// The value is known to be an int32: no check is required.
    KnownInt32,
    /// Speculate that the value is a number; int32s are converted to doubles.
    Number,
    Boolean,
    Cell,
    /// The value is known to be a cell: no check is required.
    KnownCell,
    /// Speculate that the value is a non-string cell.
    Object,
    /// Speculate that the value is a non-string cell, `null`, or `undefined`.
    ObjectOrOther,
    String,
}

impl UseKind {
    /// The set of types a value consumed with this use kind is known to have after the use has
    /// executed.
    pub fn filter(self) -> SpecType {
        match self {
            UseKind::Untyped => SpecType::TOP,
            UseKind::Int32 | UseKind::KnownInt32 => SpecType::INT32,
            UseKind::Number => SpecType::NUMBER,
            UseKind::Boolean => SpecType::BOOLEAN,
            UseKind::Cell | UseKind::KnownCell => SpecType::CELL,
            UseKind::Object => SpecType::OBJECT,
            UseKind::ObjectOrOther => SpecType::OBJECT.union(SpecType::OTHER),
            UseKind::String => SpecType::STRING,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Edge {
    pub node: NodeIdx,
    pub use_kind: UseKind,
}

impl Edge {
    pub fn new(node: NodeIdx, use_kind: UseKind) -> Self {
        Self { node, use_kind }
    }

    pub fn untyped(node: NodeIdx) -> Self {
        Self::new(node, UseKind::Untyped)
    }
}

impl Display for Edge {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.use_kind {
            UseKind::Untyped => write!(f, "@{}", usize::from(self.node)),
            k => write!(f, "{k}:@{}", usize::from(self.node)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NodeFlags(u16);

impl NodeFlags {
    pub const NONE: NodeFlags = NodeFlags(0);
    /// The consumers of this integer result only care about its low 32 bits: overflow need not be
    /// checked.
    pub const CAN_TRUNCATE: NodeFlags = NodeFlags(1 << 0);
    /// Consumers can distinguish `-0` from `0`, so producing a negative zero must be guarded.
    pub const NEEDS_NEG_ZERO: NodeFlags = NodeFlags(1 << 1);
    /// Generate this node even if nothing uses its result.
    pub const MUST_GENERATE: NodeFlags = NodeFlags(1 << 2);
    /// Upstream analysis believes this node can OSR exit.
    pub const CAN_EXIT: NodeFlags = NodeFlags(1 << 3);

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | other.0)
    }
}

/// The indexing / element representation a heap access speculates on.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ArrayMode {
    /// Boxed values in a butterfly.
    Contiguous,
    /// Unboxed doubles in a butterfly; holes are NaN.
    Double,
    Int32Array,
    Float64Array,
    String,
}

impl ArrayMode {
    pub fn uses_butterfly(self) -> bool {
        matches!(self, ArrayMode::Contiguous | ArrayMode::Double)
    }

    pub fn spec_type(self) -> SpecType {
        match self {
            ArrayMode::Contiguous | ArrayMode::Double => SpecType::OBJECT,
            ArrayMode::Int32Array => SpecType::INT32_ARRAY,
            ArrayMode::Float64Array => SpecType::FLOAT64_ARRAY,
            ArrayMode::String => SpecType::STRING,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SwitchKind {
    Imm,
    String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SwitchCase {
    Imm(i32),
    String(Arc<str>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwitchData {
    pub kind: SwitchKind,
    /// The index of the code block's jump table of the appropriate kind.
    pub table: usize,
    pub cases: Vec<(SwitchCase, BlockIdx)>,
    pub fallthrough: BlockIdx,
}

#[derive(Clone, Debug, Display, PartialEq)]
pub enum Op {
    JSConstant(JSValue),
    DoubleConstant(f64),
    GetLocal(VariableIdx),
    SetLocal(VariableIdx),
    /// The interpreter-visible local now holds the child's value, even though it has not (yet)
    /// been stored.
    MovHint(VariableIdx),
    Flush(VariableIdx),
    Phantom,
    Phi(VariableIdx),
    ArithAdd,
    ArithSub,
    ArithMul,
    ArithNegate,
    ArithDiv,
    ArithMod,
    ArithAbs,
    ArithMin,
    ArithMax,
    ArithSqrt,
    ValueAdd,
    BitAnd,
    BitOr,
    BitXor,
    BitLShift,
    BitRShift,
    BitURShift,
    ValueToInt32,
    UInt32ToNumber,
    Int32ToDouble,
    DoubleAsInt32,
    CompareLess,
    CompareLessEq,
    CompareGreater,
    CompareGreaterEq,
    CompareEq,
    CompareStrictEq,
    LogicalNot,
    /// Children: `[cell]`. The data is the set of acceptable structure addresses.
    CheckStructure(SmallVec<[u64; 2]>),
    CheckArray(ArrayMode),
    Arrayify(ArrayMode),
    GetIndexedPropertyStorage(ArrayMode),
    /// Children: `[base, index, storage]`.
    GetByVal(ArrayMode),
    /// Children: `[base, index, value, storage]`.
    PutByVal(ArrayMode),
    /// Children: `[base]` or, for butterfly modes, `[base, storage]`.
    GetArrayLength(ArrayMode),
    /// Children: `[string, index, storage]`.
    StringCharCodeAt,
    StringCharAt,
    GetById(IdentIdx),
    PutById(IdentIdx),
    CheckHasInstance,
    /// Children: `[value, prototype]`.
    InstanceOf,
    /// Children: `[callee, this, args...]`.
    Call,
    Jump(BlockIdx),
    Branch {
        taken: BlockIdx,
        not_taken: BlockIdx,
    },
    Switch(Box<SwitchData>),
    Return,
    Throw,
    ForceOSRExit,
}

impl Op {
    /// Does this node produce a value?
    pub fn has_result(&self) -> bool {
        !matches!(
            self,
            Op::SetLocal(_)
                | Op::MovHint(_)
                | Op::Flush(_)
                | Op::Phantom
                | Op::Phi(_)
                | Op::CheckStructure(_)
                | Op::CheckArray(_)
                | Op::Arrayify(_)
                | Op::PutByVal(_)
                | Op::PutById(_)
                | Op::CheckHasInstance
                | Op::Jump(_)
                | Op::Branch { .. }
                | Op::Switch(_)
                | Op::Return
                | Op::Throw
                | Op::ForceOSRExit
        )
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Op::JSConstant(_) | Op::DoubleConstant(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Op::Jump(_) | Op::Branch { .. } | Op::Switch(_) | Op::Return | Op::Throw
        )
    }

    pub fn is_compare(&self) -> bool {
        matches!(
            self,
            Op::CompareLess
                | Op::CompareLessEq
                | Op::CompareGreater
                | Op::CompareGreaterEq
                | Op::CompareEq
                | Op::CompareStrictEq
        )
    }

    /// Nodes which must be generated regardless of whether their result is used.
    pub fn has_side_effects(&self) -> bool {
        !self.has_result()
            || matches!(
                self,
                Op::GetById(_) | Op::Call | Op::ValueAdd | Op::GetByVal(_)
            )
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub op: Op,
    pub children: SmallVec<[Edge; 3]>,
    /// The frame slot this node's value is spilled to, if it produces a value.
    pub vreg: Option<VirtualRegister>,
    pub prediction: SpecType,
    /// The types upstream analysis proved this node's result has.
    pub proven: SpecType,
    pub flags: NodeFlags,
    pub origin: CodeOrigin,
    /// How many generated nodes consume this node's value.
    pub ref_count: u32,
    /// For nodes which may exit forward, the `SetLocal` that stores their value.
    pub forward_target: Option<NodeIdx>,
}

impl Node {
    pub fn new(op: Op, children: &[Edge], origin: CodeOrigin) -> Self {
        Self {
            op,
            children: SmallVec::from_slice(children),
            vreg: None,
            prediction: SpecType::EMPTY,
            proven: SpecType::TOP,
            flags: NodeFlags::NONE,
            origin,
            ref_count: 0,
            forward_target: None,
        }
    }

    pub fn child(&self, i: usize) -> Edge {
        self.children[i]
    }

    pub fn should_generate(&self) -> bool {
        self.ref_count > 0 || self.flags.contains(NodeFlags::MUST_GENERATE)
    }

    pub fn can_truncate(&self) -> bool {
        self.flags.contains(NodeFlags::CAN_TRUNCATE)
    }

    pub fn needs_neg_zero_check(&self) -> bool {
        self.flags.contains(NodeFlags::NEEDS_NEG_ZERO)
    }
}

/// How a variable is stored in its frame slot.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum FlushFormat {
    JSValue,
    Int32,
    /// An unboxed double. Never used for arguments, which are always boxed.
    Double,
    Boolean,
    Cell,
}

impl FlushFormat {
    pub fn use_kind(self) -> UseKind {
        match self {
            FlushFormat::JSValue => UseKind::Untyped,
            FlushFormat::Int32 => UseKind::Int32,
            FlushFormat::Double => UseKind::Number,
            FlushFormat::Boolean => UseKind::Boolean,
            FlushFormat::Cell => UseKind::Cell,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VariableAccessData {
    pub operand: VirtualRegister,
    pub prediction: SpecType,
    pub flush_format: FlushFormat,
}

#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    pub nodes: Vec<NodeIdx>,
    pub is_reachable: bool,
    /// Can execution enter optimised code at the start of this block?
    pub is_osr_target: bool,
    /// The variables that are live, in their frame slots, on entry to this block.
    pub variables_at_head: Vec<VariableIdx>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GraphKind {
    Function,
    Program,
}

#[derive(Clone, Debug)]
pub struct Graph {
    pub name: String,
    pub kind: GraphKind,
    pub nodes: IndexVec<NodeIdx, Node>,
    pub blocks: IndexVec<BlockIdx, BasicBlock>,
    pub variables: IndexVec<VariableIdx, VariableAccessData>,
    /// Argument variables, `this` first. Arguments are always present in their frame slots on
    /// entry.
    pub arguments: Vec<VariableIdx>,
    pub identifiers: IndexVec<IdentIdx, Arc<str>>,
    pub inline_frames: IndexVec<InlineFrameIdx, InlineFrame>,
    /// The number of interpreter-visible locals. Locals beyond this are temporaries.
    pub num_vars: usize,
    /// The total number of local slots including temporaries.
    pub num_locals: usize,
    /// Is this graph instrumented for profiling?
    pub profiling: bool,
}

impl Graph {
    pub fn num_arguments(&self) -> usize {
        self.arguments.len()
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx]
    }

    /// If `idx` is an int32 constant, return its value.
    pub fn as_int32_constant(&self, idx: NodeIdx) -> Option<i32> {
        match self.nodes[idx].op {
            Op::JSConstant(v) => v.as_int32(),
            _ => None,
        }
    }

    /// If `idx` is a numeric constant, return its value as a double.
    pub fn as_number_constant(&self, idx: NodeIdx) -> Option<f64> {
        match self.nodes[idx].op {
            Op::JSConstant(v) => v.as_number(),
            Op::DoubleConstant(d) => Some(d),
            _ => None,
        }
    }

    /// If `idx` is a constant, return its boxed value.
    pub fn as_js_constant(&self, idx: NodeIdx) -> Option<JSValue> {
        match self.nodes[idx].op {
            Op::JSConstant(v) => Some(v),
            Op::DoubleConstant(d) => Some(JSValue::double(d)),
            _ => None,
        }
    }

    /// The largest number of arguments (including `this`) passed by any call in the graph.
    pub fn max_call_args(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.op == Op::Call)
            .map(|n| n.children.len() - 1)
            .max()
            .unwrap_or(0)
    }

    /// The position of `nidx` within block `bidx`.
    pub fn block_position(&self, bidx: BlockIdx, nidx: NodeIdx) -> Option<usize> {
        self.blocks[bidx].nodes.iter().position(|x| *x == nidx)
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "; {} ({} args, {} vars, {} locals)",
            self.name,
            self.num_arguments(),
            self.num_vars,
            self.num_locals
        )?;
        for (bidx, b) in self.blocks.iter_enumerated() {
            write!(f, "bb{}:", usize::from(bidx))?;
            if !b.is_reachable {
                write!(f, " unreachable")?;
            }
            if b.is_osr_target {
                write!(f, " osr-target")?;
            }
            writeln!(f)?;
            for nidx in &b.nodes {
                let n = &self.nodes[*nidx];
                let args = n
                    .children
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "  @{}: ", usize::from(*nidx))?;
                match &n.op {
                    Op::JSConstant(v) => write!(f, "JSConstant({v})")?,
                    Op::DoubleConstant(d) => write!(f, "DoubleConstant({d:?})")?,
                    Op::GetLocal(v)
                    | Op::SetLocal(v)
                    | Op::MovHint(v)
                    | Op::Flush(v)
                    | Op::Phi(v) => write!(f, "{}({}, {args})", n.op, self.variables[*v].operand)?,
                    Op::Jump(t) => write!(f, "Jump(bb{})", usize::from(*t))?,
                    Op::Branch { taken, not_taken } => write!(
                        f,
                        "Branch({args}, bb{}, bb{})",
                        usize::from(*taken),
                        usize::from(*not_taken)
                    )?,
                    op => write!(f, "{op}({args})")?,
                }
                if let Some(v) = n.vreg {
                    write!(f, " -> {v}")?;
                }
                writeln!(f, " [{}, rc={}, {}]", n.prediction, n.ref_count, n.origin)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn virtual_registers() {
        let a = VirtualRegister::argument(1);
        assert_eq!(a.to_argument(), Some(1));
        assert_eq!(a.offset(), (CALL_FRAME_HEADER_SIZE + 1) * 8);
        assert_eq!(a.to_string(), "arg1");
        let l = VirtualRegister::local(2);
        assert_eq!(l.to_local(), Some(2));
        assert_eq!(l.offset(), -24);
        assert_eq!(l.to_string(), "loc2");
        assert!(!l.is_argument());
    }

    #[test]
    fn node_flags() {
        let f = NodeFlags::CAN_TRUNCATE.union(NodeFlags::CAN_EXIT);
        assert!(f.contains(NodeFlags::CAN_TRUNCATE));
        assert!(!f.contains(NodeFlags::NEEDS_NEG_ZERO));
    }
}
