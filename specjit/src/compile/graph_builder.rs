//! Build [Graph]s.
//!
//! Upstream passes (and tests) describe a graph in terms of nodes, blocks, and predictions; the
//! builder then does the bookkeeping the backend relies on: it chooses use kinds for edges from
//! predictions (unless they were set explicitly), computes reference counts, assigns each value a
//! frame slot, and annotates nodes that may exit forward with the store their exit resumes after.

use crate::{
    compile::{
        CompilationError,
        graph::{
            ArrayMode, BasicBlock, BlockIdx, CodeOrigin, Edge, FlushFormat, Graph, GraphKind,
            IdentIdx, InlineFrame, InlineFrameIdx, Node, NodeFlags, NodeIdx, Op, SwitchKind,
            UseKind, VariableAccessData, VariableIdx, VirtualRegister,
        },
        osr_exit::find_forward_set_local,
        spec_type::SpecType,
    },
    value::JSValue,
};
use index_vec::{IndexVec, index_vec};
use std::{collections::HashSet, sync::Arc};

pub struct GraphBuilder {
    name: String,
    kind: GraphKind,
    nodes: IndexVec<NodeIdx, Node>,
    blocks: IndexVec<BlockIdx, BasicBlock>,
    variables: IndexVec<VariableIdx, VariableAccessData>,
    arguments: Vec<VariableIdx>,
    num_vars: usize,
    identifiers: IndexVec<IdentIdx, Arc<str>>,
    inline_frames: IndexVec<InlineFrameIdx, InlineFrame>,
    cur_block: Option<BlockIdx>,
    cur_origin: CodeOrigin,
    /// Edges whose use kinds were set explicitly and which fixup must leave alone.
    fixed_edges: HashSet<(NodeIdx, usize)>,
    /// Nodes appended while no block was selected. [Self::finish] rejects the graph if any exist.
    orphans: Vec<NodeIdx>,
    profiling: bool,
}

impl GraphBuilder {
    pub fn new(name: &str, kind: GraphKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            nodes: index_vec![],
            blocks: index_vec![],
            variables: index_vec![],
            arguments: Vec::new(),
            num_vars: 0,
            identifiers: index_vec![],
            inline_frames: index_vec![],
            cur_block: None,
            cur_origin: CodeOrigin::new(0),
            fixed_edges: HashSet::new(),
            orphans: Vec::new(),
            profiling: false,
        }
    }

    /// Add an argument. The first argument added is `this`.
    pub fn argument(&mut self, prediction: SpecType, flush_format: FlushFormat) -> VariableIdx {
        let flush_format = match flush_format {
            FlushFormat::Double => FlushFormat::JSValue,
            x => x,
        };
        let operand = VirtualRegister::argument(self.arguments.len());
        let v = self.variables.push(VariableAccessData {
            operand,
            prediction,
            flush_format,
        });
        self.arguments.push(v);
        v
    }

    /// Add an interpreter-visible local variable.
    pub fn variable(&mut self, prediction: SpecType, flush_format: FlushFormat) -> VariableIdx {
        let operand = VirtualRegister::local(self.num_vars);
        self.num_vars += 1;
        self.variables.push(VariableAccessData {
            operand,
            prediction,
            flush_format,
        })
    }

    pub fn identifier(&mut self, name: &str) -> IdentIdx {
        if let Some((i, _)) = self
            .identifiers
            .iter_enumerated()
            .find(|(_, x)| &***x == name)
        {
            return i;
        }
        self.identifiers.push(Arc::from(name))
    }

    pub fn inline_frame(&mut self, callee_name: &str, caller: CodeOrigin) -> InlineFrameIdx {
        self.inline_frames.push(InlineFrame {
            callee_name: callee_name.to_owned(),
            caller,
        })
    }

    pub fn profiling(&mut self, profiling: bool) {
        self.profiling = profiling;
    }

    /// Create a new reachable block. The first block created is the entry block.
    pub fn block(&mut self) -> BlockIdx {
        self.blocks.push(BasicBlock {
            is_reachable: true,
            ..BasicBlock::default()
        })
    }

    /// Append subsequent nodes to `bidx`.
    pub fn switch_to(&mut self, bidx: BlockIdx) {
        self.cur_block = Some(bidx);
    }

    pub fn set_unreachable(&mut self, bidx: BlockIdx) {
        self.blocks[bidx].is_reachable = false;
    }

    pub fn set_osr_target(&mut self, bidx: BlockIdx) {
        self.blocks[bidx].is_osr_target = true;
    }

    /// Record that `var` is live in its frame slot on entry to `bidx`.
    pub fn live_at_head(&mut self, bidx: BlockIdx, var: VariableIdx) {
        self.blocks[bidx].variables_at_head.push(var);
    }

    /// Attribute subsequent nodes to `origin`.
    pub fn origin(&mut self, origin: CodeOrigin) {
        self.cur_origin = origin;
    }

    /// Attribute subsequent nodes to bytecode index `bc` of the outermost function.
    pub fn bytecode(&mut self, bc: u32) {
        self.cur_origin = CodeOrigin::new(bc);
    }

    /// Append a node with untyped edges (which [Self::finish] will refine) to the current block.
    /// If no block has been selected with [Self::switch_to], [Self::finish] will fail.
    pub fn node(&mut self, op: Op, children: &[NodeIdx], prediction: SpecType) -> NodeIdx {
        let edges = children.iter().map(|x| Edge::untyped(*x)).collect::<Vec<_>>();
        let mut node = Node::new(op, &edges, self.cur_origin);
        node.prediction = prediction;
        let nidx = self.nodes.push(node);
        match self.cur_block {
            Some(bidx) => self.blocks[bidx].nodes.push(nidx),
            None => self.orphans.push(nidx),
        }
        nidx
    }

    pub fn constant(&mut self, v: JSValue) -> NodeIdx {
        let t = SpecType::from_value(v, |_| SpecType::CELL);
        let nidx = self.node(Op::JSConstant(v), &[], t);
        self.nodes[nidx].proven = t;
        nidx
    }

    pub fn double_constant(&mut self, d: f64) -> NodeIdx {
        let t = SpecType::from_value(JSValue::double(d), |_| SpecType::CELL);
        let nidx = self.node(Op::DoubleConstant(d), &[], t);
        self.nodes[nidx].proven = t;
        nidx
    }

    pub fn get_local(&mut self, var: VariableIdx) -> NodeIdx {
        let pred = self.variables[var].prediction;
        self.node(Op::GetLocal(var), &[], pred)
    }

    /// Emit the conventional `MovHint; SetLocal` pair storing `value` into `var`.
    pub fn set_local(&mut self, var: VariableIdx, value: NodeIdx) -> NodeIdx {
        self.node(Op::MovHint(var), &[value], SpecType::EMPTY);
        self.node(Op::SetLocal(var), &[value], SpecType::EMPTY)
    }

    pub fn add_flags(&mut self, nidx: NodeIdx, flags: NodeFlags) {
        let n = &mut self.nodes[nidx];
        n.flags = n.flags.union(flags);
    }

    /// Set the types upstream analysis has proven `nidx`'s result to have.
    pub fn set_proven(&mut self, nidx: NodeIdx, proven: SpecType) {
        self.nodes[nidx].proven = proven;
    }

    /// Explicitly set the use kind of `nidx`'s `i`th edge.
    pub fn set_use_kind(&mut self, nidx: NodeIdx, i: usize, use_kind: UseKind) {
        self.nodes[nidx].children[i].use_kind = use_kind;
        self.fixed_edges.insert((nidx, i));
    }

    pub fn finish(mut self) -> Result<Graph, CompilationError> {
        if self.blocks.is_empty() {
            return Err(CompilationError::General("Graph has no blocks".into()));
        }
        self.validate()?;
        self.fixup();
        self.count_refs();
        let num_locals = self.assign_vregs();
        let mut g = Graph {
            name: self.name,
            kind: self.kind,
            nodes: self.nodes,
            blocks: self.blocks,
            variables: self.variables,
            arguments: self.arguments,
            identifiers: self.identifiers,
            inline_frames: self.inline_frames,
            num_vars: self.num_vars,
            num_locals,
            profiling: self.profiling,
        };
        annotate_forward_targets(&mut g);
        Ok(g)
    }

    /// Check the structural invariants the backend relies on: every child is defined earlier in
    /// the same block, and every reachable block ends in a terminal.
    fn validate(&self) -> Result<(), CompilationError> {
        if let Some(nidx) = self.orphans.first() {
            return Err(CompilationError::General(format!(
                "@{} was added outside any block",
                usize::from(*nidx)
            )));
        }
        let mut defined = HashSet::new();
        for (bidx, b) in self.blocks.iter_enumerated() {
            defined.clear();
            for nidx in &b.nodes {
                let n = &self.nodes[*nidx];
                for e in &n.children {
                    if !defined.contains(&e.node) {
                        return Err(CompilationError::General(format!(
                            "@{} uses @{} which is not defined earlier in bb{}",
                            usize::from(*nidx),
                            usize::from(e.node),
                            usize::from(bidx)
                        )));
                    }
                }
                defined.insert(*nidx);
            }
            if b.is_reachable
                && !b
                    .nodes
                    .last()
                    .map(|x| self.nodes[*x].op.is_terminal())
                    .unwrap_or(false)
            {
                return Err(CompilationError::General(format!(
                    "bb{} does not end in a terminal",
                    usize::from(bidx)
                )));
            }
        }
        Ok(())
    }

    fn pred(&self, e: Edge) -> SpecType {
        self.nodes[e.node].prediction
    }

    /// Choose use kinds for every edge that wasn't set explicitly.
    fn fixup(&mut self) {
        for nidx in self.nodes.indices() {
            let kinds = self.fixup_kinds(nidx);
            for (i, k) in kinds.into_iter().enumerate() {
                if let Some(k) = k
                    && !self.fixed_edges.contains(&(nidx, i))
                {
                    self.nodes[nidx].children[i].use_kind = k;
                }
            }
        }
    }

    fn fixup_kinds(&self, nidx: NodeIdx) -> Vec<Option<UseKind>> {
        let n = &self.nodes[nidx];
        let ch = &n.children;
        let all = |t: SpecType| ch.iter().all(|e| self.pred(*e).is(t));
        let arith = || {
            if all(SpecType::INT32) && (n.prediction.is(SpecType::INT32) || n.can_truncate()) {
                UseKind::Int32
            } else if all(SpecType::NUMBER) {
                UseKind::Number
            } else {
                UseKind::Untyped
            }
        };
        let boolish = |t: SpecType| {
            if t.is(SpecType::BOOLEAN) {
                UseKind::Boolean
            } else if t.is(SpecType::INT32) {
                UseKind::Int32
            } else if t.is(SpecType::NUMBER) {
                UseKind::Number
            } else {
                UseKind::Untyped
            }
        };
        let cell_or_untyped = |e: Edge| {
            if self.pred(e).is(SpecType::CELL) {
                UseKind::Cell
            } else {
                UseKind::Untyped
            }
        };
        let same = |k: UseKind| vec![Some(k); ch.len()];
        match &n.op {
            Op::ArithAdd
            | Op::ArithSub
            | Op::ArithMul
            | Op::ArithDiv
            | Op::ArithMod
            | Op::ArithMin
            | Op::ArithMax
            | Op::ArithNegate
            | Op::ArithAbs
            | Op::ValueAdd => same(arith()),
            Op::ArithSqrt | Op::Int32ToDouble | Op::DoubleAsInt32 => same(UseKind::Number),
            Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::BitLShift
            | Op::BitRShift
            | Op::BitURShift
            | Op::UInt32ToNumber => same(UseKind::Int32),
            Op::ValueToInt32 => {
                let p = self.pred(ch[0]);
                same(if p.is(SpecType::INT32) {
                    UseKind::Int32
                } else if p.is(SpecType::NUMBER) {
                    UseKind::Number
                } else {
                    UseKind::Untyped
                })
            }
            Op::CompareLess
            | Op::CompareLessEq
            | Op::CompareGreater
            | Op::CompareGreaterEq
            | Op::CompareEq
            | Op::CompareStrictEq => {
                let (l, r) = (self.pred(ch[0]), self.pred(ch[1]));
                let ooo = SpecType::OBJECT.union(SpecType::OTHER);
                let is_eq = matches!(n.op, Op::CompareEq | Op::CompareStrictEq);
                if all(SpecType::INT32) {
                    same(UseKind::Int32)
                } else if all(SpecType::NUMBER) {
                    same(UseKind::Number)
                } else if is_eq && all(SpecType::OBJECT) {
                    same(UseKind::Object)
                } else if is_eq && l.is(SpecType::OBJECT) && r.is(ooo) {
                    vec![Some(UseKind::Object), Some(UseKind::ObjectOrOther)]
                } else if is_eq && l.is(ooo) && r.is(SpecType::OBJECT) {
                    vec![Some(UseKind::ObjectOrOther), Some(UseKind::Object)]
                } else {
                    same(UseKind::Untyped)
                }
            }
            Op::LogicalNot | Op::Branch { .. } => same(boolish(self.pred(ch[0]))),
            Op::SetLocal(v) => same(self.variables[*v].flush_format.use_kind()),
            Op::CheckStructure(_)
            | Op::CheckArray(_)
            | Op::Arrayify(_)
            | Op::GetIndexedPropertyStorage(_)
            | Op::CheckHasInstance => same(UseKind::Cell),
            Op::GetArrayLength(_) => {
                let mut v = same(UseKind::Untyped);
                v[0] = Some(UseKind::Cell);
                v
            }
            Op::GetByVal(_) => vec![
                Some(UseKind::Cell),
                Some(UseKind::Int32),
                Some(UseKind::Untyped),
            ],
            Op::PutByVal(mode) => {
                let vk = match mode {
                    ArrayMode::Contiguous | ArrayMode::String => UseKind::Untyped,
                    ArrayMode::Double | ArrayMode::Float64Array => UseKind::Number,
                    ArrayMode::Int32Array => UseKind::Int32,
                };
                vec![
                    Some(UseKind::Cell),
                    Some(UseKind::Int32),
                    Some(vk),
                    Some(UseKind::Untyped),
                ]
            }
            Op::StringCharCodeAt | Op::StringCharAt => vec![
                Some(UseKind::String),
                Some(UseKind::Int32),
                Some(UseKind::Untyped),
            ],
            Op::GetById(_) => vec![Some(cell_or_untyped(ch[0]))],
            Op::PutById(_) => vec![Some(cell_or_untyped(ch[0])), Some(UseKind::Untyped)],
            Op::InstanceOf => vec![Some(cell_or_untyped(ch[0])), Some(UseKind::Cell)],
            Op::Switch(data) => same(match data.kind {
                SwitchKind::Imm if self.pred(ch[0]).is(SpecType::INT32) => UseKind::Int32,
                _ => UseKind::Untyped,
            }),
            _ => vec![None; ch.len()],
        }
    }

    /// Compute reference counts. A node counts as a use of its children only if it will itself
    /// be generated; `MovHint`s generate no code and never count as uses.
    fn count_refs(&mut self) {
        for n in self.nodes.iter_mut() {
            n.ref_count = 0;
            if n.op.has_side_effects() {
                n.flags = n.flags.union(NodeFlags::MUST_GENERATE);
            }
        }
        for bidx in self.blocks.indices() {
            for i in (0..self.blocks[bidx].nodes.len()).rev() {
                let nidx = self.blocks[bidx].nodes[i];
                let n = &self.nodes[nidx];
                if !n.should_generate() || matches!(n.op, Op::MovHint(_) | Op::Phi(_)) {
                    continue;
                }
                let children = n.children.iter().map(|e| e.node).collect::<Vec<_>>();
                for c in children {
                    self.nodes[c].ref_count += 1;
                }
            }
        }
    }

    /// Give every generated value its own temporary frame slot after the interpreter-visible
    /// locals, returning the total number of locals.
    fn assign_vregs(&mut self) -> usize {
        let mut next = self.num_vars;
        for n in self.nodes.iter_mut() {
            if n.op.has_result() && (n.should_generate() || n.op.is_constant()) {
                n.vreg = Some(VirtualRegister::local(next));
                next += 1;
            }
            if let Op::GetLocal(v) = n.op {
                n.proven = match self.variables[v].flush_format {
                    FlushFormat::Int32 => SpecType::INT32,
                    FlushFormat::Double => SpecType::NUMBER,
                    FlushFormat::Boolean => SpecType::BOOLEAN,
                    FlushFormat::Cell => SpecType::CELL,
                    FlushFormat::JSValue => n.proven,
                };
            }
        }
        next
    }
}

/// Attach to each node that may exit forward the `SetLocal` its exits resume after.
fn annotate_forward_targets(g: &mut Graph) {
    for bidx in g.blocks.indices() {
        for pos in 0..g.blocks[bidx].nodes.len() {
            let nidx = g.blocks[bidx].nodes[pos];
            if matches!(g.nodes[nidx].op, Op::UInt32ToNumber | Op::DoubleAsInt32)
                && let Some(sl) = find_forward_set_local(g, bidx, pos)
            {
                g.nodes[nidx].forward_target = Some(g.blocks[bidx].nodes[sl]);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixup_and_refcounts() {
        let mut gb = GraphBuilder::new("f", GraphKind::Function);
        let _this = gb.argument(SpecType::OTHER, FlushFormat::JSValue);
        let a = gb.argument(SpecType::INT32, FlushFormat::JSValue);
        let b = gb.argument(SpecType::DOUBLE_REAL, FlushFormat::JSValue);
        let bb0 = gb.block();
        gb.switch_to(bb0);
        let x = gb.get_local(a);
        let y = gb.get_local(b);
        let add = gb.node(Op::ArithAdd, &[x, x], SpecType::INT32);
        let add2 = gb.node(Op::ArithAdd, &[add, y], SpecType::DOUBLE_REAL);
        let dead = gb.node(Op::ArithSub, &[x, x], SpecType::INT32);
        gb.node(Op::Return, &[add2], SpecType::EMPTY);
        let g = gb.finish().unwrap();

        assert_eq!(g.nodes[add].children[0].use_kind, UseKind::Int32);
        assert_eq!(g.nodes[add2].children[1].use_kind, UseKind::Number);
        assert_eq!(g.nodes[x].ref_count, 2);
        assert_eq!(g.nodes[add].ref_count, 1);
        assert_eq!(g.nodes[dead].ref_count, 0);
        assert!(!g.nodes[dead].should_generate());
        assert!(g.nodes[dead].vreg.is_none());
        assert_eq!(g.nodes[x].vreg, Some(VirtualRegister::local(0)));
        assert_eq!(g.num_locals, 4);
    }

    #[test]
    fn validation() {
        let mut gb = GraphBuilder::new("f", GraphKind::Program);
        let bb0 = gb.block();
        let bb1 = gb.block();
        gb.switch_to(bb0);
        let c = gb.constant(JSValue::int32(1));
        gb.node(Op::Jump(bb1), &[], SpecType::EMPTY);
        gb.switch_to(bb1);
        gb.node(Op::Return, &[c], SpecType::EMPTY);
        assert!(matches!(gb.finish(), Err(CompilationError::General(_))));

        let mut gb = GraphBuilder::new("f", GraphKind::Program);
        let bb0 = gb.block();
        gb.switch_to(bb0);
        gb.constant(JSValue::int32(1));
        assert!(matches!(gb.finish(), Err(CompilationError::General(_))));

        let mut gb = GraphBuilder::new("f", GraphKind::Program);
        let c = gb.constant(JSValue::int32(1));
        let bb0 = gb.block();
        gb.switch_to(bb0);
        gb.node(Op::Return, &[], SpecType::EMPTY);
        match gb.finish() {
            Err(CompilationError::General(e)) => {
                assert_eq!(e, format!("@{} was added outside any block", usize::from(c)))
            }
            _ => panic!(),
        }
    }

    #[test]
    fn identifiers_are_interned() {
        let mut gb = GraphBuilder::new("f", GraphKind::Program);
        let x = gb.identifier("x");
        let y = gb.identifier("y");
        assert_ne!(x, y);
        assert_eq!(gb.identifier("x"), x);
        assert_eq!(gb.identifier(&String::from("y")), y);
        assert_eq!(gb.identifiers.len(), 2);
    }

    #[test]
    fn forward_annotation() {
        let mut gb = GraphBuilder::new("f", GraphKind::Program);
        let v = gb.variable(SpecType::NUMBER, FlushFormat::JSValue);
        let bb0 = gb.block();
        gb.switch_to(bb0);
        gb.bytecode(0);
        let a = gb.constant(JSValue::int32(-1));
        let b = gb.constant(JSValue::int32(0));
        let sh = gb.node(Op::BitURShift, &[a, b], SpecType::INT32);
        let u = gb.node(Op::UInt32ToNumber, &[sh], SpecType::NUMBER);
        gb.bytecode(1);
        let sl = gb.set_local(v, u);
        gb.bytecode(2);
        gb.node(Op::Return, &[u], SpecType::EMPTY);
        let g = gb.finish().unwrap();
        assert_eq!(g.nodes[u].forward_target, Some(sl));
    }
}
