//! The abstract-interpretation cursor: what we have proven about values so far in the current
//! block.
//!
//! State starts each block from the types upstream analysis proved and is narrowed as checks
//! execute. Lowering consults it to elide redundant checks and to spot speculation that can never
//! succeed.

use crate::compile::{
    graph::{ArrayMode, Graph, NodeIdx, Op},
    spec_type::SpecType,
};
use index_vec::{IndexVec, index_vec};
use smallvec::SmallVec;
use std::collections::HashMap;
use vob::Vob;

pub(crate) struct AbstractState {
    proven: IndexVec<NodeIdx, SpecType>,
    array_modes: IndexVec<NodeIdx, Option<ArrayMode>>,
    structures: HashMap<NodeIdx, SmallVec<[u64; 2]>>,
    /// Nodes whose state has been narrowed in the current block.
    touched: Vob,
}

impl AbstractState {
    pub(crate) fn new(g: &Graph) -> Self {
        Self {
            proven: g.nodes.iter().map(|n| n.proven).collect(),
            array_modes: index_vec![None; g.nodes.len()],
            structures: HashMap::new(),
            touched: Vob::from_elem(false, g.nodes.len()),
        }
    }

    /// Reset to the state upstream analysis gives us at the start of every block.
    pub(crate) fn begin_block(&mut self, g: &Graph) {
        for i in self.touched.iter_set_bits(..) {
            let nidx = NodeIdx::from_usize(i);
            self.proven[nidx] = g.nodes[nidx].proven;
            self.array_modes[nidx] = None;
        }
        self.touched.set_all(false);
        self.structures.clear();
    }

    pub(crate) fn proven(&self, nidx: NodeIdx) -> SpecType {
        self.proven[nidx]
    }

    /// Narrow what we know about `nidx` to `t`, returning the result.
    pub(crate) fn filter(&mut self, nidx: NodeIdx, t: SpecType) -> SpecType {
        self.touched.set(usize::from(nidx), true);
        self.proven[nidx] = self.proven[nidx].intersect(t);
        self.proven[nidx]
    }

    pub(crate) fn is_array_validated(&self, nidx: NodeIdx, mode: ArrayMode) -> bool {
        self.array_modes[nidx] == Some(mode)
    }

    pub(crate) fn is_structure_checked(&self, nidx: NodeIdx, set: &[u64]) -> bool {
        self.structures
            .get(&nidx)
            .map(|x| x.iter().all(|s| set.contains(s)))
            .unwrap_or(false)
    }

    /// Advance past `nidx`: every check it performed now holds.
    pub(crate) fn execute(&mut self, g: &Graph, nidx: NodeIdx) {
        let n = &g.nodes[nidx];
        for e in &n.children {
            self.filter(e.node, e.use_kind.filter());
        }
        match &n.op {
            Op::CheckStructure(set) => {
                self.structures.insert(n.children[0].node, set.clone());
            }
            Op::CheckArray(mode) | Op::Arrayify(mode) => {
                let base = n.children[0].node;
                self.touched.set(usize::from(base), true);
                self.array_modes[base] = Some(*mode);
                self.filter(base, mode.spec_type());
            }
            Op::Call | Op::PutById(_) | Op::PutByVal(_) => {
                // Calls and stores can change structures and indexing types.
                self.structures.clear();
                for i in self.touched.iter_set_bits(..) {
                    self.array_modes[NodeIdx::from_usize(i)] = None;
                }
            }
            _ => (),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        compile::{
            graph::{FlushFormat, GraphKind, UseKind},
            graph_builder::GraphBuilder,
        },
        value::JSValue,
    };

    #[test]
    fn narrowing_resets_per_block() {
        let mut gb = GraphBuilder::new("f", GraphKind::Function);
        gb.argument(SpecType::OTHER, FlushFormat::JSValue);
        let a = gb.argument(SpecType::INT32, FlushFormat::JSValue);
        let bb0 = gb.block();
        gb.switch_to(bb0);
        let x = gb.get_local(a);
        let c = gb.constant(JSValue::int32(1));
        let add = gb.node(Op::ArithAdd, &[x, c], SpecType::INT32);
        gb.node(Op::Return, &[add], SpecType::EMPTY);
        let g = gb.finish().unwrap();
        assert_eq!(g.nodes[add].children[0].use_kind, UseKind::Int32);

        let mut st = AbstractState::new(&g);
        assert_eq!(st.proven(x), SpecType::TOP);
        assert_eq!(st.proven(c), SpecType::INT32);
        st.execute(&g, add);
        assert_eq!(st.proven(x), SpecType::INT32);
        st.begin_block(&g);
        assert_eq!(st.proven(x), SpecType::TOP);
    }
}
