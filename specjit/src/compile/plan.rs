//! Compilation plans: everything a single compile needs, owned in one place for exactly the
//! lifetime of that compile.

use crate::{
    compile::{code_block::CodeBlock, graph::Graph, osr_exit::ExitKind},
    options::JitOptions,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// A runtime condition compiled code may assume, and which the runtime promises to report if it
/// ever stops holding.
#[derive(Debug)]
pub struct WatchpointSet {
    valid: AtomicBool,
}

impl WatchpointSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            valid: AtomicBool::new(true),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Invalidate the set, returning `true` if it was previously valid. Code compiled against the
    /// set must then have [crate::compile::CompiledCode::fire_watchpoints] called on it.
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }
}

/// What is reported to an attached [Profiler] for each successful compile.
#[derive(Clone, Debug)]
pub struct ProfilerReport {
    pub name: String,
    pub disassembly: String,
    /// The code offset of each exit's failure jump target (its stub) and the exit's kind.
    pub exit_sites: Vec<(u32, ExitKind)>,
}

pub trait Profiler: Send + Sync {
    fn report(&self, report: ProfilerReport);
}

/// The double constants a compile needs, interned by bit pattern.
#[derive(Debug, Default)]
pub(crate) struct DoubleConstantPool {
    index: HashMap<u64, usize>,
    values: Vec<u64>,
}

impl DoubleConstantPool {
    pub(crate) fn intern(&mut self, d: f64) -> usize {
        let bits = d.to_bits();
        *self.index.entry(bits).or_insert_with(|| {
            self.values.push(bits);
            self.values.len() - 1
        })
    }

    pub(crate) fn values(&self) -> &[u64] {
        &self.values
    }
}

pub struct CompilationPlan {
    pub graph: Graph,
    pub code_block: Arc<CodeBlock>,
    pub options: Arc<JitOptions>,
    /// The address of the VM context record generated code consults for the stack limit and
    /// pending exceptions.
    pub vm: u64,
    /// Holds while no object that masquerades as `undefined` has ever been created.
    pub masquerades_watchpoint: Arc<WatchpointSet>,
    pub profiler: Option<Arc<dyn Profiler>>,
    pub(crate) double_constants: Mutex<DoubleConstantPool>,
}

impl CompilationPlan {
    pub fn new(graph: Graph, code_block: Arc<CodeBlock>, vm: u64) -> Self {
        Self {
            graph,
            code_block,
            options: Arc::new(JitOptions::default()),
            vm,
            masquerades_watchpoint: WatchpointSet::new(),
            profiler: None,
            double_constants: Mutex::new(DoubleConstantPool::default()),
        }
    }

    pub fn with_options(mut self, options: Arc<JitOptions>) -> Self {
        self.options = options;
        self
    }

    pub fn with_masquerades_watchpoint(mut self, wp: Arc<WatchpointSet>) -> Self {
        self.masquerades_watchpoint = wp;
        self
    }

    pub fn with_profiler(mut self, profiler: Arc<dyn Profiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }
}

impl fmt::Debug for CompilationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationPlan")
            .field("graph", &self.graph.name)
            .field("vm", &format_args!("0x{:x}", self.vm))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_interns_by_bits() {
        let mut p = DoubleConstantPool::default();
        assert_eq!(p.intern(1.5), 0);
        assert_eq!(p.intern(-0.0), 1);
        assert_eq!(p.intern(0.0), 2);
        assert_eq!(p.intern(1.5), 0);
        assert_eq!(p.values().len(), 3);
    }

    #[test]
    fn watchpoints() {
        let wp = WatchpointSet::new();
        assert!(wp.is_valid());
        assert!(wp.invalidate());
        assert!(!wp.invalidate());
        assert!(!wp.is_valid());
    }
}
