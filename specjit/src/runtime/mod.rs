//! A runtime for generated code: a simulated address space holding the VM record and the heap,
//! implementations of the helpers and thunks generated code calls, an executor for SJM64 code,
//! and the reconstruction of interpreter state when an OSR exit is taken.
//!
//! Generated code only ever touches the heap through the layouts in the ABI, so the runtime's
//! objects are laid out in simulated memory exactly as the code expects. Metadata generated code
//! never reads (property names, function bodies) is kept on the Rust side.

mod exit;
mod heap;
mod helpers;
mod memory;
mod simulator;
mod vm;

pub use exit::ExitState;
pub use heap::ArrayShape;
pub use memory::Memory;
pub use simulator::Outcome;

use crate::{
    compile::{CompiledCode, WatchpointSet},
    value::JSValue,
};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

/// Something went wrong executing generated code. These are bugs in the code (or in a test), not
/// exceptions thrown by the program being run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Access to unmapped address 0x{0:x}")]
    BadAccess(u64),
    #[error("No code at 0x{0:x}")]
    NoCode(u64),
    #[error("Cannot decode instruction at 0x{0:x}: {1}")]
    Decode(u64, String),
    #[error("Breakpoint at 0x{0:x}")]
    Breakpoint(u64),
    #[error("Division fault at 0x{0:x}")]
    DivisionFault(u64),
    #[error("{0} is not a {1}")]
    WrongType(JSValue, &'static str),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Step limit exceeded")]
    StepLimit,
}

/// A native function callable from generated code.
pub type HostFn = fn(&mut Runtime, this: JSValue, args: &[JSValue]) -> Result<JSValue, SimError>;

#[derive(Clone)]
pub enum Function {
    Compiled(Arc<CompiledCode>),
    Host(HostFn),
}

/// Rust-side metadata for a structure in simulated memory.
#[derive(Clone, Debug, Default)]
struct StructureInfo {
    /// Property names in inline slot order.
    properties: Vec<Arc<str>>,
}

pub struct Runtime {
    pub mem: Memory,
    /// The address of the VM record.
    vm: u64,
    structures: HashMap<u64, StructureInfo>,
    /// `(structure, property) -> structure with the property added`.
    transitions: HashMap<(u64, Arc<str>), u64>,
    /// `(structure, indexing type) -> structure with that indexing type`.
    indexing_transitions: HashMap<(u64, u8), u64>,
    /// The structure of plain objects, per prototype.
    empty_structures: HashMap<u64, u64>,
    next_structure_id: u32,
    functions: Vec<Function>,
    /// Every piece of code installed, so that code addresses can be resolved.
    codes: Vec<Arc<CompiledCode>>,
    masquerades_watchpoint: Arc<WatchpointSet>,
}

impl Runtime {
    pub fn new() -> Result<Self, SimError> {
        let mut rt = Self {
            mem: Memory::new(),
            vm: 0,
            structures: HashMap::new(),
            transitions: HashMap::new(),
            indexing_transitions: HashMap::new(),
            empty_structures: HashMap::new(),
            next_structure_id: 1,
            functions: Vec::new(),
            codes: Vec::new(),
            masquerades_watchpoint: WatchpointSet::new(),
        };
        rt.init_vm()?;
        Ok(rt)
    }

    /// The address of the VM record, for [crate::compile::CompilationPlan::new].
    pub fn vm(&self) -> u64 {
        self.vm
    }

    /// The watchpoint set which holds while no object masquerading as `undefined` exists.
    pub fn masquerades_watchpoint(&self) -> &Arc<WatchpointSet> {
        &self.masquerades_watchpoint
    }

    /// Make `code` executable by [Runtime::call] and callable from other code.
    pub fn install(&mut self, code: Arc<CompiledCode>) {
        if !self.codes.iter().any(|c| Arc::ptr_eq(c, &code)) {
            self.codes.push(code);
        }
    }

    pub(crate) fn code_at(&self, addr: u64) -> Option<&Arc<CompiledCode>> {
        self.codes.iter().find(|c| c.contains(addr))
    }
}
