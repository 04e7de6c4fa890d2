//! The backend: lower a [plan::CompilationPlan]'s graph to SJM64 code.

use crate::log::LogLevel;
use std::{error::Error, sync::Arc};
use thiserror::Error;

pub(crate) mod abstract_state;
pub mod code_block;
mod codebuf;
pub mod compiled_code;
pub mod gen_info;
pub mod graph;
pub mod graph_builder;
mod jit_compiler;
mod link;
pub(crate) mod machine;
pub mod osr_exit;
pub mod plan;
mod queue;
pub(crate) mod regalloc;
mod slow_path;
pub mod spec_type;
mod speculative_jit;
pub mod variable_event;

pub use code_block::CodeBlock;
pub use compiled_code::CompiledCode;
pub use plan::{CompilationPlan, Profiler, ProfilerReport, WatchpointSet};
pub use queue::CompileQueue;

/// A failure to compile a graph.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// Compilation failed because the graph handed to us was malformed.
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong when compiling that is probably the result of a bug in the backend.
    InternalError(String),
    #[error("Internal error: {0}")]
    /// A limit was exceeded (e.g. a switch table too large to encode).
    LimitExceeded(String),
    #[error("Internal error: {0:}")]
    /// Compilation failed because an external resource was exhausted: the caller should continue
    /// running the lower tier.
    ResourceExhausted(Box<dyn Error>),
}

/// The outcome of lowering a single node.
#[derive(Debug)]
pub(crate) enum LowerError {
    /// The node's speculation can never succeed: an unconditional exit has been emitted and the
    /// rest of the node must be skipped.
    Terminated,
    /// Abort the whole compile.
    Compile(CompilationError),
}

impl From<CompilationError> for LowerError {
    fn from(e: CompilationError) -> Self {
        LowerError::Compile(e)
    }
}

/// What a compile produced.
#[derive(Debug)]
pub enum CompileResult {
    Compiled(Arc<CompiledCode>),
    Failed(FailedFinalizer),
}

/// Installed in place of compiled code when a compile is abandoned. The lower tier keeps running.
#[derive(Debug)]
pub struct FailedFinalizer {
    pub name: String,
    pub reason: String,
    resource_exhausted: bool,
}

impl FailedFinalizer {
    /// Was the compile abandoned because a resource (e.g. code memory) was exhausted?
    pub fn is_resource_exhaustion(&self) -> bool {
        self.resource_exhausted
    }
}

/// Compile `plan`. Failure is a routine outcome and is reported as [CompileResult::Failed].
pub fn compile(plan: &CompilationPlan) -> CompileResult {
    let log = &plan.options.log;
    log.log(
        LogLevel::Compiles,
        &format!("start-compiling: {}", plan.graph.name),
    );
    match jit_compiler::JitCompiler::new(plan).compile() {
        Ok(cc) => {
            log.log(
                LogLevel::Compiles,
                &format!("stop-compiling: {}", plan.graph.name),
            );
            CompileResult::Compiled(cc)
        }
        Err(e) => {
            let resource_exhausted = matches!(e, CompilationError::ResourceExhausted(_));
            match e {
                CompilationError::General(_) | CompilationError::ResourceExhausted(_) => log.log(
                    LogLevel::Abandoned,
                    &format!("compiling {} failed: {e}", plan.graph.name),
                ),
                CompilationError::InternalError(_) | CompilationError::LimitExceeded(_) => log.log(
                    LogLevel::Bug,
                    &format!("compiling {} failed: {e}", plan.graph.name),
                ),
            }
            CompileResult::Failed(FailedFinalizer {
                name: plan.graph.name.clone(),
                reason: e.to_string(),
                resource_exhausted,
            })
        }
    }
}
