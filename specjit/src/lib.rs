//! A speculative optimising JIT backend for a dynamic-language VM.
//!
//! The backend consumes a frozen, type-annotated dataflow graph ([compile::graph::Graph]) and
//! lowers it to code for the SJM64 register machine ([compile::machine]), inserting guards which
//! transfer control back to a lower tier ("OSR exits") when a speculation fails at run-time. The
//! [runtime] module provides an executor for that machine code together with the runtime helpers
//! and the exit-state reconstruction the generated code relies on.

#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::comparison_chain)]
#![allow(clippy::too_many_arguments)]

pub mod compile;
mod log;
pub mod options;
pub mod runtime;
pub mod value;

pub use compile::{CompilationError, CompileResult, compile};
pub use options::JitOptions;
pub use value::JSValue;
