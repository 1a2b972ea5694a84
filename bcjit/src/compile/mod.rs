//! The function translator: turns a code descriptor, plus the feedback recorded while
//! interpreting it, into an IR function that reproduces its semantics.

use crate::{code::CodeDescriptor, ir::Func};
use std::{collections::HashSet, rc::Rc};
use thiserror::Error;

pub(crate) mod guard;
mod translate;

pub use guard::GuardSet;
pub(crate) use translate::translate;

/// A failure to translate a function.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// Compilation failed for reasons that might be of interest to a programmer producing
    /// bytecode for the JIT but not to the end user running a program on it.
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong when compiling that is probably the result of a bug in the
    /// translator.
    InternalError(String),
    #[error("Internal error: {0}")]
    /// A limit was exceeded (e.g. too many IR instructions, or a block stack deeper than a frame
    /// can hold).
    LimitExceeded(String),
}

/// Knobs controlling what the translator emits.
#[derive(Clone, Debug)]
pub struct TranslatorConfig {
    /// How many observations a conditional branch needs before an arm that was never taken
    /// may be replaced by a bailout.
    pub branch_min_samples: u64,
    /// Emit guarded fast paths for `LOAD_ATTR` and `STORE_ATTR`.
    pub speculate_attrs: bool,
    /// Emit a dictionary-version guarded fast path for `LOAD_GLOBAL`.
    pub speculate_globals: bool,
    /// Call a builtin directly, guarded by its identity, at `CALL_FUNCTION` sites that only ever
    /// called that builtin.
    pub speculate_calls: bool,
    /// Check for an active tracing hook at each new source line and loop back edge.
    pub line_trace_checks: bool,
    /// Instruction offsets that are translated as an unconditional bailout.
    pub force_bail: HashSet<usize>,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            branch_min_samples: 100,
            speculate_attrs: true,
            speculate_globals: true,
            speculate_calls: true,
            line_trace_checks: true,
            force_bail: HashSet::new(),
        }
    }
}

/// A translated function, ready to be run by [crate::ir::eval].
#[derive(Debug)]
pub struct CompiledFunction {
    pub code: Rc<CodeDescriptor>,
    pub func: Func,
    /// The types this function's fast paths depend on. The function must not be run once this
    /// has been invalidated.
    pub guards: Rc<GuardSet>,
    /// How many conditional branches had an arm replaced by a bailout.
    pub elided_branches: usize,
}
