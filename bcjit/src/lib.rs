//! A function-at-a-time JIT for a stack-based bytecode.
//!
//! Functions start out interpreted ([interp]), recording [feedback] about the types and branches
//! they see. Once hot, the [jit] driver asks the translator ([compile]) to turn the function's
//! bytecode into [ir], specialised on that feedback, and runs the result. Whenever translated
//! code cannot continue (a speculation failed, a tracing hook became active, ...) it writes its
//! state back to the [frame::Frame] and the interpreter resumes where it left off.

#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::new_without_default)]

pub mod asm;
pub mod code;
pub mod compile;
pub mod feedback;
pub mod frame;
pub mod interp;
pub mod ir;
pub mod jit;
mod log;
pub mod runtime;

pub use self::jit::{HotThreshold, Jit, JitBuilder};
pub use self::log::{Log, Verbosity};
