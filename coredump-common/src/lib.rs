//! Shared types for the core dump reconstruction pipeline.
//!
//! Everything here is plain data: loaded-module ranges, stack frames,
//! threads, the fault context extracted from the terminating signal, and the
//! process-wide context read from the dump's auxiliary vector. The crates
//! that actually talk to the unwinding engine and to external tools
//! (`coredump-unwind`, `coredump-symbols`, `coredump-processor`) all build
//! on these.

pub mod auxv;
pub mod context;
pub mod module;
pub mod signals;
pub mod stack;

pub use auxv::AuxvTag;
pub use context::{FaultContext, SystemContext};
pub use module::{basename, Module};
pub use signals::signal_name;
pub use stack::{CallStack, StackFrame};
