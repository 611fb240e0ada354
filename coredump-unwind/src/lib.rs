//! Stack unwinding for Linux core dumps.
//!
//! The actual unwinding work is done by a foreign engine (libunwind's
//! coredump accessors, reached through a small C wrapper). This crate wraps
//! that engine behind the [`UnwindEngine`] trait, guards its lifecycle with
//! [`EngineSession`], and walks every thread in the dump into
//! [`CallStack`][coredump_common::CallStack]s.
//!
//! The engine keeps a single global cursor, so everything here is strictly
//! sequential: one thread is selected, stepped to the end, then the next.
//! Engine types are `!Send`, so concurrent misuse fails to compile instead
//! of corrupting the cursor.
//!
//! The real backend is behind the `libunwind` cargo feature; without it the
//! crate only offers the trait, which the test suites implement in memory.

mod engine;
mod session;
mod walker;

#[cfg(feature = "libunwind")]
pub mod ffi;

pub use engine::{Cursor, EngineError, SignalInfo, UnwindEngine};
pub use session::EngineSession;
pub use walker::{extract_fault_context, read_system_context, unwind_threads};

/// Hard cap on frames unwound per thread, to bound runaway cursors on
/// corrupt stacks.
pub const MAX_FRAMES: usize = 128;
