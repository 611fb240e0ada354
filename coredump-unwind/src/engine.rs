//! The boundary to the foreign unwinding engine.

use coredump_common::AuxvTag;
use std::path::Path;

/// Errors reported by an unwinding engine.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to open core dump")]
    InitFailed,
    #[error("Failed to initiate remote unwind session for thread {thread}: {code}")]
    ThreadSelectFailed { thread: u32, code: i32 },
    #[error("Engine reported no threads")]
    NoThreads,
}

/// One snapshot of the engine's unwind cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    /// Demangled procedure name, if the engine could resolve one.
    pub procedure_name: Option<String>,
    /// Offset of the instruction pointer into the procedure.
    pub procedure_offset: u64,
}

/// Per-thread terminating-signal information from the dump's PRSTATUS notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub number: i32,
    pub errno: i32,
    pub fault_address: u64,
}

/// A handle to an initialized unwinding engine for one core dump.
///
/// All methods mutate engine-global cursor state, so a handle must be driven
/// from one logical sequence of calls; implementations are `!Send` to keep
/// it that way. Wrap handles in an [`EngineSession`][crate::EngineSession]
/// so the engine is torn down on every exit path.
pub trait UnwindEngine {
    /// Number of hardware threads captured in the dump.
    fn thread_count(&mut self) -> u32;

    /// Selects the thread whose stack the cursor walks next.
    fn select_thread(&mut self, index: u32) -> Result<(), EngineError>;

    /// Reads the cursor at its current frame.
    fn cursor(&mut self) -> Cursor;

    /// Steps the cursor one frame outward. Returns `true` when there are no
    /// more frames (or the engine reported the end of the stack).
    fn step(&mut self) -> bool;

    /// Reads a numeric auxiliary vector entry, 0 if absent.
    fn auxv_value(&mut self, tag: AuxvTag) -> u64;

    /// Reads a string auxiliary vector entry, empty if absent.
    fn auxv_string(&mut self, tag: AuxvTag) -> String;

    /// Terminating-signal info for the given thread, `None` when the thread
    /// was not stopped by a signal.
    fn signal_info(&mut self, thread: u32) -> Option<SignalInfo>;

    /// Tells the engine where a binary image is mapped, so symbol lookups
    /// during stepping can consult the file.
    ///
    /// The gdb module-map strategy must register every image (and the main
    /// executable) before any thread is unwound.
    fn register_backing_file(&mut self, path: &Path, address: u64);

    /// Path of the main executable as recorded in the dump, if known.
    fn executable_path(&mut self) -> Option<String>;

    /// Command line of the crashed process, if known.
    fn executable_args(&mut self) -> Option<String>;

    /// Whether the dump is a 64-bit dump; `None` if the header could not be
    /// classified.
    fn is_64_bit(&mut self) -> Option<bool>;

    /// Releases the engine's resources. Called exactly once, by
    /// [`EngineSession`][crate::EngineSession] on drop.
    fn end(&mut self);
}
