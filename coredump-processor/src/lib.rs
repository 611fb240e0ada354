//! Post-mortem reconstruction of Linux core dumps.
//!
//! Given a core dump and the directory its archive was unpacked into, this
//! crate rebuilds per-thread call stacks, maps instruction pointers to the
//! shared libraries and source lines that produced them, extracts the
//! terminating signal, recovers local variables through a scripted gdb
//! session, and reduces the result to a compact fingerprint for crash
//! deduplication.
//!
//! The pipeline (see [`process_coredump`]) runs in a fixed order: module
//! map construction, sequential unwinding through the engine, then the
//! concurrent enrichment stages (debug symbols, source lines, gdb locals),
//! and finally fingerprint-ready data. Everything past the module map is
//! best-effort; a missing tool degrades the result instead of failing it.

mod config;
mod fingerprint;
mod gdb;
mod module_map;
mod process_state;
mod processor;
mod transcript;

pub use config::AnalyzerConfig;
pub use fingerprint::{
    fingerprint, similarity, CrashFingerprint, SimilarityScore, FINGERPRINT_SCHEMA_VERSION,
};
pub use gdb::GdbSession;
pub use module_map::{
    build_module_map, ElfNoteStrategy, GdbMapStrategy, ModuleMapError, ModuleMapStrategy,
};
pub use process_state::{ExceptionInfo, ProcessState};
pub use processor::{process_coredump, resymbolicate, ProcessError};
pub use transcript::{parse_transcript, transcript_commands};
