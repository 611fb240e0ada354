//! Debug symbol acquisition and source line resolution for core dump
//! modules.
//!
//! Two stages live here, both fanning out as concurrent tasks and both
//! strictly best-effort:
//!
//! * [`DebugSymbolResolver`]: for each distinct module with a local binary,
//!   computes a content hash, looks the hash up in an on-disk cache
//!   (`{root}/{hash}/{stem}.dbg`), downloads from the remote symbol store on
//!   a miss, and merges the debug file back into the stripped binary with
//!   `eu-unstrip`.
//! * [`SourceResolver`]: maps every stack frame's instruction pointer to a
//!   function name and `file:line` by invoking `addr2line` against the
//!   owning module at the module-relative address.
//!
//! Nothing in this crate aborts the pipeline; failures degrade the result
//! to stripped binaries and empty source info.

mod resolver;
mod source;
pub mod tool;

pub use resolver::{DebugSymbolResolver, SymbolStoreConfig};
pub use source::{SourceResolver, UNKNOWN_SENTINEL};
pub use tool::{run_tool, ToolError};

/// Errors from symbol retrieval. All of these are logged and swallowed by
/// the pipeline; they only abort the one module they concern.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    #[error("No remote symbol store is configured")]
    NoStore,
    #[error("Symbol store returned no usable file")]
    NotFound,
    #[error("Failed to download debug symbols")]
    Download(#[from] reqwest::Error),
    #[error("I/O error while caching debug symbols")]
    Io(#[from] std::io::Error),
}
