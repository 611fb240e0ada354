//! Process-wide context and fault information.

use serde::{Deserialize, Serialize};

/// Attributes of the crashed process, read from the dump's auxiliary vector
/// and ELF header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemContext {
    /// Path of the main executable, as far as it could be determined.
    pub executable_path: Option<String>,
    /// Command line of the crashed process.
    pub args: Option<String>,
    pub architecture: String,
    pub page_size: u64,
    pub entry_point: u64,
    pub base_platform: String,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

/// The terminating signal, at most one per reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultContext {
    /// Index of the last-executing thread, the one the signal hit.
    pub thread_index: u32,
    pub signal_number: i32,
    pub signal_name: String,
    /// Faulting address for SIGILL/SIGFPE/SIGSEGV.
    #[serde(default)]
    pub fault_address: Option<u64>,
    #[serde(default)]
    pub error_number: Option<i32>,
    /// Human-readable summary, e.g.
    /// `"SIGSEGV: Invalid memory reference to address 0x10"`.
    pub description: String,
}
