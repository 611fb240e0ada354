//! Stack frames and per-thread call stacks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single native stack frame, innermost first within a [`CallStack`].
///
/// Frames come out of the unwinding engine with only addresses and the
/// engine's own idea of the procedure name; the symbol and gdb stages fill
/// in the rest in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    /// Instruction pointer of the next-outer frame (the return site).
    pub return_offset: u64,
    /// Name of the module whose range contains `instruction_pointer`.
    ///
    /// Left empty while unresolved, and for frames outside every known
    /// module range.
    #[serde(default)]
    pub module_name: String,
    pub method_name: String,
    pub offset_in_method: u64,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub source_line: Option<u32>,
    /// Function arguments recovered from the gdb transcript.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Local variables recovered from the gdb transcript.
    #[serde(default)]
    pub locals: BTreeMap<String, String>,
}

impl StackFrame {
    pub fn new(
        method_name: String,
        offset_in_method: u64,
        instruction_pointer: u64,
        stack_pointer: u64,
        return_offset: u64,
    ) -> StackFrame {
        StackFrame {
            instruction_pointer,
            stack_pointer,
            return_offset,
            method_name,
            offset_in_method,
            ..Default::default()
        }
    }
}

/// The reconstructed stack of one thread in the dump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallStack {
    pub engine_id: u32,
    pub os_id: u32,
    pub index: u32,
    pub frames: Vec<StackFrame>,
}

impl CallStack {
    pub fn with_index(index: u32) -> CallStack {
        CallStack {
            engine_id: index,
            os_id: index,
            index,
            frames: Vec::new(),
        }
    }
}
