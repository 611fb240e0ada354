//! Bindings to the `unwind-coredump` C wrapper over libunwind's `_UCD_*`
//! coredump accessors.
//!
//! The wrapper keeps one global address space and cursor, so this whole
//! module is single-handle by construction: [`LibunwindEngine::new`] calls
//! `init`, the engine's [`end`][crate::UnwindEngine::end] calls `destroy`,
//! and the type is `!Send` so the cursor can never be stepped from two
//! threads.

use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::path::Path;

use coredump_common::AuxvTag;
use libc::{c_char, c_int, c_uint, c_ulong};
use tracing::warn;

use crate::{Cursor, EngineError, SignalInfo, UnwindEngine};

#[allow(non_snake_case)]
#[link(name = "unwind-coredump")]
extern "C" {
    fn init(filepath: *const c_char, working_dir: *const c_char);
    fn destroy();
    fn getNumberOfThreads() -> c_int;
    fn selectThread(thread_number: c_uint) -> c_int;
    fn getInstructionPointer() -> c_ulong;
    fn getStackPointer() -> c_ulong;
    fn getProcedureName() -> *const c_char;
    fn getProcedureOffset() -> c_ulong;
    fn step() -> bool;
    fn getAuxvValue(tag: c_int) -> c_ulong;
    fn getAuxvString(tag: c_int) -> *const c_char;
    fn getSignalNumber(thread_no: c_int) -> c_int;
    fn getSignalErrorNo(thread_no: c_int) -> c_int;
    fn getSignalAddress(thread_no: c_int) -> c_ulong;
    fn getFileName() -> *const c_char;
    fn getArgs() -> *const c_char;
    fn is64Bit() -> c_int;
    fn addBackingFileAtAddr(filepath: *const c_char, address: c_ulong);
}

/// Copies a wrapper-owned C string. The wrapper allocates and never frees
/// its returned strings, so they must not be freed here either.
fn copy_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // Safety: the wrapper returns NUL-terminated strings it owns.
    let s = unsafe { CStr::from_ptr(ptr) };
    Some(s.to_string_lossy().into_owned())
}

fn to_c_path(path: &Path) -> Option<CString> {
    CString::new(path.to_string_lossy().as_bytes()).ok()
}

/// The libunwind-backed engine for one core dump.
pub struct LibunwindEngine {
    // Ties the handle to one thread; the wrapper's cursor is global state.
    _not_send: PhantomData<*mut ()>,
}

impl LibunwindEngine {
    /// Initializes the wrapper for `dump_path`, with backing files resolved
    /// relative to `work_dir`.
    pub fn new(dump_path: &Path, work_dir: &Path) -> Result<LibunwindEngine, EngineError> {
        let dump = to_c_path(dump_path).ok_or(EngineError::InitFailed)?;
        let dir = to_c_path(work_dir).ok_or(EngineError::InitFailed)?;
        // Safety: both strings outlive the call; init copies them.
        unsafe { init(dump.as_ptr(), dir.as_ptr()) };
        Ok(LibunwindEngine {
            _not_send: PhantomData,
        })
    }
}

impl UnwindEngine for LibunwindEngine {
    fn thread_count(&mut self) -> u32 {
        let count = unsafe { getNumberOfThreads() };
        count.max(0) as u32
    }

    fn select_thread(&mut self, index: u32) -> Result<(), EngineError> {
        let code = unsafe { selectThread(index) };
        if code == 0 {
            Ok(())
        } else {
            Err(EngineError::ThreadSelectFailed {
                thread: index,
                code,
            })
        }
    }

    fn cursor(&mut self) -> Cursor {
        unsafe {
            Cursor {
                instruction_pointer: getInstructionPointer(),
                stack_pointer: getStackPointer(),
                procedure_name: copy_c_string(getProcedureName()),
                procedure_offset: getProcedureOffset(),
            }
        }
    }

    fn step(&mut self) -> bool {
        unsafe { step() }
    }

    fn auxv_value(&mut self, tag: AuxvTag) -> u64 {
        unsafe { getAuxvValue(tag.tag()) }
    }

    fn auxv_string(&mut self, tag: AuxvTag) -> String {
        unsafe { copy_c_string(getAuxvString(tag.tag())) }.unwrap_or_default()
    }

    fn signal_info(&mut self, thread: u32) -> Option<SignalInfo> {
        let number = unsafe { getSignalNumber(thread as c_int) };
        if number == -1 {
            return None;
        }
        Some(SignalInfo {
            number,
            errno: unsafe { getSignalErrorNo(thread as c_int) },
            fault_address: unsafe { getSignalAddress(thread as c_int) },
        })
    }

    fn register_backing_file(&mut self, path: &Path, address: u64) {
        let Some(c_path) = to_c_path(path) else {
            warn!("backing file path is not a valid C string: {}", path.display());
            return;
        };
        unsafe { addBackingFileAtAddr(c_path.as_ptr(), address) };
    }

    fn executable_path(&mut self) -> Option<String> {
        unsafe { copy_c_string(getFileName()) }
    }

    fn executable_args(&mut self) -> Option<String> {
        unsafe { copy_c_string(getArgs()) }
    }

    fn is_64_bit(&mut self) -> Option<bool> {
        match unsafe { is64Bit() } {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    fn end(&mut self) {
        unsafe { destroy() };
    }
}
