//! Walks every thread in the dump through the engine cursor.

use coredump_common::{signal_name, AuxvTag, CallStack, FaultContext, StackFrame, SystemContext};
use tracing::{debug, warn};

use crate::{Cursor, UnwindEngine, MAX_FRAMES};

/// Unwinds all threads sequentially and returns their call stacks, indexed
/// by thread.
pub fn unwind_threads<E: UnwindEngine>(engine: &mut E) -> Vec<CallStack> {
    let thread_count = engine.thread_count();
    let mut threads = Vec::with_capacity(thread_count as usize);
    for index in 0..thread_count {
        let mut stack = CallStack::with_index(index);
        match engine.select_thread(index) {
            Ok(()) => stack.frames = unwind_current_thread(engine),
            Err(e) => warn!("skipping thread {index}: {e}"),
        }
        threads.push(stack);
    }
    threads
}

/// Steps the cursor to the end of the currently selected thread's stack.
///
/// A frame is emitted one step late so that its `return_offset` can carry
/// the instruction pointer of the frame above it; the cursor position seen
/// when the engine reports the end of the stack is therefore not emitted,
/// and neither are positions the engine could not name.
fn unwind_current_thread<E: UnwindEngine>(engine: &mut E) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut previous: Option<Cursor> = None;
    let mut steps = 0;
    loop {
        let cursor = engine.cursor();
        if let Some(prev) = previous.take() {
            if let Some(name) = prev.procedure_name {
                frames.push(StackFrame::new(
                    name,
                    prev.procedure_offset,
                    prev.instruction_pointer,
                    prev.stack_pointer,
                    cursor.instruction_pointer,
                ));
            }
        }
        previous = Some(cursor);
        steps += 1;
        if engine.step() || steps >= MAX_FRAMES {
            break;
        }
    }
    frames
}

/// Scans all threads for a terminating signal and builds the fault context.
///
/// Signals 32 and up are realtime signals and SIGSTOP is how the dumper
/// parks threads, so neither identifies the crash. The first qualifying
/// thread wins; further ones are only logged.
pub fn extract_fault_context<E: UnwindEngine>(
    engine: &mut E,
    thread_count: u32,
) -> Option<FaultContext> {
    let mut fault: Option<FaultContext> = None;
    for thread in 0..thread_count {
        let Some(info) = engine.signal_info(thread) else {
            continue;
        };
        if info.number >= 32 || info.number == 19 {
            continue;
        }
        if let Some(existing) = &fault {
            debug!(
                "already found the last executed thread ({}); thread {thread} also has signal {}",
                existing.thread_index, info.number
            );
            continue;
        }
        let name = signal_name(info.number);
        let mut description = name.to_string();
        let mut fault_address = None;
        let mut error_number = None;
        match info.number {
            4 | 8 => {
                description += &format!(": Faulty instruction at address {}", info.fault_address);
                fault_address = Some(info.fault_address);
            }
            11 => {
                description += &format!(
                    ": Invalid memory reference to address {:#x}",
                    info.fault_address
                );
                fault_address = Some(info.fault_address);
            }
            _ => {
                if info.errno != 0 {
                    description += &format!(" (error number {})", info.errno);
                    error_number = Some(info.errno);
                }
            }
        }
        fault = Some(FaultContext {
            thread_index: thread,
            signal_number: info.number,
            signal_name: name.to_string(),
            fault_address,
            error_number,
            description,
        });
    }
    fault
}

/// Reads the process-wide context from the dump's auxiliary vector.
pub fn read_system_context<E: UnwindEngine>(engine: &mut E) -> SystemContext {
    let architecture = match engine.is_64_bit() {
        Some(false) => "x86",
        Some(true) => "Amd64",
        None => "N/A",
    };
    SystemContext {
        executable_path: engine.executable_path(),
        args: engine.executable_args(),
        architecture: architecture.to_string(),
        page_size: engine.auxv_value(AuxvTag::PageSize),
        entry_point: engine.auxv_value(AuxvTag::EntryPoint),
        base_platform: engine.auxv_string(AuxvTag::BasePlatform),
        uid: engine.auxv_value(AuxvTag::Uid) as u32,
        euid: engine.auxv_value(AuxvTag::Euid) as u32,
        gid: engine.auxv_value(AuxvTag::Gid) as u32,
        egid: engine.auxv_value(AuxvTag::Egid) as u32,
    }
}
