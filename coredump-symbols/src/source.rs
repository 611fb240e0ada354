//! Instruction pointer to `function` + `file:line` resolution via addr2line.

use std::path::Path;

use futures_util::future;
use tracing::{debug, warn};

use coredump_common::module::module_at_address;
use coredump_common::{CallStack, Module, StackFrame};

use crate::run_tool;

/// What addr2line prints for a function or file it cannot resolve.
pub const UNKNOWN_SENTINEL: &str = "??";

/// Resolves source locations for stack frames by running the line-lookup
/// tool against each frame's owning module.
pub struct SourceResolver {
    addr2line_tool: String,
}

impl SourceResolver {
    pub fn new(addr2line_tool: impl Into<String>) -> SourceResolver {
        SourceResolver {
            addr2line_tool: addr2line_tool.into(),
        }
    }

    /// Resolves every frame of every thread, concurrently, and waits for
    /// all lookups.
    ///
    /// Every frame whose instruction pointer falls inside a known module
    /// range gets that module's name, whether or not a local binary exists;
    /// the addr2line lookup additionally needs the local binary.
    pub async fn resolve_all(
        &self,
        threads: &mut [CallStack],
        modules: &[Module],
        page_size: u64,
    ) {
        let tasks: Vec<_> = threads
            .iter_mut()
            .flat_map(|thread| thread.frames.iter_mut())
            .filter_map(|frame| {
                let module = module_at_address(modules, frame.instruction_pointer)?;
                frame.module_name = module.name.clone();
                module.local_path.as_ref()?;
                Some(self.add_source_info(frame, module, page_size))
            })
            .collect();
        future::join_all(tasks).await;
    }

    async fn add_source_info(&self, frame: &mut StackFrame, module: &Module, page_size: u64) {
        let Some(local_path) = &module.local_path else {
            return;
        };
        let Some(relative) = relative_address(frame.instruction_pointer, module, page_size) else {
            debug!(
                "instruction pointer {:#x} below base of {}",
                frame.instruction_pointer, module.name
            );
            return;
        };
        link_debug_file(module).await;

        let address = format!("0x{relative:x}");
        let output = match run_tool(
            &self.addr2line_tool,
            &["-f", "-C", "-e", &local_path.to_string_lossy(), &address],
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!("source lookup unavailable: {e}");
                return;
            }
        };
        apply_lookup_output(frame, &output);
    }
}

/// The module-relative lookup address for a frame.
///
/// `start_address` may only be the start of a loaded segment, so the true
/// image base is recovered first; one more byte is subtracted because the
/// stored address is a return address, one past the call site.
pub fn relative_address(instruction_pointer: u64, module: &Module, page_size: u64) -> Option<u64> {
    instruction_pointer
        .checked_sub(module.base_address(page_size))?
        .checked_sub(1)
}

/// Applies addr2line's two output lines (function name, then `file:line`)
/// to a frame.
fn apply_lookup_output(frame: &mut StackFrame, output: &str) {
    let mut lines = output.lines();
    let (Some(function), Some(file_line)) = (lines.next(), lines.next()) else {
        warn!("unexpected addr2line output: {output:?}");
        return;
    };
    if function == UNKNOWN_SENTINEL {
        return;
    }
    frame.method_name = function.to_string();

    let Some((file, line)) = file_line.rsplit_once(':') else {
        return;
    };
    if file == UNKNOWN_SENTINEL {
        return;
    }
    frame.source_file = Some(file.to_string());
    frame.source_line = Some(line.parse().unwrap_or(0));
}

/// Links the module's debug symbol file next to the binary so addr2line can
/// find it through the debug link. An existing same-named entry is left
/// alone.
async fn link_debug_file(module: &Module) {
    let (Some(local_path), Some(debug_file)) = (&module.local_path, &module.debug_symbol_path)
    else {
        return;
    };
    let Some(file_name) = debug_file.file_name() else {
        return;
    };
    let target = local_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(file_name);
    if target.exists() {
        return;
    }
    if tokio::fs::hard_link(debug_file, &target).await.is_err() {
        // Different filesystem, most likely; fall back to a copy.
        if let Err(e) = tokio::fs::copy(debug_file, &target).await {
            debug!("could not place {} next to binary: {e}", file_name.to_string_lossy());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_address_corrects_segment_base() {
        let module = Module::new("/lib/liboneagent.so", 0x401000, 0x500000, 2);
        // 0x403500 - (0x401000 - 2 * 0x1000) - 1
        assert_eq!(relative_address(0x403500, &module, 4096), Some(0x44ff));
    }

    #[test]
    fn test_relative_address_below_base() {
        let module = Module::new("/lib/liboneagent.so", 0x401000, 0x500000, 2);
        assert_eq!(relative_address(0x100, &module, 4096), None);
    }

    #[test]
    fn test_lookup_output_applied() {
        let mut frame = StackFrame::default();
        apply_lookup_output(&mut frame, "do_work(int)\n/src/worker.cpp:42\n");
        assert_eq!(frame.method_name, "do_work(int)");
        assert_eq!(frame.source_file.as_deref(), Some("/src/worker.cpp"));
        assert_eq!(frame.source_line, Some(42));
    }

    #[test]
    fn test_unknown_function_keeps_existing_name() {
        let mut frame = StackFrame {
            method_name: "from_unwinder".to_string(),
            ..Default::default()
        };
        apply_lookup_output(&mut frame, "??\n??:0\n");
        assert_eq!(frame.method_name, "from_unwinder");
        assert!(frame.source_file.is_none());
    }

    #[test]
    fn test_unknown_file_sets_only_function() {
        let mut frame = StackFrame::default();
        apply_lookup_output(&mut frame, "do_work\n??:?\n");
        assert_eq!(frame.method_name, "do_work");
        assert!(frame.source_file.is_none());
        assert!(frame.source_line.is_none());
    }

    #[test]
    fn test_unparsable_line_number_defaults_to_zero() {
        let mut frame = StackFrame::default();
        apply_lookup_output(&mut frame, "do_work\n/src/worker.cpp:?\n");
        assert_eq!(frame.source_file.as_deref(), Some("/src/worker.cpp"));
        assert_eq!(frame.source_line, Some(0));
    }

    #[test]
    fn test_windows_style_colon_splits_at_last() {
        let mut frame = StackFrame::default();
        apply_lookup_output(&mut frame, "f\n/odd:dir/file.c:7\n");
        assert_eq!(frame.source_file.as_deref(), Some("/odd:dir/file.c"));
        assert_eq!(frame.source_line, Some(7));
    }

    #[tokio::test]
    async fn test_resolve_all_names_modules_without_local_binary() {
        let resolver = SourceResolver::new("addr2line");
        let modules = vec![Module::new("/lib/libfoo.so", 0x1000, 0x2000, 0)];
        let mut threads = vec![CallStack::with_index(0)];
        threads[0]
            .frames
            .push(StackFrame::new("f".into(), 0, 0x1500, 0x7f00, 0x1600));
        threads[0]
            .frames
            .push(StackFrame::new("g".into(), 0, 0x9000, 0x7f40, 0x9100));
        resolver.resolve_all(&mut threads, &modules, 4096).await;
        assert_eq!(threads[0].frames[0].module_name, "libfoo.so");
        assert_eq!(threads[0].frames[1].module_name, "");
    }
}
