//! The analysis pipeline, from raw dump to result artifact.

use std::path::Path;

use regex::Regex;
use tracing::{debug, info, warn};

use coredump_common::{Module, SystemContext};
use coredump_symbols::{DebugSymbolResolver, SourceResolver};
use coredump_unwind::{
    extract_fault_context, read_system_context, unwind_threads, EngineSession, UnwindEngine,
};

use crate::config::AnalyzerConfig;
use crate::fingerprint::fingerprint;
use crate::module_map::{build_module_map, ElfNoteStrategy, GdbMapStrategy};
use crate::process_state::ProcessState;
use crate::transcript::enrich_from_gdb;

/// Names of files the service layer drops next to the dump.
const SUMMARY_FILE: &str = "summary.txt";

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("No module map could be constructed from the dump")]
    NoModuleMap,
    #[error("The dump contains no thread state")]
    NoThreadData,
}

/// Runs the full reconstruction of one core dump.
///
/// `work_dir` is the directory the crash archive was unpacked into; mapped
/// binaries, `summary.txt` and the agent log are looked up relative to it.
/// Stage order matters: the module map runs before unwinding because the
/// gdb fallback strategy has to register backing files with the engine
/// first, and everything after unwinding is best effort.
pub async fn process_coredump<E: UnwindEngine>(
    engine: E,
    dump_path: &Path,
    work_dir: &Path,
    config: &AnalyzerConfig,
) -> Result<ProcessState, ProcessError> {
    let mut session = EngineSession::new(engine);

    let mut system_context = read_system_context(&mut *session);
    resolve_executable_path(&mut system_context, work_dir);

    info!("building module map");
    let elf_note = ElfNoteStrategy::new(&config.readelf_tool, dump_path, work_dir);
    let gdb_map = GdbMapStrategy::new(
        &config.gdb_tool,
        &config.readelf_tool,
        dump_path,
        config.gdb_map_timeout,
    );
    let modules = build_module_map(&[&elf_note, &gdb_map], &mut *session)
        .await
        .map_err(|_| ProcessError::NoModuleMap)?;
    info!("found {} modules", modules.len());

    let thread_count = session.thread_count();
    if thread_count == 0 {
        return Err(ProcessError::NoThreadData);
    }
    info!("unwinding {thread_count} threads");
    let threads = unwind_threads(&mut *session);
    let fault_context = extract_fault_context(&mut *session, thread_count);
    drop(session);

    let mut state = ProcessState {
        system_context,
        modules,
        threads,
        fault_context,
        ..Default::default()
    };
    symbolicate(&mut state, dump_path, work_dir, config).await;
    Ok(state)
}

/// Re-runs the enrichment stages against a previous run's artifact.
///
/// Unwinding is skipped entirely; the stacks and fault context in `state`
/// are taken as-is and only symbols, source lines and gdb variables are
/// refreshed. Useful after new debug symbols were published.
pub async fn resymbolicate(
    state: &mut ProcessState,
    dump_path: &Path,
    work_dir: &Path,
    config: &AnalyzerConfig,
) {
    symbolicate(state, dump_path, work_dir, config).await;
}

async fn symbolicate(
    state: &mut ProcessState,
    dump_path: &Path,
    work_dir: &Path,
    config: &AnalyzerConfig,
) {
    info!("reading agent versions from the dump log");
    apply_agent_log_versions(dump_path, &mut state.modules);

    info!("fetching debug symbols");
    DebugSymbolResolver::new(config.symbol_store.clone())
        .resolve_all(&mut state.modules)
        .await;

    info!("resolving source information");
    let page_size = match state.system_context.page_size {
        0 => 4096,
        size => size,
    };
    SourceResolver::new(&config.addr2line_tool)
        .resolve_all(&mut state.threads, &state.modules, page_size)
        .await;

    info!("reading stack variables through gdb");
    if let Err(e) = enrich_from_gdb(
        state,
        &config.gdb_tool,
        dump_path,
        work_dir,
        config.gdb_transcript_timeout,
    )
    .await
    {
        warn!("gdb enrichment skipped: {e}");
    }

    // Always computed last, over the fully symbolicated stacks; a stored
    // fingerprint from an older schema version is replaced here.
    state.fingerprint = Some(fingerprint(state));
}

/// Settles on a main-executable path that actually exists on disk.
///
/// The engine's idea of the executable (and the first token of the command
/// line) refer to paths on the crashed host; the unpacked archive usually
/// holds them under `work_dir`. `summary.txt`, written by the agent at dump
/// time, is the most reliable source when present. The first candidate that
/// exists as a file wins; if none does, the engine's answer is kept.
fn resolve_executable_path(context: &mut SystemContext, work_dir: &Path) {
    let mut candidates = Vec::new();
    if let Some(path) = executable_from_summary(work_dir) {
        candidates.push(work_dir.join(path.trim_start_matches('/')));
    }
    if let Some(path) = &context.executable_path {
        candidates.push(work_dir.join(path.trim_start_matches('/')));
        candidates.push(path.into());
    }
    if let Some(path) = context.args.as_deref().map(first_token) {
        candidates.push(work_dir.join(path.trim_start_matches('/')));
        candidates.push(path.into());
    }
    for candidate in candidates {
        if candidate.is_file() {
            info!("executable file: {}", candidate.display());
            context.executable_path = Some(candidate.to_string_lossy().into_owned());
            return;
        }
    }
    debug!("no executable candidate exists locally, keeping {:?}", context.executable_path);
}

fn executable_from_summary(work_dir: &Path) -> Option<String> {
    let text = std::fs::read_to_string(work_dir.join(SUMMARY_FILE)).ok()?;
    let executable_re = Regex::new(r"executablePath: (\S+)").unwrap();
    text.lines()
        .find_map(|line| executable_re.captures(line).map(|c| c[1].to_string()))
}

fn first_token(args: &str) -> &str {
    match args.find(' ') {
        Some(index) => &args[..index],
        None => args,
    }
}

/// Pulls agent module versions out of the log the dumper writes next to the
/// core file (same name, `.log` extension).
///
/// Version lines end in a parenthesized version; the first module whose
/// file name occurs in such a line gets it.
fn apply_agent_log_versions(dump_path: &Path, modules: &mut [Module]) {
    let log_path = dump_path.with_extension("log");
    let text = match std::fs::read_to_string(&log_path) {
        Ok(text) => text,
        Err(_) => {
            debug!("no dump log at {}, skipping", log_path.display());
            return;
        }
    };
    let version_re = Regex::new(r"\(([\w\-\.]+)\)$").unwrap();
    for line in text.lines() {
        let line = line.trim_end();
        let Some(captures) = version_re.captures(line) else {
            continue;
        };
        if let Some(module) = modules
            .iter_mut()
            .find(|module| !module.name.is_empty() && line.contains(&module.name))
        {
            module.version = Some(captures[1].to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coredump_common::{AuxvTag, Module};
    use coredump_unwind::{Cursor, EngineError, SignalInfo};
    use std::path::PathBuf;

    struct StubEngine;

    impl UnwindEngine for StubEngine {
        fn thread_count(&mut self) -> u32 {
            1
        }
        fn select_thread(&mut self, _index: u32) -> Result<(), EngineError> {
            Ok(())
        }
        fn cursor(&mut self) -> Cursor {
            Cursor::default()
        }
        fn step(&mut self) -> bool {
            true
        }
        fn auxv_value(&mut self, _tag: AuxvTag) -> u64 {
            0
        }
        fn auxv_string(&mut self, _tag: AuxvTag) -> String {
            String::new()
        }
        fn signal_info(&mut self, _thread: u32) -> Option<SignalInfo> {
            None
        }
        fn register_backing_file(&mut self, _path: &Path, _address: u64) {}
        fn executable_path(&mut self) -> Option<String> {
            None
        }
        fn executable_args(&mut self) -> Option<String> {
            None
        }
        fn is_64_bit(&mut self) -> Option<bool> {
            Some(true)
        }
        fn end(&mut self) {}
    }

    #[tokio::test]
    async fn test_no_module_map_is_fatal() {
        let work_dir = tempfile::tempdir().unwrap();
        let config = AnalyzerConfig {
            readelf_tool: "readelf-that-does-not-exist".into(),
            gdb_tool: "gdb-that-does-not-exist".into(),
            ..Default::default()
        };
        let result = process_coredump(
            StubEngine,
            &work_dir.path().join("core.1"),
            work_dir.path(),
            &config,
        )
        .await;
        assert!(matches!(result, Err(ProcessError::NoModuleMap)));
    }

    #[test]
    fn test_first_token() {
        assert_eq!(first_token("/bin/app --flag x"), "/bin/app");
        assert_eq!(first_token("/bin/app"), "/bin/app");
    }

    #[test]
    fn test_executable_path_prefers_summary() {
        let work_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            work_dir.path().join("summary.txt"),
            "pid: 17\nexecutablePath: /usr/bin/app\n",
        )
        .unwrap();
        std::fs::create_dir_all(work_dir.path().join("usr/bin")).unwrap();
        std::fs::write(work_dir.path().join("usr/bin/app"), b"elf").unwrap();

        let mut context = SystemContext {
            executable_path: Some("/does/not/exist".into()),
            ..Default::default()
        };
        resolve_executable_path(&mut context, work_dir.path());
        assert_eq!(
            PathBuf::from(context.executable_path.unwrap()),
            work_dir.path().join("usr/bin/app")
        );
    }

    #[test]
    fn test_executable_path_falls_back_to_args() {
        let work_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(work_dir.path().join("opt")).unwrap();
        std::fs::write(work_dir.path().join("opt/daemon"), b"elf").unwrap();

        let mut context = SystemContext {
            executable_path: None,
            args: Some("/opt/daemon --workers 4".into()),
            ..Default::default()
        };
        resolve_executable_path(&mut context, work_dir.path());
        assert_eq!(
            PathBuf::from(context.executable_path.unwrap()),
            work_dir.path().join("opt/daemon")
        );
    }

    #[test]
    fn test_executable_path_keeps_engine_answer_when_nothing_exists() {
        let work_dir = tempfile::tempdir().unwrap();
        let mut context = SystemContext {
            executable_path: Some("/usr/bin/gone".into()),
            ..Default::default()
        };
        resolve_executable_path(&mut context, work_dir.path());
        assert_eq!(context.executable_path.as_deref(), Some("/usr/bin/gone"));
    }

    #[test]
    fn test_agent_log_versions() {
        let work_dir = tempfile::tempdir().unwrap();
        let dump_path = work_dir.path().join("core.1234");
        std::fs::write(
            work_dir.path().join("core.log"),
            "loading agent module liboneagentproc.so (1.135.24.20180102)\n\
             some unrelated line\n\
             loading libc.so.6 without version\n",
        )
        .unwrap();

        let mut modules = vec![
            Module::new("/lib/libc.so.6", 0x1000, 0x2000, 0),
            Module::new("/lib/oneagent/liboneagentproc.so", 0x3000, 0x4000, 0),
        ];
        apply_agent_log_versions(&dump_path, &mut modules);
        assert_eq!(modules[0].version, None);
        assert_eq!(
            modules[1].version.as_deref(),
            Some("1.135.24.20180102")
        );
    }
}
