//! Builds the list of loaded binary images, two ways.
//!
//! The primary strategy reads the core file's `NT_FILE` mapping note via
//! `readelf -n`. Dumps written by kernels older than 3.6 don't carry that
//! note, so a fallback scripts gdb's `info shared` listing and normalizes
//! the reported segment addresses with section/program-header data. The
//! fallback also has to tell the unwinding engine where every image is
//! mapped (`register_backing_file`) before any unwinding starts, because
//! the engine resolves symbols from registered backing files while
//! stepping.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use coredump_common::{basename, Module};
use coredump_symbols::{run_tool, ToolError};
use coredump_unwind::UnwindEngine;

use crate::gdb::GdbSession;

#[derive(Debug, thiserror::Error)]
pub enum ModuleMapError {
    #[error("No module map could be built from any source")]
    Empty,
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// One way of producing the module list for a dump.
///
/// Strategies are tried in order; a strategy that yields no modules is not
/// an error, the next one simply runs. Only all strategies coming back
/// empty is fatal.
#[async_trait(?Send)]
pub trait ModuleMapStrategy {
    async fn build(&self, engine: &mut dyn UnwindEngine) -> Result<Vec<Module>, ModuleMapError>;
}

/// Runs the strategies in order and returns the first non-empty module
/// list.
pub async fn build_module_map(
    strategies: &[&dyn ModuleMapStrategy],
    engine: &mut dyn UnwindEngine,
) -> Result<Vec<Module>, ModuleMapError> {
    for strategy in strategies {
        match strategy.build(engine).await {
            Ok(modules) if !modules.is_empty() => return Ok(modules),
            Ok(_) => debug!("module map strategy produced no modules, trying next"),
            Err(e) => warn!("module map strategy failed: {e}"),
        }
    }
    Err(ModuleMapError::Empty)
}

/// A `(start, end, offset, path)` mapping parsed from tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: String,
}

// ---------------------------------------------------------------------------
// Strategy 1: the NT_FILE note.

pub struct ElfNoteStrategy {
    readelf_tool: String,
    dump_path: PathBuf,
    work_dir: PathBuf,
}

impl ElfNoteStrategy {
    pub fn new(readelf_tool: &str, dump_path: &Path, work_dir: &Path) -> ElfNoteStrategy {
        ElfNoteStrategy {
            readelf_tool: readelf_tool.to_string(),
            dump_path: dump_path.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
        }
    }
}

#[async_trait(?Send)]
impl ModuleMapStrategy for ElfNoteStrategy {
    async fn build(&self, _engine: &mut dyn UnwindEngine) -> Result<Vec<Module>, ModuleMapError> {
        let output = run_tool(
            &self.readelf_tool,
            &["-n", &self.dump_path.to_string_lossy()],
        )
        .await?;
        let mut modules = Vec::new();
        for mapping in parse_nt_file_note(&output) {
            let mut module = Module::new(&mapping.path, mapping.start, mapping.end, mapping.offset);
            let (local_path, file_size) = locate_local_file(&self.work_dir, &mapping.path);
            module.local_path = local_path;
            module.file_size = file_size;
            modules.push(module);
        }
        Ok(modules)
    }
}

/// Extracts the mapped-file triples from `readelf -n` output.
///
/// The mapping block follows the "Page size:" marker and a column header;
/// each entry is an address line followed by the path on its own line. The
/// `/dev/zero` pseudo-mapping carries no image and is dropped.
pub fn parse_nt_file_note(output: &str) -> Vec<RawMapping> {
    let address_re =
        Regex::new(r"0x([0-9a-f]+)\s+0x([0-9a-f]+)\s+0x([0-9a-f]+)\s+(\S+)").unwrap();
    let lines: Vec<&str> = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .skip_while(|line| !line.contains("Page size:"))
        .skip(2)
        .collect();
    let mut mappings = Vec::new();
    for pair in lines.chunks(2) {
        let [addresses, path] = pair else { break };
        let joined = format!("{addresses} {path}");
        let Some(captures) = address_re.captures(&joined) else {
            continue;
        };
        let (Ok(start), Ok(end), Ok(offset)) = (
            u64::from_str_radix(&captures[1], 16),
            u64::from_str_radix(&captures[2], 16),
            u64::from_str_radix(&captures[3], 16),
        ) else {
            continue;
        };
        let path = captures[4].to_string();
        if path == "/dev/zero" {
            continue;
        }
        mappings.push(RawMapping {
            start,
            end,
            offset,
            path,
        });
    }
    mappings
}

/// Looks for a local copy of a mapped file: the unpacked-archive copy under
/// the work dir first, then the absolute path on the analysis host.
fn locate_local_file(work_dir: &Path, mapped_path: &str) -> (Option<PathBuf>, u64) {
    let relative = work_dir.join(mapped_path.trim_start_matches('/'));
    let absolute = PathBuf::from(mapped_path);
    for candidate in [relative, absolute] {
        if let Ok(metadata) = candidate.metadata() {
            if metadata.is_file() {
                return (Some(candidate), metadata.len());
            }
        }
    }
    (None, 0)
}

// ---------------------------------------------------------------------------
// Strategy 2: scripted gdb, for dumps without the NT_FILE note.

pub struct GdbMapStrategy {
    gdb_tool: String,
    readelf_tool: String,
    dump_path: PathBuf,
    timeout: Duration,
}

impl GdbMapStrategy {
    pub fn new(
        gdb_tool: &str,
        readelf_tool: &str,
        dump_path: &Path,
        timeout: Duration,
    ) -> GdbMapStrategy {
        GdbMapStrategy {
            gdb_tool: gdb_tool.to_string(),
            readelf_tool: readelf_tool.to_string(),
            dump_path: dump_path.to_path_buf(),
            timeout,
        }
    }

    /// Runs the `info shared` session. Registering must happen before the
    /// engine unwinds anything, which the pipeline's stage order
    /// guarantees.
    async fn build_from_gdb(
        &self,
        engine: &mut dyn UnwindEngine,
    ) -> Result<Vec<Module>, ModuleMapError> {
        let executable = engine.executable_path();
        let mut session = GdbSession::spawn(&self.gdb_tool)?;
        // Libraries must load from the unpacked archive so gdb sees the
        // same images the unwinding engine does.
        session.send("set solib-absolute-prefix .").await?;
        if let Some(executable) = &executable {
            session.send(&format!("file {executable}")).await?;
        }
        session
            .send(&format!("core-file {}", self.dump_path.display()))
            .await?;
        session.send("info shared").await?;
        session.send("quit").await?;
        let (out, err) = session.finish(self.timeout).await?;
        if !err.is_empty() {
            debug!("gdb stderr during module listing: {}", err.trim());
        }

        let mut modules = Vec::new();
        for (start, end, path) in parse_info_shared(&out) {
            info!("shared library {start:#x}-{end:#x}: {path}");
            let local_path = tokio::fs::canonicalize(&path)
                .await
                .unwrap_or_else(|_| PathBuf::from(&path));
            let mut module = Module::new(&path, start, end, 0);
            module.name = basename(&local_path.to_string_lossy()).to_string();
            if let Ok(metadata) = local_path.metadata() {
                module.file_size = metadata.len();
            }

            // gdb reports where the .text segment is mapped, not the image
            // base; back out the section's file offset.
            let sections = run_tool(
                &self.readelf_tool,
                &["-S", &local_path.to_string_lossy()],
            )
            .await
            .unwrap_or_default();
            if let Some(text_offset) = parse_text_file_offset(&sections) {
                module.start_address = module.start_address.saturating_sub(text_offset);
            }
            engine.register_backing_file(&local_path, module.start_address);
            module.local_path = Some(local_path);
            modules.push(module);
        }

        if let Some(executable) = &executable {
            self.register_main_executable(engine, executable).await;
        }
        Ok(modules)
    }

    /// The main executable is not in `info shared`; its load address comes
    /// from the first LOAD program header.
    async fn register_main_executable(&self, engine: &mut dyn UnwindEngine, executable: &str) {
        let output = run_tool(&self.readelf_tool, &["-l", executable])
            .await
            .unwrap_or_default();
        if let Some(address) = parse_first_load_address(&output) {
            engine.register_backing_file(Path::new(executable), address);
        } else {
            warn!("no LOAD program header found for {executable}");
        }
    }
}

#[async_trait(?Send)]
impl ModuleMapStrategy for GdbMapStrategy {
    async fn build(&self, engine: &mut dyn UnwindEngine) -> Result<Vec<Module>, ModuleMapError> {
        self.build_from_gdb(engine).await
    }
}

/// Extracts `(start, end, path)` from gdb's `info shared` listing.
pub fn parse_info_shared(output: &str) -> Vec<(u64, u64, String)> {
    let library_re =
        Regex::new(r"0x([0-9a-f]+)\s+0x([0-9a-f]+)\s+\w*\s+(?:\(\*\)\s+)?(.*)").unwrap();
    let mut libraries = Vec::new();
    for line in output.lines() {
        let Some(captures) = library_re.captures(line) else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(&captures[1], 16),
            u64::from_str_radix(&captures[2], 16),
        ) else {
            continue;
        };
        libraries.push((start, end, captures[3].trim().to_string()));
    }
    libraries
}

/// File offset of the `.text` section in a `readelf -S` section listing.
pub fn parse_text_file_offset(output: &str) -> Option<u64> {
    let section_re = Regex::new(r"\.\w+\s+PROGBITS\s+([0-9a-f]+)\s+([0-9a-f]+)").unwrap();
    for line in output.lines() {
        if !line.contains(".text") {
            continue;
        }
        if let Some(captures) = section_re.captures(line) {
            return u64::from_str_radix(&captures[2], 16).ok();
        }
    }
    None
}

/// Virtual address of the first LOAD entry in a `readelf -l` program-header
/// listing.
pub fn parse_first_load_address(output: &str) -> Option<u64> {
    let load_re = Regex::new(r"LOAD\s+0x(?:[0-9a-f]+)\s+0x([0-9a-f]+)").unwrap();
    for line in output.lines() {
        if let Some(captures) = load_re.captures(line) {
            return u64::from_str_radix(&captures[1], 16).ok();
        }
    }
    None
}
