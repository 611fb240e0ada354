use std::time::Duration;

use coredump_symbols::SymbolStoreConfig;

/// Tool names and limits for one analysis run.
///
/// The defaults match a stock elfutils/binutils/gdb installation; the CLI
/// overrides the symbol-store fields from its flags.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub symbol_store: SymbolStoreConfig,
    /// The ELF note/section/program-header dump tool.
    pub readelf_tool: String,
    /// The file/line lookup tool.
    pub addr2line_tool: String,
    /// The interactive debugger.
    pub gdb_tool: String,
    /// Budget for the gdb module-map fallback session.
    pub gdb_map_timeout: Duration,
    /// Budget for the gdb locals/args transcript session. Generous; gdb
    /// usually finishes in seconds even for dumps with hundreds of threads.
    pub gdb_transcript_timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> AnalyzerConfig {
        AnalyzerConfig {
            symbol_store: SymbolStoreConfig::default(),
            readelf_tool: "readelf".into(),
            addr2line_tool: "addr2line".into(),
            gdb_tool: "gdb".into(),
            gdb_map_timeout: Duration::from_secs(60),
            gdb_transcript_timeout: Duration::from_secs(120),
        }
    }
}
