use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use log::error;
use simplelog::{
    ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};

use coredump_processor::{process_coredump, resymbolicate, AnalyzerConfig, ProcessState};

/// Analyzes a Linux core dump and produces a JSON report: per-thread call
/// stacks with source locations and stack variables, the loaded modules,
/// the terminating signal, and a fingerprint for crash deduplication.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// The core dump to analyze.
    dump: PathBuf,

    /// Directory the crash archive was unpacked into.
    ///
    /// Mapped binaries, summary.txt and the agent log are looked up here.
    /// Defaults to the dump's own directory.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Where to write the JSON report (stdout when absent).
    #[arg(long)]
    output_file: Option<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Pretty-print the JSON report.
    #[arg(long)]
    pretty: bool,

    /// Reuse the unwound stacks of a previous run's report and only refresh
    /// debug symbols, source lines, stack variables and the fingerprint.
    #[arg(long)]
    prior_json: Option<PathBuf>,

    /// Debug symbol store URL template, with {hash} and {file} placeholders.
    #[arg(long)]
    symbols_url: Option<String>,

    /// Root of the on-disk debug symbol cache.
    #[arg(long)]
    symbols_cache: Option<PathBuf>,

    /// Logging verbosity: off, error, warn, info, debug or trace.
    #[arg(long, default_value = "error")]
    verbose: String,
}

impl Args {
    fn work_dir(&self) -> PathBuf {
        match &self.work_dir {
            Some(dir) => dir.clone(),
            None => self
                .dump
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf(),
        }
    }

    fn config(&self) -> AnalyzerConfig {
        let mut config = AnalyzerConfig::default();
        config.symbol_store.url_template = self.symbols_url.clone();
        if let Some(cache) = &self.symbols_cache {
            config.symbol_store.cache_root = cache.clone();
        }
        config
    }
}

fn init_logging(args: &Args) {
    let verbosity = match args.verbose.as_str() {
        "off" => LevelFilter::Off,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Error,
    };
    // Keep trace output readable: no timestamps, threads or targets.
    let config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Off)
        .set_time_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .build();
    if let Some(log_path) = &args.log_file {
        match File::create(log_path) {
            Ok(log_file) => {
                let _ = WriteLogger::init(verbosity, config, log_file);
            }
            Err(e) => eprintln!("could not open log file {}: {e}", log_path.display()),
        }
    } else {
        let _ = TermLogger::init(verbosity, config, TerminalMode::Stderr, ColorChoice::Auto);
    }
}

#[cfg(feature = "libunwind")]
async fn analyze(args: &Args, config: &AnalyzerConfig) -> anyhow::Result<ProcessState> {
    let engine = coredump_unwind::ffi::LibunwindEngine::new(&args.dump, &args.work_dir())
        .context("while opening the core dump")?;
    process_coredump(engine, &args.dump, &args.work_dir(), config)
        .await
        .context("while processing the core dump")
}

#[cfg(not(feature = "libunwind"))]
async fn analyze(_args: &Args, _config: &AnalyzerConfig) -> anyhow::Result<ProcessState> {
    anyhow::bail!(
        "this build has no unwinding backend (the `libunwind` feature is disabled); \
         only --prior-json reprocessing is available"
    )
}

async fn try_main(args: &Args) -> anyhow::Result<()> {
    let config = args.config();
    let state = match &args.prior_json {
        Some(prior) => {
            let json = std::fs::read_to_string(prior)
                .with_context(|| format!("while reading {}", prior.display()))?;
            let mut state =
                ProcessState::from_json(&json).context("while parsing the prior report")?;
            resymbolicate(&mut state, &args.dump, &args.work_dir(), &config).await;
            state
        }
        None => analyze(args, &config).await?,
    };

    let json = state
        .to_json(args.pretty)
        .context("while serializing the report")?;
    match &args.output_file {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("while creating {}", path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("while writing {}", path.display()))?;
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);
    if let Err(e) = try_main(&args).await {
        error!("{e:#}");
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_dir_defaults_to_dump_directory() {
        let args = Args::parse_from(["coredump-stackwalk", "/dumps/crash/core.17"]);
        assert_eq!(args.work_dir(), PathBuf::from("/dumps/crash"));

        let args = Args::parse_from(["coredump-stackwalk", "core.17"]);
        assert_eq!(args.work_dir(), PathBuf::from("."));

        let args =
            Args::parse_from(["coredump-stackwalk", "--work-dir", "/unpacked", "core.17"]);
        assert_eq!(args.work_dir(), PathBuf::from("/unpacked"));
    }

    #[test]
    fn test_symbol_store_flags() {
        let args = Args::parse_from([
            "coredump-stackwalk",
            "--symbols-url",
            "https://symbols.example.com/{hash}/{file}",
            "--symbols-cache",
            "/var/cache/debugsymbols",
            "core.17",
        ]);
        let config = args.config();
        assert_eq!(
            config.symbol_store.url_template.as_deref(),
            Some("https://symbols.example.com/{hash}/{file}")
        );
        assert_eq!(
            config.symbol_store.cache_root,
            PathBuf::from("/var/cache/debugsymbols")
        );
    }
}
