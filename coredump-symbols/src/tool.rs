//! Spawning short-lived external tools.

use std::process::Stdio;

use tokio::process::Command;

/// Failure to run an external tool.
///
/// `SpawnFailed` usually means the binary is not installed; callers treat it
/// as "this enrichment is unavailable" rather than an error of the dump.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Failed to start `{tool}`: {source}")]
    SpawnFailed {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{tool}` did not produce readable output: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{tool}` took too long, giving up on it")]
    TimedOut { tool: String },
}

/// Runs `tool` with `args` and returns its stdout as text.
///
/// A non-zero exit status is not an error here; tools like addr2line and
/// readelf emit their diagnostics on stderr and partial output is still
/// useful.
pub async fn run_tool(tool: &str, args: &[&str]) -> Result<String, ToolError> {
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|source| ToolError::SpawnFailed {
            tool: tool.to_string(),
            source,
        })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
