//! Driving one interactive gdb child process.
//!
//! gdb is scripted over stdin and its transcript read back from
//! stdout/stderr. The readers run as their own tasks from the moment the
//! process is spawned, so writing a long command script can never deadlock
//! against a full output pipe.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::warn;

use coredump_symbols::ToolError;

/// One long-lived scripted debugger session.
pub struct GdbSession {
    tool: String,
    child: Child,
    stdin: ChildStdin,
    stdout_task: JoinHandle<String>,
    stderr_task: JoinHandle<String>,
}

impl GdbSession {
    /// Starts the debugger. A spawn failure means gdb is not installed;
    /// callers skip their enrichment step in that case.
    pub fn spawn(tool: &str) -> Result<GdbSession, ToolError> {
        let mut child = Command::new(tool)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::SpawnFailed {
                tool: tool.to_string(),
                source,
            })?;
        let stdin = child.stdin.take().ok_or_else(|| ToolError::Io {
            tool: tool.to_string(),
            source: std::io::Error::other("no stdin pipe"),
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| ToolError::Io {
            tool: tool.to_string(),
            source: std::io::Error::other("no stdout pipe"),
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| ToolError::Io {
            tool: tool.to_string(),
            source: std::io::Error::other("no stderr pipe"),
        })?;
        let stdout_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stdout.read_to_string(&mut buffer).await;
            buffer
        });
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            buffer
        });
        Ok(GdbSession {
            tool: tool.to_string(),
            child,
            stdin,
            stdout_task,
            stderr_task,
        })
    }

    /// Sends one command line.
    pub async fn send(&mut self, command: &str) -> Result<(), ToolError> {
        let tool = self.tool.clone();
        let map_err = move |source| ToolError::Io { tool, source };
        self.stdin
            .write_all(command.as_bytes())
            .await
            .map_err(map_err.clone())?;
        self.stdin.write_all(b"\n").await.map_err(map_err)
    }

    /// Closes stdin and collects the full (stdout, stderr) transcript,
    /// bounded by `timeout`. On expiry the child is killed and the partial
    /// session is discarded.
    pub async fn finish(self, timeout: Duration) -> Result<(String, String), ToolError> {
        let GdbSession {
            tool,
            mut child,
            stdin,
            stdout_task,
            stderr_task,
        } = self;
        // Closing stdin is what makes gdb run the script to completion.
        drop(stdin);
        let transcripts = tokio::time::timeout(timeout, async move {
            let out = stdout_task.await.unwrap_or_default();
            let err = stderr_task.await.unwrap_or_default();
            (out, err)
        })
        .await;
        match transcripts {
            Ok((out, err)) => {
                let _ = child.wait().await;
                Ok((out, err))
            }
            Err(_) => {
                warn!("{tool} session timed out");
                let _ = child.start_kill();
                Err(ToolError::TimedOut { tool })
            }
        }
    }
}
