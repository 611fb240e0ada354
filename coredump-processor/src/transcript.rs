//! Scripted gdb sessions for per-frame arguments and locals.
//!
//! Every thread and frame already known from unwinding gets an `info args`
//! and `info locals` issued against it, each preceded by an `echo` marker
//! line. The markers make it back in the transcript interleaved with the
//! command output, which lets a small state machine route every `name =
//! value` line to the thread and frame it belongs to.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use coredump_common::CallStack;
use coredump_symbols::ToolError;

use crate::gdb::GdbSession;
use crate::process_state::ProcessState;

pub const GDB_OUT_FILE: &str = "gdb.out.log";
pub const GDB_ERR_FILE: &str = "gdb.err.log";

/// Builds the command script for one transcript session.
///
/// gdb numbers threads starting at 1, while the engine and the result
/// artifact number them from 0; the echo markers carry the artifact's
/// numbering.
pub fn transcript_commands(state: &ProcessState, dump_path: &Path) -> Vec<String> {
    let mut commands = Vec::new();
    // Libraries must load from the unpacked archive so gdb's idea of the
    // frames matches what the unwinding produced.
    commands.push("set solib-absolute-prefix .".to_string());
    if let Some(executable) = &state.system_context.executable_path {
        commands.push(format!("file {executable}"));
    }
    commands.push(format!("core-file {}", dump_path.display()));
    for thread in &state.threads {
        commands.push(format!("echo >>thread {}\\n", thread.index));
        commands.push(format!("thread {}", thread.index + 1));
        for frame in 0..thread.frames.len() {
            commands.push(format!("echo >>select {frame}\\n"));
            commands.push(format!("select {frame}"));
            commands.push("echo >>info args\\n".to_string());
            commands.push("info args".to_string());
            commands.push("echo >>info locals\\n".to_string());
            commands.push("info locals".to_string());
            commands.push("echo >>finish frame\\n".to_string());
        }
        commands.push("echo >>finish thread\\n".to_string());
    }
    commands.push("q".to_string());
    commands
}

/// Runs the session and folds the parsed variables into `state`.
///
/// Raw transcripts are written next to the analysis output no matter what
/// the parse makes of them; they are the only way to debug a session gone
/// wrong.
pub async fn enrich_from_gdb(
    state: &mut ProcessState,
    gdb_tool: &str,
    dump_path: &Path,
    work_dir: &Path,
    timeout: Duration,
) -> Result<(), ToolError> {
    let mut session = GdbSession::spawn(gdb_tool)?;
    for command in transcript_commands(state, dump_path) {
        session.send(&command).await?;
    }
    info!("waiting for gdb transcript");
    let (out, err) = session.finish(timeout).await?;
    if !out.is_empty() {
        if let Err(e) = tokio::fs::write(work_dir.join(GDB_OUT_FILE), &out).await {
            warn!("could not persist gdb stdout transcript: {e}");
        }
    }
    if !err.is_empty() {
        if let Err(e) = tokio::fs::write(work_dir.join(GDB_ERR_FILE), err.trim()).await {
            warn!("could not persist gdb stderr transcript: {e}");
        }
    }
    parse_transcript(&out, &mut state.threads);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Skipping,
    InThread,
    InFrame,
    InArgs,
    InLocals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variable {
    Arg,
    Local,
}

/// Routes the `name = value` lines of a transcript onto their frames.
///
/// Unknown thread or frame indices in the markers are tolerated; gdb and
/// the unwinding engine occasionally disagree about thread order and a
/// transcript that does not line up should degrade to missing variables,
/// not a failed analysis.
pub fn parse_transcript(transcript: &str, threads: &mut [CallStack]) {
    let lines: Vec<&str> = transcript.lines().filter(|l| !l.is_empty()).collect();
    let mut state = State::Skipping;
    let mut active_thread = 0usize;
    let mut active_frame = 0usize;
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        match state {
            State::Skipping => {
                if line.contains(">>thread") {
                    if let Some(index) = trailing_index(line) {
                        active_thread = index;
                        state = State::InThread;
                    }
                }
            }
            State::InThread => {
                if line.ends_with(">>finish thread") {
                    state = State::Skipping;
                } else if line.contains(">>select") {
                    if let Some(index) = trailing_index(line) {
                        active_frame = index;
                        state = State::InFrame;
                    }
                }
            }
            State::InFrame => {
                if line.ends_with(">>info args") {
                    state = State::InArgs;
                } else if line.ends_with(">>info locals") {
                    state = State::InLocals;
                } else if line.ends_with(">>finish frame") {
                    state = State::InThread;
                }
            }
            State::InArgs | State::InLocals => {
                if line.contains('=') {
                    let mut full = line.to_string();
                    // gdb wraps long values; continuation lines start with
                    // whitespace.
                    while i + 1 < lines.len() && lines[i + 1].starts_with(' ') {
                        full.push(' ');
                        full.push_str(lines[i + 1].trim());
                        i += 1;
                    }
                    let kind = if state == State::InArgs {
                        Variable::Arg
                    } else {
                        Variable::Local
                    };
                    record_variable(threads, active_thread, active_frame, kind, &full);
                } else if line.ends_with(">>finish frame") {
                    state = State::InThread;
                } else if line.ends_with(">>info locals") {
                    state = State::InLocals;
                } else if line.ends_with(">>info args") {
                    state = State::InArgs;
                }
            }
        }
        i += 1;
    }
}

/// The decimal index at the end of a marker line, after the last space.
fn trailing_index(line: &str) -> Option<usize> {
    line.rsplit(' ').next()?.parse().ok()
}

fn record_variable(
    threads: &mut [CallStack],
    thread: usize,
    frame: usize,
    kind: Variable,
    line: &str,
) {
    let Some((key, value)) = parse_assignment(line) else {
        debug!("unparseable gdb assignment: {line}");
        return;
    };
    let Some(frame) = threads
        .get_mut(thread)
        .and_then(|t| t.frames.get_mut(frame))
    else {
        debug!("gdb transcript names thread {thread} frame {frame}, which was not unwound");
        return;
    };
    let variables = match kind {
        Variable::Arg => &mut frame.args,
        Variable::Local => &mut frame.locals,
    };
    // gdb sometimes prints the same variable twice; the first value wins.
    if variables.contains_key(&key) {
        debug!("duplicate gdb variable {key}");
        return;
    }
    variables.insert(key, value);
}

/// Splits a `name = value` transcript line, dropping a leading `(gdb) `
/// prompt on the name.
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let index = line.find('=')?;
    if index == 0 {
        return None;
    }
    let mut key = &line[..index];
    if let Some(stripped) = key.strip_prefix("(gdb) ") {
        key = stripped;
    }
    Some((key.trim().to_string(), line[index + 1..].trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coredump_common::StackFrame;

    fn thread_with_frames(index: u32, frames: usize) -> CallStack {
        let mut thread = CallStack::with_index(index);
        for i in 0..frames {
            thread.frames.push(StackFrame::new(
                format!("fn_{i}"),
                0,
                0x1000 + i as u64,
                0x7f00,
                0,
            ));
        }
        thread
    }

    #[test]
    fn test_variables_land_on_their_frame() {
        let mut threads = vec![thread_with_frames(0, 2), thread_with_frames(1, 1)];
        let transcript = "\
GNU gdb (GDB) 12.1
(gdb) >>thread 0
[Switching to thread 1]
>>select 0
>>info args
argc = 2
(gdb) argv = 0x7ffc0000
>>info locals
No locals.
>>finish frame
>>select 1
>>info args
No arguments.
>>info locals
buffer = \"abc\"
>>finish frame
>>finish thread
";
        parse_transcript(transcript, &mut threads);
        let frame0 = &threads[0].frames[0];
        assert_eq!(frame0.args.get("argc").map(String::as_str), Some("2"));
        assert_eq!(frame0.args.get("argv").map(String::as_str), Some("0x7ffc0000"));
        assert!(frame0.locals.is_empty());
        let frame1 = &threads[0].frames[1];
        assert!(frame1.args.is_empty());
        assert_eq!(frame1.locals.get("buffer").map(String::as_str), Some("\"abc\""));
        assert!(threads[1].frames[0].args.is_empty());
    }

    #[test]
    fn test_continuation_lines_join_the_value() {
        let mut threads = vec![thread_with_frames(0, 1)];
        let transcript = "\
>>thread 0
>>select 0
>>info locals
entry = {name = \"first\",
  next = 0x0,
  size = 4}
>>finish frame
>>finish thread
";
        parse_transcript(transcript, &mut threads);
        assert_eq!(
            threads[0].frames[0].locals.get("entry").map(String::as_str),
            Some("{name = \"first\", next = 0x0, size = 4}")
        );
    }

    #[test]
    fn test_duplicate_variable_keeps_first_value() {
        let mut threads = vec![thread_with_frames(0, 1)];
        let transcript = "\
>>thread 0
>>select 0
>>info args
x = 1
x = 2
>>finish frame
>>finish thread
";
        parse_transcript(transcript, &mut threads);
        assert_eq!(threads[0].frames[0].args.get("x").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_out_of_range_markers_are_ignored() {
        let mut threads = vec![thread_with_frames(0, 1)];
        let transcript = "\
>>thread 7
>>select 0
>>info args
ghost = 1
>>finish frame
>>finish thread
";
        parse_transcript(transcript, &mut threads);
        assert!(threads[0].frames[0].args.is_empty());
    }

    #[test]
    fn test_command_script_shape() {
        let mut state = ProcessState::default();
        state.system_context.executable_path = Some("/usr/bin/app".to_string());
        state.threads.push(thread_with_frames(0, 1));
        let commands = transcript_commands(&state, Path::new("/tmp/core.1234"));
        assert_eq!(commands[0], "set solib-absolute-prefix .");
        assert_eq!(commands[1], "file /usr/bin/app");
        assert_eq!(commands[2], "core-file /tmp/core.1234");
        assert!(commands.contains(&"echo >>thread 0\\n".to_string()));
        assert!(commands.contains(&"thread 1".to_string()));
        assert!(commands.contains(&"select 0".to_string()));
        assert!(commands.contains(&"echo >>finish thread\\n".to_string()));
        assert_eq!(commands.last().map(String::as_str), Some("q"));
    }
}
