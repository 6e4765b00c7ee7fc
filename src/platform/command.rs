//! External command execution with a hard deadline.
//!
//! Mount helpers talking to an unreachable server can hang for minutes (or
//! forever in uninterruptible sleep), so every command is polled against a
//! deadline, killed when it expires, and abandoned if the kill does not take.

#![allow(missing_docs)]

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded};

use crate::core::errors::{NfsmError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to wait for a killed child to be reaped before giving up on it.
const KILL_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for pipe readers once the child has exited.
const PIPE_DRAIN_WAIT: Duration = Duration::from_secs(1);

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Best available failure text: stderr, else stdout, else the exit code.
    #[must_use]
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Run `program args...`, capturing output, killing it after `timeout`.
pub fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| NfsmError::io(program, source))?;

    let stdout_rx = child.stdout.take().map(spawn_pipe_reader);
    let stderr_rx = child.stderr.take().map(spawn_pipe_reader);

    let started = Instant::now();
    let code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {}
            Err(source) => return Err(NfsmError::io(program, source)),
        }
        if started.elapsed() >= timeout {
            kill_and_abandon(&mut child);
            return Err(NfsmError::CommandTimeout {
                command: render_command(program, args),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        code,
        stdout: drain(stdout_rx),
        stderr: drain(stderr_rx),
    })
}

/// `program arg1 arg2` for log lines.
#[must_use]
pub fn render_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_pipe_reader<R>(mut pipe: R) -> Receiver<String>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// Helpers forked by the child (e.g. `mount.nfs`) may keep the pipe open, so
/// reads are bounded too.
fn drain(rx: Option<Receiver<String>>) -> String {
    rx.and_then(|rx| rx.recv_timeout(PIPE_DRAIN_WAIT).ok())
        .unwrap_or_default()
}

fn kill_and_abandon(child: &mut Child) {
    let _ = child.kill();
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    eprintln!(
        "[NFSM-COMMAND] pid {} did not exit after kill, abandoning",
        child.id()
    );
}
