//! # deskvm-exec
//!
//! Synchronous subprocess facade.
//!
//! Every external tool deskvm drives (the VM provisioning tool, `virsh`,
//! `systemctl`, `systemd-run`) goes through a [`Runner`]. [`HostRunner`]
//! spawns real processes; tests substitute scripted runners.
//!
//! Captured stderr is always surfaced in the log unless the caller asks to
//! hide it, and [`RunnerExt::check_call`] turns a non-zero exit into
//! [`Error::Exec`] carrying the exit code and stderr.

use std::io::{self, Write};
use std::process::{ChildStdin, Command, Stdio};
use std::thread;

use deskvm_error::{Error, ExecFailure, Result};
use tracing::{debug, warn};

/// Options for a single command invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Text written to the child's stdin.
    pub stdin: Option<String>,
    /// Don't surface stderr in the log (it is still captured).
    pub hide_stderr: bool,
}

impl ExecOptions {
    /// Options feeding `input` to stdin.
    #[must_use]
    pub fn with_stdin(input: impl Into<String>) -> Self {
        Self {
            stdin: Some(input.into()),
            hide_stderr: false,
        }
    }

    /// Options that keep stderr out of the log.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            stdin: None,
            hide_stderr: true,
        }
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// A successful exit with the given standard output.
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// An exit with `code` and nothing captured.
    #[must_use]
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Self::default()
        }
    }

    /// An exit with `code` and the given standard error.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a non-zero exit into [`Error::Exec`].
    pub fn check(self, argv: &[&str]) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::Exec(ExecFailure {
            command: argv.join(" "),
            code: self.code,
            stderr: self.stderr,
        }))
    }
}

/// Something that can execute a command line and capture its output.
pub trait Runner: Send + Sync {
    /// Runs `argv` to completion without checking the exit status.
    fn run(&self, argv: &[&str], opts: &ExecOptions) -> Result<ExecOutput>;
}

/// Checked variants available on every [`Runner`].
pub trait RunnerExt: Runner {
    /// Runs `argv` and fails unless it exits with code 0.
    fn check_call(&self, argv: &[&str], opts: &ExecOptions) -> Result<()> {
        self.run(argv, opts)?.check(argv).map(|_| ())
    }

    /// Runs `argv`, fails unless it exits with code 0, and returns stdout.
    fn check_output(&self, argv: &[&str], opts: &ExecOptions) -> Result<String> {
        Ok(self.run(argv, opts)?.check(argv)?.stdout)
    }
}

impl<R: Runner + ?Sized> RunnerExt for R {}

/// Runs commands on the test host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn run(&self, argv: &[&str], opts: &ExecOptions) -> Result<ExecOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::config("empty command line"))?;
        let command_line = argv.join(" ");
        debug!(command = %command_line, "Executing command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Fed from a separate thread so a child that echoes its input
        // cannot fill the stdout pipe while we are still writing.
        let feeder = match (child.stdin.take(), &opts.stdin) {
            (Some(stdin), Some(input)) => {
                let input = input.clone();
                Some(thread::spawn(move || feed_stdin(stdin, &input)))
            }
            _ => None,
        };

        let output = child.wait_with_output()?;
        if let Some(feeder) = feeder {
            match feeder.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(command = %command_line, error = %e, "Failed to write stdin")
                }
                Err(_) => debug!(command = %command_line, "stdin writer panicked"),
            }
        }
        let result = ExecOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !opts.hide_stderr {
            surface_stderr(&command_line, &result);
        }
        debug!(command = %command_line, code = ?result.code, "Done executing command");

        Ok(result)
    }
}

/// Writes `input` and closes the pipe. A child that exits without reading
/// all of it is not an error.
fn feed_stdin(mut stdin: ChildStdin, input: &str) -> io::Result<()> {
    match stdin.write_all(input.as_bytes()) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

fn surface_stderr(command_line: &str, output: &ExecOutput) {
    let stderr = output.stderr.trim_end();
    if stderr.is_empty() {
        return;
    }
    if output.success() {
        debug!(command = %command_line, "stderr: {stderr}");
    } else {
        warn!(command = %command_line, code = ?output.code, "stderr: {stderr}");
    }
}
