//! Command execution abstraction with timeouts and privilege escalation.
//!
//! Every external tool this library touches (`lsblk`, `blkid`, `mount`,
//! `smartctl`, ...) is launched through a [`CommandRunner`]. Arguments are
//! always passed as a literal argument vector, never through a shell, so
//! device paths and labels coming from the outside cannot inject commands.
//!
//! [`ExecutionContext`] is the production runner. It can wrap privileged
//! commands with `pkexec` (GUI) or `sudo` (TTY).

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// How often a running child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    /// Returns the wrapper binary, if any.
    fn wrapper(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pkexec => Some("pkexec"),
            Self::Sudo => Some("sudo"),
        }
    }
}

/// Per-invocation execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Deadline after which the child is killed.
    pub timeout: Duration,
    /// Report success even when the exit code is non-zero.
    pub ignore_failure: bool,
    /// Run through the context's privilege escalation wrapper.
    pub privileged: bool,
}

impl RunOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ignore_failure: false,
            privileged: false,
        }
    }

    pub fn ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// True when the exit code is zero or failures are ignored.
    pub success: bool,
    /// Process exit code, `-1` when killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Converts an unsuccessful output into [`Error::CommandExit`].
    pub fn into_checked(self, command: &str) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        Err(Error::CommandExit {
            command: command.to_string(),
            code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Capability for running external programs and touching root-owned files.
///
/// Implemented by [`ExecutionContext`] for real systems; tests provide
/// scripted runners so no real process is ever launched.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`.
    ///
    /// A non-zero exit is not an error; only a launch failure
    /// ([`Error::CommandExecution`]) or an expired deadline
    /// ([`Error::CommandTimeout`]) are.
    fn run(&self, program: &str, args: &[&str], options: RunOptions) -> Result<CommandOutput>;

    /// Appends `content` to the file at `path`, creating it if needed.
    fn append_file(&self, path: &Path, content: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(content.as_bytes())
    }

    /// Copies `src` to `dst`.
    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        std::fs::copy(src, dst).map(|_| ())
    }
}

/// Execution context for running system commands.
///
/// This struct holds the configuration for how commands should be executed,
/// particularly whether they need privilege escalation.
///
/// # Example
///
/// ```
/// use homestore_core::executor::{ExecutionContext, PrivilegeEscalation};
///
/// // Default: no privilege escalation
/// let ctx = ExecutionContext::default();
/// assert_eq!(ctx.escalation(), PrivilegeEscalation::None);
///
/// // For terminal applications
/// let tty_ctx = ExecutionContext::with_sudo();
/// assert_eq!(tty_ctx.escalation(), PrivilegeEscalation::Sudo);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    escalation: PrivilegeEscalation,
}

impl ExecutionContext {
    /// Creates a new execution context with no privilege escalation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an execution context that uses `pkexec` for privileged commands.
    pub fn with_pkexec() -> Self {
        Self::with_escalation(PrivilegeEscalation::Pkexec)
    }

    /// Creates an execution context that uses `sudo` for privileged commands.
    pub fn with_sudo() -> Self {
        Self::with_escalation(PrivilegeEscalation::Sudo)
    }

    /// Creates an execution context with a specific escalation method.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self { escalation }
    }

    /// Returns the current privilege escalation method.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }

    /// Builds the final argument vector, prepending the wrapper if needed.
    fn argv<'a>(&self, program: &'a str, args: &[&'a str], privileged: bool) -> Vec<&'a str> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if privileged && let Some(wrapper) = self.escalation.wrapper() {
            argv.push(wrapper);
        }
        argv.push(program);
        argv.extend_from_slice(args);
        argv
    }
}

impl CommandRunner for ExecutionContext {
    fn run(&self, program: &str, args: &[&str], options: RunOptions) -> Result<CommandOutput> {
        let argv = self.argv(program, args, options.privileged);
        debug!(command = %argv.join(" "), timeout = ?options.timeout, "running command");

        let child = Command::new(argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .command_context(program)?;

        let (status, stdout, stderr) = wait_with_timeout(child, program, options.timeout)?;
        let exit_code = status.code().unwrap_or(-1);

        if exit_code != 0 {
            debug!(command = program, exit_code, stderr = %stderr.trim(), "command exited non-zero");
        }

        Ok(CommandOutput {
            success: exit_code == 0 || options.ignore_failure,
            exit_code,
            stdout,
            stderr,
        })
    }

    fn append_file(&self, path: &Path, content: &str) -> io::Result<()> {
        let Some(wrapper) = self.escalation.wrapper() else {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            return file.write_all(content.as_bytes());
        };

        let mut child = Command::new(wrapper)
            .arg("tee")
            .arg("-a")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes())?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} tee exited with {}", wrapper, status),
            ));
        }
        Ok(())
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let Some(wrapper) = self.escalation.wrapper() else {
            return std::fs::copy(src, dst).map(|_| ());
        };

        let status = Command::new(wrapper)
            .arg("cp")
            .arg(src)
            .arg(dst)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} cp exited with {}", wrapper, status),
            ));
        }
        Ok(())
    }
}

/// Waits for `child`, draining its pipes on helper threads so a chatty
/// process cannot block on a full pipe, and kills it once `timeout` passes.
fn wait_with_timeout(
    mut child: Child,
    command: &str,
    timeout: Duration,
) -> Result<(ExitStatus, String, String)> {
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait().command_context(command)? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!(command, timeout = ?timeout, "command timed out, killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::CommandTimeout {
                command: command.to_string(),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = collect(stdout_reader);
    let stderr = collect(stderr_reader);
    Ok((status, stdout, stderr))
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
