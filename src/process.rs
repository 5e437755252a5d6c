//! Builder for running host tools (`mdconfig`, `gpart`, `zpool`, `git`, `make`).
//!
//! `Cmd` is cloneable so a release command can be stored alongside the
//! resource it tears down and run later by the tracker.
//!
//! Every child runs in its own process group and is recorded while it runs,
//! so [`terminate_children`] can stop in-flight work (a `make` stage, a
//! `git clone`, an attach) before a signal-triggered teardown releases what
//! that work was using.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::raw::c_int;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// How long killed process groups get to be reaped after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Failure to run a host tool.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' not started: shutting down")]
    Stopped { program: String },

    #[error("{message}: `{command}` exited with {status}{detail}")]
    Failed {
        message: String,
        command: String,
        status: ExitStatus,
        detail: String,
    },
}

#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    dir: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
    /// Recorded for [`terminate_children`] and refused once it has run.
    supervised: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            dir: None,
            error_msg: None,
            allow_fail: false,
            supervised: true,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    /// Message prefixed to the error when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Exempt from [`terminate_children`]: teardown's own release commands
    /// must still run after in-flight work has been stopped.
    pub(crate) fn for_teardown(mut self) -> Self {
        self.supervised = false;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run with captured stdout/stderr.
    pub fn run(&self) -> Result<CommandResult, CommandError> {
        debug!(command = %self, "running");
        let mut command = self.command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let (child, _running) = self.spawn(command)?;
        let output = child
            .wait_with_output()
            .map_err(|source| self.wait_failed(source))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let stderr = result.stderr.trim();
            return Err(self.failed(
                result.status,
                if stderr.is_empty() {
                    String::new()
                } else {
                    format!("\n{stderr}")
                },
            ));
        }
        Ok(result)
    }

    /// Run with inherited stdout/stderr so long-running tools show their own progress.
    pub fn run_interactive(&self) -> Result<(), CommandError> {
        debug!(command = %self, "running (interactive)");
        let mut command = self.command();
        // A background process group reading the terminal would stop on SIGTTIN.
        command.stdin(Stdio::null());
        let (mut child, _running) = self.spawn(command)?;
        let status = child.wait().map_err(|source| self.wait_failed(source))?;
        if !status.success() && !self.allow_fail {
            return Err(self.failed(status, String::new()));
        }
        Ok(())
    }

    fn spawn(&self, mut command: Command) -> Result<(Child, Option<Running>), CommandError> {
        command.process_group(0);
        let spawn_failed = |source| CommandError::Spawn {
            program: self.program.clone(),
            source,
        };
        if !self.supervised {
            return command.spawn().map(|child| (child, None)).map_err(spawn_failed);
        }

        // Spawn and record under one lock so terminate_children never misses a child.
        let mut children = supervisor();
        if children.stopping {
            return Err(CommandError::Stopped {
                program: self.program.clone(),
            });
        }
        let child = command.spawn().map_err(spawn_failed)?;
        children.groups.push(child.id());
        let running = Running(child.id());
        Ok((child, Some(running)))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn wait_failed(&self, source: std::io::Error) -> CommandError {
        CommandError::Wait {
            program: self.program.clone(),
            source,
        }
    }

    fn failed(&self, status: ExitStatus, detail: String) -> CommandError {
        CommandError::Failed {
            message: self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("{} failed", self.program)),
            command: self.to_string(),
            status,
            detail,
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Process groups of supervised children that have not been waited for yet.
struct Supervisor {
    groups: Vec<u32>,
    stopping: bool,
}

static SUPERVISOR: Mutex<Supervisor> = Mutex::new(Supervisor {
    groups: Vec::new(),
    stopping: false,
});
static GROUP_REAPED: Condvar = Condvar::new();

fn supervisor() -> MutexGuard<'static, Supervisor> {
    SUPERVISOR.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded child; dropped by the spawning thread after it reaped the child.
struct Running(u32);

impl Drop for Running {
    fn drop(&mut self) {
        supervisor().groups.retain(|g| *g != self.0);
        GROUP_REAPED.notify_all();
    }
}

/// Stop every supervised child and refuse new ones.
///
/// Each child's process group gets SIGTERM, then SIGKILL if it is still
/// running after `grace`. Returns once the threads that started them have
/// reaped them, or the kill wait ran out.
pub fn terminate_children(grace: Duration) {
    let mut children = supervisor();
    children.stopping = true;
    if children.groups.is_empty() {
        return;
    }
    warn!(count = children.groups.len(), "stopping running host commands");
    signal_groups(&children.groups, libc::SIGTERM);
    children = wait_reaped(children, grace);

    if !children.groups.is_empty() {
        signal_groups(&children.groups, libc::SIGKILL);
        children = wait_reaped(children, KILL_WAIT);
    }
    if !children.groups.is_empty() {
        warn!(groups = ?children.groups, "host commands still running after SIGKILL");
    }
}

fn wait_reaped(
    mut children: MutexGuard<'static, Supervisor>,
    limit: Duration,
) -> MutexGuard<'static, Supervisor> {
    let deadline = Instant::now() + limit;
    while !children.groups.is_empty() {
        let Some(left) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        children = GROUP_REAPED
            .wait_timeout(children, left)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
    children
}

fn signal_groups(groups: &[u32], sig: c_int) {
    for &group in groups {
        // SAFETY: a negative pid addresses exactly that process group.
        unsafe {
            libc::kill(-(group as libc::pid_t), sig);
        }
    }
}
