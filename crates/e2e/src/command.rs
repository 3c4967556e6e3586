//! Host process boundary
//!
//! Hypervisor, ISO and SSH tooling is invoked through [`CommandRunner`] so
//! the VM controller only sees exit status and text output.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::{E2eError, E2eResult};

// Keep error messages readable when a tool dumps a lot on stderr
const MAX_STDERR_BYTES: usize = 1024;

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// True when any argument contains `needle`
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a.contains(needle))
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured output of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            stderr: String::new(),
        }
    }
}

/// A process left running in the background (e.g. `virt-install --wait`)
pub struct BackgroundProcess {
    description: String,
    child: Option<Child>,
}

impl BackgroundProcess {
    pub fn new(description: impl Into<String>, child: Child) -> Self {
        Self {
            description: description.into(),
            child: Some(child),
        }
    }

    /// A handle with no local process behind it
    pub fn detached(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            child: None,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Terminate the process: SIGTERM first, SIGKILL if it is still around.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Some(pid) = child.id() {
            info!("Stopping {} (pid: {})", self.description, pid);
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                    let _ = tokio::time::timeout(Duration::from_millis(500), child.wait()).await;
                }
            }
        }

        let _ = child.kill().await;
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Executes host commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is [`E2eError::CommandFailed`].
    async fn run(&self, cmd: &HostCommand) -> E2eResult<CommandOutput>;

    /// Start in the background without waiting for it
    fn spawn(&self, cmd: &HostCommand) -> E2eResult<BackgroundProcess>;
}

/// [`CommandRunner`] backed by real processes
#[derive(Debug, Clone, Default)]
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, cmd: &HostCommand) -> E2eResult<CommandOutput> {
        debug!("exec: {}", cmd);
        let output = cmd
            .to_command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| E2eError::CommandFailed {
                command: cmd.to_string(),
                status: "spawn failed".to_string(),
                stderr: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(E2eError::CommandFailed {
                command: cmd.to_string(),
                status: output.status.to_string(),
                stderr: tail(&stderr, MAX_STDERR_BYTES).to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }

    fn spawn(&self, cmd: &HostCommand) -> E2eResult<BackgroundProcess> {
        debug!("spawn: {}", cmd);
        let child = cmd
            .to_command()
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| E2eError::CommandFailed {
                command: cmd.to_string(),
                status: "spawn failed".to_string(),
                stderr: e.to_string(),
            })?;
        Ok(BackgroundProcess::new(cmd.program.clone(), child))
    }
}

/// Last `max` bytes of `s`, cut on a char boundary
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
