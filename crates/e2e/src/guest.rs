//! Remote execution inside the guest

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::command::{CommandRunner, HostCommand};
use crate::error::{E2eError, E2eResult};

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Command channel into the running guest
#[async_trait]
pub trait Guest: Send + Sync {
    /// Wait until the guest accepts commands
    async fn wait_boot(&self, timeout: Duration) -> E2eResult<()>;

    /// Run a shell command in the guest, returning its stdout
    async fn execute(&self, command: &str) -> E2eResult<String>;

    /// Copy `source` (may be a glob) from the guest to `dest_dir/dest_name`.
    /// A `dest_name` of `.` keeps the guest file names.
    async fn download(&self, source: &str, dest_name: &str, dest_dir: &Path) -> E2eResult<()>;

    /// Wait for a reboot triggered elsewhere to complete
    async fn wait_reboot(&self, timeout: Duration) -> E2eResult<()>;

    /// Drop any cached connection
    async fn disconnect(&self);
}

/// Connection parameters for [`SshGuest`]
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub address: String,
    pub port: u16,
    pub user: String,
    pub identity: PathBuf,
}

/// [`Guest`] over OpenSSH with a shared control master
pub struct SshGuest {
    runner: Arc<dyn CommandRunner>,
    target: SshTarget,
    control_dir: TempDir,
    boot_id: Mutex<Option<String>>,
    poll_interval: Duration,
}

impl SshGuest {
    pub fn new(runner: Arc<dyn CommandRunner>, target: SshTarget) -> E2eResult<Self> {
        Ok(Self {
            runner,
            target,
            control_dir: tempfile::Builder::new().prefix("e2e-ssh").tempdir()?,
            boot_id: Mutex::new(None),
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn common_options(&self) -> Vec<String> {
        let control_path = self.control_dir.path().join("%C");
        [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
            "BatchMode=yes".to_string(),
            "ConnectTimeout=5".to_string(),
            "ControlMaster=auto".to_string(),
            format!("ControlPath={}", control_path.display()),
            "ControlPersist=60".to_string(),
        ]
        .into_iter()
        .flat_map(|opt| ["-o".to_string(), opt])
        .collect()
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.address)
    }

    /// `ssh` invocation running `command` in the guest
    pub fn ssh_command(&self, command: &str) -> HostCommand {
        HostCommand::new("ssh")
            .args(self.common_options())
            .arg("-i")
            .arg(self.target.identity.display().to_string())
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg(self.destination())
            .arg("--")
            .arg(command)
    }

    fn scp_command(&self, source: &str, dest: &Path) -> HostCommand {
        HostCommand::new("scp")
            .args(self.common_options())
            .arg("-i")
            .arg(self.target.identity.display().to_string())
            .arg("-P")
            .arg(self.target.port.to_string())
            .arg(format!("{}:{}", self.destination(), source))
            .arg(dest.display().to_string())
    }

    async fn read_boot_id(&self) -> E2eResult<String> {
        let out = self.execute(&format!("cat {}", BOOT_ID_PATH)).await?;
        Ok(out.trim().to_string())
    }
}

#[async_trait]
impl Guest for SshGuest {
    async fn wait_boot(&self, timeout: Duration) -> E2eResult<()> {
        info!(
            "Waiting for guest SSH at {}:{} (timeout: {}s)",
            self.target.address,
            self.target.port,
            timeout.as_secs()
        );
        let start = Instant::now();
        loop {
            match self.read_boot_id().await {
                Ok(id) => {
                    debug!("Guest is up, boot id {}", id);
                    *self.boot_id.lock() = Some(id);
                    return Ok(());
                }
                Err(e) => debug!("Guest not reachable yet: {}", e),
            }
            if start.elapsed() >= timeout {
                return Err(E2eError::Timeout(format!(
                    "Timed out waiting for guest at {}:{} to boot",
                    self.target.address, self.target.port
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn execute(&self, command: &str) -> E2eResult<String> {
        let out = self.runner.run(&self.ssh_command(command)).await?;
        Ok(out.stdout)
    }

    async fn download(&self, source: &str, dest_name: &str, dest_dir: &Path) -> E2eResult<()> {
        let dest = if dest_name == "." {
            dest_dir.to_path_buf()
        } else {
            dest_dir.join(dest_name)
        };
        debug!("Downloading {} to {}", source, dest.display());
        self.runner.run(&self.scp_command(source, &dest)).await?;
        Ok(())
    }

    async fn wait_reboot(&self, timeout: Duration) -> E2eResult<()> {
        let previous = self.boot_id.lock().clone();
        let start = Instant::now();
        loop {
            // the old control master points at the previous boot
            self.disconnect().await;
            if let Ok(id) = self.read_boot_id().await {
                if previous.as_deref() != Some(id.as_str()) {
                    info!("Guest rebooted (boot id {})", id);
                    *self.boot_id.lock() = Some(id);
                    return Ok(());
                }
            }
            if start.elapsed() >= timeout {
                return Err(E2eError::Timeout(format!(
                    "Timed out waiting for guest at {}:{} to reboot",
                    self.target.address, self.target.port
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn disconnect(&self) {
        let cmd = HostCommand::new("ssh")
            .args(self.common_options())
            .args(["-O", "exit"])
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg(self.destination());
        // no master running is fine
        let _ = self.runner.run(&cmd).await;
    }
}
