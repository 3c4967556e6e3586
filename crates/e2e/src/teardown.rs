//! Log collection and VM teardown

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::E2eResult;
use crate::machine::VirtInstallMachine;
use crate::workflow::WorkflowState;

/// Installer logs every run must produce, with their local names
pub const INSTALLER_LOGS: &[(&str, &str)] = &[
    ("/tmp/anaconda.log", "anaconda.log"),
    ("/tmp/packaging.log", "packaging.log"),
    ("/tmp/storage.log", "storage.log"),
    ("/tmp/dbus.log", "dbus.log"),
    ("/tmp/syslog", "syslog"),
];

/// Crash dumps; only present when the installer hit an exception
pub const CRASH_DUMPS: &str = "/tmp/anaconda-tb-*";

/// Downloads installer logs into one directory per test
#[derive(Debug, Clone)]
pub struct LogCollector {
    logs_dir: PathBuf,
}

impl LogCollector {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Download the installer logs, then any crash dumps.
    ///
    /// A missing installer log is an error; missing crash dumps are not.
    pub async fn collect(&self, machine: &VirtInstallMachine) -> E2eResult<()> {
        tokio::fs::create_dir_all(&self.logs_dir).await?;
        info!("Collecting installer logs into {}", self.logs_dir.display());

        for (source, name) in INSTALLER_LOGS {
            machine.download(source, name, &self.logs_dir).await?;
        }
        if let Err(e) = machine.download(CRASH_DUMPS, ".", &self.logs_dir).await {
            debug!("No crash dumps collected: {}", e);
        }
        Ok(())
    }
}

/// Collect logs unless the workflow already did, then destroy the VM.
///
/// The VM is destroyed even when collection fails; that error is returned
/// afterwards.
pub async fn teardown(
    machine: &mut VirtInstallMachine,
    state: &WorkflowState,
    collector: &LogCollector,
) -> E2eResult<()> {
    let collected = if state.installation_finished() {
        Ok(())
    } else if machine.is_live() {
        warn!("Live image {}: no guest access, skipping log collection", machine.label());
        Ok(())
    } else {
        collector.collect(machine).await
    };

    if let Err(e) = &collected {
        warn!("Log collection failed: {}", e);
    }
    machine.kill().await;
    collected
}
