//! Test runner: machine start, workflow, teardown

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::boot_image::CpioPatcher;
use crate::command::{CommandRunner, HostRunner};
use crate::config::{Firmware, HarnessConfig};
use crate::error::E2eResult;
use crate::guest::{SshGuest, SshTarget};
use crate::machine::{MachineSession, VirtInstallMachine};
use crate::playwright::{PlaywrightConfig, PlaywrightHandle};
use crate::screens::{InstallerScreens, WizardScreens};
use crate::teardown::{teardown, LogCollector};
use crate::workflow::{InstallerWorkflow, StageHandlers, StageRecord};

/// Result of one installation test
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub image: String,
    pub firmware: Firmware,
    pub label: String,
    pub stages: Vec<StageRecord>,
    pub logs_dir: PathBuf,
    pub error: Option<String>,
}

/// Owns the machine and the browser for one test
pub struct TestRunner {
    test_name: String,
    machine: VirtInstallMachine,
    screens: Box<dyn InstallerScreens>,
    output_dir: PathBuf,
}

impl TestRunner {
    pub fn new(
        test_name: impl Into<String>,
        machine: VirtInstallMachine,
        screens: Box<dyn InstallerScreens>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            machine,
            screens,
            output_dir: output_dir.into(),
        }
    }

    /// Wire up real host tools, SSH and a Playwright browser.
    ///
    /// `playwright.base_url` is replaced by the session's forwarded web port.
    pub fn with_host_tools(
        test_name: impl Into<String>,
        config: HarnessConfig,
        mut playwright: PlaywrightConfig,
        output_dir: impl Into<PathBuf>,
    ) -> E2eResult<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);
        let session = MachineSession::allocate(&config)?;

        let guest = SshGuest::new(
            runner.clone(),
            SshTarget {
                address: session.ssh_address.clone(),
                port: session.ssh_port,
                user: "root".to_string(),
                identity: config.identity_file(),
            },
        )?;
        playwright.base_url = session.web_url();
        let screens = WizardScreens::new(PlaywrightHandle::new(playwright)?)
            .with_install_timeout_ms(config.timings.install_timeout_ms);

        let machine = VirtInstallMachine::new(
            config,
            runner,
            Arc::new(CpioPatcher::new()),
            Arc::new(guest),
            session,
        );
        Ok(Self::new(test_name, machine, Box::new(screens), output_dir))
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn machine(&self) -> &VirtInstallMachine {
        &self.machine
    }

    /// Run the test.
    ///
    /// Missing browser tooling or a machine that fails to start is an `Err`;
    /// the machine has already been destroyed and a failed result is written
    /// to the output directory. Anything later is reported in the
    /// [`TestResult`] after teardown has run.
    pub async fn run(&mut self, handlers: &dyn StageHandlers) -> E2eResult<TestResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        info!("Running {} on {}", self.test_name, self.machine.config().image);

        let ready = match self.screens.check_browser().await {
            Ok(()) => self.machine.start().await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            error!("✗ {} - {}", self.test_name, e);
            let result = self.result(started_at, start, Vec::new(), Some(e.to_string()));
            if let Err(write) = self.write_results(&result) {
                warn!("Could not write results for {}: {}", self.test_name, write);
            }
            return Err(e);
        }

        let collector = LogCollector::new(self.machine.config().logs_dir(&self.test_name));
        let mut workflow = InstallerWorkflow::new(self.screens.as_ref(), handlers, &collector);
        let outcome = workflow.run(&self.machine).await;
        let cleanup = teardown(&mut self.machine, workflow.state(), &collector).await;

        // the workflow failure is the interesting one
        let error = outcome.err().or(cleanup.err()).map(|e| e.to_string());
        let duration_ms = start.elapsed().as_millis() as u64;

        match &error {
            None => info!("✓ {} ({} ms)", self.test_name, duration_ms),
            Some(e) => error!("✗ {} - {}", self.test_name, e),
        }

        Ok(self.result(started_at, start, workflow.records().to_vec(), error))
    }

    fn result(
        &self,
        started_at: DateTime<Utc>,
        start: Instant,
        stages: Vec<StageRecord>,
        error: Option<String>,
    ) -> TestResult {
        let config = self.machine.config();
        TestResult {
            name: self.test_name.clone(),
            success: error.is_none(),
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            image: config.image.clone(),
            firmware: config.firmware,
            label: self.machine.label().to_string(),
            stages,
            logs_dir: config.logs_dir(&self.test_name),
            error,
        }
    }

    /// Write the result as `test-results.json` in the output directory
    pub fn write_results(&self, result: &TestResult) -> E2eResult<PathBuf> {
        write_results(&self.output_dir, result)
    }
}

pub fn write_results(output_dir: &Path, result: &TestResult) -> E2eResult<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let path = output_dir.join("test-results.json");
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(&path, json)?;

    info!("Results written to: {}", path.display());
    Ok(path)
}
