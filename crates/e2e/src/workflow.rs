//! Installer workflow orchestration
//!
//! Drives the wizard through a fixed sequence of stages. Tests customise
//! individual screens through [`StageHandlers`]; the order itself never
//! changes and no stage is retried.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tracing::{error, info};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::machine::VirtInstallMachine;
use crate::screens::InstallerScreens;
use crate::spec::Scenario;
use crate::teardown::LogCollector;

/// Position in the wizard, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    Open,
    Language,
    StorageDisks,
    StorageEncryption,
    Users,
    Review,
    BeginInstallation,
    Progress,
    PostInstall,
    RebootToInstalled,
    InstalledSystem,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::NotStarted => "not started",
            Stage::Open => "open installer",
            Stage::Language => "language",
            Stage::StorageDisks => "storage disks",
            Stage::StorageEncryption => "storage encryption",
            Stage::Users => "users",
            Stage::Review => "review",
            Stage::BeginInstallation => "begin installation",
            Stage::Progress => "installation progress",
            Stage::PostInstall => "post install",
            Stage::RebootToInstalled => "reboot to installed system",
            Stage::InstalledSystem => "installed system checks",
        };
        f.write_str(name)
    }
}

/// Where the workflow is, and whether logs were already collected inline
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    stage: Stage,
    installation_finished: bool,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowState {
    pub fn new() -> Self {
        Self {
            stage: Stage::NotStarted,
            installation_finished: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Set once the reboot stage has downloaded the installer logs
    pub fn installation_finished(&self) -> bool {
        self.installation_finished
    }

    /// Move forward to `next`. Going back or repeating a stage is an error.
    pub fn advance(&mut self, next: Stage) -> E2eResult<()> {
        if next <= self.stage {
            return Err(E2eError::InvalidStageTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        self.stage = next;
        Ok(())
    }

    pub(crate) fn mark_finished(&mut self) {
        self.installation_finished = true;
    }
}

/// What a stage hook gets to work with
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub screens: &'a dyn InstallerScreens,
    pub machine: &'a VirtInstallMachine,
    pub config: &'a HarnessConfig,
}

/// Per-test customisation of the wizard screens.
///
/// Every hook has a default; most are no-ops.
#[async_trait]
pub trait StageHandlers: Send + Sync {
    async fn configure_language(&self, _ctx: &StageContext<'_>) -> E2eResult<()> {
        Ok(())
    }

    async fn configure_storage_disks(&self, _ctx: &StageContext<'_>) -> E2eResult<()> {
        Ok(())
    }

    async fn configure_storage_encryption(&self, _ctx: &StageContext<'_>) -> E2eResult<()> {
        Ok(())
    }

    /// Creates the configured user account
    async fn check_users_screen(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        ctx.screens.create_user(&ctx.config.user).await
    }

    async fn check_review_screen(&self, _ctx: &StageContext<'_>) -> E2eResult<()> {
        Ok(())
    }

    /// Waits for the installation to complete
    async fn monitor_progress(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        ctx.screens.wait_done().await
    }

    async fn post_install_step(&self, _ctx: &StageContext<'_>) -> E2eResult<()> {
        Ok(())
    }

    /// Sets the root password; the installed root account starts locked
    async fn check_installed_system(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        ctx.machine.set_root_password(&ctx.config.root_password).await
    }
}

/// The stock behaviour for every hook
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStages;

impl StageHandlers for DefaultStages {}

/// Hooks filled from a YAML [`Scenario`].
///
/// A hook with scripted steps runs those instead of its default.
/// `installed_checks` run after the default installed-system check.
#[derive(Debug, Clone)]
pub struct ScriptedStages {
    scenario: Scenario,
}

impl ScriptedStages {
    pub fn new(scenario: Scenario) -> Self {
        Self { scenario }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Run the steps for `hook`. Returns false if there are none.
    async fn run_hook(&self, hook: &str, ctx: &StageContext<'_>) -> E2eResult<bool> {
        let steps = self.scenario.steps(hook);
        if steps.is_empty() {
            return Ok(false);
        }
        info!("{}: running {} scripted step(s)", hook, steps.len());
        ctx.screens.run_steps(steps).await?;
        Ok(true)
    }
}

#[async_trait]
impl StageHandlers for ScriptedStages {
    async fn configure_language(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        self.run_hook("configure_language", ctx).await.map(drop)
    }

    async fn configure_storage_disks(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        self.run_hook("configure_storage_disks", ctx).await.map(drop)
    }

    async fn configure_storage_encryption(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        self.run_hook("configure_storage_encryption", ctx)
            .await
            .map(drop)
    }

    async fn check_users_screen(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        if !self.run_hook("check_users_screen", ctx).await? {
            ctx.screens.create_user(&ctx.config.user).await?;
        }
        Ok(())
    }

    async fn check_review_screen(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        self.run_hook("check_review_screen", ctx).await.map(drop)
    }

    async fn monitor_progress(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        if !self.run_hook("monitor_progress", ctx).await? {
            ctx.screens.wait_done().await?;
        }
        Ok(())
    }

    async fn post_install_step(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        self.run_hook("post_install_step", ctx).await.map(drop)
    }

    async fn check_installed_system(&self, ctx: &StageContext<'_>) -> E2eResult<()> {
        if !self.run_hook("check_installed_system", ctx).await? {
            ctx.machine
                .set_root_password(&ctx.config.root_password)
                .await?;
        }
        for check in &self.scenario.installed_checks {
            info!("Installed system check: {}", check);
            ctx.machine.execute(check).await?;
        }
        Ok(())
    }
}

/// Timing of one executed stage
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Runs the stage sequence against a started machine
pub struct InstallerWorkflow<'a> {
    screens: &'a dyn InstallerScreens,
    handlers: &'a dyn StageHandlers,
    collector: &'a LogCollector,
    state: WorkflowState,
    records: Vec<StageRecord>,
}

impl<'a> InstallerWorkflow<'a> {
    pub fn new(
        screens: &'a dyn InstallerScreens,
        handlers: &'a dyn StageHandlers,
        collector: &'a LogCollector,
    ) -> Self {
        Self {
            screens,
            handlers,
            collector,
            state: WorkflowState::new(),
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// Run every stage in order, stopping at the first failure
    pub async fn run(&mut self, machine: &VirtInstallMachine) -> E2eResult<()> {
        let screens = self.screens;
        let handlers = self.handlers;
        let collector = self.collector;
        let ctx = StageContext {
            screens,
            machine,
            config: machine.config(),
        };

        self.run_stage(Stage::Open, screens.open()).await?;
        self.run_stage(Stage::Language, async {
            handlers.configure_language(&ctx).await?;
            screens.next().await
        })
        .await?;
        self.run_stage(Stage::StorageDisks, async {
            handlers.configure_storage_disks(&ctx).await?;
            screens.next().await
        })
        .await?;
        self.run_stage(Stage::StorageEncryption, async {
            handlers.configure_storage_encryption(&ctx).await?;
            screens.next().await
        })
        .await?;
        self.run_stage(Stage::Users, async {
            handlers.check_users_screen(&ctx).await?;
            screens.next().await
        })
        .await?;
        self.run_stage(Stage::Review, handlers.check_review_screen(&ctx))
            .await?;
        self.run_stage(Stage::BeginInstallation, screens.begin_installation())
            .await?;
        self.run_stage(Stage::Progress, handlers.monitor_progress(&ctx))
            .await?;
        self.run_stage(Stage::PostInstall, handlers.post_install_step(&ctx))
            .await?;

        let start = self.begin(Stage::RebootToInstalled)?;
        let result = async {
            machine.add_public_key().await?;
            collector.collect(machine).await?;
            self.state.mark_finished();
            screens.reboot().await?;
            machine.wait_reboot().await
        }
        .await;
        self.finish(Stage::RebootToInstalled, start, result)?;

        self.run_stage(Stage::InstalledSystem, handlers.check_installed_system(&ctx))
            .await?;
        Ok(())
    }

    async fn run_stage<F>(&mut self, stage: Stage, work: F) -> E2eResult<()>
    where
        F: Future<Output = E2eResult<()>>,
    {
        let start = self.begin(stage)?;
        let result = work.await;
        self.finish(stage, start, result)
    }

    fn begin(&mut self, stage: Stage) -> E2eResult<Instant> {
        self.state.advance(stage)?;
        info!("Stage: {}", stage);
        Ok(Instant::now())
    }

    fn finish(&mut self, stage: Stage, start: Instant, result: E2eResult<()>) -> E2eResult<()> {
        let duration_ms = start.elapsed().as_millis() as u64;
        if let Err(e) = &result {
            error!("Stage '{}' failed after {} ms: {}", stage, duration_ms, e);
        }
        self.records.push(StageRecord {
            stage,
            duration_ms,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }
}
