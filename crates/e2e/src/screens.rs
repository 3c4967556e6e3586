//! Installer wizard screen objects

use async_trait::async_trait;

use crate::config::{Timings, UserAccount};
use crate::error::E2eResult;
use crate::playwright::PlaywrightHandle;
use crate::spec::{UiStep, WaitState};

/// Installer entry page, relative to the web UI base URL
pub const INSTALLER_PATH: &str = "/cockpit/@localhost/anaconda-webui/index.html";

const APP: &str = "#app";
const NEXT_BUTTON: &str = "#installation-next-btn";
const PROGRESS: &str = "#installation-progress";
const PROGRESS_DONE: &str = "#installation-progress-step-success";
const REBOOT_BUTTON: &str = "#installation-progress-reboot-btn";
const FULL_NAME: &str = "#accounts-create-account-full-name";
const USER_NAME: &str = "#accounts-create-account-user-name";
const PASSWORD: &str = "#accounts-create-account-password-field";
const PASSWORD_CONFIRM: &str = "#accounts-create-account-password-confirm-field";

/// Screen-level actions the workflow drives
#[async_trait]
pub trait InstallerScreens: Send + Sync {
    /// Load the installer and wait for the first screen
    async fn open(&self) -> E2eResult<()>;

    /// Advance to the next wizard screen
    async fn next(&self) -> E2eResult<()>;

    /// Confirm the review screen and start installing
    async fn begin_installation(&self) -> E2eResult<()>;

    /// Wait for the progress screen to report success
    async fn wait_done(&self) -> E2eResult<()>;

    /// Press the reboot button on the finished progress screen
    async fn reboot(&self) -> E2eResult<()>;

    async fn create_user(&self, user: &UserAccount) -> E2eResult<()>;

    /// Run arbitrary scripted steps on the current screen
    async fn run_steps(&self, steps: &[UiStep]) -> E2eResult<()>;

    /// Check the browser tooling before a VM is booted for it
    async fn check_browser(&self) -> E2eResult<()>;
}

/// [`InstallerScreens`] over a Playwright browser
pub struct WizardScreens {
    browser: PlaywrightHandle,
    install_timeout_ms: u64,
}

impl WizardScreens {
    pub fn new(browser: PlaywrightHandle) -> Self {
        Self {
            browser,
            install_timeout_ms: Timings::default().install_timeout_ms,
        }
    }

    pub fn with_install_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.install_timeout_ms = timeout_ms;
        self
    }

    pub fn browser(&self) -> &PlaywrightHandle {
        &self.browser
    }

    fn open_steps() -> Vec<UiStep> {
        vec![UiStep::Navigate {
            url: INSTALLER_PATH.to_string(),
            wait_for_selector: Some(APP.to_string()),
        }]
    }

    fn next_steps() -> Vec<UiStep> {
        vec![UiStep::Click {
            selector: NEXT_BUTTON.to_string(),
            timeout_ms: None,
        }]
    }

    fn begin_installation_steps() -> Vec<UiStep> {
        vec![
            UiStep::Click {
                selector: NEXT_BUTTON.to_string(),
                timeout_ms: None,
            },
            UiStep::Wait {
                selector: PROGRESS.to_string(),
                timeout_ms: 30_000,
                state: WaitState::Visible,
            },
        ]
    }

    fn wait_done_steps(&self) -> Vec<UiStep> {
        vec![UiStep::Wait {
            selector: PROGRESS_DONE.to_string(),
            timeout_ms: self.install_timeout_ms,
            state: WaitState::Visible,
        }]
    }

    fn reboot_steps() -> Vec<UiStep> {
        vec![UiStep::Click {
            selector: REBOOT_BUTTON.to_string(),
            timeout_ms: None,
        }]
    }

    fn create_user_steps(user: &UserAccount) -> Vec<UiStep> {
        [
            (FULL_NAME, &user.full_name),
            (USER_NAME, &user.username),
            (PASSWORD, &user.password),
            (PASSWORD_CONFIRM, &user.password),
        ]
        .into_iter()
        .map(|(selector, value)| UiStep::Fill {
            selector: selector.to_string(),
            value: value.clone(),
        })
        .collect()
    }
}

#[async_trait]
impl InstallerScreens for WizardScreens {
    async fn open(&self) -> E2eResult<()> {
        self.browser.run_steps(&Self::open_steps()).await
    }

    async fn next(&self) -> E2eResult<()> {
        self.browser.run_steps(&Self::next_steps()).await
    }

    async fn begin_installation(&self) -> E2eResult<()> {
        self.browser.run_steps(&Self::begin_installation_steps()).await
    }

    async fn wait_done(&self) -> E2eResult<()> {
        self.browser.run_steps(&self.wait_done_steps()).await
    }

    async fn reboot(&self) -> E2eResult<()> {
        self.browser.run_steps(&Self::reboot_steps()).await
    }

    async fn create_user(&self, user: &UserAccount) -> E2eResult<()> {
        self.browser.run_steps(&Self::create_user_steps(user)).await
    }

    async fn run_steps(&self, steps: &[UiStep]) -> E2eResult<()> {
        self.browser.run_steps(steps).await
    }

    async fn check_browser(&self) -> E2eResult<()> {
        self.browser.ensure_installed().await
    }
}
