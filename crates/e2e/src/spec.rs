//! Declarative YAML scenarios for the wizard hooks
//!
//! A scenario names a test and lists UI steps per workflow hook, e.g.
//!
//! ```yaml
//! name: TestStorageEncrypted
//! hooks:
//!   configure_storage_encryption:
//!     - action: check
//!       selector: '#disk-encryption-encrypt-devices'
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{E2eError, E2eResult};

/// Hooks a scenario may fill, in workflow order
pub const HOOK_NAMES: &[&str] = &[
    "configure_language",
    "configure_storage_disks",
    "configure_storage_encryption",
    "check_users_screen",
    "check_review_screen",
    "monitor_progress",
    "post_install_step",
    "check_installed_system",
];

/// A test scenario parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Test name; also names the log directory
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// UI steps keyed by hook name
    #[serde(default)]
    pub hooks: BTreeMap<String, Vec<UiStep>>,

    /// Guest commands run against the installed system
    #[serde(default)]
    pub installed_checks: Vec<String>,
}

/// A single browser action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UiStep {
    /// Navigate to a URL relative to the installer base URL
    Navigate {
        url: String,
        #[serde(default)]
        wait_for_selector: Option<String>,
    },

    Click {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Fill {
        selector: String,
        value: String,
    },

    /// Type with keyboard simulation
    Type {
        selector: String,
        text: String,
        #[serde(default)]
        delay_ms: Option<u64>,
    },

    Press {
        #[serde(default)]
        selector: Option<String>,
        key: String,
    },

    Wait {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
        #[serde(default)]
        state: WaitState,
    },

    /// Fixed delay (use sparingly)
    Sleep {
        ms: u64,
    },

    Assert {
        selector: String,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        text_contains: Option<String>,
    },

    Screenshot {
        name: String,
    },

    Select {
        selector: String,
        value: String,
    },

    Check {
        selector: String,
    },

    Uncheck {
        selector: String,
    },

    Log {
        message: String,
    },
}

fn default_wait_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

impl UiStep {
    /// Short label used in logs and script comments
    pub fn name(&self) -> String {
        match self {
            UiStep::Navigate { url, .. } => format!("navigate:{}", url),
            UiStep::Click { selector, .. } => format!("click:{}", selector),
            UiStep::Fill { selector, .. } => format!("fill:{}", selector),
            UiStep::Type { selector, .. } => format!("type:{}", selector),
            UiStep::Press { key, .. } => format!("press:{}", key),
            UiStep::Wait { selector, .. } => format!("wait:{}", selector),
            UiStep::Sleep { ms } => format!("sleep:{}ms", ms),
            UiStep::Assert { selector, .. } => format!("assert:{}", selector),
            UiStep::Screenshot { name } => format!("screenshot:{}", name),
            UiStep::Select { selector, .. } => format!("select:{}", selector),
            UiStep::Check { selector } => format!("check:{}", selector),
            UiStep::Uncheck { selector } => format!("uncheck:{}", selector),
            UiStep::Log { message } => {
                let cut = message
                    .char_indices()
                    .nth(30)
                    .map(|(i, _)| i)
                    .unwrap_or(message.len());
                format!("log:{}", &message[..cut])
            }
        }
    }
}

impl Scenario {
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let scenario: Self = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Steps for `hook`, empty when the scenario leaves it alone
    pub fn steps(&self, hook: &str) -> &[UiStep] {
        self.hooks.get(hook).map(Vec::as_slice).unwrap_or(&[])
    }

    fn validate(&self) -> E2eResult<()> {
        if self.name.trim().is_empty() {
            return Err(E2eError::SpecParse("scenario name is empty".to_string()));
        }
        // The name becomes a directory under the logs root
        if self.name.contains('/') || self.name == "." || self.name == ".." {
            return Err(E2eError::SpecParse(format!(
                "scenario name '{}' is not a valid directory name",
                self.name
            )));
        }
        if let Some(unknown) = self.hooks.keys().find(|k| !HOOK_NAMES.contains(&k.as_str())) {
            return Err(E2eError::SpecParse(format!(
                "unknown hook '{}' (expected one of: {})",
                unknown,
                HOOK_NAMES.join(", ")
            )));
        }
        Ok(())
    }
}
