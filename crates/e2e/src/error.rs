//! Error types for installer E2E runs

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Missing file {}{}", .path.display(), .hint)]
    MissingFile { path: PathBuf, hint: String },

    #[error("{0}")]
    Timeout(String),

    #[error("No free port in {start}..{start}+{attempts}")]
    PortsExhausted { start: u16, attempts: u16 },

    #[error("File server failed to start: {0}")]
    ServerStartup(String),

    #[error("Command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Guest commands are unavailable on live image {0}")]
    GuestUnavailable(String),

    #[error("Boot image patching failed: {0}")]
    Patch(String),

    #[error("Invalid stage transition: {from} -> {to}")]
    InvalidStageTransition { from: String, to: String },

    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Scenario parse error: {0}")]
    SpecParse(String),

    #[error("Stage failed: {stage} - {reason}")]
    StepFailed { stage: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl E2eError {
    pub fn missing_file(path: impl Into<PathBuf>, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        E2eError::MissingFile {
            path: path.into(),
            hint: if hint.is_empty() {
                hint
            } else {
                format!("; {}", hint)
            },
        }
    }

    /// True for the bounded-poll failures (HTTP readiness, boot, UI, power-off).
    pub fn is_timeout(&self) -> bool {
        matches!(self, E2eError::Timeout(_))
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
