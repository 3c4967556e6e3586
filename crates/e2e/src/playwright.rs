//! Playwright browser automation
//!
//! Each batch of [`UiStep`]s is rendered into one Node script and run with
//! `node`. The browser profile lives for as long as the handle, and each
//! script resumes at the page the previous one ended on, so consecutive
//! batches behave like one browser session.

use parking_lot::Mutex;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{E2eError, E2eResult};
use crate::spec::UiStep;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for Browser {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(E2eError::Config(format!("unknown browser '{}'", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    /// Installer web UI, e.g. `http://127.0.0.2:9091`
    pub base_url: String,
    pub screenshot_dir: PathBuf,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub browser: Browser,
    pub headless: bool,
    /// `node` executable
    pub node: String,
    /// Directory holding the `playwright` packages, exported as `NODE_PATH`
    pub node_modules: Option<PathBuf>,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.2:9091".to_string(),
            screenshot_dir: PathBuf::from("test-results/screenshots"),
            viewport_width: 1280,
            viewport_height: 720,
            browser: Browser::Chromium,
            headless: true,
            node: "node".to_string(),
            node_modules: None,
        }
    }
}

/// Last line a script prints, on stdout when it passes and stderr otherwise
#[derive(Debug, Deserialize)]
struct ScriptReport {
    success: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    step: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Playwright browser handle
pub struct PlaywrightHandle {
    config: PlaywrightConfig,
    profile_dir: TempDir,
    current_url: Mutex<Option<String>>,
}

impl PlaywrightHandle {
    pub fn new(config: PlaywrightConfig) -> E2eResult<Self> {
        std::fs::create_dir_all(&config.screenshot_dir)?;
        Ok(Self {
            config,
            profile_dir: tempfile::Builder::new().prefix("e2e-browser").tempdir()?,
            current_url: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PlaywrightConfig {
        &self.config
    }

    /// Page the last script ended on
    pub fn current_url(&self) -> Option<String> {
        self.current_url.lock().clone()
    }

    /// Fail early with [`E2eError::PlaywrightNotFound`] when the playwright
    /// package cannot be loaded. `@playwright/test` is only needed by
    /// batches with assertions and is not checked here.
    pub async fn ensure_installed(&self) -> E2eResult<()> {
        let status = self
            .node_command()
            .args(["-e", "require('playwright')"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    fn node_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.node);
        if let Some(modules) = &self.config.node_modules {
            cmd.env("NODE_PATH", modules);
        }
        cmd
    }

    /// Render `steps` into a standalone Playwright script
    pub fn build_script(&self, steps: &[UiStep]) -> String {
        let mut script = String::new();
        let import_expect = if steps.iter().any(|s| matches!(s, UiStep::Assert { .. })) {
            "const { expect } = require('@playwright/test');\n"
        } else {
            ""
        };

        script.push_str(&format!(
            r#"
const {{ chromium, firefox, webkit }} = require('playwright');
{import_expect}
(async () => {{
  const context = await {browser}.launchPersistentContext({profile}, {{
    headless: {headless},
    viewport: {{ width: {width}, height: {height} }}
  }});
  const page = context.pages()[0] || await context.newPage();
  const baseUrl = {base_url};
  let step = null;

  try {{
"#,
            import_expect = import_expect,
            browser = self.config.browser.as_str(),
            profile = js(&self.profile_dir.path().to_string_lossy()),
            headless = self.config.headless,
            width = self.config.viewport_width,
            height = self.config.viewport_height,
            base_url = js(&self.config.base_url),
        ));

        if let Some(url) = self.current_url() {
            script.push_str(&format!("    await page.goto({});\n", js(&url)));
        }

        for (i, step) in steps.iter().enumerate() {
            let name = step.name();
            script.push_str(&format!("\n    // Step {}: {}\n", i + 1, name));
            script.push_str(&format!("    step = {};\n", js(&name)));
            script.push_str(&self.step_to_js(step));
            script.push('\n');
        }

        script.push_str(
            r#"
    console.log(JSON.stringify({ success: true, url: page.url() }));
  } catch (error) {
    console.error(JSON.stringify({ success: false, step, error: error.message }));
    process.exitCode = 1;
  } finally {
    await context.close();
  }
})();
"#,
        );

        script
    }

    fn step_to_js(&self, step: &UiStep) -> String {
        match step {
            UiStep::Navigate {
                url,
                wait_for_selector,
            } => {
                let wait = wait_for_selector
                    .as_ref()
                    .map(|s| format!("\n    await page.waitForSelector({});", js(s)))
                    .unwrap_or_default();
                format!("    await page.goto(baseUrl + {});{}", js(url), wait)
            }
            UiStep::Click {
                selector,
                timeout_ms,
            } => format!(
                "    await page.click({}, {{ timeout: {} }});",
                js(selector),
                timeout_ms.unwrap_or(5000)
            ),
            UiStep::Fill { selector, value } => {
                format!("    await page.fill({}, {});", js(selector), js(value))
            }
            UiStep::Type {
                selector,
                text,
                delay_ms,
            } => format!(
                "    await page.type({}, {}, {{ delay: {} }});",
                js(selector),
                js(text),
                delay_ms.unwrap_or(50)
            ),
            UiStep::Press { selector, key } => match selector {
                Some(sel) => format!("    await page.locator({}).press({});", js(sel), js(key)),
                None => format!("    await page.keyboard.press({});", js(key)),
            },
            UiStep::Wait {
                selector,
                timeout_ms,
                state,
            } => format!(
                "    await page.waitForSelector({}, {{ state: '{}', timeout: {} }});",
                js(selector),
                state.as_str(),
                timeout_ms
            ),
            UiStep::Sleep { ms } => format!("    await page.waitForTimeout({});", ms),
            UiStep::Assert {
                selector,
                visible,
                text,
                text_contains,
            } => {
                let locator = format!("page.locator({})", js(selector));
                let mut assertions = Vec::new();
                match visible {
                    Some(true) => assertions.push(format!("    await expect({}).toBeVisible();", locator)),
                    Some(false) => assertions.push(format!("    await expect({}).toBeHidden();", locator)),
                    None => {}
                }
                if let Some(t) = text {
                    assertions.push(format!("    await expect({}).toHaveText({});", locator, js(t)));
                }
                if let Some(t) = text_contains {
                    assertions.push(format!("    await expect({}).toContainText({});", locator, js(t)));
                }
                assertions.join("\n")
            }
            UiStep::Screenshot { name } => {
                let path = self.config.screenshot_dir.join(format!("{}.png", name));
                format!(
                    "    await page.screenshot({{ path: {}, fullPage: true }});",
                    js(&path.to_string_lossy())
                )
            }
            UiStep::Select { selector, value } => {
                format!("    await page.selectOption({}, {});", js(selector), js(value))
            }
            UiStep::Check { selector } => format!("    await page.check({});", js(selector)),
            UiStep::Uncheck { selector } => format!("    await page.uncheck({});", js(selector)),
            UiStep::Log { message } => format!("    console.error('[TEST] ' + {});", js(message)),
        }
    }

    /// Run `steps` as one script.
    ///
    /// A failing step becomes [`E2eError::StepFailed`] naming the step.
    pub async fn run_steps(&self, steps: &[UiStep]) -> E2eResult<()> {
        if steps.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let script = self.build_script(steps);

        let temp_dir = tempfile::tempdir()?;
        let script_path = temp_dir.path().join("steps.js");
        tokio::fs::write(&script_path, &script).await?;
        debug!("Running Playwright script: {}", script_path.display());

        let output = self
            .node_command()
            .arg(&script_path)
            .current_dir(temp_dir.path())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| E2eError::Playwright(format!("failed to run {}: {}", self.config.node, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(match last_report(&stderr) {
                Some(ScriptReport {
                    step: Some(step),
                    error,
                    ..
                }) => E2eError::StepFailed {
                    stage: step,
                    reason: error.unwrap_or_else(|| "unknown error".to_string()),
                },
                _ => E2eError::Playwright(format!(
                    "Script failed:\nstdout: {}\nstderr: {}",
                    stdout, stderr
                )),
            });
        }

        if let Some(report) = last_report(&stdout).filter(|r| r.success) {
            *self.current_url.lock() = report.url;
        }
        info!(
            "Ran {} UI step(s) in {} ms",
            steps.len(),
            start.elapsed().as_millis()
        );
        Ok(())
    }
}

/// JavaScript string literal for `s`
fn js(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn last_report(output: &str) -> Option<ScriptReport> {
    output
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<ScriptReport>(line.trim()).ok())
}
