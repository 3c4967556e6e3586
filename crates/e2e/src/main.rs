//! Installer end-to-end test entry point
//!
//! Boots the installer VM, walks the wizard and checks the installed system.
//! Exit codes: 0 passed, 1 test failed, 2 harness error.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use installer_e2e::config::{ENV_COMPOSE, ENV_FIRMWARE, ENV_OS};
use installer_e2e::playwright::{Browser, PlaywrightConfig};
use installer_e2e::{
    DefaultStages, E2eResult, HarnessConfig, Scenario, ScriptedStages, StageHandlers, TestRunner,
};

#[derive(Parser, Debug)]
#[command(name = "installer-e2e")]
#[command(about = "End-to-end installation test runner")]
struct Args {
    /// Harness configuration (YAML); defaults apply when absent
    #[arg(short, long, default_value = "e2e.yaml")]
    config: PathBuf,

    /// Scenario with per-screen steps (YAML)
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Test name when no scenario is given; names the log directory
    #[arg(short, long, default_value = "End2EndTest")]
    name: String,

    /// Firmware: bios or efi
    #[arg(long, env = ENV_FIRMWARE)]
    firmware: Option<String>,

    /// Installer image identifier
    #[arg(long, env = ENV_OS)]
    os: Option<String>,

    /// Custom compose ISO name under test/images
    #[arg(long, env = ENV_COMPOSE)]
    compose: Option<String>,

    /// Checkout root holding the boot images
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long, default_value = "test-results")]
    output: PathBuf,

    /// Browser to use (chromium, firefox, webkit)
    #[arg(long, default_value = "chromium")]
    browser: String,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Directory with the playwright node packages
    #[arg(long, env = "NODE_PATH")]
    node_modules: Option<PathBuf>,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            std::process::exit(2);
        }
    };

    match rt.block_on(async_main(args)) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }
}

async fn async_main(args: Args) -> E2eResult<bool> {
    let mut config = HarnessConfig::load(&args.config)?;
    // clap already folded the environment into these
    config.apply_env(|key| match key {
        ENV_FIRMWARE => args.firmware.clone(),
        ENV_OS => args.os.clone(),
        ENV_COMPOSE => args.compose.clone(),
        _ => None,
    })?;
    if let Some(root) = &args.root_dir {
        config.root_dir = root.clone();
    }

    let scenario = match &args.scenario {
        Some(path) => Some(Scenario::from_file(path)?),
        None => None,
    };
    let test_name = scenario
        .as_ref()
        .map(|s| s.name.clone())
        .unwrap_or_else(|| args.name.clone());

    let playwright = PlaywrightConfig {
        screenshot_dir: args.output.join("screenshots"),
        browser: args.browser.parse::<Browser>()?,
        headless: !args.headed,
        node_modules: args.node_modules.clone(),
        ..Default::default()
    };

    let mut runner = TestRunner::with_host_tools(&test_name, config, playwright, &args.output)?;

    let handlers: Box<dyn StageHandlers> = match scenario {
        Some(scenario) => Box::new(ScriptedStages::new(scenario)),
        None => Box::new(DefaultStages),
    };

    let result = runner.run(handlers.as_ref()).await?;
    runner.write_results(&result)?;

    Ok(result.success)
}
