//! Fakes shared by the integration tests
//!
//! Every fake appends to one [`Events`] journal so tests can assert on the
//! relative order of host commands, guest calls and screen actions.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use installer_e2e::boot_image::{interactive_defaults, sha256_file, ImagePatcher, PatchedImage};
use installer_e2e::command::{BackgroundProcess, CommandOutput, CommandRunner, HostCommand};
use installer_e2e::config::{HarnessConfig, PortRanges, Timings, UserAccount};
use installer_e2e::guest::Guest;
use installer_e2e::machine::{MachineSession, REMOTE_UI_MARKER};
use installer_e2e::screens::InstallerScreens;
use installer_e2e::{E2eError, E2eResult, UiStep, VirtInstallMachine};

pub const PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIE2e test@installer-e2e";

/// Ordered record of everything the fakes saw
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.matching(prefix).len()
    }

    /// Index of the first event starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e.starts_with(prefix))
    }
}

fn failed(cmd: &str, stderr: &str) -> E2eError {
    E2eError::CommandFailed {
        command: cmd.to_string(),
        status: "exit status: 1".to_string(),
        stderr: stderr.to_string(),
    }
}

/// Scripted answer of [`FakeRunner`]
#[derive(Clone, Debug)]
pub enum Reply {
    Stdout(String),
    Fail(String),
}

/// Records host commands. Commands containing a scripted needle get the next
/// scripted reply (the last one repeats); everything else succeeds silently.
#[derive(Default)]
pub struct FakeRunner {
    events: Events,
    replies: Mutex<Vec<(String, VecDeque<Reply>)>>,
    commands: Mutex<Vec<HostCommand>>,
    spawned: Mutex<Vec<HostCommand>>,
}

impl FakeRunner {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn reply(&self, needle: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .push((needle.to_string(), replies.into_iter().collect()));
    }

    pub fn commands(&self) -> Vec<HostCommand> {
        self.commands.lock().clone()
    }

    pub fn spawned(&self) -> Vec<HostCommand> {
        self.spawned.lock().clone()
    }

    pub fn commands_with(&self, needle: &str) -> Vec<HostCommand> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.program == needle || c.has_arg(needle))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cmd: &HostCommand) -> E2eResult<CommandOutput> {
        let line = cmd.to_string();
        self.events.push(format!("run:{}", line));
        self.commands.lock().push(cmd.clone());

        let mut replies = self.replies.lock();
        let scripted = replies
            .iter_mut()
            .find(|(needle, _)| cmd.program == *needle || cmd.has_arg(needle));
        let reply = match scripted {
            Some((_, queue)) if queue.len() > 1 => queue.pop_front(),
            Some((_, queue)) => queue.front().cloned(),
            None => None,
        };

        match reply {
            Some(Reply::Stdout(out)) => Ok(CommandOutput::stdout(out)),
            Some(Reply::Fail(stderr)) => Err(failed(&line, &stderr)),
            None => Ok(CommandOutput::default()),
        }
    }

    fn spawn(&self, cmd: &HostCommand) -> E2eResult<BackgroundProcess> {
        self.events.push(format!("spawn:{}", cmd));
        self.spawned.lock().push(cmd.clone());
        Ok(BackgroundProcess::detached(cmd.program.clone()))
    }
}

/// In-memory guest
pub struct FakeGuest {
    events: Events,
    /// `wait_boot` fails when set
    pub boot_fails: Mutex<bool>,
    /// Readiness probes answered negatively before the marker shows up
    pub ui_ready_after: Mutex<usize>,
    ui_polls: Mutex<usize>,
    /// Downloads whose source contains one of these fail
    pub failing_downloads: Mutex<Vec<String>>,
    /// Commands containing one of these fail
    pub failing_commands: Mutex<Vec<String>>,
}

impl FakeGuest {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            boot_fails: Mutex::new(false),
            ui_ready_after: Mutex::new(0),
            ui_polls: Mutex::new(0),
            failing_downloads: Mutex::new(vec!["anaconda-tb-".to_string()]),
            failing_commands: Mutex::new(Vec::new()),
        }
    }

    pub fn ui_never_ready(&self) {
        *self.ui_ready_after.lock() = usize::MAX;
    }

    pub fn fail_download(&self, needle: &str) {
        self.failing_downloads.lock().push(needle.to_string());
    }

    pub fn allow_crash_dumps(&self) {
        self.failing_downloads.lock().retain(|n| n != "anaconda-tb-");
    }

    pub fn fail_command(&self, needle: &str) {
        self.failing_commands.lock().push(needle.to_string());
    }

    pub fn ui_polls(&self) -> usize {
        *self.ui_polls.lock()
    }
}

#[async_trait]
impl Guest for FakeGuest {
    async fn wait_boot(&self, _timeout: Duration) -> E2eResult<()> {
        self.events.push("guest:wait_boot");
        if *self.boot_fails.lock() {
            return Err(E2eError::Timeout("guest did not boot".to_string()));
        }
        Ok(())
    }

    async fn execute(&self, command: &str) -> E2eResult<String> {
        self.events.push(format!("guest:execute:{}", command));
        if self
            .failing_commands
            .lock()
            .iter()
            .any(|n| command.contains(n.as_str()))
        {
            return Err(failed(command, "command failed in guest"));
        }
        if command.contains("journalctl") {
            let mut polls = self.ui_polls.lock();
            *polls += 1;
            if *polls <= *self.ui_ready_after.lock() {
                return Err(failed(command, ""));
            }
            return Ok(format!("anaconda[1234]: {}\n", REMOTE_UI_MARKER));
        }
        Ok(String::new())
    }

    async fn download(&self, source: &str, dest_name: &str, dest_dir: &Path) -> E2eResult<()> {
        if self
            .failing_downloads
            .lock()
            .iter()
            .any(|n| source.contains(n.as_str()))
        {
            self.events.push(format!("guest:download-failed:{}", source));
            return Err(failed(source, "No such file or directory"));
        }
        self.events.push(format!("guest:download:{}", source));
        if dest_name != "." {
            std::fs::write(dest_dir.join(dest_name), format!("contents of {}\n", source))?;
        }
        Ok(())
    }

    async fn wait_reboot(&self, _timeout: Duration) -> E2eResult<()> {
        self.events.push("guest:wait_reboot");
        Ok(())
    }

    async fn disconnect(&self) {
        self.events.push("guest:disconnect");
    }
}

/// Writes the directive file instead of a real archive
pub struct FakePatcher {
    events: Events,
    pub fails: Mutex<bool>,
    calls: Mutex<Vec<(PathBuf, PathBuf, String)>>,
}

impl FakePatcher {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            fails: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, PathBuf, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ImagePatcher for FakePatcher {
    async fn patch(&self, source: &Path, dest: &Path, payload_url: &str) -> E2eResult<PatchedImage> {
        self.events.push(format!("patch:{}", payload_url));
        self.calls
            .lock()
            .push((source.to_path_buf(), dest.to_path_buf(), payload_url.to_string()));
        if *self.fails.lock() {
            return Err(E2eError::Patch("cpio exploded".to_string()));
        }
        std::fs::write(dest, interactive_defaults(payload_url))?;
        Ok(PatchedImage {
            path: dest.to_path_buf(),
            payload_url: payload_url.to_string(),
            digest: sha256_file(dest).await?,
        })
    }
}

/// Records screen actions; optionally fails one of them
pub struct RecordingScreens {
    events: Events,
    fail_on: Mutex<Option<String>>,
    steps: Mutex<Vec<UiStep>>,
}

impl RecordingScreens {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            fail_on: Mutex::new(None),
            steps: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_on(&self, action: &str) {
        *self.fail_on.lock() = Some(action.to_string());
    }

    pub fn steps(&self) -> Vec<UiStep> {
        self.steps.lock().clone()
    }

    fn act(&self, action: &str) -> E2eResult<()> {
        self.events.push(format!("screen:{}", action));
        if self.fail_on.lock().as_deref() == Some(action) {
            return Err(E2eError::StepFailed {
                stage: action.to_string(),
                reason: "element not found".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InstallerScreens for RecordingScreens {
    async fn open(&self) -> E2eResult<()> {
        self.act("open")
    }

    async fn next(&self) -> E2eResult<()> {
        self.act("next")
    }

    async fn begin_installation(&self) -> E2eResult<()> {
        self.act("begin_installation")
    }

    async fn wait_done(&self) -> E2eResult<()> {
        self.act("wait_done")
    }

    async fn reboot(&self) -> E2eResult<()> {
        self.act("reboot")
    }

    async fn create_user(&self, user: &UserAccount) -> E2eResult<()> {
        self.act(&format!("create_user:{}", user.username))
    }

    async fn run_steps(&self, steps: &[UiStep]) -> E2eResult<()> {
        self.steps.lock().extend(steps.iter().cloned());
        self.act("run_steps")
    }

    async fn check_browser(&self) -> E2eResult<()> {
        self.act("check_browser")
    }
}

/// A scratch checkout with payload, boot image and SSH key in place
pub struct Fixture {
    pub root: TempDir,
    pub config: HarnessConfig,
    pub events: Events,
    pub runner: Arc<FakeRunner>,
    pub guest: Arc<FakeGuest>,
    pub patcher: Arc<FakePatcher>,
}

impl Fixture {
    /// Non-live fixture; `http_start` keeps parallel tests off each other's ports
    pub fn new(http_start: u16) -> Self {
        Self::with_image("fedora-rawhide-boot", http_start)
    }

    pub fn live(http_start: u16) -> Self {
        Self::with_image("fedora-rawhide-live-boot", http_start)
    }

    fn with_image(image: &str, http_start: u16) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let config = HarnessConfig {
            root_dir: root.path().to_path_buf(),
            image: image.to_string(),
            serve_bind: "127.0.0.1".to_string(),
            logs_root: root.path().join("test_logs"),
            ports: PortRanges {
                http_start,
                ..Default::default()
            },
            timings: fast_timings(),
            ..Default::default()
        };

        let images = config.bots_dir().join("images");
        std::fs::create_dir_all(&images).expect("images dir");
        std::fs::write(config.payload_path(), b"payload tarball").expect("payload");
        std::fs::write(config.global_updates_image(), b"global updates image").expect("updates.img");
        std::fs::write(config.iso_path(), b"iso").expect("iso");

        let machine_dir = config.bots_dir().join("machine");
        std::fs::create_dir_all(&machine_dir).expect("machine dir");
        std::fs::write(config.identity_file(), b"private").expect("identity");
        std::fs::write(config.public_key_path(), format!("{}\n", PUBLIC_KEY)).expect("public key");

        let events = Events::default();
        Self {
            root,
            config,
            runner: Arc::new(FakeRunner::new(events.clone())),
            guest: Arc::new(FakeGuest::new(events.clone())),
            patcher: Arc::new(FakePatcher::new(events.clone())),
            events,
        }
    }

    pub fn machine(&self) -> VirtInstallMachine {
        let session = MachineSession::allocate(&self.config).expect("session");
        VirtInstallMachine::new(
            self.config.clone(),
            self.runner.clone(),
            self.patcher.clone(),
            self.guest.clone(),
            session,
        )
    }

    pub fn root_path(&self) -> &Path {
        self.root.path()
    }
}

pub fn fast_timings() -> Timings {
    Timings {
        http_ready_timeout_ms: 5_000,
        http_poll_interval_ms: 20,
        boot_timeout_ms: 100,
        webui_attempts: 3,
        webui_interval_ms: 1,
        poweroff_attempts: 10,
        poweroff_interval_ms: 1,
        reboot_timeout_ms: 100,
        install_timeout_ms: 1_000,
    }
}
