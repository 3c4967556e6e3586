//! VM process controller
//!
//! Boots the installer image with `virt-install`, serving the boot image and
//! payload over ephemeral HTTP servers, and waits until the installer's
//! remote web UI is up. Every failure on the start path destroys the domain
//! before the error is returned.
//!
//! ```text
//! NotStarted ──start()──> Booting ──> Ready ──wait_poweroff()──> PoweredOff
//!                            │          │
//!                            └──────────┴──> Failed        kill() ──> Destroyed
//! ```

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::boot_image::{ImagePatcher, PatchedImage};
use crate::command::{BackgroundProcess, CommandRunner, HostCommand};
use crate::config::{Firmware, HarnessConfig};
use crate::error::{E2eError, E2eResult};
use crate::guest::Guest;
use crate::port::find_free_port;
use crate::server::FileServer;

/// Journal line logged once the installer web UI is reachable
pub const REMOTE_UI_MARKER: &str = "anaconda: ui.webui: cockpit web view has been started";

/// Expose the UI files under /usr/local so they can be synced without
/// restarting the bridge.
const BIND_MOUNT_UI: &str = "mkdir -p /usr/local/share/cockpit/anaconda-webui && mount --bind /usr/share/cockpit /usr/local/share/cockpit";

const LIVE_KERNEL: &str = "images/pxeboot/vmlinuz";
const LIVE_INITRD: &str = "images/pxeboot/initrd.img";
const GUEST_SSH_PORT: u16 = 22;
const GUEST_WEB_PORT: u16 = 80;

/// Lifecycle of the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachineState {
    NotStarted,
    Booting,
    Ready,
    PoweredOff,
    Destroyed,
    Failed,
}

/// The one VM of a test run, with everything spawned on its behalf
pub struct MachineSession {
    pub label: String,
    pub ssh_address: String,
    pub ssh_port: u16,
    pub web_address: String,
    pub web_port: u16,
    pub firmware: Firmware,
    pub image: String,
    pub live: bool,
    servers: Vec<FileServer>,
    // locked only so the session stays Sync
    installer: Mutex<Option<BackgroundProcess>>,
}

impl MachineSession {
    /// New session with a unique label and free forwarded ports
    pub fn allocate(config: &HarnessConfig) -> E2eResult<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let label = format!("{}-{}", config.label_prefix, &id[..8]);
        // hostfwd binds these on the forward addresses, so probe there
        let ssh_host = forward_address(&config.ssh_address)?;
        let web_host = forward_address(&config.web_address)?;
        let attempts = config.ports.max_attempts;

        let ssh_port = find_free_port(ssh_host, config.ports.ssh_start, attempts)?;
        let mut web_port = find_free_port(web_host, config.ports.web_start, attempts)?;
        if web_port == ssh_port {
            web_port = find_free_port(web_host, ssh_port.saturating_add(1), attempts)?;
        }

        Ok(Self {
            label,
            ssh_address: config.ssh_address.clone(),
            ssh_port,
            web_address: config.web_address.clone(),
            web_port,
            firmware: config.firmware,
            image: config.image.clone(),
            live: config.is_live(),
            servers: Vec::new(),
            installer: Mutex::new(None),
        })
    }

    /// File servers currently owned by the session
    pub fn servers(&self) -> &[FileServer] {
        &self.servers
    }

    /// True while the `virt-install` process handle is held
    pub fn has_installer_process(&self) -> bool {
        self.installer.lock().is_some()
    }

    /// Base URL of the forwarded installer web UI
    pub fn web_url(&self) -> String {
        format!("http://{}:{}", self.web_address, self.web_port)
    }
}

/// Payload served to the guest (pipeline stage 1)
#[derive(Debug, Clone)]
pub struct ServedPayload {
    pub url: String,
}

/// The `virt-install` invocation for a session (pipeline stage 3)
#[derive(Debug, Clone)]
pub struct BootPlan {
    pub command: HostCommand,
}

impl BootPlan {
    /// `volume_id` is set for live images, which boot kernel and initrd
    /// straight from the ISO.
    pub fn new(
        config: &HarnessConfig,
        session: &MachineSession,
        updates_url: &str,
        volume_id: Option<&str>,
    ) -> Self {
        let iso_path = config.iso_path();
        let iso = iso_path.display().to_string();

        let mut cmd = HostCommand::new("virt-install")
            .args(["--wait", "--connect", config.connect_uri.as_str(), "--quiet"]);
        if session.firmware == Firmware::Efi {
            cmd = cmd.args(["--boot", "uefi"]);
        }
        cmd = cmd
            .args(["--name", session.label.as_str()])
            .arg("--os-variant=detect=on")
            .arg("--memory")
            .arg(config.memory_mb.to_string())
            .arg("--noautoconsole")
            .arg("--graphics")
            .arg(format!("vnc,listen={}", session.ssh_address))
            .arg("--extra-args")
            .arg(format!(
                "inst.sshd inst.webui.remote inst.updates={}",
                updates_url
            ))
            .args(["--network", "none"])
            .arg(format!(
                "--qemu-commandline=-netdev user,id=hostnet0,\
                 hostfwd=tcp:{}:{}-:{},hostfwd=tcp:{}:{}-:{} \
                 -device virtio-net-pci,netdev=hostnet0,id=net0,addr=0x16",
                session.ssh_address,
                session.ssh_port,
                GUEST_SSH_PORT,
                session.web_address,
                session.web_port,
                GUEST_WEB_PORT
            ));

        let location = match volume_id {
            Some(volume_id) => {
                cmd = cmd.arg("--extra-args").arg(format!(
                    "root=live:CDLABEL={} rd.live.image quiet rhgb",
                    volume_id
                ));
                format!("{},kernel={},initrd={}", iso, LIVE_KERNEL, LIVE_INITRD)
            }
            None => iso,
        };

        cmd = cmd.arg("--disk=none").arg("--location").arg(location);
        Self { command: cmd }
    }
}

/// Pull the volume label out of `isoinfo -d` output
pub fn parse_volume_id(isoinfo_output: &str) -> E2eResult<String> {
    let re = Regex::new(r"(?m)^Volume id:\s*(.*?)\s*$")?;
    re.captures(isoinfo_output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| E2eError::Config("isoinfo output has no volume id".to_string()))
}

/// Drives one installer VM through libvirt's session connection
pub struct VirtInstallMachine {
    config: HarnessConfig,
    runner: Arc<dyn CommandRunner>,
    patcher: Arc<dyn ImagePatcher>,
    guest: Arc<dyn Guest>,
    session: MachineSession,
    state: MachineState,
}

impl VirtInstallMachine {
    pub fn new(
        config: HarnessConfig,
        runner: Arc<dyn CommandRunner>,
        patcher: Arc<dyn ImagePatcher>,
        guest: Arc<dyn Guest>,
        session: MachineSession,
    ) -> Self {
        Self {
            config,
            runner,
            patcher,
            guest,
            session,
            state: MachineState::NotStarted,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn session(&self) -> &MachineSession {
        &self.session
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn label(&self) -> &str {
        &self.session.label
    }

    pub fn is_live(&self) -> bool {
        self.session.live
    }

    fn set_state(&mut self, next: MachineState) {
        debug!("{}: {:?} -> {:?}", self.session.label, self.state, next);
        self.state = next;
    }

    /// Boot the VM and wait for the installer UI.
    ///
    /// Missing payload or boot image fail before anything is spawned.
    pub async fn start(&mut self) -> E2eResult<()> {
        if self.state != MachineState::NotStarted {
            return Err(E2eError::Config(format!(
                "machine {} already started ({:?})",
                self.session.label, self.state
            )));
        }
        self.preflight()?;

        self.set_state(MachineState::Booting);
        match self.boot().await {
            Ok(()) => {
                self.set_state(MachineState::Ready);
                Ok(())
            }
            Err(e) => {
                error!("Starting {} failed: {}", self.session.label, e);
                self.kill().await;
                self.set_state(MachineState::Failed);
                Err(e)
            }
        }
    }

    fn preflight(&self) -> E2eResult<()> {
        let payload = self.config.payload_path();
        if !payload.exists() {
            return Err(E2eError::missing_file(payload, "use 'make payload'"));
        }
        let updates = self.config.global_updates_image();
        if !updates.exists() {
            return Err(E2eError::missing_file(updates, "build the installer updates.img first"));
        }
        Ok(())
    }

    async fn boot(&mut self) -> E2eResult<()> {
        let updates_image = if self.is_live() {
            self.config.global_updates_image()
        } else {
            let payload = self.serve_payload().await?;
            self.patch_updates_image(&payload).await?.path
        };
        let updates_url = self.serve_updates_image(&updates_image).await?;

        let volume_id = if self.is_live() {
            Some(self.volume_id(&self.config.iso_path()).await?)
        } else {
            None
        };

        let plan = BootPlan::new(&self.config, &self.session, &updates_url, volume_id.as_deref());
        info!("Launching {}", plan.command);
        let process = self.runner.spawn(&plan.command)?;
        *self.session.installer.get_mut() = Some(process);

        if self.is_live() {
            // No sshd on live media by default
            info!("Live image {}: skipping guest readiness checks", self.session.image);
            return Ok(());
        }

        self.guest.wait_boot(self.config.timings.boot_timeout()).await?;
        self.wait_for_remote_ui().await?;
        self.guest.execute(BIND_MOUNT_UI).await?;
        Ok(())
    }

    async fn serve_payload(&mut self) -> E2eResult<ServedPayload> {
        let payload = tokio::fs::canonicalize(self.config.payload_path()).await?;
        let (dir, name) = split_file_path(&payload)?;

        let server = self.serve(&dir).await?;
        let url = server.url_for(&self.config.guest_host, &name);
        self.session.servers.push(server);

        info!("Payload served at {}", url);
        Ok(ServedPayload { url })
    }

    async fn patch_updates_image(&self, payload: &ServedPayload) -> E2eResult<PatchedImage> {
        let source = self.config.global_updates_image();
        let dest = self.config.session_updates_image(&self.session.label);
        let patched = self.patcher.patch(&source, &dest, &payload.url).await?;
        if !patched.path.exists() {
            return Err(E2eError::missing_file(&patched.path, "patched boot image was not written"));
        }
        Ok(patched)
    }

    async fn serve_updates_image(&mut self, image: &Path) -> E2eResult<String> {
        let (dir, name) = split_file_path(image)?;
        let server = self.serve(&dir).await?;
        let url = server.url_for(&self.config.guest_host, &name);
        self.session.servers.push(server);

        info!("Boot image served at {}", url);
        Ok(url)
    }

    async fn serve(&self, dir: &Path) -> E2eResult<FileServer> {
        FileServer::start(
            dir,
            &self.config.serve_bind,
            &self.config.ports,
            &self.config.timings,
        )
        .await
    }

    async fn volume_id(&self, iso: &Path) -> E2eResult<String> {
        let cmd = HostCommand::new("isoinfo")
            .args(["-d", "-i"])
            .arg(iso.display().to_string());
        let output = self.runner.run(&cmd).await?;
        parse_volume_id(&output.stdout)
    }

    async fn wait_for_remote_ui(&self) -> E2eResult<()> {
        let timings = &self.config.timings;
        let probe = format!("journalctl -t anaconda | grep '{}'", REMOTE_UI_MARKER);

        for attempt in 1..=timings.webui_attempts {
            match self.guest.execute(&probe).await {
                Ok(_) => {
                    info!("Installer web UI is up (attempt {})", attempt);
                    return Ok(());
                }
                Err(e) => debug!("Web UI not ready (attempt {}): {}", attempt, e),
            }
            if attempt < timings.webui_attempts {
                sleep(timings.webui_interval()).await;
            }
        }

        Err(E2eError::Timeout("Webui initialization did not finish".to_string()))
    }

    fn virsh<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> HostCommand {
        HostCommand::new("virsh")
            .args(["-q", "-c", self.config.connect_uri.as_str()])
            .args(args)
    }

    /// Destroy and undefine the domain and stop every helper process.
    ///
    /// Best effort and idempotent; a missing domain is not an error.
    pub async fn kill(&mut self) {
        let label = self.session.label.clone();
        info!("Destroying {}", label);

        let destroy = self.virsh(["destroy", label.as_str()]);
        if let Err(e) = self.runner.run(&destroy).await {
            debug!("Ignoring destroy failure: {}", e);
        }
        // --nvram also drops the EFI variable store
        let undefine = self.virsh(["undefine", "--nvram", "--remove-all-storage", label.as_str()]);
        if let Err(e) = self.runner.run(&undefine).await {
            debug!("Ignoring undefine failure: {}", e);
        }

        let installer = self.session.installer.get_mut().take();
        if let Some(mut installer) = installer {
            installer.stop().await;
        }
        for server in self.session.servers.iter_mut() {
            server.stop();
        }
        self.session.servers.clear();

        self.guest.disconnect().await;
        self.set_state(MachineState::Destroyed);
    }

    /// Wait for the domain to report `shut off`
    pub async fn wait_poweroff(&mut self) -> E2eResult<()> {
        let attempts = self.config.timings.poweroff_attempts;
        let label = self.session.label.clone();
        let domstate = self.virsh(["domstate", label.as_str()]);

        for attempt in 1..=attempts {
            let result = self.runner.run(&domstate).await;
            match result {
                Ok(out) if out.stdout.contains("shut off") => {
                    info!("{} is shut off", label);
                    self.guest.disconnect().await;
                    self.set_state(MachineState::PoweredOff);
                    return Ok(());
                }
                Ok(out) => debug!("{} state: {}", label, out.stdout.trim()),
                Err(e) => warn!("domstate failed: {}", e),
            }
            if attempt < attempts {
                sleep(self.config.timings.poweroff_interval()).await;
            }
        }

        Err(E2eError::Timeout("Test VM did not shut off".to_string()))
    }

    fn guest(&self) -> E2eResult<&dyn Guest> {
        if self.is_live() {
            return Err(E2eError::GuestUnavailable(self.session.image.clone()));
        }
        Ok(self.guest.as_ref())
    }

    /// Run a shell command in the guest
    pub async fn execute(&self, command: &str) -> E2eResult<String> {
        self.guest()?.execute(command).await
    }

    pub async fn download(&self, source: &str, dest_name: &str, dest_dir: &Path) -> E2eResult<()> {
        self.guest()?.download(source, dest_name, dest_dir).await
    }

    pub async fn wait_reboot(&self) -> E2eResult<()> {
        self.guest()?
            .wait_reboot(self.config.timings.reboot_timeout())
            .await
    }

    /// Authorize the harness key for root on the freshly installed system
    pub async fn add_public_key(&self) -> E2eResult<()> {
        let key_path = self.config.public_key_path();
        let key = tokio::fs::read_to_string(&key_path)
            .await
            .map_err(|_| E2eError::missing_file(&key_path, "public key for the installed system"))?;
        let key = key.trim();
        if key.contains('\'') {
            return Err(E2eError::Config(format!("unexpected quote in {}", key_path.display())));
        }

        let ssh_dir = "/mnt/sysroot/root/.ssh";
        self.execute(&format!(
            "mkdir -p {dir} && chmod 700 {dir} && echo '{key}' >> {dir}/authorized_keys && chmod 600 {dir}/authorized_keys",
            dir = ssh_dir,
            key = key
        ))
        .await?;
        Ok(())
    }

    pub async fn set_root_password(&self, password: &str) -> E2eResult<()> {
        self.execute(&format!("echo \"{}\" | passwd --stdin root", password))
            .await?;
        Ok(())
    }
}

fn forward_address(address: &str) -> E2eResult<IpAddr> {
    address
        .parse()
        .map_err(|e| E2eError::Config(format!("invalid forward address '{}': {}", address, e)))
}

fn split_file_path(path: &Path) -> E2eResult<(PathBuf, String)> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| E2eError::Config(format!("{} has no parent directory", path.display())))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| E2eError::Config(format!("{} has no file name", path.display())))?;
    Ok((dir, name))
}
