//! Harness configuration
//!
//! Everything the VM controller and the workflow need is carried in
//! [`HarnessConfig`]. The process environment is read once, at the binary
//! boundary, through [`HarnessConfig::apply_env`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{E2eError, E2eResult};

/// Environment variable selecting the firmware (`bios` or `efi`)
pub const ENV_FIRMWARE: &str = "TEST_FIRMWARE";
/// Environment variable selecting the installer image
pub const ENV_OS: &str = "TEST_OS";
/// Environment variable naming a custom compose ISO under `test/images`
pub const ENV_COMPOSE: &str = "TEST_COMPOSE";

/// VM firmware mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Bios,
    Efi,
}

impl FromStr for Firmware {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "efi" | "uefi" => Ok(Firmware::Efi),
            "bios" | "" => Ok(Firmware::Bios),
            other => Err(E2eError::Config(format!("unknown firmware '{}'", other))),
        }
    }
}

/// Account created on the users screen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub full_name: String,
    pub username: String,
    pub password: String,
}

impl Default for UserAccount {
    fn default() -> Self {
        Self {
            full_name: "Full User Name".to_string(),
            username: "admin".to_string(),
            password: "password".to_string(),
        }
    }
}

/// Start ports for probing and the probe limit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRanges {
    /// First port tried for the ephemeral file servers
    pub http_start: u16,
    /// First port tried for the forwarded guest SSH port
    pub ssh_start: u16,
    /// First port tried for the forwarded guest web port
    pub web_start: u16,
    /// Ports probed before giving up
    pub max_attempts: u16,
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            http_start: 8000,
            ssh_start: 2201,
            web_start: 9091,
            max_attempts: 1000,
        }
    }
}

/// Polling budgets. All waits in the harness are bounded polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub http_ready_timeout_ms: u64,
    pub http_poll_interval_ms: u64,
    pub boot_timeout_ms: u64,
    pub webui_attempts: u32,
    pub webui_interval_ms: u64,
    pub poweroff_attempts: u32,
    pub poweroff_interval_ms: u64,
    pub reboot_timeout_ms: u64,
    /// How long the progress screen may take to report completion
    pub install_timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            http_ready_timeout_ms: 50_000,
            http_poll_interval_ms: 500,
            boot_timeout_ms: 300_000,
            webui_attempts: 30,
            webui_interval_ms: 10_000,
            poweroff_attempts: 10,
            poweroff_interval_ms: 2_000,
            reboot_timeout_ms: 300_000,
            install_timeout_ms: 30 * 60 * 1000,
        }
    }
}

impl Timings {
    pub fn http_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.http_ready_timeout_ms)
    }

    pub fn http_poll_interval(&self) -> Duration {
        Duration::from_millis(self.http_poll_interval_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn webui_interval(&self) -> Duration {
        Duration::from_millis(self.webui_interval_ms)
    }

    pub fn poweroff_interval(&self) -> Duration {
        Duration::from_millis(self.poweroff_interval_ms)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_millis(self.reboot_timeout_ms)
    }
}

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Checkout root; holds the boot images and is served to the guest
    pub root_dir: PathBuf,

    /// Test-bots checkout (default: `<root_dir>/bots`)
    pub bots_dir: Option<PathBuf>,

    /// Installer image identifier, e.g. `fedora-rawhide-boot`
    pub image: String,

    /// Firmware mode
    pub firmware: Firmware,

    /// Custom compose ISO name under `<root_dir>/test/images`
    pub compose: Option<String>,

    /// libvirt connection URI
    pub connect_uri: String,

    /// Guest memory
    pub memory_mb: u32,

    /// Loopback address the forwarded SSH port and VNC listen on
    pub ssh_address: String,

    /// Loopback address the forwarded web port listens on
    pub web_address: String,

    /// Host address as seen from the user-mode guest network
    pub guest_host: String,

    /// Bind address of the ephemeral file servers
    pub serve_bind: String,

    /// Prefix for generated session labels
    pub label_prefix: String,

    /// SSH private key (default: `<bots_dir>/machine/identity`)
    pub identity_file: Option<PathBuf>,

    /// Account created during the wizard
    pub user: UserAccount,

    /// Root password set on the installed system
    pub root_password: String,

    /// Parent of the per-test log directories
    pub logs_root: PathBuf,

    pub ports: PortRanges,

    pub timings: Timings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            bots_dir: None,
            image: "fedora-rawhide-boot".to_string(),
            firmware: Firmware::Bios,
            compose: None,
            connect_uri: "qemu:///session".to_string(),
            memory_mb: 4096,
            ssh_address: "127.0.0.2".to_string(),
            web_address: "127.0.0.2".to_string(),
            guest_host: "10.0.2.2".to_string(),
            serve_bind: "0.0.0.0".to_string(),
            label_prefix: "installer-e2e".to_string(),
            identity_file: None,
            user: UserAccount::default(),
            root_password: "test".to_string(),
            logs_root: PathBuf::from("test_logs"),
            ports: PortRanges::default(),
            timings: Timings::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a YAML file, falling back to defaults when absent
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Overlay `TEST_FIRMWARE`, `TEST_OS` and `TEST_COMPOSE` using `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> E2eResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(firmware) = lookup(ENV_FIRMWARE) {
            self.firmware = firmware.parse()?;
        }
        if let Some(image) = lookup(ENV_OS).filter(|v| !v.is_empty()) {
            self.image = image;
        }
        if let Some(compose) = lookup(ENV_COMPOSE).filter(|v| !v.is_empty()) {
            self.compose = Some(compose);
        }
        Ok(())
    }

    pub fn bots_dir(&self) -> PathBuf {
        self.bots_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("bots"))
    }

    /// Target OS: the image identifier without its `-boot` suffix
    pub fn os(&self) -> &str {
        match self.image.find("-boot") {
            Some(idx) => &self.image[..idx],
            None => &self.image,
        }
    }

    /// Live images boot straight into a running system and are not patched
    pub fn is_live(&self) -> bool {
        self.image.contains("live")
    }

    pub fn payload_path(&self) -> PathBuf {
        self.bots_dir()
            .join("images")
            .join(format!("{}-anaconda-payload", self.os()))
    }

    /// The shared, unpatched boot image for the target OS
    pub fn global_updates_image(&self) -> PathBuf {
        self.root_dir.join(format!("updates-{}.img", self.os()))
    }

    /// Per-session patched boot image
    pub fn session_updates_image(&self, label: &str) -> PathBuf {
        self.root_dir.join(format!("{}-updates.img", label))
    }

    pub fn iso_path(&self) -> PathBuf {
        match &self.compose {
            Some(compose) => self
                .root_dir
                .join("test")
                .join("images")
                .join(format!("{}.iso", compose)),
            None => self.bots_dir().join("images").join(&self.image),
        }
    }

    pub fn identity_file(&self) -> PathBuf {
        self.identity_file
            .clone()
            .unwrap_or_else(|| self.bots_dir().join("machine").join("identity"))
    }

    pub fn public_key_path(&self) -> PathBuf {
        let mut path = self.identity_file().into_os_string();
        path.push(".pub");
        PathBuf::from(path)
    }

    /// Log directory for one test, e.g. `test_logs/TestStorageEncrypted`
    pub fn logs_dir(&self, test_name: &str) -> PathBuf {
        self.logs_root.join(test_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    #[test_case("fedora-rawhide-boot", "fedora-rawhide" ; "boot suffix stripped")]
    #[test_case("fedora-41-boot", "fedora-41" ; "release boot image")]
    #[test_case("fedora-rawhide-live-boot", "fedora-rawhide-live" ; "live boot image")]
    #[test_case("fedora-rawhide", "fedora-rawhide" ; "no suffix")]
    fn os_is_derived_from_image(image: &str, os: &str) {
        let config = HarnessConfig {
            image: image.to_string(),
            ..Default::default()
        };
        assert_eq!(config.os(), os);
    }

    #[test_case("efi", Firmware::Efi)]
    #[test_case("EFI", Firmware::Efi)]
    #[test_case("bios", Firmware::Bios)]
    #[test_case("", Firmware::Bios)]
    fn firmware_parses(value: &str, expected: Firmware) {
        assert_eq!(value.parse::<Firmware>().unwrap(), expected);
    }

    #[test]
    fn unknown_firmware_is_rejected() {
        assert!("coreboot".parse::<Firmware>().is_err());
    }

    #[test]
    fn env_overlay() {
        let env: HashMap<&str, &str> = [
            (ENV_FIRMWARE, "efi"),
            (ENV_OS, "fedora-41-boot"),
            (ENV_COMPOSE, "Fedora-Rawhide-20240101"),
        ]
        .into_iter()
        .collect();

        let mut config = HarnessConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.firmware, Firmware::Efi);
        assert_eq!(config.os(), "fedora-41");
        assert_eq!(
            config.iso_path(),
            PathBuf::from("./test/images/Fedora-Rawhide-20240101.iso")
        );
    }

    #[test]
    fn derived_paths() {
        let config = HarnessConfig {
            root_dir: PathBuf::from("/src/webui"),
            ..Default::default()
        };
        assert_eq!(
            config.payload_path(),
            PathBuf::from("/src/webui/bots/images/fedora-rawhide-anaconda-payload")
        );
        assert_eq!(
            config.global_updates_image(),
            PathBuf::from("/src/webui/updates-fedora-rawhide.img")
        );
        assert_eq!(
            config.session_updates_image("vm-1"),
            PathBuf::from("/src/webui/vm-1-updates.img")
        );
        assert_eq!(
            config.iso_path(),
            PathBuf::from("/src/webui/bots/images/fedora-rawhide-boot")
        );
        assert_eq!(
            config.public_key_path(),
            PathBuf::from("/src/webui/bots/machine/identity.pub")
        );
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r#"
image: fedora-rawhide-live-boot
timings:
  webui_attempts: 5
"#;
        let config: HarnessConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.is_live());
        assert_eq!(config.timings.webui_attempts, 5);
        assert_eq!(config.timings.poweroff_attempts, 10);
        assert_eq!(config.memory_mb, 4096);
    }
}
