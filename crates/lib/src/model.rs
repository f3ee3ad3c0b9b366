//! The install descriptor: everything an installation needs to know about
//! the target system, as loaded from and saved to YAML.

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, PermissionsExt as _};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use installer_blockdev::BlockDevice;
use serde::{Deserialize, Serialize};

use crate::install::InstallError;

/// The first line of every descriptor we write.
pub const DESCRIPTOR_HEADER: &str = "#os-installer-config\n";

/// Bundle providing the telemetry client.
pub const TELEMETRY_BUNDLE: &str = "telemetrics";

fn default_true() -> bool {
    true
}

/// A network interface to configure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Interface name, e.g. `eth0`.
    pub name: String,
    /// Use DHCP instead of static addressing.
    #[serde(default = "default_true")]
    pub dhcp: bool,
    /// Static addresses in CIDR notation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addrs: Vec<String>,
    /// Default gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// DNS servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
}

/// A user account to create on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Login name.
    pub login: String,
    /// Password hash, as accepted by `useradd --password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Whether the user may administer the system.
    #[serde(default)]
    pub admin: bool,
}

/// The kernel to install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    /// The bundle providing it.
    pub bundle: String,
}

/// A complete description of an installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInstall {
    /// Disks to install to, with their desired partitions.
    #[serde(default)]
    pub target_media: Vec<BlockDevice>,
    /// Network interfaces to configure before installing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<Interface>,
    /// Keyboard map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<String>,
    /// System language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Bundles to install on top of the base system.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundles: Vec<String>,
    /// The kernel to install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<Kernel>,
    /// Proxy for HTTPS traffic of every command run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    /// Whether telemetry is enabled; unset means the user has not answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<bool>,
    /// Telemetry server for the installed system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_url: Option<String>,
    /// Alternate content mirror.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swupd_mirror: Option<String>,
    /// Kernel command line for the installed system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_cmdline: Option<String>,
    /// Hostname of the installed system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Users to create.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<User>,
    /// Update to the latest content after installing, and leave automatic
    /// updates on.
    #[serde(default = "default_true")]
    pub auto_update: bool,
    /// Reboot once installed.
    #[serde(default = "default_true")]
    pub post_reboot: bool,
    /// Save the descriptor and log into the installed system.
    #[serde(default = "default_true")]
    pub post_archive: bool,
}

impl Default for SystemInstall {
    fn default() -> Self {
        Self {
            target_media: Vec::new(),
            network_interfaces: Vec::new(),
            keyboard: None,
            language: None,
            bundles: Vec::new(),
            kernel: None,
            https_proxy: None,
            telemetry: None,
            telemetry_url: None,
            swupd_mirror: None,
            kernel_cmdline: None,
            hostname: None,
            users: Vec::new(),
            auto_update: true,
            post_reboot: true,
            post_archive: true,
        }
    }
}

impl SystemInstall {
    /// Whether `bundle` is requested.
    pub fn contains_bundle(&self, bundle: &str) -> bool {
        self.bundles.iter().any(|b| b == bundle)
    }

    /// Request `bundle`, unless it already is.
    pub fn add_bundle(&mut self, bundle: &str) {
        if !self.contains_bundle(bundle) {
            self.bundles.push(bundle.to_owned());
        }
    }

    /// Stop requesting `bundle`.
    pub fn remove_bundle(&mut self, bundle: &str) {
        self.bundles.retain(|b| b != bundle);
    }

    /// Add a disk to install to.
    pub fn add_target_media(&mut self, media: BlockDevice) {
        self.target_media.push(media);
    }

    /// Add an interface to configure.
    pub fn add_network_interface(&mut self, iface: Interface) {
        self.network_interfaces.push(iface);
    }

    /// Answer the telemetry question.
    pub fn enable_telemetry(&mut self, enable: bool) {
        self.telemetry = Some(enable);
    }

    /// Whether telemetry was accepted.
    pub fn is_telemetry_enabled(&self) -> bool {
        self.telemetry.unwrap_or_default()
    }

    /// The kernel bundle, if one was chosen.
    pub fn kernel_bundle(&self) -> Option<&str> {
        self.kernel.as_ref().map(|k| k.bundle.as_str())
    }

    /// Check that the descriptor holds everything an installation needs.
    pub fn validate(&self) -> Result<(), InstallError> {
        let invalid = |msg: &str| Err(InstallError::ValidationFailed(msg.to_owned()));
        if self.target_media.is_empty() {
            return invalid("System Installation must provide a target media");
        }
        for media in self.target_media.iter() {
            media
                .validate()
                .map_err(|e| InstallError::ValidationFailed(format!("{}: {e}", media.name)))?;
        }
        if self.keyboard.is_none() {
            return invalid("Keyboard not set");
        }
        if self.language.is_none() {
            return invalid("System Language not set");
        }
        if self.telemetry.is_none() {
            return invalid("Telemetry not acknowledged");
        }
        Ok(())
    }

    /// A copy without anything identifying the user or their network:
    /// users, hostname, proxy and mirror.
    pub fn sanitized(&self) -> Self {
        Self {
            users: Vec::new(),
            hostname: None,
            https_proxy: None,
            swupd_mirror: None,
            ..self.clone()
        }
    }

    /// Load a descriptor. A missing file yields the default descriptor.
    #[context("Loading descriptor {path}")]
    pub fn load_file(path: &Utf8Path) -> Result<Self> {
        let buf = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No descriptor at {path}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_yaml::from_str(&buf).context("Parsing YAML")
    }

    /// Write the descriptor, readable by everyone.
    #[context("Writing descriptor {path}")]
    pub fn write_file(&self, path: &Utf8Path) -> Result<()> {
        let body = serde_yaml::to_string(self)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Not a file path"))?;
        let dir = Dir::open_ambient_dir(dir, cap_std::ambient_authority())
            .with_context(|| format!("Opening {dir}"))?;
        dir.atomic_write_with_perms(
            name,
            format!("{DESCRIPTOR_HEADER}{body}"),
            cap_std::fs::Permissions::from_mode(0o644),
        )?;
        Ok(())
    }
}
