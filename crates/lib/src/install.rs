//! # Installing a system
//!
//! An [`Installer`] takes a validated descriptor and a scratch target root
//! through a fixed pipeline: check privileges, discover the host's content
//! version, validate, bring the network up, partition and format every
//! target disk, mount the target tree, install content and a boot loader,
//! then configure the installed system. [`Installer::cleanup`] unwinds the
//! host side afterwards, whether or not installing succeeded.
//!
//! Each installer runs at most once. An installation running on another
//! thread is stopped through the flag from [`Installer::cancel_flag`]; it
//! finishes the external command in flight and stops before the next step.

pub mod config;
mod results;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use installer_blockdev::{BlockDevice, Provisioner};
use installer_mount::{MountError, Mounter};
use installer_utils::{CommandRunner, ResultExt};
use installer_utils::progress::Progress;
use regex::Regex;

use crate::bootstrap::{ContentBootstrap, Swupd, bundle_plan};
use crate::model::{SystemInstall, TELEMETRY_BUNDLE};
use crate::network::{HostNetwork, NetworkConfigurator};
use crate::postinstall::{HostPostInstall, PostInstall, write_target_file};
pub use config::{InstallConfiguration, load_config};
pub use results::save_install_results;

/// Where the host's content version is read from.
pub const OS_RELEASE: &str = "/usr/lib/os-release";

/// Network configuration is applied to the running host.
const HOST_ROOT: &str = "/";

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"VERSION_ID=([0-9][0-9]*)").unwrap());

/// Errors which stop an installation.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Installing requires root.
    #[error("Permission denied: must be run as root")]
    PermissionDenied,
    /// The descriptor is incomplete or inconsistent.
    #[error("{0}")]
    ValidationFailed(String),
    /// Connectivity could not be established.
    #[error("Failed, network is not working.")]
    NetworkUnreachable,
    /// The host's content version could not be determined.
    #[error("Version not found in {0}")]
    VersionNotFound(Utf8PathBuf),
    /// This installer has already run.
    #[error("Installation already ran")]
    AlreadyRan,
    /// The installation was stopped through its cancel flag.
    #[error("Installation cancelled")]
    Cancelled,
}

/// How far an installation has got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    /// Nothing done yet.
    Init,
    /// The descriptor passed validation.
    Validated,
    /// The network is configured and reachable.
    NetworkReady,
    /// Every target disk is partitioned and formatted.
    Provisioned,
    /// The target tree is mounted.
    Mounted,
    /// Content and boot loader are installed.
    BootstrapComplete,
    /// The host side has been torn down; terminal.
    Cleaned,
}

/// Whether we run with root privileges.
pub fn host_is_privileged() -> bool {
    rustix::process::geteuid().is_root()
}

/// Read the content version of the host from an os-release file.
#[context("Reading host version")]
pub fn read_host_version(path: &Utf8Path) -> Result<String> {
    let buf = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
    match VERSION_RE.captures(&buf) {
        Some(c) => Ok(c[1].to_owned()),
        None => Err(InstallError::VersionNotFound(path.to_owned()).into()),
    }
}

/// Order partitions for mounting: shallow mount points first, so that
/// every mount point comes after the mount points it lives below.
pub fn sort_mount_points(parts: &mut [BlockDevice]) {
    parts.sort_by(|a, b| {
        let depth = |p: &BlockDevice| Utf8Path::new(&p.mountpoint).components().count();
        depth(a)
            .cmp(&depth(b))
            .then_with(|| a.mountpoint.cmp(&b.mountpoint))
    });
}

/// Remove `path` recursively, except for anything in `keep` and the
/// directories leading to it.
fn remove_tree_except(path: &Utf8Path, keep: &[Utf8PathBuf]) -> Result<()> {
    if keep.iter().any(|k| k == path) {
        tracing::warn!("Leaving {path} in place");
        return Ok(());
    }
    if !keep.iter().any(|k| k.starts_with(path)) {
        return match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            r => r.with_context(|| format!("Removing {path}")),
        };
    }
    for entry in path
        .read_dir_utf8()
        .with_context(|| format!("Reading {path}"))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_tree_except(entry.path(), keep)?;
        } else {
            std::fs::remove_file(entry.path())
                .with_context(|| format!("Removing {}", entry.path()))?;
        }
    }
    Ok(())
}

/// Undoes the host side of an installation: unmounts everything that was
/// mounted and removes the target root.
#[derive(Debug)]
struct Teardown {
    provisioner: Provisioner,
    root: Utf8PathBuf,
    is_privileged: fn() -> bool,
}

impl Teardown {
    /// Unmount and remove the target root.
    ///
    /// Unmount failures are only logged; whatever is still mounted is left
    /// in place and everything else removed. Without privileges nothing
    /// can have been mounted, and nothing is done.
    fn run(&self) -> Result<()> {
        if !(self.is_privileged)() {
            tracing::debug!("Not privileged, nothing to clean up");
            return Ok(());
        }
        let still_mounted = match self.provisioner.unmount_all() {
            Ok(()) => Vec::new(),
            Err(MountError::UnmountFailed { failures }) => {
                for (path, e) in failures.iter() {
                    tracing::warn!("Failed to unmount {path}: {e}");
                }
                failures.into_iter().map(|(p, _)| p).collect()
            }
            Err(e) => {
                tracing::warn!("{e}");
                Vec::new()
            }
        };
        remove_tree_except(&self.root, &still_mounted)
    }
}

/// Runs the install pipeline for one descriptor.
#[derive(Debug)]
pub struct Installer {
    model: SystemInstall,
    root: Utf8PathBuf,
    provisioner: Provisioner,
    bootstrap: Box<dyn ContentBootstrap>,
    network: Box<dyn NetworkConfigurator>,
    post_install: Box<dyn PostInstall>,
    os_release: Utf8PathBuf,
    log_file: Option<Utf8PathBuf>,
    is_privileged: fn() -> bool,
    connectivity_attempts: u32,
    retry_interval: Duration,
    cancelled: Arc<AtomicBool>,
    started: bool,
    stage: InstallStage,
    bundle_failures: Vec<String>,
}

impl Installer {
    /// Create an installer for `model` assembling the target under `root`,
    /// using the host's tools through `runner` and reporting to `progress`.
    pub fn new(
        model: SystemInstall,
        root: Utf8PathBuf,
        config: &InstallConfiguration,
        runner: Arc<dyn CommandRunner>,
        progress: Progress,
    ) -> Self {
        let provisioner = Provisioner::new(Arc::clone(&runner), progress)
            .with_settle_timeout(config.settle_timeout());
        Self {
            bootstrap: Box::new(Swupd::new(Arc::clone(&runner), &root)),
            network: Box::new(HostNetwork::new(Arc::clone(&runner), config.check_url())),
            post_install: Box::new(HostPostInstall::new(runner)),
            model,
            root,
            provisioner,
            os_release: OS_RELEASE.into(),
            log_file: None,
            is_privileged: host_is_privileged,
            connectivity_attempts: config.connectivity_attempts(),
            retry_interval: config.retry_interval(),
            cancelled: Arc::new(AtomicBool::new(false)),
            started: false,
            stage: InstallStage::Init,
            bundle_failures: Vec::new(),
        }
    }

    /// Install content with `bootstrap` instead of `swupd`.
    pub fn with_bootstrap(mut self, bootstrap: Box<dyn ContentBootstrap>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Configure the network with `network` instead of systemd-networkd.
    pub fn with_network(mut self, network: Box<dyn NetworkConfigurator>) -> Self {
        self.network = network;
        self
    }

    /// Configure the installed system with `post_install`.
    pub fn with_post_install(mut self, post_install: Box<dyn PostInstall>) -> Self {
        self.post_install = post_install;
        self
    }

    /// Read the host version from `path` instead of [`OS_RELEASE`].
    pub fn with_os_release(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.os_release = path.into();
        self
    }

    /// Look for device nodes under `dir` instead of `/dev`.
    pub fn with_dev_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.provisioner = self.provisioner.with_dev_dir(dir);
        self
    }

    /// Archive `log_file` into the installed system.
    pub fn with_log_file(mut self, log_file: Option<Utf8PathBuf>) -> Self {
        self.log_file = log_file;
        self
    }

    /// Decide whether we are privileged with `check`.
    pub fn with_privilege_check(mut self, check: fn() -> bool) -> Self {
        self.is_privileged = check;
        self
    }

    /// The descriptor being installed.
    pub fn model(&self) -> &SystemInstall {
        &self.model
    }

    /// The target root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// How far the installation has got.
    pub fn stage(&self) -> InstallStage {
        self.stage
    }

    /// Bundles which failed to install.
    pub fn bundle_failures(&self) -> &[String] {
        &self.bundle_failures
    }

    /// The record of what has been mounted.
    pub fn mounter(&self) -> &Mounter {
        self.provisioner.mounter()
    }

    /// Setting this flag stops [`Installer::install`] before its next
    /// step with [`InstallError::Cancelled`].
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            tracing::info!("Installation cancelled at stage {:?}", self.stage);
            return Err(InstallError::Cancelled.into());
        }
        Ok(())
    }

    fn teardown(&self) -> Teardown {
        Teardown {
            provisioner: self.provisioner.clone(),
            root: self.root.clone(),
            is_privileged: self.is_privileged,
        }
    }

    /// Install the system. The first error ends the installation, except
    /// for bundles, which are recorded in
    /// [`Installer::bundle_failures`].
    ///
    /// Nothing is torn down; see [`Installer::cleanup`].
    pub fn install(&mut self) -> Result<()> {
        if self.started {
            return Err(InstallError::AlreadyRan.into());
        }
        self.started = true;
        if !(self.is_privileged)() {
            return Err(InstallError::PermissionDenied.into());
        }
        let version = read_host_version(&self.os_release)?;
        tracing::info!("Installing version {version} to {}", self.root);

        self.model.validate()?;
        self.stage = InstallStage::Validated;

        self.check_cancelled()?;
        self.configure_network()?;
        self.stage = InstallStage::NetworkReady;

        let mut to_mount = self.provision()?;
        self.stage = InstallStage::Provisioned;

        sort_mount_points(&mut to_mount);
        for part in to_mount.iter() {
            self.check_cancelled()?;
            tracing::info!("Mounting: {}", part.mountpoint);
            self.provisioner.mount(part, &self.root)?;
        }
        self.check_cancelled()?;
        self.provisioner.mount_meta_fs(&self.root)?;
        self.stage = InstallStage::Mounted;

        if self.model.is_telemetry_enabled() {
            self.model.add_bundle(TELEMETRY_BUNDLE);
        }
        if let Some(cmdline) = self.model.kernel_cmdline.as_deref() {
            write_target_file(&self.root, "etc/kernel/cmdline", cmdline)
                .context("Writing kernel command line")?;
        }
        self.install_content(&version)?;
        self.check_cancelled()?;
        self.install_bootloader()?;
        self.stage = InstallStage::BootstrapComplete;

        self.check_cancelled()?;
        self.configure_target()?;
        save_install_results(&self.root, &self.model, self.log_file.as_deref())
    }

    /// Tear down the host side of the installation. After this the
    /// installer is spent.
    pub fn cleanup(&mut self) -> Result<()> {
        let r = self.teardown().run();
        self.stage = InstallStage::Cleaned;
        r
    }

    /// [`Installer::install`], then [`Installer::cleanup`] regardless of
    /// the outcome. A cleanup failure is logged; the install error wins.
    pub fn run(&mut self) -> Result<()> {
        if self.started {
            return Err(InstallError::AlreadyRan.into());
        }
        let r = self.install();
        self.cleanup().context("Cleaning up").log_err_default();
        r
    }

    fn configure_network(&self) -> Result<()> {
        let progress = self.provisioner.progress();
        if !self.model.network_interfaces.is_empty() {
            let prg = progress.new_loop("Applying network settings");
            self.network
                .apply(Utf8Path::new(HOST_ROOT), &self.model.network_interfaces)?;
            prg.complete();
            let prg = progress.new_loop("Restarting network interfaces");
            self.network.restart()?;
            prg.complete();
        }

        let prg = progress.new_loop("Testing connectivity");
        for attempt in 1..=self.connectivity_attempts {
            std::thread::sleep(self.retry_interval);
            match self.network.verify_connectivity() {
                Ok(()) => {
                    prg.complete();
                    return Ok(());
                }
                Err(e) => tracing::warn!(
                    "Connectivity check {attempt}/{} failed: {e:#}",
                    self.connectivity_attempts
                ),
            }
        }
        prg.fail();
        Err(InstallError::NetworkUnreachable.into())
    }

    /// Partition and format every target disk, returning the partitions
    /// to mount.
    fn provision(&self) -> Result<Vec<BlockDevice>> {
        let progress = self.provisioner.progress();
        let mut to_mount = Vec::new();
        for disk in self.model.target_media.iter() {
            self.check_cancelled()?;
            self.provisioner.write_partition_table(disk)?;
            for part in disk.children.iter() {
                self.check_cancelled()?;
                let prg = progress.new_loop(&format!(
                    "Writing {} file system to {}",
                    part.fstype, part.name
                ));
                self.provisioner.make_filesystem(part)?;
                prg.complete();
                if !part.mountpoint.is_empty() {
                    to_mount.push(part.clone());
                }
            }
        }
        Ok(to_mount)
    }

    fn install_content(&mut self, version: &str) -> Result<()> {
        let progress = self.provisioner.progress().clone();

        self.check_cancelled()?;
        let prg = progress.new_loop("Installing the base system");
        self.bootstrap
            .verify(version, self.model.swupd_mirror.as_deref())?;
        prg.complete();

        if self.model.auto_update {
            let prg = progress.new_loop("Updating the base system");
            self.bootstrap.update()?;
            prg.complete();
        } else {
            tracing::info!("Skipping initial update, automatic updates are disabled");
            self.bootstrap.disable_auto_update()?;
        }

        // A bundle which fails to install does not fail the installation.
        for bundle in bundle_plan(&self.model.bundles, self.model.kernel_bundle()) {
            self.check_cancelled()?;
            let prg = progress.new_loop(&format!("Installing bundle: {bundle}"));
            match self.bootstrap.bundle_add(bundle) {
                Ok(()) => prg.complete(),
                Err(e) => {
                    prg.fail();
                    tracing::error!("Failed to install bundle: {bundle}: {e:#}");
                    self.bundle_failures.push(bundle.to_owned());
                }
            }
        }
        Ok(())
    }

    #[context("Installing boot loader")]
    fn install_bootloader(&self) -> Result<()> {
        let prg = self
            .provisioner
            .progress()
            .new_loop("Installing boot loader");
        let cbm = self.root.join("usr/bin/clr-boot-manager");
        let path = format!("--path={}", self.root);
        self.provisioner
            .runner()
            .run_and_log(&[cbm.as_str(), "update", path.as_str()])?;
        prg.complete();
        Ok(())
    }

    fn configure_target(&self) -> Result<()> {
        if !self.model.users.is_empty() {
            self.post_install
                .apply_users(&self.root, &self.model.users)?;
        }
        if let Some(hostname) = self.model.hostname.as_deref().filter(|h| !h.is_empty()) {
            self.post_install.set_hostname(&self.root, hostname)?;
        }
        if let Some(url) = self.model.telemetry_url.as_deref() {
            if self.model.is_telemetry_enabled() {
                self.post_install.write_telemetry_config(&self.root, url)?;
            }
        }
        Ok(())
    }
}
