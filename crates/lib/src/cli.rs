//! # The os-installer command line
//!
//! Loads the install descriptor and the installer configuration, applies
//! command line overrides, and runs the install with console progress.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use installer_blockdev::{BlockDevice, DeviceInventory, largest_filesystem_name};
use installer_utils::progress::Progress;
use installer_utils::{CommandRunner, HostCommandRunner, ResultExt, initialize_tracing};
use tokio::signal::unix::SignalKind;

use crate::console::ConsoleProgress;
use crate::install::{Installer, load_config};
use crate::model::SystemInstall;

/// The descriptor installed when `--config` is not given.
pub const DEFAULT_DESCRIPTOR: &str = "/usr/share/defaults/os-installer/os-installer.yaml";

const DEFAULT_LOG_FILE: &str = "/var/log/os-installer.log";

/// Install an operating system as described by an install descriptor.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "os-installer", version)]
pub(crate) struct Opt {
    /// Path to the install descriptor (YAML)
    #[clap(long, short = 'c')]
    config: Option<Utf8PathBuf>,

    /// Also write the log here; it is archived into the installed system
    #[clap(long, default_value = DEFAULT_LOG_FILE)]
    log_file: Utf8PathBuf,

    /// Log level filter; `RUST_LOG` takes precedence
    #[clap(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Reboot after a successful installation
    #[clap(long, overrides_with = "no_reboot")]
    reboot: bool,

    /// Do not reboot, whatever the descriptor says
    #[clap(long, overrides_with = "reboot")]
    no_reboot: bool,

    /// Archive the descriptor and log into the installed system
    #[clap(long, overrides_with = "no_archive")]
    archive: bool,

    /// Do not archive install results
    #[clap(long, overrides_with = "archive")]
    no_archive: bool,

    /// Content mirror URL, overriding the descriptor
    #[clap(long)]
    mirror: Option<String>,

    /// List the block devices available for installation, then exit
    #[clap(long)]
    list_devices: bool,
}

fn tristate(yes: bool, no: bool) -> Option<bool> {
    match (yes, no) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Opt {
    /// Apply the overrides given on the command line to `model`.
    fn apply_overrides(&self, model: &mut SystemInstall) {
        if let Some(reboot) = tristate(self.reboot, self.no_reboot) {
            model.post_reboot = reboot;
        }
        if let Some(archive) = tristate(self.archive, self.no_archive) {
            model.post_archive = archive;
        }
        if let Some(mirror) = self.mirror.as_deref() {
            model.swupd_mirror = Some(mirror.to_owned());
        }
    }
}

/// One line per disk, then one indented line per partition.
fn render_devices(devices: &[BlockDevice]) -> String {
    let width = largest_filesystem_name();
    let mut r = String::new();
    for disk in devices {
        let _ = writeln!(r, "{} {} {}", disk.name, disk.human_size(), disk.model);
        for part in disk.children.iter() {
            let _ = writeln!(
                r,
                "  {:<10} {:<width$} {:>8} {}",
                part.name,
                part.fstype,
                part.human_size(),
                part.mountpoint
            );
        }
    }
    r
}

async fn shutdown_signal() -> Result<()> {
    let mut term = tokio::signal::unix::signal(SignalKind::terminate())
        .context("Installing SIGTERM handler")?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.context("Waiting for SIGINT")?,
        _ = term.recv() => {}
    }
    Ok(())
}

async fn install(opt: Opt) -> Result<()> {
    let descriptor = opt
        .config
        .as_deref()
        .unwrap_or(Utf8Path::new(DEFAULT_DESCRIPTOR));
    tracing::debug!("Loading install descriptor: {descriptor}");
    let mut model = SystemInstall::load_file(descriptor)?;
    opt.apply_overrides(&mut model);
    let config = load_config()?.unwrap_or_default();
    config.apply_defaults(&mut model);
    if let Some(mirror) = model.swupd_mirror.as_deref() {
        tracing::debug!("Using content mirror {mirror}");
    }

    let runner: Arc<dyn CommandRunner> =
        Arc::new(HostCommandRunner::new().with_https_proxy(model.https_proxy.clone()));
    let progress = Progress::with_client(Arc::new(ConsoleProgress::new()));
    let root = tempfile::Builder::new()
        .prefix("install-")
        .tempdir()
        .context("Creating target root")?
        .keep();
    let root = Utf8PathBuf::try_from(root)?;
    let reboot = model.post_reboot;

    let mut installer = Installer::new(model, root, &config, Arc::clone(&runner), progress.clone())
        .with_log_file(Some(opt.log_file));
    let cancel = installer.cancel_flag();
    let mut task = tokio::task::spawn_blocking(move || {
        let r = installer.install();
        let prg = progress.new_loop("Cleaning up install environment");
        installer.cleanup().log_err_default();
        prg.complete();
        if !installer.bundle_failures().is_empty() {
            tracing::warn!(
                "Bundles failed to install: {}",
                installer.bundle_failures().join(", ")
            );
        }
        r
    });

    // On a signal the pipeline stops before its next step and cleans up
    // after itself; only then do we leave.
    let r = tokio::select! {
        r = &mut task => r,
        r = shutdown_signal() => {
            match r {
                Ok(()) => {
                    println!("Leaving...");
                    cancel.store(true, Ordering::SeqCst);
                }
                Err(e) => tracing::warn!("{e:#}"),
            }
            task.await
        }
    };
    r.context("Install task")??;

    if reboot {
        runner.run_and_log(&["reboot"])?;
    }
    Ok(())
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    if opt.list_devices {
        initialize_tracing(&opt.log_level, None)?;
        let mut inventory = DeviceInventory::new(Arc::new(HostCommandRunner::new()));
        print!("{}", render_devices(inventory.available(&[])?));
        return Ok(());
    }
    initialize_tracing(&opt.log_level, Some(&opt.log_file))?;
    install(opt).await
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and
/// aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

#[cfg(test)]
mod tests {
    use installer_blockdev::BlockDeviceType;

    use super::*;

    #[test]
    fn test_parse_opts() {
        let opt = Opt::parse_from(["os-installer"]);
        assert_eq!(opt.config, None);
        assert_eq!(opt.log_file, DEFAULT_LOG_FILE);
        assert_eq!(opt.log_level, "info");
        assert!(!opt.list_devices);

        let opt = Opt::parse_from([
            "os-installer",
            "-c",
            "/tmp/desc.yaml",
            "--no-reboot",
            "--reboot",
            "--no-archive",
            "--mirror",
            "https://mirror.example.com/update",
        ]);
        assert_eq!(opt.config.as_deref(), Some(Utf8Path::new("/tmp/desc.yaml")));
        assert!(opt.reboot && !opt.no_reboot);
        assert!(opt.no_archive && !opt.archive);

        assert!(Opt::try_parse_from(["os-installer", "--bogus"]).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut model = SystemInstall::default();
        assert!(model.post_reboot && model.post_archive);

        Opt::parse_from(["os-installer"]).apply_overrides(&mut model);
        assert!(model.post_reboot && model.post_archive);
        assert_eq!(model.swupd_mirror, None);

        Opt::parse_from(["os-installer", "--no-reboot", "--no-archive", "--mirror", "m"])
            .apply_overrides(&mut model);
        assert!(!model.post_reboot);
        assert!(!model.post_archive);
        assert_eq!(model.swupd_mirror.as_deref(), Some("m"));

        Opt::parse_from(["os-installer", "--reboot"]).apply_overrides(&mut model);
        assert!(model.post_reboot);
        assert!(!model.post_archive);
    }

    #[test]
    fn test_render_devices() {
        let mut disk = BlockDevice {
            name: "sda".into(),
            model: "QEMU HARDDISK".into(),
            size: 20 << 30,
            device_type: BlockDeviceType::Disk,
            ..Default::default()
        };
        disk.new_standard_partitions();
        let out = render_devices(&[disk]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("sda "));
        assert!(lines[0].ends_with("QEMU HARDDISK"));
        assert!(lines[1].trim_start().starts_with("sda1"));
        assert!(lines[1].contains("vfat"));
        assert!(lines[1].ends_with("/boot"));
        assert!(lines[3].ends_with('/'));
    }
}
