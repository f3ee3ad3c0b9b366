//! Installing OS content into the target root with `swupd`.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use installer_utils::CommandRunner;

/// Bundles the base install always provides.
pub const CORE_BUNDLES: &[&str] = &["os-core", "os-core-update"];

/// Whether `bundle` is already installed by the base install.
pub fn is_core_bundle(bundle: &str) -> bool {
    CORE_BUNDLES.contains(&bundle)
}

/// The bundles left to add after the base install: the requested bundles
/// followed by the kernel, without duplicates or core bundles.
pub fn bundle_plan<'a>(requested: &'a [String], kernel: Option<&'a str>) -> Vec<&'a str> {
    let mut r: Vec<&str> = Vec::new();
    for b in requested.iter().map(String::as_str).chain(kernel) {
        if is_core_bundle(b) {
            tracing::debug!("Skipping core bundle {b}");
            continue;
        }
        if !r.contains(&b) {
            r.push(b);
        }
    }
    r
}

/// A client installing OS content into a target root.
pub trait ContentBootstrap: Send + Sync + Debug {
    /// Install the base system at `version`, optionally from `mirror`.
    fn verify(&self, version: &str, mirror: Option<&str>) -> Result<()>;
    /// Update the installed content to the latest version.
    fn update(&self) -> Result<()>;
    /// Turn automatic updates off in the installed system.
    fn disable_auto_update(&self) -> Result<()>;
    /// Add a bundle.
    fn bundle_add(&self, bundle: &str) -> Result<()>;
}

/// Drives `swupd` against a target root.
///
/// The base install uses the host's `swupd`, matching the host's content
/// version; everything afterwards uses the copy just installed into the
/// target.
#[derive(Debug, Clone)]
pub struct Swupd {
    runner: Arc<dyn CommandRunner>,
    root: Utf8PathBuf,
    state_dir: Utf8PathBuf,
}

impl Swupd {
    /// Create a client for the target at `root`.
    pub fn new(runner: Arc<dyn CommandRunner>, root: &Utf8Path) -> Self {
        Self {
            runner,
            root: root.to_owned(),
            state_dir: root.join("var/lib/swupd"),
        }
    }

    fn target_swupd(&self) -> String {
        self.root.join("usr/bin/swupd").into_string()
    }

    fn path_arg(&self) -> String {
        format!("--path={}", self.root)
    }

    fn statedir_arg(&self) -> String {
        format!("--statedir={}", self.state_dir)
    }
}

impl ContentBootstrap for Swupd {
    #[context("Installing base system version {version}")]
    fn verify(&self, version: &str, mirror: Option<&str>) -> Result<()> {
        let path = self.path_arg();
        let statedir = self.statedir_arg();
        let url = mirror.map(|m| format!("--url={m}"));
        let mut argv = vec![
            "swupd",
            "verify",
            path.as_str(),
            statedir.as_str(),
            "--install",
            "-m",
            version,
            "--force",
            "--no-scripts",
        ];
        argv.extend(url.as_deref());
        self.runner.run_and_log(&argv)?;

        let mut argv = vec!["swupd", "bundle-add", path.as_str(), statedir.as_str()];
        argv.extend(url.as_deref());
        argv.push("os-core-update");
        self.runner.run_and_log(&argv)
    }

    #[context("Updating installed content")]
    fn update(&self) -> Result<()> {
        self.runner.run_and_log(&[
            &self.target_swupd(),
            "update",
            &self.path_arg(),
            &self.statedir_arg(),
        ])
    }

    #[context("Disabling automatic updates")]
    fn disable_auto_update(&self) -> Result<()> {
        self.runner.run_and_log(&[
            &self.target_swupd(),
            "autoupdate",
            "--disable",
            &self.path_arg(),
            &self.statedir_arg(),
        ])
    }

    #[context("Adding bundle {bundle}")]
    fn bundle_add(&self, bundle: &str) -> Result<()> {
        self.runner.run_and_log(&[
            &self.target_swupd(),
            "bundle-add",
            &self.path_arg(),
            &self.statedir_arg(),
            bundle,
        ])
    }
}
