//! # Configuration for the installer
//!
//! This module handles the TOML configuration fragments stored in
//! `os-installer/install` (e.g. `/etc/os-installer/install/05-custom.toml`).
//! These carry site defaults; the install descriptor describes one
//! particular installation.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::model::{Kernel, SystemInstall};

/// The kernel installed when neither the descriptor nor the configuration
/// picks one.
pub const DEFAULT_KERNEL_BUNDLE: &str = "kernel-native";

/// Probed to decide whether the network works.
pub const DEFAULT_CHECK_URL: &str = "https://cdn.download.clearlinux.org/update/";

const DEFAULT_CONNECTIVITY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// What fragments are matched against.
pub(crate) struct EnvProperties {
    pub(crate) sys_arch: String,
}

/// A whole configuration fragment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct InstallConfigurationToplevel {
    /// The `[install]` table.
    pub install: Option<InstallConfiguration>,
}

/// The `[install.storage]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfiguration {
    /// Seconds to wait for partition device nodes after re-reading a
    /// partition table.
    pub settle_timeout: Option<u64>,
}

/// The `[install.network]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfiguration {
    /// How many times connectivity is probed before giving up.
    pub connectivity_attempts: Option<u32>,
    /// Seconds to wait before each probe.
    pub retry_interval: Option<u64>,
    /// The URL probed.
    pub check_url: Option<String>,
}

/// The serialized `[install]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename = "install", rename_all = "kebab-case")]
pub struct InstallConfiguration {
    /// Kernel bundle used when the descriptor names none
    pub kernel_bundle: Option<String>,
    /// Bundles always installed, in addition to the descriptor's
    pub bundles: Option<Vec<String>>,
    /// Content mirror used when the descriptor names none
    pub mirror: Option<String>,
    /// Supported architectures for this configuration
    pub match_architectures: Option<Vec<String>>,
    /// Storage provisioning settings
    pub storage: Option<StorageConfiguration>,
    /// Network bring-up settings
    pub network: Option<NetworkConfiguration>,
}

fn merge_basic<T>(s: &mut Option<T>, o: Option<T>, _env: &EnvProperties) {
    if let Some(o) = o {
        *s = Some(o);
    }
}

trait Mergeable {
    fn merge(&mut self, other: Self, env: &EnvProperties)
    where
        Self: Sized;
}

impl<T> Mergeable for Option<T>
where
    T: Mergeable,
{
    fn merge(&mut self, other: Self, env: &EnvProperties)
    where
        Self: Sized,
    {
        if let Some(other) = other {
            if let Some(s) = self.as_mut() {
                s.merge(other, env)
            } else {
                *self = Some(other);
            }
        }
    }
}

impl Mergeable for StorageConfiguration {
    fn merge(&mut self, other: Self, env: &EnvProperties) {
        merge_basic(&mut self.settle_timeout, other.settle_timeout, env)
    }
}

impl Mergeable for NetworkConfiguration {
    fn merge(&mut self, other: Self, env: &EnvProperties) {
        merge_basic(
            &mut self.connectivity_attempts,
            other.connectivity_attempts,
            env,
        );
        merge_basic(&mut self.retry_interval, other.retry_interval, env);
        merge_basic(&mut self.check_url, other.check_url, env);
    }
}

impl Mergeable for InstallConfiguration {
    /// Fragments for other architectures are skipped. Bundle lists
    /// accumulate; everything else is overridden.
    fn merge(&mut self, other: Self, env: &EnvProperties) {
        if other.applies_to(env) {
            merge_basic(&mut self.kernel_bundle, other.kernel_bundle, env);
            merge_basic(&mut self.mirror, other.mirror, env);
            self.storage.merge(other.storage, env);
            self.network.merge(other.network, env);
            if let Some(other_bundles) = other.bundles {
                self.bundles
                    .get_or_insert_with(Default::default)
                    .extend(other_bundles)
            }
        }
    }
}

impl InstallConfiguration {
    /// Whether this fragment is meant for the architecture of `env`; a
    /// fragment naming no architectures applies everywhere.
    fn applies_to(&self, env: &EnvProperties) -> bool {
        self.match_architectures
            .as_ref()
            .is_none_or(|a| a.contains(&env.sys_arch))
    }

    /// Bound on the wait for partition device nodes.
    pub fn settle_timeout(&self) -> Duration {
        self.storage
            .as_ref()
            .and_then(|s| s.settle_timeout)
            .map(Duration::from_secs)
            .unwrap_or(installer_blockdev::DEFAULT_SETTLE_TIMEOUT)
    }

    /// Number of connectivity probes; at least one.
    pub fn connectivity_attempts(&self) -> u32 {
        self.network
            .as_ref()
            .and_then(|n| n.connectivity_attempts)
            .unwrap_or(DEFAULT_CONNECTIVITY_ATTEMPTS)
            .max(1)
    }

    /// Pause before each connectivity probe.
    pub fn retry_interval(&self) -> Duration {
        self.network
            .as_ref()
            .and_then(|n| n.retry_interval)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_INTERVAL)
    }

    /// The URL probed for connectivity.
    pub fn check_url(&self) -> &str {
        self.network
            .as_ref()
            .and_then(|n| n.check_url.as_deref())
            .unwrap_or(DEFAULT_CHECK_URL)
    }

    /// Fill in what the descriptor leaves open: the kernel, the mirror and
    /// the site's bundles.
    pub fn apply_defaults(&self, model: &mut SystemInstall) {
        if model.kernel.is_none() {
            let bundle = self
                .kernel_bundle
                .as_deref()
                .unwrap_or(DEFAULT_KERNEL_BUNDLE);
            model.kernel = Some(Kernel {
                bundle: bundle.to_owned(),
            });
        }
        if model.swupd_mirror.is_none() {
            model.swupd_mirror = self.mirror.clone();
        }
        for b in self.bundles.iter().flatten() {
            model.add_bundle(b);
        }
    }
}

const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];

/// Load the install configuration, merging all found configuration files.
pub fn load_config() -> Result<Option<InstallConfiguration>> {
    let env = EnvProperties {
        sys_arch: std::env::consts::ARCH.to_string(),
    };
    load_config_from(SYSTEMD_CONVENTIONAL_BASES, &env)
}

#[context("Loading configuration")]
fn load_config_from<P: AsRef<Utf8Path>>(
    bases: &[P],
    env: &EnvProperties,
) -> Result<Option<InstallConfiguration>> {
    let fragments = liboverdrop::scan(
        bases.iter().map(|b| b.as_ref().as_std_path()),
        "os-installer/install",
        &["toml"],
        true,
    );
    let mut config: Option<InstallConfiguration> = None;
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path)?;
        let mut unused = std::collections::HashSet::new();
        let de = toml::Deserializer::parse(&buf).with_context(|| format!("Parsing {path:?}"))?;
        let c: InstallConfigurationToplevel = serde_ignored::deserialize(de, |path| {
            unused.insert(path.to_string());
        })
        .with_context(|| format!("Parsing {path:?}"))?;
        for key in unused {
            tracing::warn!("{path:?}: Unknown key {key}");
        }
        let Some(install) = c.install else {
            continue;
        };
        if let Some(config) = config.as_mut() {
            tracing::debug!("Merging {path:?}: {install:?}");
            config.merge(install, env);
        } else if install.applies_to(env) {
            config = Some(install);
        } else {
            tracing::debug!("Skipping {path:?} for another architecture");
        }
    }
    Ok(config)
}
