//! Bringing the network up before installing, using systemd-networkd.

use std::fmt::{Debug, Write as _};
use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use installer_utils::CommandRunner;

use crate::model::Interface;
use crate::postinstall::write_target_file;

const NETWORKD_DIR: &str = "etc/systemd/network";

/// Configures and checks the network.
pub trait NetworkConfigurator: Send + Sync + Debug {
    /// Write the configuration of `interfaces` into the system at `root`.
    fn apply(&self, root: &Utf8Path, interfaces: &[Interface]) -> Result<()>;
    /// Restart networking so written configuration takes effect.
    fn restart(&self) -> Result<()>;
    /// Fail unless the network can reach the content servers.
    fn verify_connectivity(&self) -> Result<()>;
}

/// Render the systemd-networkd unit for `iface`.
pub(crate) fn networkd_unit(iface: &Interface) -> String {
    let mut r = format!("[Match]\nName={}\n\n[Network]\n", iface.name);
    if iface.dhcp {
        r.push_str("DHCP=yes\n");
    }
    for addr in iface.addrs.iter() {
        let _ = writeln!(r, "Address={addr}");
    }
    if let Some(gw) = iface.gateway.as_deref() {
        let _ = writeln!(r, "Gateway={gw}");
    }
    for dns in iface.dns.iter() {
        let _ = writeln!(r, "DNS={dns}");
    }
    r
}

/// Configures the host's network.
#[derive(Debug, Clone)]
pub struct HostNetwork {
    runner: Arc<dyn CommandRunner>,
    check_url: String,
}

impl HostNetwork {
    /// Create a configurator which probes `check_url` for connectivity.
    pub fn new(runner: Arc<dyn CommandRunner>, check_url: &str) -> Self {
        Self {
            runner,
            check_url: check_url.to_owned(),
        }
    }
}

impl NetworkConfigurator for HostNetwork {
    #[context("Applying network settings")]
    fn apply(&self, root: &Utf8Path, interfaces: &[Interface]) -> Result<()> {
        for iface in interfaces {
            let path = format!("{NETWORKD_DIR}/10-{}.network", iface.name);
            tracing::debug!("Writing {path}");
            write_target_file(root, &path, &networkd_unit(iface))?;
        }
        Ok(())
    }

    #[context("Restarting network interfaces")]
    fn restart(&self) -> Result<()> {
        self.runner.run_and_log(&[
            "systemctl",
            "restart",
            "systemd-networkd.service",
            "systemd-resolved.service",
        ])
    }

    #[context("Checking connectivity to {}", self.check_url)]
    fn verify_connectivity(&self) -> Result<()> {
        self.runner
            .run(&[
                "curl",
                "--fail",
                "--silent",
                "--show-error",
                "--head",
                "--max-time",
                "10",
                &self.check_url,
            ])
            .map(|_| ())
    }
}
