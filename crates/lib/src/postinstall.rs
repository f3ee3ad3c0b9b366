//! Configuration of the installed system once its content is in place.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, PermissionsExt as _};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use installer_utils::CommandRunner;

use crate::model::User;

/// Group granting administrative rights.
const ADMIN_GROUP: &str = "wheel";

/// Applies the identity of the installed system.
pub trait PostInstall: Send + Sync + Debug {
    /// Create `users` in the system at `root`.
    fn apply_users(&self, root: &Utf8Path, users: &[User]) -> Result<()>;
    /// Set the hostname of the system at `root`.
    fn set_hostname(&self, root: &Utf8Path, hostname: &str) -> Result<()>;
    /// Point the telemetry client of the system at `root` to `url`.
    fn write_telemetry_config(&self, root: &Utf8Path, url: &str) -> Result<()>;
}

/// Write `contents` to `path` below `root`, creating parent directories.
pub(crate) fn write_target_file(root: &Utf8Path, path: &str, contents: &str) -> Result<()> {
    let dir = Dir::open_ambient_dir(root, cap_std::ambient_authority())
        .with_context(|| format!("Opening {root}"))?;
    if let Some(parent) = Utf8Path::new(path).parent().filter(|p| !p.as_str().is_empty()) {
        dir.create_dir_all(parent)
            .with_context(|| format!("Creating {parent}"))?;
    }
    dir.atomic_write_with_perms(path, contents, cap_std::fs::Permissions::from_mode(0o644))
        .with_context(|| format!("Writing {path}"))
}

/// Configures the installed system using host tools.
#[derive(Debug, Clone)]
pub struct HostPostInstall {
    runner: Arc<dyn CommandRunner>,
}

impl HostPostInstall {
    /// Create a post-install step running commands through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl PostInstall for HostPostInstall {
    #[context("Creating users")]
    fn apply_users(&self, root: &Utf8Path, users: &[User]) -> Result<()> {
        for user in users {
            let mut argv = vec!["useradd", "--root", root.as_str(), "--create-home"];
            if let Some(pw) = user.password.as_deref() {
                argv.extend(["--password", pw]);
            }
            if user.admin {
                argv.extend(["--groups", ADMIN_GROUP]);
            }
            argv.push(user.login.as_str());
            self.runner
                .run_and_log(&argv)
                .with_context(|| format!("Creating user {}", user.login))?;
        }
        Ok(())
    }

    #[context("Setting hostname")]
    fn set_hostname(&self, root: &Utf8Path, hostname: &str) -> Result<()> {
        write_target_file(root, "etc/hostname", &format!("{hostname}\n"))
    }

    #[context("Writing telemetry configuration")]
    fn write_telemetry_config(&self, root: &Utf8Path, url: &str) -> Result<()> {
        write_target_file(
            root,
            "etc/telemetrics/telemetrics.conf",
            &format!("server={url}\n"),
        )
    }
}
