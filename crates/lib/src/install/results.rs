//! Archiving what was installed, and how, into the installed system.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::model::SystemInstall;

/// Name of the archived descriptor.
pub const DESCRIPTOR_NAME: &str = "os-installer.yaml";
/// Name of the archived log.
pub const LOG_NAME: &str = "os-installer.log";

/// Save a sanitized copy of `model` and the install log into the system at
/// `root`, under `/root` or at `root` itself if that cannot be created.
///
/// Both are attempted; failures are reported together.
#[context("Saving install results")]
pub fn save_install_results(
    root: &Utf8Path,
    model: &SystemInstall,
    log_file: Option<&Utf8Path>,
) -> Result<()> {
    if !model.post_archive {
        tracing::debug!("Not archiving install results");
        return Ok(());
    }
    let mut dest = root.join("root");
    if let Err(e) = std::fs::create_dir_all(&dest) {
        tracing::warn!("Creating {dest}: {e}; saving to {root}");
        dest = root.to_owned();
    }

    let mut errors = Vec::new();
    if let Err(e) = model.sanitized().write_file(&dest.join(DESCRIPTOR_NAME)) {
        errors.push(format!("{e:#}"));
    }
    if let Some(log_file) = log_file {
        let target = dest.join(LOG_NAME);
        if let Err(e) = std::fs::copy(log_file, &target)
            .with_context(|| format!("Copying {log_file} to {target}"))
        {
            errors.push(format!("{e:#}"));
        }
    }
    if errors.is_empty() {
        tracing::info!("Saved install results to {dest}");
        Ok(())
    } else {
        anyhow::bail!("{}", errors.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::model::User;

    fn tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        Ok((td, path))
    }

    #[test]
    fn test_save() -> Result<()> {
        let (_td, root) = tempdir()?;
        let log = root.join("install.log");
        std::fs::write(&log, "line 1\n")?;
        let mut model = SystemInstall {
            hostname: Some("box".into()),
            ..Default::default()
        };
        model.users.push(User {
            login: "admin".into(),
            password: Some("secret".into()),
            admin: true,
        });
        model.add_bundle("editors");
        save_install_results(&root, &model, Some(&log))?;

        let saved = std::fs::read_to_string(root.join("root").join(DESCRIPTOR_NAME))?;
        assert!(saved.starts_with(crate::model::DESCRIPTOR_HEADER));
        assert!(saved.contains("editors"));
        assert!(!saved.contains("secret"));
        assert!(!saved.contains("box"));
        assert_eq!(
            std::fs::read_to_string(root.join("root").join(LOG_NAME))?,
            "line 1\n"
        );
        Ok(())
    }

    #[test]
    fn test_not_archived() -> Result<()> {
        let (_td, root) = tempdir()?;
        let model = SystemInstall {
            post_archive: false,
            ..Default::default()
        };
        save_install_results(&root, &model, None)?;
        assert!(!root.join("root").exists());
        Ok(())
    }

    #[test]
    fn test_missing_log_still_saves_descriptor() -> Result<()> {
        let (_td, root) = tempdir()?;
        let e = save_install_results(
            &root,
            &SystemInstall::default(),
            Some(&root.join("missing.log")),
        )
        .unwrap_err();
        assert!(format!("{e:#}").contains("missing.log"));
        assert!(root.join("root").join(DESCRIPTOR_NAME).exists());
        Ok(())
    }
}
