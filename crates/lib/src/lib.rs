//! # OS installer
//!
//! This crate installs an operating system onto local disks from a
//! declarative install descriptor: it partitions and formats the target
//! disks, assembles them under a scratch root, installs content with
//! `swupd`, installs a boot loader, configures the result and tears the
//! host side down again.
//!
//! # Crate Overview
//!
//! This is the core implementation library. The `os-installer` binary
//! (`crates/cli`) is a thin wrapper that delegates to [`cli::run_from_iter`].
//!
//! The API is internal and not stable for external consumption.
//!
//! # Module Index
//!
//! - [`cli`] - Command-line interface implementation (clap-based)
//! - [`model`] - The install descriptor, [`model::SystemInstall`]
//! - [`install`] - The install pipeline ([`install::Installer`]) and the
//!   layered installer configuration
//! - [`bootstrap`] - Installing content into the target with `swupd`
//! - [`network`] - Bringing the network up before installing
//! - [`postinstall`] - Users, hostname and telemetry of the installed system
//!
//! # Related Crates
//!
//! - [`installer-blockdev`](../installer_blockdev/index.html) - Block device
//!   model, discovery and provisioning
//! - [`installer-mount`](../installer_mount/index.html) - Mounting, and the
//!   ledger of what was mounted
//! - [`installer-utils`](../installer_utils/index.html) - Command running,
//!   progress reporting and tracing setup

pub mod bootstrap;
pub mod cli;
mod console;
pub mod install;
pub mod model;
pub mod network;
pub mod postinstall;
