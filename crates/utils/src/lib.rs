//! Shared plumbing for the installer crates: running host commands,
//! progress reporting and tracing setup. Only add things here that depend
//! on the standard library and the workspace's "core" crates.
//!
mod command;
pub use command::*;
pub mod progress;
mod result_ext;
pub use result_ext::*;
#[cfg(feature = "internal-testing-api")]
pub mod testing;
mod tracing_util;
pub use tracing_util::*;

/// The name of our binary, also used to tag our journal entries.
pub const NAME: &str = "os-installer";

/// Intended for use in `main`, calls an inner function and handles errors
/// by printing them and exiting non-zero.
pub fn run_main<F>(f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    use std::io::Write as _;

    use owo_colors::OwoColorize;

    if let Err(e) = f() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails.
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
