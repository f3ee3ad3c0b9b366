//! Helpers for running external programs.
//!
//! Everything the installer does to a disk goes through a binary such as
//! `parted`, `mkfs.ext4` or `swupd`; this module owns how those are spawned,
//! logged and how their failures surface.

use std::borrow::Cow;
use std::fmt::Debug;
use std::process::{Command, Output};

use anyhow::{Context, Result};

/// A shelled-out command returned a non-zero exit status.
#[derive(Debug, thiserror::Error)]
pub struct ExternalToolFailed {
    /// The command line, shell-quoted.
    pub command: String,
    /// The exit code, if the process was not killed by a signal.
    pub code: Option<i32>,
    /// Combined stderr and stdout, trimmed.
    pub output: String,
}

impl std::fmt::Display for ExternalToolFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} failed with exit code {code}", self.command)?,
            None => write!(f, "{} was terminated by a signal", self.command)?,
        }
        if !self.output.is_empty() {
            write!(f, ": {}", self.output)?;
        }
        Ok(())
    }
}

fn quote_argv<'a>(argv: impl IntoIterator<Item = &'a str> + Clone) -> String {
    shlex::try_join(argv.clone()).unwrap_or_else(|_| argv.into_iter().collect::<Vec<_>>().join(" "))
}

/// Arguments whose value must never reach the log.
const SECRET_FLAGS: &[&str] = &["--password"];

const REDACTED: &str = "REDACTED";

/// Replace the values of [`SECRET_FLAGS`], given either as the next
/// argument or as `--flag=value`.
fn redact_argv<'a>(argv: impl IntoIterator<Item = &'a str>) -> Vec<Cow<'a, str>> {
    let mut redact_next = false;
    argv.into_iter()
        .map(|arg| {
            if std::mem::take(&mut redact_next) {
                return Cow::Borrowed(REDACTED);
            }
            if SECRET_FLAGS.contains(&arg) {
                redact_next = true;
                return Cow::Borrowed(arg);
            }
            match arg.split_once('=') {
                Some((flag, _)) if SECRET_FLAGS.contains(&flag) => {
                    Cow::Owned(format!("{flag}={REDACTED}"))
                }
                _ => Cow::Borrowed(arg),
            }
        })
        .collect()
}

fn describe_command(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy();
    let args = cmd
        .get_args()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>();
    let argv = redact_argv(std::iter::once(&*program).chain(args.iter().map(|a| &**a)));
    quote_argv(argv.iter().map(|a| &**a))
}

fn check_output(command: String, output: &Output) -> Result<(), ExternalToolFailed> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let combined = format!("{}\n{}", stderr.trim(), stdout.trim());
    Err(ExternalToolFailed {
        command,
        code: output.status.code(),
        output: combined.trim().to_owned(),
    })
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", describe_command(self));
        self
    }

    fn run_get_string(&mut self) -> Result<String> {
        let description = describe_command(self);
        let output = self
            .output()
            .with_context(|| format!("Spawning {description}"))?;
        check_output(description, &output)?;
        String::from_utf8(output.stdout).context("Parsing command output as UTF-8")
    }
}

/// Executes external programs on behalf of the installer.
///
/// The provisioning engine and the install pipeline only ever talk to the
/// host through this trait, which lets tests substitute a recorder.
pub trait CommandRunner: Send + Sync + Debug {
    /// Run `argv`, capturing and returning its stdout.
    fn run(&self, argv: &[&str]) -> Result<String>;

    /// Run `argv`, forwarding each line of its output to the log.
    fn run_and_log(&self, argv: &[&str]) -> Result<()>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone)]
pub struct HostCommandRunner {
    https_proxy: Option<String>,
}

impl HostCommandRunner {
    /// Create a runner with no extra environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject `https_proxy=<proxy>` into every command run.
    pub fn with_https_proxy(mut self, proxy: Option<String>) -> Self {
        self.https_proxy = proxy.filter(|p| !p.is_empty());
        self
    }

    fn command(&self, argv: &[&str]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Empty command line"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(proxy) = self.https_proxy.as_deref() {
            cmd.env("https_proxy", proxy);
        }
        Ok(cmd)
    }
}

impl CommandRunner for HostCommandRunner {
    fn run(&self, argv: &[&str]) -> Result<String> {
        self.command(argv)?.log_debug().run_get_string()
    }

    fn run_and_log(&self, argv: &[&str]) -> Result<()> {
        let mut cmd = self.command(argv)?;
        let description = describe_command(cmd.log_debug());
        let output = cmd
            .output()
            .with_context(|| format!("Spawning {description}"))?;
        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
        {
            tracing::info!(target: "cmd", "{line}");
        }
        check_output(description, &output)?;
        Ok(())
    }
}
