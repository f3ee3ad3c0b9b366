//! Fakes for testing code that shells out, only built with the
//! `internal-testing-api` feature.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use crate::{CommandRunner, ExternalToolFailed};

type FailPredicate = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

/// A [`CommandRunner`] which records every command instead of running it.
///
/// Output can be canned per program (matched on the full `argv[0]` or its
/// file name), and commands matching a predicate fail with
/// [`ExternalToolFailed`].
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
    outputs: Mutex<HashMap<String, String>>,
    failures: Mutex<Vec<FailPredicate>>,
}

impl std::fmt::Debug for RecordingRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingRunner")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl RecordingRunner {
    /// Create a runner where every command succeeds with empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `stdout` whenever `program` is run.
    pub fn with_output(self, program: &str, stdout: &str) -> Self {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(program.to_owned(), stdout.to_owned());
        self
    }

    /// Fail every subsequent command for which `pred` returns true.
    pub fn fail_when(&self, pred: impl Fn(&[String]) -> bool + Send + Sync + 'static) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(pred));
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every command run so far, joined with spaces.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.join(" ")).collect()
    }

    /// The commands whose program (or its file name) is `program`.
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().is_some_and(|p| program_matches(p, program)))
            .collect()
    }

    fn record(&self, argv: &[&str]) -> Result<String> {
        let argv: Vec<String> = argv.iter().map(|&s| s.to_owned()).collect();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(argv.clone());
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if failures.iter().any(|pred| pred(&argv)) {
            return Err(ExternalToolFailed {
                command: argv.join(" "),
                code: Some(1),
                output: "injected failure".into(),
            }
            .into());
        }
        let outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        let out = argv
            .first()
            .and_then(|p| {
                outputs
                    .iter()
                    .find(|(k, _)| program_matches(p, k))
                    .map(|(_, v)| v.clone())
            })
            .unwrap_or_default();
        Ok(out)
    }
}

fn program_matches(argv0: &str, program: &str) -> bool {
    argv0 == program || argv0.rsplit('/').next() == Some(program)
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[&str]) -> Result<String> {
        self.record(argv)
    }

    fn run_and_log(&self, argv: &[&str]) -> Result<()> {
        self.record(argv).map(|_| ())
    }
}
