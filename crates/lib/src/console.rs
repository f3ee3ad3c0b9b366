//! Rendering install progress on the terminal.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use installer_utils::progress::ProgressClient;

const TICK_STRINGS: &[&str] = &["|", "-", "\\", "|", "/", "-", "\\", ""];

#[derive(Default)]
struct State {
    description: String,
    bar: Option<ProgressBar>,
}

/// Draws one line per unit of work: a spinner or a percentage while it
/// runs, then `[done]` or `[failed]`.
#[derive(Default)]
pub(crate) struct ConsoleProgress {
    state: Mutex<State>,
}

impl std::fmt::Debug for ConsoleProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleProgress")
            .field("description", &self.state().description)
            .finish_non_exhaustive()
    }
}

fn style(template: &str) -> ProgressStyle {
    // Templates are static
    ProgressStyle::with_template(template)
        .unwrap()
        .tick_strings(TICK_STRINGS)
}

impl ConsoleProgress {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(&self, template: &str) {
        let mut state = self.state();
        let bar = state.bar.take().unwrap_or_else(ProgressBar::new_spinner);
        bar.set_style(style(template));
        bar.set_message(state.description.clone());
        bar.finish();
    }
}

impl ProgressClient for ConsoleProgress {
    fn set_description(&self, description: &str) {
        let mut state = self.state();
        if let Some(bar) = state.bar.take() {
            bar.finish_and_clear();
        }
        state.description = description.to_owned();
    }

    fn report_fraction(&self, total: usize, step: usize) {
        let mut state = self.state();
        let description = state.description.clone();
        let bar = state.bar.get_or_insert_with(|| {
            ProgressBar::new(total as u64)
                .with_style(style("{msg} {percent}%"))
                .with_message(description)
        });
        bar.set_length(total as u64);
        bar.set_position(step as u64);
    }

    fn tick(&self) {
        let mut state = self.state();
        let description = state.description.clone();
        state
            .bar
            .get_or_insert_with(|| {
                ProgressBar::new_spinner()
                    .with_style(style("{msg} [{spinner}]"))
                    .with_message(description)
            })
            .tick();
    }

    fn complete(&self) {
        self.finish("{msg} [done]");
    }

    fn fail(&self) {
        self.finish("{msg} [failed]");
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(50)
    }
}
