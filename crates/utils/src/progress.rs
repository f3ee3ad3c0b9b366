//! Progress reporting for long running install steps.
//!
//! A single [`ProgressClient`] (a console renderer, a UI, a test recorder)
//! is registered on a [`Progress`] handle. Work is then reported through
//! short-lived units created from that handle: a [`LoopProgress`] for steps
//! of unknown length, which animates on a background thread until finished,
//! and a [`MultiStepProgress`] for steps with a known number of parts.

use std::fmt::Debug;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// A front end which renders progress.
pub trait ProgressClient: Send + Sync + Debug {
    /// A new unit of work started.
    fn set_description(&self, description: &str);
    /// `step` out of `total` parts of the current unit are done.
    fn report_fraction(&self, total: usize, step: usize);
    /// Animate an indeterminate unit.
    fn tick(&self);
    /// The current unit finished successfully.
    fn complete(&self);
    /// The current unit failed.
    fn fail(&self);
    /// How often [`ProgressClient::tick`] should be called for loop units.
    fn tick_interval(&self) -> Duration;
}

/// Handle to the registered progress client.
///
/// Cloning the handle shares the registration.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    client: Arc<RwLock<Option<Arc<dyn ProgressClient>>>>,
}

impl Progress {
    /// Create a handle with no client registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle with `client` already registered.
    pub fn with_client(client: Arc<dyn ProgressClient>) -> Self {
        let r = Self::new();
        r.register(client);
        r
    }

    /// Register the client all subsequently created units report to.
    ///
    /// Units created before this call keep reporting to the previous client.
    pub fn register(&self, client: Arc<dyn ProgressClient>) {
        let mut slot = self.client.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(client);
    }

    /// Whether a client has been registered.
    pub fn has_client(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn client(&self) -> Arc<dyn ProgressClient> {
        let slot = self.client.read().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(c) => Arc::clone(c),
            None => panic!("progress unit created with no registered progress client"),
        }
    }

    /// Start an indeterminate unit of work.
    ///
    /// # Panics
    ///
    /// Panics if no client has been registered.
    pub fn new_loop(&self, description: &str) -> LoopProgress {
        LoopProgress::start(self.client(), description)
    }

    /// Start a unit of work made of `total` discrete steps.
    ///
    /// # Panics
    ///
    /// Panics if no client has been registered.
    pub fn multi_step(&self, total: usize, description: &str) -> MultiStepProgress {
        let client = self.client();
        client.set_description(description);
        MultiStepProgress {
            client,
            total,
            finished: false,
        }
    }
}

/// An indeterminate unit of work; ticks the client until finished.
///
/// Dropping an unfinished unit stops the ticker and reports a failure.
#[derive(Debug)]
pub struct LoopProgress {
    client: Arc<dyn ProgressClient>,
    stop: Option<mpsc::Sender<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl LoopProgress {
    fn start(client: Arc<dyn ProgressClient>, description: &str) -> Self {
        client.set_description(description);
        let (tx, rx) = mpsc::channel::<()>();
        let interval = client.tick_interval();
        let ticker_client = Arc::clone(&client);
        let ticker = std::thread::spawn(move || {
            while let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(interval) {
                ticker_client.tick();
            }
        });
        Self {
            client,
            stop: Some(tx),
            ticker: Some(ticker),
        }
    }

    /// Signal the ticker and wait for it to exit. Returns false if it was
    /// already stopped.
    fn stop(&mut self) -> bool {
        let Some(tx) = self.stop.take() else {
            return false;
        };
        // The receiver may already be gone if the ticker panicked.
        let _ = tx.send(());
        if let Some(ticker) = self.ticker.take() {
            if ticker.join().is_err() {
                tracing::warn!("progress ticker thread panicked");
            }
        }
        true
    }

    /// Finish the unit successfully.
    pub fn complete(mut self) {
        self.stop();
        self.client.complete();
    }

    /// Finish the unit as failed.
    pub fn fail(mut self) {
        self.stop();
        self.client.fail();
    }
}

impl Drop for LoopProgress {
    fn drop(&mut self) {
        if self.stop() {
            self.client.fail();
        }
    }
}

/// A unit of work with a known number of steps.
#[derive(Debug)]
pub struct MultiStepProgress {
    client: Arc<dyn ProgressClient>,
    total: usize,
    finished: bool,
}

impl MultiStepProgress {
    /// The number of steps in this unit.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Report that `current` steps out of the total are done.
    pub fn report_fraction(&self, current: usize) {
        self.client.report_fraction(self.total, current);
    }

    /// Finish the unit successfully.
    pub fn complete(mut self) {
        self.finished = true;
        self.client.complete();
    }

    /// Finish the unit as failed.
    pub fn fail(mut self) {
        self.finished = true;
        self.client.fail();
    }
}

impl Drop for MultiStepProgress {
    fn drop(&mut self) {
        if !self.finished {
            self.client.fail();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, e: impl Into<String>) {
            self.events.lock().unwrap().push(e.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn ticks(&self) -> usize {
            self.events().iter().filter(|e| *e == "tick").count()
        }
    }

    impl ProgressClient for Recorder {
        fn set_description(&self, description: &str) {
            self.push(format!("desc:{description}"));
        }
        fn report_fraction(&self, total: usize, step: usize) {
            self.push(format!("{step}/{total}"));
        }
        fn tick(&self) {
            self.push("tick");
        }
        fn complete(&self) {
            self.push("complete");
        }
        fn fail(&self) {
            self.push("fail");
        }
        fn tick_interval(&self) -> Duration {
            Duration::from_millis(1)
        }
    }

    fn setup() -> (Arc<Recorder>, Progress) {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::with_client(recorder.clone());
        (recorder, progress)
    }

    #[test]
    fn test_loop_ticks_until_complete() {
        let (recorder, progress) = setup();
        let unit = progress.new_loop("Writing partition table");
        std::thread::sleep(Duration::from_millis(30));
        unit.complete();
        let events = recorder.events();
        assert_eq!(events.first().unwrap(), "desc:Writing partition table");
        assert_eq!(events.last().unwrap(), "complete");
        assert!(recorder.ticks() > 0);
        // The ticker was joined; nothing may arrive after completion.
        let n = recorder.events().len();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(recorder.events().len(), n);
    }

    #[test]
    fn test_loop_dropped_fails() {
        let (recorder, progress) = setup();
        {
            let _unit = progress.new_loop("Mounting");
        }
        assert_eq!(recorder.events().last().unwrap(), "fail");
        let unit = progress.new_loop("Mounting");
        unit.fail();
        let events = recorder.events();
        assert_eq!(events.iter().filter(|e| *e == "fail").count(), 2);
    }

    #[test]
    fn test_multi_step() {
        let (recorder, progress) = setup();
        let unit = progress.multi_step(3, "Setting partition types");
        assert_eq!(unit.total(), 3);
        for i in 1..=3 {
            unit.report_fraction(i);
        }
        unit.complete();
        similar_asserts::assert_eq!(
            recorder.events(),
            ["desc:Setting partition types", "1/3", "2/3", "3/3", "complete"]
        );
        {
            let _unit = progress.multi_step(2, "x");
        }
        assert_eq!(recorder.events().last().unwrap(), "fail");
    }

    #[test]
    fn test_register_shared_between_clones() {
        let progress = Progress::new();
        let other = progress.clone();
        assert!(!other.has_client());
        progress.register(Arc::new(Recorder::default()));
        assert!(other.has_client());
    }

    #[test]
    #[should_panic(expected = "no registered progress client")]
    fn test_loop_without_client_panics() {
        let _ = Progress::new().new_loop("x");
    }

    #[test]
    #[should_panic(expected = "no registered progress client")]
    fn test_multi_step_without_client_panics() {
        let _ = Progress::new().multi_step(1, "x");
    }
}
