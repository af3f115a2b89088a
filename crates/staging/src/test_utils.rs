//! Mock stage workers and test helpers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use dtr::{Dtr, DtrStatus, ErrorKind, ErrorLocation};

use crate::worker::{DeliveryWorker, GeneratorSink, SchedulerFeed, StageWorker};

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer() // Write to test output
        .try_init();
}

/// Stage worker that keeps everything pushed to it. For tests that only
/// exercise admission, never the return path.
#[derive(Default)]
pub struct RecordingWorker {
    taken: Mutex<Vec<Dtr>>,
}

impl RecordingWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> usize {
        self.taken.lock().len()
    }

    pub fn drain(&self) -> Vec<Dtr> {
        std::mem::take(&mut self.taken.lock())
    }
}

impl StageWorker for RecordingWorker {
    fn push(&self, dtr: Dtr) {
        self.taken.lock().push(dtr);
    }
}

/// Delivery-flavoured [`RecordingWorker`] that also records cancellations.
#[derive(Default)]
pub struct RecordingDelivery {
    taken: Mutex<Vec<Dtr>>,
    cancelled: Mutex<Vec<String>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> usize {
        self.taken.lock().len()
    }

    pub fn drain(&self) -> Vec<Dtr> {
        std::mem::take(&mut self.taken.lock())
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

impl StageWorker for RecordingDelivery {
    fn push(&self, dtr: Dtr) {
        self.taken.lock().push(dtr);
    }
}

impl DeliveryWorker for RecordingDelivery {
    fn cancel_dtr(&self, id: &str) -> bool {
        self.cancelled.lock().push(id.to_owned());
        true
    }
}

/// A scripted failure injected when the worker processes a given state.
#[derive(Clone)]
pub struct ScriptedFailure {
    pub kind: ErrorKind,
    pub location: ErrorLocation,
    pub message: String,
    /// How many times to fail before succeeding. 0 means always fail.
    pub times: usize,
}

/// Stage worker that simulates processing: each pushed request is
/// advanced to its returned state (after an optional delay) and handed
/// back through the scheduler feed. Failures can be scripted per active
/// state.
pub struct EchoWorker {
    feed: SchedulerFeed,
    delay: Duration,
    failures: Mutex<HashMap<DtrStatus, ScriptedFailure>>,
    peak: Arc<Peak>,
}

#[derive(Default)]
struct Peak {
    current: Mutex<usize>,
    peak: Mutex<usize>,
}

impl EchoWorker {
    pub fn new(feed: SchedulerFeed) -> Self {
        Self {
            feed,
            delay: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            peak: Arc::new(Peak::default()),
        }
    }

    /// Hold each request for `delay` before returning it.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail processing of `state` with the given error.
    pub fn fail_on(self, state: DtrStatus, failure: ScriptedFailure) -> Self {
        self.failures.lock().insert(state, failure);
        self
    }

    /// Highest number of requests held concurrently.
    pub fn peak_concurrency(&self) -> usize {
        *self.peak.peak.lock()
    }

    fn advance(failures: &Mutex<HashMap<DtrStatus, ScriptedFailure>>, dtr: &mut Dtr) {
        let active = dtr.status();
        let Some(returned) = active.returned_counterpart() else {
            // not an active state, hand it back untouched
            return;
        };
        let failure = {
            let mut failures = failures.lock();
            match failures.get_mut(&active) {
                Some(scripted) if scripted.times == 0 => Some(scripted.clone()),
                Some(scripted) => {
                    scripted.times -= 1;
                    let fire = scripted.clone();
                    if scripted.times == 0 {
                        failures.remove(&active);
                    }
                    Some(fire)
                }
                None => None,
            }
        };
        if let Some(failure) = failure {
            dtr.set_error_in_state(failure.kind, failure.location, failure.message, active);
        } else if dtr.error().is_some()
            && dtr.error().is_some_and(|e| e.last_error_state == active)
        {
            // a retried step succeeded this time
            dtr.reset_error();
        }
        dtr.set_status(returned);
    }

    fn process(&self, mut dtr: Dtr) {
        {
            let mut current = self.peak.current.lock();
            *current += 1;
            let mut peak = self.peak.peak.lock();
            *peak = (*peak).max(*current);
        }
        Self::advance(&self.failures, &mut dtr);
        let feed = self.feed.clone();
        let peak = self.peak.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            *peak.current.lock() -= 1;
            feed.push(dtr);
        });
    }
}

impl StageWorker for EchoWorker {
    fn push(&self, dtr: Dtr) {
        self.process(dtr);
    }
}

impl DeliveryWorker for EchoWorker {
    fn cancel_dtr(&self, _id: &str) -> bool {
        // the request comes back through the feed either way
        true
    }
}

/// Generator sink collecting finished requests.
#[derive(Default)]
pub struct CollectingSink {
    finished: Mutex<Vec<Dtr>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.finished.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.finished.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<Dtr> {
        std::mem::take(&mut self.finished.lock())
    }

    /// Poll until `count` requests have finished or the timeout expires.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.len() >= count
    }
}

impl GeneratorSink for CollectingSink {
    fn return_dtr(&self, dtr: Dtr) {
        self.finished.lock().push(dtr);
    }
}
