//! Stage worker boundary.
//!
//! The scheduler never performs network I/O itself. Replica resolution,
//! staging round-trips, the byte copy and registration all happen behind
//! these traits: the scheduler pushes a DTR into a worker, the worker does
//! the slow work and hands the DTR back through the [`SchedulerFeed`].
//! Ownership of the DTR moves with every push, so neither side ever
//! touches a request the other currently holds.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use dtr::{Dtr, TransferParameters};

/// Clonable handle to the scheduler's inbound queue. Workers and the
/// generator use it to hand DTRs (back) to the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerFeed {
    tx: mpsc::UnboundedSender<Dtr>,
}

impl SchedulerFeed {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Dtr>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn push(&self, dtr: Dtr) {
        if let Err(err) = self.tx.send(dtr) {
            warn!(dtr = %err.0.short_id(), "scheduler feed closed, dropping DTR");
        }
    }
}

/// A processing stage: pre-processor, delivery or post-processor.
pub trait StageWorker: Send + Sync {
    /// Bring the worker up. False aborts scheduler startup.
    fn start(&self) -> bool {
        true
    }

    /// Hand a DTR over for processing. The worker owns it until it pushes
    /// it back through the feed.
    fn push(&self, dtr: Dtr);

    fn stop(&self) {}
}

/// The delivery stage additionally supports in-flight cancellation and
/// transfer tuning.
pub trait DeliveryWorker: StageWorker {
    /// Abort a running transfer. Returns false if the transfer is not
    /// known to this worker; the DTR still comes back through the feed.
    fn cancel_dtr(&self, id: &str) -> bool;

    fn set_transfer_parameters(&self, _parameters: TransferParameters) {}
}

/// Where finished DTRs go. The generator created the request and receives
/// it back exactly once, in a final state.
pub trait GeneratorSink: Send + Sync {
    fn return_dtr(&self, dtr: Dtr);
}

/// The full set of collaborators, supplied before start.
#[derive(Clone)]
pub struct StageWorkers {
    pub pre_processor: Arc<dyn StageWorker>,
    pub post_processor: Arc<dyn StageWorker>,
    pub delivery: Arc<dyn DeliveryWorker>,
    pub generator: Arc<dyn GeneratorSink>,
}

impl StageWorkers {
    pub(crate) fn start_all(&self) -> bool {
        self.pre_processor.start() && self.delivery.start() && self.post_processor.start()
    }

    pub(crate) fn stop_all(&self) {
        self.pre_processor.stop();
        self.delivery.stop();
        self.post_processor.stop();
    }
}
