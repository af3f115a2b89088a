//! The scheduler.
//!
//! One control-loop task owns all state mutation: it drains DTRs arriving
//! from the generator or returning from stage workers, advances them
//! through the state machine, runs admission control, and periodically
//! dumps the registry. The public handle only touches the loop through
//! synchronized structures (the registry, the cancelled-job list, the
//! inbound feed).

mod queue;
mod transitions;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use dtr::{Dtr, DtrStatus, TransferParameters, UrlMap, local_delivery};

use crate::registry::DtrList;
use crate::shares::{DEFAULT_SHARE, TransferSharesConf};
use crate::worker::{SchedulerFeed, StageWorkers};

use queue::QueueCtx;
use transitions::TransitionCtx;

const STATE_INITIATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_TO_STOP: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Pause between control-loop passes.
const LOOP_PAUSE: Duration = Duration::from_millis(50);
/// How often the registry is dumped when a dump location is configured.
const DUMP_INTERVAL: Duration = Duration::from_secs(5);

/// Pre-start configuration, conservative defaults.
#[derive(Debug, Clone)]
struct Config {
    pre_slots: usize,
    post_slots: usize,
    delivery_slots: usize,
    emergency_slots: usize,
    url_map: UrlMap,
    preferred_pattern: String,
    delivery_services: Vec<Url>,
    transfer_parameters: TransferParameters,
    dump_location: Option<PathBuf>,
    rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pre_slots: 20,
            post_slots: 20,
            delivery_slots: 10,
            emergency_slots: 2,
            url_map: UrlMap::new(),
            preferred_pattern: String::new(),
            delivery_services: Vec::new(),
            transfer_parameters: TransferParameters::default(),
            dump_location: None,
            rng_seed: None,
        }
    }
}

/// Drives data transfer requests from receipt to completion.
pub struct Scheduler {
    state: AtomicU8,
    config: Mutex<Config>,
    shares_conf: Arc<Mutex<TransferSharesConf>>,
    registry: Arc<DtrList>,
    feed: SchedulerFeed,
    receiver: Mutex<Option<UnboundedReceiver<Dtr>>>,
    workers: Mutex<Option<StageWorkers>>,
    cancelled_jobs: Arc<Mutex<Vec<String>>>,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (feed, receiver) = SchedulerFeed::channel();
        Self {
            state: AtomicU8::new(STATE_INITIATED),
            config: Mutex::new(Config::default()),
            shares_conf: Arc::new(Mutex::new(TransferSharesConf::default())),
            registry: Arc::new(DtrList::new()),
            feed,
            receiver: Mutex::new(Some(receiver)),
            workers: Mutex::new(None),
            cancelled_jobs: Arc::new(Mutex::new(Vec::new())),
            shutdown: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// The inbound queue handle. Stage workers return processed DTRs
    /// through a clone of this feed.
    pub fn feed(&self) -> SchedulerFeed {
        self.feed.clone()
    }

    fn is_initiated(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_INITIATED
    }

    /// Supply the stage workers. Required before [`start`](Self::start).
    pub fn set_stage_workers(&self, workers: StageWorkers) {
        if self.is_initiated() {
            *self.workers.lock() = Some(workers);
        }
    }

    /// Set per-stage slot limits. Non-positive values keep the default.
    pub fn set_slots(&self, pre: i64, post: i64, delivery: i64, emergency: i64) {
        if !self.is_initiated() {
            return;
        }
        let mut config = self.config.lock();
        if pre > 0 {
            config.pre_slots = pre as usize;
        }
        if post > 0 {
            config.post_slots = post as usize;
        }
        if delivery > 0 {
            config.delivery_slots = delivery as usize;
        }
        if emergency > 0 {
            config.emergency_slots = emergency as usize;
        }
    }

    pub fn set_transfer_shares_conf(&self, conf: TransferSharesConf) {
        if self.is_initiated() {
            *self.shares_conf.lock() = conf;
        }
    }

    pub fn set_url_map(&self, map: UrlMap) {
        if self.is_initiated() {
            self.config.lock().url_map = map;
        }
    }

    /// Pattern used to order candidate source replicas.
    pub fn set_preferred_pattern(&self, pattern: impl Into<String>) {
        if self.is_initiated() {
            self.config.lock().preferred_pattern = pattern.into();
        }
    }

    pub fn set_delivery_services(&self, services: Vec<Url>) {
        if self.is_initiated() {
            self.config.lock().delivery_services = services;
        }
    }

    pub fn set_transfer_parameters(&self, parameters: TransferParameters) {
        if self.is_initiated() {
            self.config.lock().transfer_parameters = parameters;
        }
    }

    /// Where to write the periodic registry dump. Unset means no dumps.
    pub fn set_dump_location(&self, location: impl Into<PathBuf>) {
        self.config.lock().dump_location = Some(location.into());
    }

    /// Fix the seed of the delivery-service selection RNG.
    pub fn set_rng_seed(&self, seed: u64) {
        if self.is_initiated() {
            self.config.lock().rng_seed = Some(seed);
        }
    }

    /// Start the stage workers and spawn the control loop. Returns false
    /// when already started or when no stage workers were supplied.
    pub fn start(&self) -> bool {
        if self
            .state
            .compare_exchange(STATE_INITIATED, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let Some(workers) = self.workers.lock().clone() else {
            warn!("cannot start scheduler without stage workers");
            self.state.store(STATE_INITIATED, Ordering::SeqCst);
            return false;
        };
        let Some(receiver) = self.receiver.lock().take() else {
            self.state.store(STATE_INITIATED, Ordering::SeqCst);
            return false;
        };
        if !workers.start_all() {
            warn!("a stage worker failed to start");
            *self.receiver.lock() = Some(receiver);
            self.state.store(STATE_INITIATED, Ordering::SeqCst);
            return false;
        }

        let mut config = self.config.lock().clone();
        if config.delivery_services.is_empty() {
            config.delivery_services.push(local_delivery());
        }
        // slot limits scale with the number of delivery services
        config.delivery_slots *= config.delivery_services.len();
        config.emergency_slots *= config.delivery_services.len();
        workers
            .delivery
            .set_transfer_parameters(config.transfer_parameters);

        info!(
            pre_slots = config.pre_slots,
            post_slots = config.post_slots,
            delivery_slots = config.delivery_slots,
            emergency_slots = config.emergency_slots,
            delivery_services = config.delivery_services.len(),
            "scheduler starting"
        );

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let control = ControlLoop {
            registry: self.registry.clone(),
            workers,
            shares_conf: self.shares_conf.clone(),
            cancelled_jobs: self.cancelled_jobs.clone(),
            shutdown: self.shutdown.clone(),
            receiver,
            config,
            rng,
            last_dump: None,
        };
        *self.loop_handle.lock() = Some(tokio::spawn(control.run()));
        true
    }

    /// Take a brand-new DTR from the generator. Anything not in status
    /// `NEW` belongs to the scheduler already and is ignored. Requests
    /// arriving before [`start`](Self::start) are registered and wait in
    /// the registry until the control loop comes up.
    pub fn receive(&self, mut dtr: Dtr) {
        if dtr.status() != DtrStatus::New {
            warn!(dtr = %dtr.short_id(), status = %dtr.status(), "received DTR not in NEW state, ignoring");
            return;
        }
        let state = self.state.load(Ordering::SeqCst);
        if state == STATE_TO_STOP || state == STATE_STOPPED || !dtr.is_valid() {
            warn!(dtr = %dtr.short_id(), "received invalid DTR or scheduler shutting down");
            dtr.set_status(DtrStatus::Error);
            let generator = self.workers.lock().as_ref().map(|w| w.generator.clone());
            if let Some(generator) = generator {
                generator.return_dtr(dtr);
            }
            return;
        }

        let conf = self.shares_conf.lock();
        let mut share = conf.extract_share_info(&dtr);
        if share.is_empty() {
            share = DEFAULT_SHARE.to_owned();
        }
        // effective priority: share priority scaled by the job priority
        dtr.set_priority(conf.basic_priority(&share) * dtr.priority() / 100);
        dtr.set_transfer_share(share);
        drop(conf);

        info!(
            dtr = %dtr.short_id(),
            share = dtr.transfer_share(),
            priority = dtr.priority(),
            "registered new DTR"
        );
        self.registry.add(dtr);
    }

    /// Request cancellation of every DTR of a job. Applied on the next
    /// control-loop pass.
    pub fn cancel_dtrs(&self, job_id: impl Into<String>) {
        self.cancelled_jobs.lock().push(job_id.into());
    }

    /// Cancel all jobs, then wait for the loop to finish every in-flight
    /// DTR and exit. Returns false unless the scheduler was running.
    pub async fn stop(&self) -> bool {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_TO_STOP, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        info!("scheduler stop requested, cancelling all jobs");
        {
            let jobs = self.registry.jobs();
            self.cancelled_jobs.lock().extend(jobs);
        }
        self.shutdown.cancel();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "scheduler loop task failed");
        }
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        true
    }
}

/// State owned by the control-loop task.
struct ControlLoop {
    registry: Arc<DtrList>,
    workers: StageWorkers,
    shares_conf: Arc<Mutex<TransferSharesConf>>,
    cancelled_jobs: Arc<Mutex<Vec<String>>>,
    shutdown: CancellationToken,
    receiver: UnboundedReceiver<Dtr>,
    config: Config,
    rng: StdRng,
    last_dump: Option<Instant>,
}

impl ControlLoop {
    async fn run(mut self) {
        loop {
            self.apply_cancellations();
            self.drain_feed();
            self.process_events();
            self.revise_queues();
            self.maybe_dump();

            if self.shutdown.is_cancelled() && self.registry.is_empty() {
                break;
            }
            let pause = tokio::time::sleep(LOOP_PAUSE);
            if self.shutdown.is_cancelled() {
                pause.await;
            } else {
                tokio::select! {
                    _ = pause => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }
        self.dump_now();
        self.workers.stop_all();
        info!("scheduler loop exited");
    }

    /// Turn pending job cancellations into per-DTR cancel flags.
    fn apply_cancellations(&self) {
        let jobs: Vec<String> = self.cancelled_jobs.lock().drain(..).collect();
        for job in jobs {
            let flagged = self.registry.cancel_job(&job);
            info!(job = %job, dtrs = flagged, "job cancelled");
        }
    }

    /// Check returned DTRs back into the registry, applying any cancel
    /// request recorded while they were out at a worker.
    fn drain_feed(&mut self) {
        while let Ok(mut dtr) = self.receiver.try_recv() {
            if self.registry.cancel_pending(dtr.id()) && !dtr.cancel_requested() {
                dtr.set_cancel_request();
            }
            self.registry.check_in(dtr);
        }
    }

    fn process_events(&self) {
        let ctx = TransitionCtx {
            registry: &self.registry,
            url_map: &self.config.url_map,
            preferred_pattern: &self.config.preferred_pattern,
            delivery_slots: self.config.delivery_slots,
        };
        for id in self.registry.pending_ids() {
            let Some(dtr) = self.registry.take(&id) else {
                continue;
            };
            transitions::dispatch(dtr, &ctx, self.workers.generator.as_ref());
        }
    }

    fn revise_queues(&mut self) {
        let shares_conf = self.shares_conf.lock().clone();
        let mut ctx = QueueCtx {
            registry: &self.registry,
            workers: &self.workers,
            shares_conf: &shares_conf,
            url_map: &self.config.url_map,
            preferred_pattern: &self.config.preferred_pattern,
            pre_slots: self.config.pre_slots,
            post_slots: self.config.post_slots,
            delivery_slots: self.config.delivery_slots,
            emergency_slots: self.config.emergency_slots,
            delivery_services: &self.config.delivery_services,
            rng: &mut self.rng,
        };
        queue::revise_queues(&mut ctx);
    }

    fn maybe_dump(&mut self) {
        if self.config.dump_location.is_none() {
            return;
        }
        let due = self
            .last_dump
            .is_none_or(|last| last.elapsed() >= DUMP_INTERVAL);
        if due {
            self.dump_now();
            self.last_dump = Some(Instant::now());
        }
    }

    fn dump_now(&self) {
        if let Some(location) = &self.config.dump_location
            && let Err(err) = self.registry.dump_state(location)
        {
            warn!(path = %location.display(), error = %err, "failed to dump scheduler state");
        }
    }
}
