//! The Data Transfer Request.
//!
//! A `Dtr` describes one file move between two endpoints. It is created by
//! a generator, handed to the scheduler, and travels between the scheduler
//! and the stage workers by value: whoever holds the struct owns it, so no
//! field is ever mutated from two places at once.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::{DtrError, ErrorKind, ErrorLocation};
use crate::status::DtrStatus;

/// Sentinel delivery-service URL meaning "copy in-process".
static LOCAL_DELIVERY: LazyLock<Url> =
    LazyLock::new(|| Url::parse("file:///local").expect("static URL"));

pub fn local_delivery() -> Url {
    LOCAL_DELIVERY.clone()
}

/// Cache disposition of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheState {
    /// File cannot or must not be cached.
    #[default]
    NonCacheable,
    /// File may be cached.
    Cacheable,
    /// File was already present in the cache.
    CacheAlreadyPresent,
    /// File was downloaded into the cache by this request.
    CacheDownloaded,
    /// Caching was turned off for this request (e.g. linked instead).
    CacheNotUsed,
    /// Caching failed earlier; retry without the cache.
    CacheSkip,
}

/// Cache directories available to this request. Empty means no cache is
/// configured and cache checking is skipped entirely.
#[derive(Debug, Clone, Default)]
pub struct CacheParameters {
    pub cache_dirs: Vec<PathBuf>,
}

/// Transfer tuning forwarded to the delivery backend.
#[derive(Debug, Clone, Copy)]
pub struct TransferParameters {
    /// Minimum instantaneous speed in bytes/s before a transfer is failed.
    pub min_transfer_speed: u64,
    /// Window over which the average speed is computed.
    pub averaging_time: Duration,
    /// Minimum average speed in bytes/s over the averaging window.
    pub min_average_speed: u64,
    /// Maximum time without any data before a transfer is failed.
    pub max_inactivity_time: Duration,
}

impl Default for TransferParameters {
    fn default() -> Self {
        Self {
            min_transfer_speed: 0,
            averaging_time: Duration::from_secs(300),
            min_average_speed: 0,
            max_inactivity_time: Duration::from_secs(300),
        }
    }
}

/// Upper bound on remembered transitions, enough for several retry cycles.
const TRAIL_LIMIT: usize = 64;

/// One data transfer request.
#[derive(Debug)]
pub struct Dtr {
    id: String,
    job_id: String,
    owner: String,
    source: Box<dyn Endpoint>,
    destination: Box<dyn Endpoint>,
    status: DtrStatus,
    error: Option<DtrError>,
    priority: u32,
    transfer_share: String,
    cache_state: CacheState,
    cache_parameters: CacheParameters,
    tries_left: u32,
    initial_tries: u32,
    timeout: Instant,
    process_time: Instant,
    cancel_requested: bool,
    is_replication: bool,
    mapped_source: Option<Url>,
    delivery_endpoint: Url,
    bytes_transferred: u64,
    created: SystemTime,
    trail: Vec<DtrStatus>,
}

impl Dtr {
    pub fn new(
        source: Box<dyn Endpoint>,
        destination: Box<dyn Endpoint>,
        job_id: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        let mut dtr = Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            owner: owner.into(),
            source,
            destination,
            status: DtrStatus::New,
            error: None,
            priority: 50,
            transfer_share: "_default".to_owned(),
            cache_state: CacheState::NonCacheable,
            cache_parameters: CacheParameters::default(),
            tries_left: 1,
            initial_tries: 1,
            timeout: now + Duration::from_secs(60),
            process_time: now,
            cancel_requested: false,
            is_replication: false,
            mapped_source: None,
            delivery_endpoint: local_delivery(),
            bytes_transferred: 0,
            created: SystemTime::now(),
            trail: vec![DtrStatus::New],
        };

        // Identical endpoints are only allowed for replication inside an
        // index service; the physical replicas are distinguished later.
        if dtr.source.url() == dtr.destination.url() {
            if dtr.source.is_index() && dtr.destination.is_index() {
                dtr.is_replication = true;
            } else {
                dtr.error = Some(DtrError::new(
                    ErrorKind::SelfReplication,
                    ErrorLocation::None,
                    "cannot replicate a file to itself",
                    DtrStatus::New,
                ));
            }
        }
        dtr
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.set_priority(priority);
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.set_tries_left(tries);
        self
    }

    pub fn with_cache_state(mut self, state: CacheState) -> Self {
        self.cache_state = state;
        self
    }

    pub fn with_cache_parameters(mut self, parameters: CacheParameters) -> Self {
        self.cache_parameters = parameters;
        self
    }

    /// False when construction already recorded an error; an invalid DTR
    /// is bounced straight back to the generator.
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Abbreviated ID for log lines.
    pub fn short_id(&self) -> String {
        if self.id.len() < 8 {
            return self.id.clone();
        }
        format!("{}...{}", &self.id[..4], &self.id[self.id.len() - 4..])
    }

    pub fn source(&self) -> &dyn Endpoint {
        self.source.as_ref()
    }

    pub fn source_mut(&mut self) -> &mut dyn Endpoint {
        self.source.as_mut()
    }

    pub fn destination(&self) -> &dyn Endpoint {
        self.destination.as_ref()
    }

    pub fn destination_mut(&mut self) -> &mut dyn Endpoint {
        self.destination.as_mut()
    }

    pub fn status(&self) -> DtrStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DtrStatus) {
        debug!(dtr = %self.short_id(), from = %self.status, to = %status, "status change");
        self.status = status;
        if self.trail.len() < TRAIL_LIMIT {
            self.trail.push(status);
        }
    }

    /// Transition history since creation, capped at [`TRAIL_LIMIT`].
    pub fn status_trail(&self) -> &[DtrStatus] {
        &self.trail
    }

    pub fn error(&self) -> Option<&DtrError> {
        self.error.as_ref()
    }

    /// Record an error, remembering the current status as the state the
    /// error happened in.
    pub fn set_error(&mut self, kind: ErrorKind, location: ErrorLocation, message: impl Into<String>) {
        self.error = Some(DtrError::new(kind, location, message, self.status));
    }

    /// Record an error attributed to an explicit earlier state.
    pub fn set_error_in_state(
        &mut self,
        kind: ErrorKind,
        location: ErrorLocation,
        message: impl Into<String>,
        state: DtrStatus,
    ) {
        self.error = Some(DtrError::new(kind, location, message, state));
    }

    pub fn reset_error(&mut self) {
        self.error = None;
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority.clamp(1, 100);
    }

    pub fn transfer_share(&self) -> &str {
        &self.transfer_share
    }

    pub fn set_transfer_share(&mut self, share: impl Into<String>) {
        self.transfer_share = share.into();
    }

    pub fn cache_state(&self) -> CacheState {
        self.cache_state
    }

    pub fn set_cache_state(&mut self, state: CacheState) {
        self.cache_state = state;
    }

    pub fn cache_parameters(&self) -> &CacheParameters {
        &self.cache_parameters
    }

    pub fn tries_left(&self) -> u32 {
        self.tries_left
    }

    pub fn initial_tries(&self) -> u32 {
        self.initial_tries
    }

    pub fn set_tries_left(&mut self, tries: u32) {
        self.initial_tries = tries;
        self.tries_left = tries;
    }

    pub fn decrease_tries_left(&mut self) {
        self.tries_left = self.tries_left.saturating_sub(1);
    }

    /// Arm the absolute deadline for the current waiting state.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Instant::now() + timeout;
    }

    pub fn timeout(&self) -> Instant {
        self.timeout
    }

    pub fn timed_out(&self) -> bool {
        self.timeout <= Instant::now()
    }

    /// Delay the next scheduler pass over this request.
    pub fn set_process_time(&mut self, delay: Duration) {
        self.process_time = Instant::now() + delay;
    }

    pub fn process_due(&self) -> bool {
        self.process_time <= Instant::now()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Flag the request for cancellation and make it due immediately.
    pub fn set_cancel_request(&mut self) {
        self.cancel_requested = true;
        self.process_time = Instant::now();
    }

    pub fn is_replication(&self) -> bool {
        self.is_replication
    }

    pub fn mapped_source(&self) -> Option<&Url> {
        self.mapped_source.as_ref()
    }

    pub fn set_mapped_source(&mut self, url: Option<Url>) {
        self.mapped_source = url;
    }

    pub fn delivery_endpoint(&self) -> &Url {
        &self.delivery_endpoint
    }

    pub fn set_delivery_endpoint(&mut self, url: Url) {
        self.delivery_endpoint = url;
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn set_bytes_transferred(&mut self, bytes: u64) {
        self.bytes_transferred = bytes;
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Undo per-attempt state before re-entering the workflow at `New`.
    pub fn reset(&mut self) {
        if self.source.is_index() {
            self.source.clear_locations();
        }
        if self.destination.is_index() {
            self.destination.clear_locations();
        }
        self.mapped_source = None;
        self.bytes_transferred = 0;
        self.error = None;
    }

    pub fn is_destined_for_pre_processor(&self) -> bool {
        self.status.is_destined_for_pre_processor()
    }

    pub fn is_destined_for_delivery(&self) -> bool {
        self.status.is_destined_for_delivery()
    }

    pub fn is_destined_for_post_processor(&self) -> bool {
        self.status.is_destined_for_post_processor()
    }

    pub fn is_in_final_state(&self) -> bool {
        self.status.is_final()
    }

    /// True if either endpoint needs an explicit staging step.
    pub fn needs_staging(&self) -> bool {
        self.source.is_stageable() || self.destination.is_stageable()
    }
}
