//! Shared registry of all in-flight requests.
//!
//! The registry owns every DTR between its arrival from the generator and
//! the final-state handler. While a request is out at a stage worker the
//! registry keeps a summary of it (status, share, priority, flags) so
//! admission control can account for it without touching the moving
//! object; the worker returns the request itself through the scheduler
//! feed and it is checked back in.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use dtr::{CacheState, Dtr, DtrStatus};

/// Accounting snapshot of one registered request.
#[derive(Debug, Clone)]
pub struct DtrSummary {
    pub id: String,
    pub job_id: String,
    pub share: String,
    pub status: DtrStatus,
    pub priority: u32,
    pub cancel_requested: bool,
    pub needs_staging: bool,
    pub timeout: Instant,
    pub source: String,
}

impl DtrSummary {
    fn of(dtr: &Dtr) -> Self {
        Self {
            id: dtr.id().to_owned(),
            job_id: dtr.job_id().to_owned(),
            share: dtr.transfer_share().to_owned(),
            status: dtr.status(),
            priority: dtr.priority(),
            cancel_requested: dtr.cancel_requested(),
            needs_staging: dtr.needs_staging(),
            timeout: dtr.timeout(),
            source: dtr.source().url().as_str().to_owned(),
        }
    }
}

#[derive(Debug)]
struct DtrRecord {
    /// Present while the scheduler owns the request, `None` while it is
    /// out at a stage worker.
    dtr: Option<Dtr>,
    summary: DtrSummary,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, DtrRecord>,
    /// Source URL -> id of the request currently caching that file.
    caching: HashMap<String, String>,
}

/// Global list of active requests, safe for concurrent access.
#[derive(Debug, Default)]
pub struct DtrList {
    inner: Mutex<Inner>,
}

impl DtrList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request.
    pub fn add(&self, dtr: Dtr) {
        let mut inner = self.inner.lock();
        let summary = DtrSummary::of(&dtr);
        if inner
            .records
            .insert(summary.id.clone(), DtrRecord { dtr: Some(dtr), summary })
            .is_some()
        {
            warn!("replaced an already registered DTR");
        }
    }

    /// Check a request out for processing. The record stays behind.
    pub fn take(&self, id: &str) -> Option<Dtr> {
        self.inner.lock().records.get_mut(id)?.dtr.take()
    }

    /// Check a request back in and refresh its summary.
    pub fn check_in(&self, dtr: Dtr) {
        let mut inner = self.inner.lock();
        let summary = DtrSummary::of(&dtr);
        match inner.records.get_mut(dtr.id()) {
            Some(record) => {
                record.summary = summary;
                record.dtr = Some(dtr);
            }
            None => {
                warn!(dtr = %dtr.short_id(), "returned DTR was not registered, adding it");
                inner
                    .records
                    .insert(summary.id.clone(), DtrRecord { dtr: Some(dtr), summary });
            }
        }
    }

    /// Refresh the summary of a request about to leave for a worker.
    /// The caller keeps the request itself and pushes it to the worker.
    pub fn note_away(&self, dtr: &Dtr) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(dtr.id()) {
            record.summary = DtrSummary::of(dtr);
            record.dtr = None;
        }
    }

    /// Drop a request's record. Only the final-state handler calls this.
    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.lock();
        inner.records.remove(id);
        inner.caching.retain(|_, owner| owner != id);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn summaries_with_status(&self, status: DtrStatus) -> Vec<DtrSummary> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.summary.status == status)
            .map(|r| r.summary.clone())
            .collect()
    }

    /// Requests held by the scheduler whose state needs a pass and whose
    /// process time is due.
    pub fn pending_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| {
                r.dtr
                    .as_ref()
                    .is_some_and(|d| d.status().needs_scheduler() && d.process_due())
            })
            .map(|r| r.summary.id.clone())
            .collect()
    }

    /// Distinct job IDs over all registered requests.
    pub fn jobs(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut jobs: Vec<String> = inner
            .records
            .values()
            .map(|r| r.summary.job_id.clone())
            .collect();
        jobs.sort_unstable();
        jobs.dedup();
        jobs
    }

    /// Flag every request of a job for cancellation. Requests out at a
    /// worker keep the flag in their summary and pick it up on return.
    pub fn cancel_job(&self, job_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let mut flagged = 0;
        for record in inner.records.values_mut() {
            if record.summary.job_id != job_id {
                continue;
            }
            record.summary.cancel_requested = true;
            if let Some(dtr) = record.dtr.as_mut() {
                dtr.set_cancel_request();
            }
            flagged += 1;
        }
        flagged
    }

    /// True if cancellation was requested for this request while it was
    /// out at a worker.
    pub fn cancel_pending(&self, id: &str) -> bool {
        self.inner
            .lock()
            .records
            .get(id)
            .is_some_and(|r| r.summary.cancel_requested)
    }

    /// Bump a queued request's priority and re-arm its aging timeout.
    pub fn boost_priority(&self, id: &str, priority: u32, timeout: std::time::Duration) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(id)
            && let Some(dtr) = record.dtr.as_mut()
        {
            dtr.set_priority(priority);
            dtr.set_timeout(timeout);
            record.summary.priority = dtr.priority();
            record.summary.timeout = dtr.timeout();
        }
    }

    /// Record that `dtr` started caching its source. No-op unless the
    /// request is actually cacheable.
    pub fn caching_started(&self, dtr: &Dtr) {
        if dtr.cache_state() != CacheState::Cacheable {
            return;
        }
        let mut inner = self.inner.lock();
        let source = dtr.source().url().as_str().to_owned();
        inner.caching.entry(source).or_insert_with(|| dtr.id().to_owned());
    }

    /// Release the caching claim held by `dtr`, if any.
    pub fn caching_finished(&self, dtr: &Dtr) {
        let mut inner = self.inner.lock();
        let source = dtr.source().url().as_str();
        if inner.caching.get(source).is_some_and(|owner| owner == dtr.id()) {
            inner.caching.remove(source);
        }
    }

    /// True if another request is currently caching the same source.
    pub fn is_being_cached(&self, dtr: &Dtr) -> bool {
        self.inner
            .lock()
            .caching
            .get(dtr.source().url().as_str())
            .is_some_and(|owner| owner != dtr.id())
    }

    /// Write a one-line-per-request dump for external inspection.
    pub fn dump_state(&self, path: &Path) -> std::io::Result<()> {
        let mut out = Vec::new();
        {
            let inner = self.inner.lock();
            let mut summaries: Vec<&DtrSummary> =
                inner.records.values().map(|r| &r.summary).collect();
            summaries.sort_by(|a, b| a.id.cmp(&b.id));
            for s in summaries {
                writeln!(
                    out,
                    "{} job={} share={} priority={} status={}",
                    s.id, s.job_id, s.share, s.priority, s.status
                )?;
            }
        }
        std::fs::write(path, out)
    }
}
