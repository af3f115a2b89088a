//! Per-state transition handlers.
//!
//! The dispatcher is pure branching over `(status, error?)`: every handler
//! reads the request's current state and error and sets the next status,
//! possibly arming timers. Slow work never happens here; a handler at most
//! touches the registry bookkeeping and the local filesystem (link
//! creation for mapped sources).

use std::time::Duration;

use tracing::{debug, error, info, warn};
use url::Url;

use dtr::{AccessLatency, CacheState, Dtr, DtrStatus, Endpoint, ErrorKind, ErrorLocation, UrlMap};

use crate::registry::DtrList;
use crate::worker::GeneratorSink;

/// Cache checking may have to wait for a large download.
const CACHE_CHECK_TIMEOUT: Duration = Duration::from_secs(3600);
/// Re-check interval while another request caches the same file.
const CACHE_WAIT_RETRY: Duration = Duration::from_secs(10);
/// Deadline for a staging request to become ready.
const STAGING_TIMEOUT: Duration = Duration::from_secs(3600);
/// Deadline for getting a transfer slot before priority aging kicks in.
const TRANSFER_QUEUE_TIMEOUT: Duration = Duration::from_secs(7200);
/// Delay before staging when the transfer queue is already long.
const STAGING_THROTTLE_DELAY: Duration = Duration::from_secs(10);
/// Backoff before a retry attempt.
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Read-only view of the scheduler state the handlers need.
pub(crate) struct TransitionCtx<'a> {
    pub registry: &'a DtrList,
    pub url_map: &'a UrlMap,
    pub preferred_pattern: &'a str,
    pub delivery_slots: usize,
}

/// Advance a request through scheduler-side states until it is queued for
/// a stage, parked on a timer, or final. Cancelled requests are first
/// remapped to the nearest state that still allows cleanup.
pub(crate) fn process(dtr: &mut Dtr, ctx: &TransitionCtx<'_>) {
    if dtr.cancel_requested() {
        map_cancel_state(dtr);
    }
    while dtr.status().needs_scheduler() && dtr.process_due() {
        match dtr.status() {
            DtrStatus::New => on_new(dtr, ctx),
            DtrStatus::CacheWait => on_cache_wait(dtr, ctx),
            DtrStatus::CacheChecked => on_cache_checked(dtr),
            DtrStatus::Resolved => on_resolved(dtr, ctx),
            DtrStatus::ReplicaQueried => on_replica_queried(dtr, ctx),
            DtrStatus::PreCleaned => on_pre_cleaned(dtr, ctx),
            DtrStatus::StagingPreparingWait => on_staging_preparing_wait(dtr),
            DtrStatus::StagedPrepared => on_staged_prepared(dtr, ctx),
            DtrStatus::Transferred => on_transferred(dtr),
            DtrStatus::RequestReleased => on_request_released(dtr),
            DtrStatus::ReplicaRegistered => on_replica_registered(dtr),
            DtrStatus::CacheProcessed => on_cache_processed(dtr, ctx),
            _ => break,
        }
    }
}

/// Run the dispatcher over a request the scheduler just took out of the
/// registry, then either file it back or, in a final state, hand it to
/// the generator and drop its record. The only place a DTR leaves the
/// system.
pub(crate) fn dispatch(mut dtr: Dtr, ctx: &TransitionCtx<'_>, generator: &dyn GeneratorSink) {
    process(&mut dtr, ctx);
    if dtr.is_in_final_state() {
        info!(dtr = %dtr.short_id(), status = %dtr.status(), "returning DTR to generator");
        ctx.registry.remove(dtr.id());
        generator.return_dtr(dtr);
    } else {
        ctx.registry.check_in(dtr);
    }
}

/// Remap a cancelled request by current state into the nearest state that
/// still performs the cleanup already-started work may need. Requests in
/// post-processing states are left alone; the post-processor treats the
/// cancel flag as a sign to clean up rather than an interruption.
pub(crate) fn map_cancel_state(dtr: &mut Dtr) {
    match dtr.status() {
        // nothing has been started yet
        DtrStatus::New | DtrStatus::CheckCache | DtrStatus::CacheWait => {
            dtr.set_status(DtrStatus::CacheProcessed);
        }
        // the cache may have been claimed
        DtrStatus::CacheChecked | DtrStatus::Resolve => {
            dtr.set_status(DtrStatus::ReplicaRegistered);
        }
        // a destination replica may have been pre-registered
        DtrStatus::Resolved
        | DtrStatus::QueryReplica
        | DtrStatus::ReplicaQueried
        | DtrStatus::PreClean
        | DtrStatus::PreCleaned
        | DtrStatus::StagePrepare => {
            dtr.set_status(DtrStatus::RequestReleased);
        }
        // staging requests may be pending as well
        DtrStatus::StagingPreparingWait | DtrStatus::StagedPrepared | DtrStatus::Transfer => {
            dtr.set_status(DtrStatus::Transferred);
        }
        _ => {}
    }
}

fn on_new(dtr: &mut Dtr, ctx: &TransitionCtx<'_>) {
    info!(
        dtr = %dtr.short_id(),
        source = %dtr.source().url(),
        destination = %dtr.destination().url(),
        share = dtr.transfer_share(),
        priority = dtr.priority(),
        "processing new DTR"
    );
    if dtr.cache_state() == CacheState::NonCacheable
        || dtr.cache_parameters().cache_dirs.is_empty()
    {
        debug!(dtr = %dtr.short_id(), "not cacheable or no cache configured, skipping cache check");
        dtr.set_status(DtrStatus::CacheChecked);
    } else {
        dtr.set_timeout(CACHE_CHECK_TIMEOUT);
        if ctx.registry.is_being_cached(dtr) {
            debug!(dtr = %dtr.short_id(), "file is currently being cached, waiting");
            dtr.set_process_time(CACHE_WAIT_RETRY);
            dtr.set_status(DtrStatus::CacheWait);
        } else {
            dtr.set_status(DtrStatus::CheckCache);
        }
    }
}

fn on_cache_wait(dtr: &mut Dtr, ctx: &TransitionCtx<'_>) {
    if dtr.timed_out() {
        error!(dtr = %dtr.short_id(), "timed out while waiting for cache lock");
        dtr.set_error(
            ErrorKind::Cache,
            ErrorLocation::Destination,
            format!("timed out while waiting for cache for {}", dtr.source().url()),
        );
        dtr.set_status(DtrStatus::CacheProcessed);
    } else if ctx.registry.is_being_cached(dtr) {
        debug!(dtr = %dtr.short_id(), "file is still being cached, waiting");
        dtr.set_process_time(CACHE_WAIT_RETRY);
    } else {
        debug!(dtr = %dtr.short_id(), "checking cache again");
        dtr.set_status(DtrStatus::CheckCache);
    }
}

fn on_cache_checked(dtr: &mut Dtr) {
    // A cache-check failure just means the file is treated as uncached.
    dtr.reset_error();
    if dtr.cache_state() == CacheState::CacheAlreadyPresent {
        debug!(dtr = %dtr.short_id(), "destination file is in cache");
        dtr.set_status(DtrStatus::ProcessCache);
    } else if dtr.source().is_index() || dtr.destination().is_index() {
        debug!(dtr = %dtr.short_id(), "source or destination is an index service, will resolve replicas");
        dtr.set_status(DtrStatus::Resolve);
    } else {
        debug!(dtr = %dtr.short_id(), "no index services involved, skipping replica resolution");
        dtr.set_status(DtrStatus::Resolved);
    }
}

fn on_resolved(dtr: &mut Dtr, ctx: &TransitionCtx<'_>) {
    if dtr.error().is_some() {
        // Nothing can be transferred without a resolved replica. Release
        // the cache lock if one was taken, otherwise end the workflow.
        if dtr.cache_state() == CacheState::Cacheable
            && !dtr.cache_parameters().cache_dirs.is_empty()
        {
            error!(dtr = %dtr.short_id(), "index service problem, will release cache lock");
            dtr.set_status(DtrStatus::ProcessCache);
        } else {
            error!(dtr = %dtr.short_id(), "index service problem, moving to end of workflow");
            dtr.set_status(DtrStatus::CacheProcessed);
        }
    } else {
        dtr.source_mut().sort_locations(ctx.preferred_pattern, ctx.url_map);
        debug!(dtr = %dtr.short_id(), "checking source file is present");
        dtr.set_status(DtrStatus::QueryReplica);
    }
}

fn on_replica_queried(dtr: &mut Dtr, ctx: &TransitionCtx<'_>) {
    if dtr.error().is_some() {
        error!(dtr = %dtr.short_id(), "problem with source replica, trying next");
        next_replica(dtr);
        return;
    }
    if !ctx.url_map.is_empty()
        && let Some(mapped) = ctx.url_map.map(dtr.source().current_location())
        && handle_mapped_source(dtr, mapped)
    {
        return;
    }
    if dtr.mapped_source().is_none() && dtr.source().access_latency() == AccessLatency::Large {
        // Prefer a faster replica over long-latency storage when one exists.
        if dtr.source().last_location() {
            info!(
                dtr = %dtr.short_id(),
                replica = %dtr.source().current_location(),
                "no more replicas, accepting long-latency replica"
            );
        } else {
            info!(dtr = %dtr.short_id(), "replica has long latency, trying next replica");
            dtr.source_mut().next_location();
            dtr.set_status(DtrStatus::QueryReplica);
            return;
        }
    }
    if !dtr.is_replication() && overwrite_requested(dtr.destination()) {
        debug!(dtr = %dtr.short_id(), "overwrite requested, will pre-clean destination");
        dtr.set_status(DtrStatus::PreClean);
    } else {
        debug!(dtr = %dtr.short_id(), "no overwrite requested, skipping pre-cleaning");
        dtr.set_status(DtrStatus::PreCleaned);
    }
}

fn overwrite_requested(destination: &dyn Endpoint) -> bool {
    if destination.option("overwrite").as_deref() == Some("yes") {
        return true;
    }
    destination
        .current_location()
        .query_pairs()
        .any(|(k, v)| k == "overwrite" && v == "yes")
}

fn on_pre_cleaned(dtr: &mut Dtr, ctx: &TransitionCtx<'_>) {
    if dtr.error().is_some() {
        info!(dtr = %dtr.short_id(), "pre-clean failed, will still try to copy");
    }
    dtr.reset_error();
    if !dtr.needs_staging() {
        debug!(dtr = %dtr.short_id(), "no staging required, skipping staging");
        dtr.set_status(DtrStatus::StagedPrepared);
        return;
    }
    // Limit how many files are staged ahead of transfer, or pins expire
    // while requests sit in the transfer queue. The highest-priority
    // request in the share may bypass the limit.
    let mut share_queue = 0usize;
    let mut highest_priority = 0u32;
    for waiting in ctx.registry.summaries_with_status(DtrStatus::Transfer) {
        if waiting.share == dtr.transfer_share() && waiting.needs_staging {
            share_queue += 1;
            highest_priority = highest_priority.max(waiting.priority);
        }
    }
    if share_queue >= ctx.delivery_slots * 2 && dtr.priority() <= highest_priority {
        info!(dtr = %dtr.short_id(), "large transfer queue, delaying staging");
        dtr.set_process_time(STAGING_THROTTLE_DELAY);
    } else {
        dtr.set_timeout(STAGING_TIMEOUT);
        debug!(dtr = %dtr.short_id(), "source or destination requires staging");
        dtr.set_status(DtrStatus::StagePrepare);
    }
}

fn on_staging_preparing_wait(dtr: &mut Dtr) {
    if dtr.timed_out() {
        // Cannot tell which end timed out, so make an educated guess from
        // which endpoints are stageable.
        let (location, side) = match (
            dtr.source().is_stageable(),
            dtr.destination().is_stageable(),
        ) {
            (true, false) => (ErrorLocation::Source, "source"),
            (false, true) => (ErrorLocation::Destination, "destination"),
            _ => (ErrorLocation::Unknown, "source or destination"),
        };
        error!(dtr = %dtr.short_id(), "staging request timed out, will release request");
        dtr.set_error(
            ErrorKind::StagingTimeout,
            location,
            format!("stage request for {side} file timed out"),
        );
        dtr.set_status(DtrStatus::ReleaseRequest);
    } else {
        debug!(dtr = %dtr.short_id(), "querying status of staging request");
        dtr.set_status(DtrStatus::StagePrepare);
    }
}

fn on_staged_prepared(dtr: &mut Dtr, ctx: &TransitionCtx<'_>) {
    if dtr.error().is_some() {
        // Staging failed; release any requests before trying another replica.
        debug!(dtr = %dtr.short_id(), "staging failed, releasing requests");
        dtr.set_status(DtrStatus::ReleaseRequest);
        return;
    }
    if !ctx.url_map.is_empty() && dtr.mapped_source().is_none() && dtr.source().is_stageable() {
        for turl in dtr.source().transfer_locations() {
            if let Some(mapped) = ctx.url_map.map(&turl)
                && handle_mapped_source(dtr, mapped)
            {
                return;
            }
        }
    }
    debug!(dtr = %dtr.short_id(), "ready for transfer, moving to delivery queue");
    // Timeouts for the active transfer itself are delivery's business.
    dtr.set_timeout(TRANSFER_QUEUE_TIMEOUT);
    dtr.set_status(DtrStatus::Transfer);
}

fn on_transferred(dtr: &mut Dtr) {
    // A transfer error is not branched on here; the post-processor cleans
    // up either way and the error later drives the replica fallback.
    if let Some(err) = dtr.error() {
        error!(dtr = %dtr.short_id(), error = %err.message, "transfer failed");
    }
    if !dtr.cancel_requested() && dtr.error().is_none() && dtr.cache_state() == CacheState::Cacheable
    {
        dtr.set_cache_state(CacheState::CacheDownloaded);
    }
    if dtr.needs_staging() {
        debug!(dtr = %dtr.short_id(), "releasing requests made during staging");
        dtr.set_status(DtrStatus::ReleaseRequest);
    } else {
        debug!(dtr = %dtr.short_id(), "nothing was staged, skipping request release");
        dtr.set_status(DtrStatus::RequestReleased);
    }
}

fn on_request_released(dtr: &mut Dtr) {
    // A failure in the release step itself is ignored; an earlier error
    // (transfer, staging) means another replica should be tried.
    let earlier_error = dtr
        .error()
        .is_some_and(|e| e.last_error_state != DtrStatus::ReleasingRequest);
    if earlier_error {
        error!(dtr = %dtr.short_id(), "trying next replica");
        next_replica(dtr);
    } else if dtr.destination().is_index() {
        debug!(dtr = %dtr.short_id(), "will update destination index service");
        dtr.set_status(DtrStatus::RegisterReplica);
    } else {
        debug!(dtr = %dtr.short_id(), "destination is not an index service, skipping registration");
        dtr.set_status(DtrStatus::ReplicaRegistered);
    }
}

fn on_replica_registered(dtr: &mut Dtr) {
    // A registration failure cannot be fixed by a different source
    // replica, so go straight to the end of the workflow.
    let registration_error = dtr
        .error()
        .is_some_and(|e| e.last_error_state == DtrStatus::RegisteringReplica);
    let cache_involved = !dtr.cache_parameters().cache_dirs.is_empty()
        && matches!(
            dtr.cache_state(),
            CacheState::CacheAlreadyPresent
                | CacheState::CacheDownloaded
                | CacheState::Cacheable
                | CacheState::CacheNotUsed
        );
    if registration_error {
        error!(dtr = %dtr.short_id(), "error registering replica, moving to end of workflow");
        dtr.set_status(DtrStatus::CacheProcessed);
    } else if cache_involved {
        debug!(dtr = %dtr.short_id(), "will process cache");
        dtr.set_status(DtrStatus::ProcessCache);
    } else {
        debug!(dtr = %dtr.short_id(), "file is not cacheable, skipping cache processing");
        dtr.set_status(DtrStatus::CacheProcessed);
    }
}

fn on_cache_processed(dtr: &mut Dtr, ctx: &TransitionCtx<'_>) {
    // Last stage inside the scheduler; retries start from here.
    ctx.registry.caching_finished(dtr);

    if dtr.cancel_requested() {
        debug!(dtr = %dtr.short_id(), "cancellation complete");
        dtr.set_status(DtrStatus::Cancelled);
        return;
    }
    let Some(err) = dtr.error() else {
        info!(dtr = %dtr.short_id(), "finished successfully");
        dtr.set_status(DtrStatus::Done);
        return;
    };
    let kind = err.kind;
    let last_state = err.last_error_state;

    match last_state {
        DtrStatus::ProcessingCache => {
            // Retry the same replica without the cache.
            error!(dtr = %dtr.short_id(), "error in cache processing, will retry without caching");
            dtr.set_cache_state(CacheState::CacheSkip);
            dtr.reset_error();
            dtr.set_status(DtrStatus::ReplicaQueried);
        }
        DtrStatus::CacheWait => {
            error!(dtr = %dtr.short_id(), "cache wait timed out, will retry without caching");
            dtr.set_cache_state(CacheState::CacheSkip);
            dtr.reset_error();
            dtr.set_status(DtrStatus::CacheChecked);
        }
        _ => {
            dtr.decrease_tries_left();
            if kind.is_recoverable() && dtr.tries_left() > 0 {
                info!(
                    dtr = %dtr.short_id(),
                    tries_left = dtr.tries_left(),
                    "transient failure, waiting before next attempt"
                );
                dtr.set_process_time(RETRY_BACKOFF);
                match last_state {
                    DtrStatus::RegisteringReplica => dtr.set_status(DtrStatus::RegisterReplica),
                    DtrStatus::ReleasingRequest => dtr.set_status(DtrStatus::ReleaseRequest),
                    _ => {
                        // Error before or during transfer: full restart.
                        dtr.reset();
                        dtr.set_status(DtrStatus::New);
                    }
                }
            } else {
                if kind.is_recoverable() {
                    error!(dtr = %dtr.short_id(), "out of retries");
                }
                error!(dtr = %dtr.short_id(), kind = %kind, "permanent failure");
                dtr.set_status(DtrStatus::Error);
            }
        }
    }
}

/// Replica fallback: decide which side failed, advance that side to its
/// next location, or route to the right cleanup state when exhausted.
pub(crate) fn next_replica(dtr: &mut Dtr) {
    let Some(err) = dtr.error() else {
        dtr.set_error(
            ErrorKind::InternalLogic,
            ErrorLocation::Unknown,
            "no error present when looking for next replica",
        );
        return;
    };

    let source_error = match err.location {
        ErrorLocation::Source => true,
        ErrorLocation::Destination => false,
        _ => {
            if dtr.source().is_index() != dtr.destination().is_index() {
                dtr.source().is_index()
            } else if dtr.source().last_location() != dtr.destination().last_location() {
                // the side that still has alternatives gets retried
                !dtr.source().last_location()
            } else {
                true
            }
        }
    };

    let replica_exists = if source_error {
        dtr.set_mapped_source(None);
        dtr.source_mut().next_location()
    } else {
        dtr.destination_mut().next_location()
    };

    let side = if source_error { "source" } else { "destination" };
    if replica_exists {
        dtr.reset_error();
        info!(dtr = %dtr.short_id(), side, "using next replica");
        // Even for a destination error the replica is queried again, as
        // the failure could have been caused by the source mid-transfer.
        dtr.set_status(DtrStatus::QueryReplica);
    } else {
        error!(dtr = %dtr.short_id(), side, "no more replicas");
        if dtr.destination().is_index() {
            debug!(dtr = %dtr.short_id(), "will clean up pre-registered destination");
            dtr.set_status(DtrStatus::RegisterReplica);
        } else if !dtr.cache_parameters().cache_dirs.is_empty()
            && matches!(
                dtr.cache_state(),
                CacheState::CacheAlreadyPresent | CacheState::Cacheable
            )
        {
            debug!(dtr = %dtr.short_id(), "will release cache locks");
            dtr.set_status(DtrStatus::ProcessCache);
        } else {
            debug!(dtr = %dtr.short_id(), "moving to end of workflow");
            dtr.set_status(DtrStatus::CacheProcessed);
        }
    }
}

/// URL-map hit on the source: link locally where allowed, otherwise make
/// the mapped URL the effective source. Returns false when the mapping
/// could not be used and the normal copy should proceed.
pub(crate) fn handle_mapped_source(dtr: &mut Dtr, mut mapped: Url) -> bool {
    info!(dtr = %dtr.short_id(), mapped = %mapped, "source is mapped");

    if !dtr.source().read_only() && mapped.scheme() == "link" {
        // a link would expose writable source data, copy instead
        warn!(dtr = %dtr.short_id(), "cannot link to a modifiable source, will copy instead");
        let rebuilt = mapped.as_str().replacen("link", "file", 1);
        match Url::parse(&rebuilt) {
            Ok(url) => mapped = url,
            Err(parse_err) => {
                warn!(dtr = %dtr.short_id(), error = %parse_err, "cannot rewrite mapped URL");
                return false;
            }
        }
    }

    if mapped.scheme() == "link" {
        if !dtr.destination().is_local() {
            error!(dtr = %dtr.short_id(), "cannot link to a remote destination, ignoring mapped URL");
            return false;
        }
        #[cfg(unix)]
        {
            info!(dtr = %dtr.short_id(), "linking mapped file");
            // The link is created as the scheduler's own user; chowning it
            // to the destination owner needs privileges this process does
            // not hold.
            let target = std::path::PathBuf::from(mapped.path());
            let destination = std::path::PathBuf::from(dtr.destination().current_location().path());
            match std::os::unix::fs::symlink(&target, &destination) {
                Ok(()) => {
                    // linked, so no transfer and no caching of this file
                    dtr.set_mapped_source(Some(mapped));
                    if dtr.cache_state() == CacheState::Cacheable {
                        dtr.set_cache_state(CacheState::CacheNotUsed);
                    }
                    dtr.set_status(DtrStatus::Transferred);
                    return true;
                }
                Err(io_err) => {
                    error!(dtr = %dtr.short_id(), error = %io_err, "failed to create link, ignoring mapped URL");
                }
            }
        }
        #[cfg(not(unix))]
        error!(dtr = %dtr.short_id(), "cannot link on this platform, ignoring mapped URL");
        return false;
    }

    // Mapped URLs are assumed to be plain copies, no index or staging.
    dtr.set_mapped_source(Some(mapped));
    dtr.set_status(DtrStatus::StagedPrepared);
    true
}
