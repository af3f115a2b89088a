//! DTR state machine vocabulary.
//!
//! Every request walks a fixed set of states. Scheduler-side states
//! (`New`, `CacheChecked`, `Resolved`, ...) are acted on by the scheduler
//! each time a request returns from a stage worker. Queued states
//! (`CheckCache`, `Transfer`, ...) mean the request is waiting for an
//! admission slot, and each has an active counterpart (`CheckingCache`,
//! `Transferring`, ...) meaning the request is out at a worker.

use std::fmt;

/// Processing stage a queued request is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PreProcessor,
    Delivery,
    PostProcessor,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::PreProcessor => "pre-processor",
            Stage::Delivery => "delivery",
            Stage::PostProcessor => "post-processor",
        };
        f.write_str(name)
    }
}

/// Status of a data transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtrStatus {
    /// Just received from the generator.
    New,
    /// Waiting for a slot to check the cache.
    CheckCache,
    /// Cache check running in the pre-processor.
    CheckingCache,
    /// Another request is caching the same file; re-check later.
    CacheWait,
    /// Cache check finished.
    CacheChecked,
    /// Waiting for a slot to resolve replicas.
    Resolve,
    /// Replica resolution running in the pre-processor.
    Resolving,
    /// Replica resolution finished.
    Resolved,
    /// Waiting for a slot to query the current replica.
    QueryReplica,
    /// Replica query running in the pre-processor.
    QueryingReplica,
    /// Replica query finished.
    ReplicaQueried,
    /// Waiting for a slot to pre-clean the destination.
    PreClean,
    /// Destination pre-clean running in the pre-processor.
    PreCleaning,
    /// Destination pre-clean finished (or skipped).
    PreCleaned,
    /// Waiting for a slot to issue staging requests.
    StagePrepare,
    /// Staging request running in the pre-processor.
    StagingPreparing,
    /// Staging request issued but not yet ready; poll again later.
    StagingPreparingWait,
    /// Staging finished, transport URLs are known.
    StagedPrepared,
    /// Waiting for a transfer slot.
    Transfer,
    /// Transfer running in delivery.
    Transferring,
    /// Transfer finished.
    Transferred,
    /// Waiting for a slot to release staging requests.
    ReleaseRequest,
    /// Request release running in the post-processor.
    ReleasingRequest,
    /// Staging requests released.
    RequestReleased,
    /// Waiting for a slot to register the new replica.
    RegisterReplica,
    /// Replica registration running in the post-processor.
    RegisteringReplica,
    /// Replica registration finished.
    ReplicaRegistered,
    /// Waiting for a slot to process the cache.
    ProcessCache,
    /// Cache processing running in the post-processor.
    ProcessingCache,
    /// Cache processing finished; terminal decision point.
    CacheProcessed,
    /// Finished successfully.
    Done,
    /// Finished with a permanent error.
    Error,
    /// Finished after a cancellation request.
    Cancelled,
}

impl DtrStatus {
    /// Queued states in admission priority order: pre-processor states
    /// first, then delivery, then post-processor.
    pub const TO_PROCESS_STATES: [DtrStatus; 9] = [
        DtrStatus::CheckCache,
        DtrStatus::Resolve,
        DtrStatus::QueryReplica,
        DtrStatus::PreClean,
        DtrStatus::StagePrepare,
        DtrStatus::Transfer,
        DtrStatus::ReleaseRequest,
        DtrStatus::RegisterReplica,
        DtrStatus::ProcessCache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DtrStatus::New => "NEW",
            DtrStatus::CheckCache => "CHECK_CACHE",
            DtrStatus::CheckingCache => "CHECKING_CACHE",
            DtrStatus::CacheWait => "CACHE_WAIT",
            DtrStatus::CacheChecked => "CACHE_CHECKED",
            DtrStatus::Resolve => "RESOLVE",
            DtrStatus::Resolving => "RESOLVING",
            DtrStatus::Resolved => "RESOLVED",
            DtrStatus::QueryReplica => "QUERY_REPLICA",
            DtrStatus::QueryingReplica => "QUERYING_REPLICA",
            DtrStatus::ReplicaQueried => "REPLICA_QUERIED",
            DtrStatus::PreClean => "PRE_CLEAN",
            DtrStatus::PreCleaning => "PRE_CLEANING",
            DtrStatus::PreCleaned => "PRE_CLEANED",
            DtrStatus::StagePrepare => "STAGE_PREPARE",
            DtrStatus::StagingPreparing => "STAGING_PREPARING",
            DtrStatus::StagingPreparingWait => "STAGING_PREPARING_WAIT",
            DtrStatus::StagedPrepared => "STAGED_PREPARED",
            DtrStatus::Transfer => "TRANSFER",
            DtrStatus::Transferring => "TRANSFERRING",
            DtrStatus::Transferred => "TRANSFERRED",
            DtrStatus::ReleaseRequest => "RELEASE_REQUEST",
            DtrStatus::ReleasingRequest => "RELEASING_REQUEST",
            DtrStatus::RequestReleased => "REQUEST_RELEASED",
            DtrStatus::RegisterReplica => "REGISTER_REPLICA",
            DtrStatus::RegisteringReplica => "REGISTERING_REPLICA",
            DtrStatus::ReplicaRegistered => "REPLICA_REGISTERED",
            DtrStatus::ProcessCache => "PROCESS_CACHE",
            DtrStatus::ProcessingCache => "PROCESSING_CACHE",
            DtrStatus::CacheProcessed => "CACHE_PROCESSED",
            DtrStatus::Done => "DONE",
            DtrStatus::Error => "ERROR",
            DtrStatus::Cancelled => "CANCELLED",
        }
    }

    /// Active counterpart of a queued state, if this is a queued state.
    pub fn active_counterpart(&self) -> Option<DtrStatus> {
        match self {
            DtrStatus::CheckCache => Some(DtrStatus::CheckingCache),
            DtrStatus::Resolve => Some(DtrStatus::Resolving),
            DtrStatus::QueryReplica => Some(DtrStatus::QueryingReplica),
            DtrStatus::PreClean => Some(DtrStatus::PreCleaning),
            DtrStatus::StagePrepare => Some(DtrStatus::StagingPreparing),
            DtrStatus::Transfer => Some(DtrStatus::Transferring),
            DtrStatus::ReleaseRequest => Some(DtrStatus::ReleasingRequest),
            DtrStatus::RegisterReplica => Some(DtrStatus::RegisteringReplica),
            DtrStatus::ProcessCache => Some(DtrStatus::ProcessingCache),
            _ => None,
        }
    }

    /// State a worker hands back after finishing the active state.
    pub fn returned_counterpart(&self) -> Option<DtrStatus> {
        match self {
            DtrStatus::CheckingCache => Some(DtrStatus::CacheChecked),
            DtrStatus::Resolving => Some(DtrStatus::Resolved),
            DtrStatus::QueryingReplica => Some(DtrStatus::ReplicaQueried),
            DtrStatus::PreCleaning => Some(DtrStatus::PreCleaned),
            DtrStatus::StagingPreparing => Some(DtrStatus::StagedPrepared),
            DtrStatus::Transferring => Some(DtrStatus::Transferred),
            DtrStatus::ReleasingRequest => Some(DtrStatus::RequestReleased),
            DtrStatus::RegisteringReplica => Some(DtrStatus::ReplicaRegistered),
            DtrStatus::ProcessingCache => Some(DtrStatus::CacheProcessed),
            _ => None,
        }
    }

    /// Stage a queued state is destined for.
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            DtrStatus::CheckCache
            | DtrStatus::Resolve
            | DtrStatus::QueryReplica
            | DtrStatus::PreClean
            | DtrStatus::StagePrepare => Some(Stage::PreProcessor),
            DtrStatus::Transfer => Some(Stage::Delivery),
            DtrStatus::ReleaseRequest | DtrStatus::RegisterReplica | DtrStatus::ProcessCache => {
                Some(Stage::PostProcessor)
            }
            _ => None,
        }
    }

    pub fn is_destined_for_pre_processor(&self) -> bool {
        self.next_stage() == Some(Stage::PreProcessor)
    }

    pub fn is_destined_for_delivery(&self) -> bool {
        self.next_stage() == Some(Stage::Delivery)
    }

    pub fn is_destined_for_post_processor(&self) -> bool {
        self.next_stage() == Some(Stage::PostProcessor)
    }

    pub fn came_from_pre_processor(&self) -> bool {
        matches!(
            self,
            DtrStatus::CacheWait
                | DtrStatus::CacheChecked
                | DtrStatus::Resolved
                | DtrStatus::ReplicaQueried
                | DtrStatus::PreCleaned
                | DtrStatus::StagingPreparingWait
                | DtrStatus::StagedPrepared
        )
    }

    pub fn came_from_delivery(&self) -> bool {
        matches!(self, DtrStatus::Transferred)
    }

    pub fn came_from_post_processor(&self) -> bool {
        matches!(
            self,
            DtrStatus::RequestReleased | DtrStatus::ReplicaRegistered | DtrStatus::CacheProcessed
        )
    }

    pub fn came_from_generator(&self) -> bool {
        matches!(self, DtrStatus::New)
    }

    /// True for states that need a scheduler pass.
    pub fn needs_scheduler(&self) -> bool {
        self.came_from_generator()
            || self.came_from_pre_processor()
            || self.came_from_delivery()
            || self.came_from_post_processor()
    }

    pub fn is_final(&self) -> bool {
        matches!(self, DtrStatus::Done | DtrStatus::Error | DtrStatus::Cancelled)
    }
}

impl fmt::Display for DtrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
