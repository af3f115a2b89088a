//! # staging-engine
//!
//! The data-staging scheduler: takes independently submitted data
//! transfer requests (DTRs, from the `dtr` crate) and drives each one
//! through a shared finite-state workflow while enforcing per-stage
//! concurrency limits, transfer-share fairness, priorities, cancellation
//! and retry policy.
//!
//! The scheduler performs no I/O itself. The pre-processor, delivery and
//! post-processor stages are external collaborators behind the traits in
//! [`worker`]; this crate ships mock implementations in [`test_utils`]
//! for driving the scheduler in tests.

pub mod registry;
pub mod scheduler;
pub mod shares;
pub mod test_utils;
pub mod worker;

pub use registry::{DtrList, DtrSummary};
pub use scheduler::Scheduler;
pub use shares::{DEFAULT_PRIORITY, DEFAULT_SHARE, ShareType, TransferShares, TransferSharesConf};
pub use worker::{DeliveryWorker, GeneratorSink, SchedulerFeed, StageWorker, StageWorkers};
