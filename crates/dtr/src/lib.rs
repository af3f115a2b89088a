//! # dtr
//!
//! Data model for data-staging transfer requests.
//!
//! A Data Transfer Request (DTR) describes one file move between a source
//! and a destination endpoint, possibly through caching, index-service
//! resolution and staging. This crate defines the request itself, its
//! state machine vocabulary, the error taxonomy carried on it, the
//! endpoint capability abstraction, and the URL rewrite table. The
//! scheduler that drives requests through the workflow lives in the
//! `staging-engine` crate.

mod dtr;
pub mod endpoint;
pub mod error;
pub mod status;
pub mod urlmap;

pub use dtr::{CacheParameters, CacheState, Dtr, TransferParameters, local_delivery};
pub use endpoint::{AccessLatency, Endpoint, IndexEndpoint, PlainEndpoint, Replica};
pub use error::{DtrError, ErrorKind, ErrorLocation};
pub use status::{DtrStatus, Stage};
pub use urlmap::UrlMap;
