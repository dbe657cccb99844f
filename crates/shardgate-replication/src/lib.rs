//! Fan-out replication and response arbitration for shardgate.
//!
//! Every object lives on every backend of its shard. A logical request is
//! sent to all of them concurrently; a picker decides which single outcome
//! the client sees, and the summary of all outcomes feeds the consistency
//! ledger.
//!
//! ```text
//! Client request
//!      │
//!      ▼
//! ┌─────────────┐   pick(domain)   ┌───────────────┐
//! │ ShardClient │─────────────────►│ ShardResolver │
//! └──────┬──────┘                  └───────────────┘
//!        │ send
//!        ▼
//! ┌───────────────────┐
//! │ ReplicationClient │──► backend A ─┐
//! │   (one task per   │──► backend B ─┼─► mpsc<BackendResponse>
//! │     backend)      │──► backend C ─┘          │
//! └───────────────────┘                          ▼
//!                                      ┌─────────────────┐
//!                                      │ ResponsePicker  │──► client response
//!                                      │ object/delete/  │──► ReplicationSummary
//!                                      │ list            │
//!                                      └─────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod client;
mod error;
mod listing;
mod picker;
mod response;
mod shard;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export backend types
pub use backend::{clone_request, Backend, HttpBackend, S3Request, S3Response, ACCESS_KEY_HEADER};
// Re-export fan-out and picking
pub use client::ReplicationClient;
pub use error::{BackendError, ReplicationError, Result};
pub use listing::{
    merge_listings, CommonPrefix, ListBucketResult, ListEntry, ListParams, MergedListing, Owner,
    DEFAULT_MAX_KEYS,
};
pub use picker::{
    DeletePicker, ListPicker, ObjectPicker, Picked, ResponsePicker, LISTING_MISMATCH_HEADER,
};
pub use response::{BackendResponse, FailedBackend, ReplicationSummary, SummaryHandle};
// Re-export shard routing
pub use shard::{
    route_multipart, Dispatched, ShardClient, ShardResolver, StaticShardResolver,
    REQUEST_ID_HEADER,
};
