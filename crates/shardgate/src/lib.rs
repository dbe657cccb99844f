//! Shardgate: a replicating S3 reverse proxy.
//!
//! Requests are routed by Host header to a region (a shard of S3
//! backends), fanned out to every backend, and answered from the first
//! acceptable response. Writes that might leave the backends diverged are
//! recorded in a durable ledger and repaired in the background.
//!
//! ```text
//! client --> router --> ConsistentShardClient --> ShardClient --> backends
//!                              |                                     ^
//!                              v                                     |
//!                          RedbLedger --> RepairService -------------+
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod router;

pub use router::{create_router, ProxyState};
