//! Consistency ledger for shardgate.
//!
//! Mutations that may leave a shard's backends diverged are written to a
//! durable ledger before dispatch and removed once every backend confirmed
//! them. What remains is the work list of the repair pipeline.
//!
//! # Record lifecycle
//!
//! | event                              | ledger effect                        |
//! |------------------------------------|--------------------------------------|
//! | logged request dispatched          | insert, stamped with a fresh version |
//! | every backend succeeded            | delete this and older versions       |
//! | multipart upload completed         | extend the execution delay           |
//! | read saw divergence (read-repair)  | insert with the observed version     |
//! | repair succeeded                   | delete this and older versions       |
//! | repair failed (retryable)          | annotate error, push due time back   |

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod consistent;
mod error;
mod ledger;
mod record;
mod redb_ledger;

pub use consistent::{Completion, ConsistentShardClient, Handled, RequestContext, RequestOutcome};
pub use error::{LedgerError, Result};
pub use ledger::Ledger;
pub use record::{
    ConsistencyRecord, DeleteMarker, NewRecord, ParseRecordMethodError, RecordMethod,
};
pub use redb_ledger::RedbLedger;
