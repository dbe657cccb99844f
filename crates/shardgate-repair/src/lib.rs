//! Asynchronous drift repair for shardgate.
//!
//! Records left in the consistency ledger mark objects whose backends may
//! disagree. Once a record is due, this crate brings every backend of the
//! object's shard back to the version the record names:
//!
//! 1. **Feed**: [`WalFeeder`] claims due records under a lease and hands one
//!    [`WalEntry`] per object to the pipeline.
//! 2. **Filter**: [`DriftFilter`] HEADs the object on every backend and
//!    decides the source and destinations, never overwriting a newer copy.
//! 3. **Repair**: [`RepairWorker`] copies (or deletes) the object, bounded by
//!    a semaphore.
//! 4. **Settle**: the feeder compacts repaired records and defers failed
//!    ones.
//!
//! [`RepairService`] wires the stages together.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entry;
mod error;
mod feeder;
mod filter;
mod service;
mod worker;

pub use entry::{EntryOutcome, WalEntry};
pub use error::{RepairError, RepairErrorKind, Result};
pub use feeder::{CycleStats, WalFeeder};
pub use filter::{decide, DriftFilter, RepairTask, StorageState};
pub use service::{repair, RepairService};
pub use worker::RepairWorker;
