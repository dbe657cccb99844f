//! Ledger trait definition.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{ConsistencyRecord, DeleteMarker, NewRecord};

/// Durable storage for consistency records.
///
/// Records are keyed by `(domain, object_id, version, request_id)` and
/// ordered by version within an object, so compaction is a range delete.
///
/// Claims follow a lease protocol: [`claim_due`](Self::claim_due) marks the
/// returned rows with a deadline, hiding them from concurrent cycles until
/// [`release`](Self::release) or until the lease expires.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// Inserts a record and returns the marker that compacts it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be made durable.
    async fn insert(&self, record: NewRecord) -> Result<DeleteMarker>;

    /// Deletes every record of the marker's object with a version at or
    /// below the marker's. Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage engine fails.
    async fn delete(&self, marker: &DeleteMarker) -> Result<usize>;

    /// Adds `extra` to the execution delay of the exact record behind
    /// `marker`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`](crate::LedgerError::NotFound) if the
    /// record is gone.
    async fn extend_execution_delay(&self, marker: &DeleteMarker, extra: Duration) -> Result<()>;

    /// Claims up to `limit` due records, newest version first, skipping rows
    /// under an unexpired lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage engine fails.
    async fn claim_due(&self, limit: usize, lease: Duration) -> Result<Vec<ConsistencyRecord>>;

    /// Annotates a failed repair and pushes the record's due time to
    /// `now + failure_delay`. A record compacted in the meantime is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage engine fails.
    async fn defer(
        &self,
        record: &ConsistencyRecord,
        error: &str,
        failure_delay: Duration,
    ) -> Result<()>;

    /// Clears the lease of every record still present.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage engine fails.
    async fn release(&self, records: &[ConsistencyRecord]) -> Result<()>;

    /// Returns every record of one object, oldest version first.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage engine fails.
    async fn records(&self, domain: &str, object_id: &str) -> Result<Vec<ConsistencyRecord>>;

    /// Returns the number of stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage engine fails.
    async fn len(&self) -> Result<usize>;

    /// Returns true if no record is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage engine fails.
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
