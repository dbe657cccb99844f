//! Work items handed from the feeder to the repair pipeline.

use shardgate_watchdog::ConsistencyRecord;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::RepairError;

/// How the pipeline settled one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The object converged, or already was.
    Repaired,
    /// Repair failed.
    Failed(RepairError),
    /// The entry was dropped without being finished.
    Abandoned,
}

/// A claimed record plus the callback that reports its outcome.
///
/// The callback fires exactly once: through [`finish`](Self::finish), or as
/// [`EntryOutcome::Abandoned`] when the entry is dropped unfinished.
#[derive(Debug)]
pub struct WalEntry {
    record: ConsistencyRecord,
    reply: Option<oneshot::Sender<EntryOutcome>>,
}

impl WalEntry {
    /// Creates an entry and the receiver of its outcome.
    pub fn new(record: ConsistencyRecord) -> (Self, oneshot::Receiver<EntryOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { record, reply: Some(tx) }, rx)
    }

    /// Returns the record to converge.
    pub fn record(&self) -> &ConsistencyRecord {
        &self.record
    }

    /// Reports the outcome.
    pub fn finish(mut self, result: Result<(), RepairError>) {
        let outcome = match result {
            Ok(()) => EntryOutcome::Repaired,
            Err(e) => EntryOutcome::Failed(e),
        };
        self.reply(outcome);
    }

    fn reply(&mut self, outcome: EntryOutcome) {
        if let Some(tx) = self.reply.take() {
            if tx.send(outcome).is_err() {
                trace!(object = %self.record.object_id, "Entry outcome receiver gone");
            }
        }
    }
}

impl Drop for WalEntry {
    fn drop(&mut self) {
        self.reply(EntryOutcome::Abandoned);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use shardgate_core::{HlcTimestamp, ObjectVersion};
    use shardgate_watchdog::RecordMethod;

    use super::*;
    use crate::error::RepairErrorKind;

    fn record() -> ConsistencyRecord {
        ConsistencyRecord {
            request_id: "r".into(),
            object_id: "b/k".into(),
            method: RecordMethod::Put,
            domain: "d".into(),
            access_key: String::new(),
            object_version: ObjectVersion::new(HlcTimestamp::zero()),
            execution_delay: Duration::ZERO,
            error: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_finish_reports_once() {
        let (entry, rx) = WalEntry::new(record());
        entry.finish(Err(RepairError::new(RepairErrorKind::Transport, "down")));
        assert!(matches!(rx.await.unwrap(), EntryOutcome::Failed(e) if e.message() == "down"));
    }

    #[tokio::test]
    async fn test_drop_reports_abandoned() {
        let (entry, rx) = WalEntry::new(record());
        drop(entry);
        assert_eq!(rx.await.unwrap(), EntryOutcome::Abandoned);
    }

    #[tokio::test]
    async fn test_success() {
        let (entry, rx) = WalEntry::new(record());
        assert_eq!(entry.record().object_id, "b/k");
        entry.finish(Ok(()));
        assert_eq!(rx.await.unwrap(), EntryOutcome::Repaired);
    }
}
