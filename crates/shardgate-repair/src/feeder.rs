//! WAL feeder: turns due ledger records into repair work.
//!
//! Each cycle claims a batch of due records under a lease, keeps the newest
//! record per object (its delete marker also covers the older ones), hands
//! one [`WalEntry`] per object to the pipeline, and settles the ledger from
//! the outcomes:
//!
//! | outcome               | ledger                                   |
//! |-----------------------|------------------------------------------|
//! | repaired              | delete this and older versions           |
//! | failed, retryable     | annotate, due again after failure delay  |
//! | failed, terminal      | delete, logged as an error               |
//! | abandoned / timed out | untouched, retried next cycle            |
//!
//! Claimed rows are released at the end of the cycle, except those of
//! objects still in flight; their lease keeps other cycles away.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, gauge, histogram};
use shardgate_core::FeederConfig;
use shardgate_watchdog::{ConsistencyRecord, Ledger};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entry::{EntryOutcome, WalEntry};
use crate::error::Result;

/// Counters for one feeder cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Records claimed from the ledger.
    pub claimed: usize,
    /// Entries handed to the pipeline.
    pub dispatched: usize,
    /// Entries repaired and compacted.
    pub repaired: usize,
    /// Entries deferred after a retryable failure.
    pub deferred: usize,
    /// Entries dropped after a terminal failure.
    pub dropped: usize,
    /// Entries abandoned by the pipeline or still running at the deadline.
    pub abandoned: usize,
}

/// Drives records from the ledger into the repair pipeline.
pub struct WalFeeder {
    ledger: Arc<dyn Ledger>,
    config: FeederConfig,
}

impl WalFeeder {
    /// Creates a feeder over `ledger`.
    pub fn new(ledger: Arc<dyn Ledger>, config: FeederConfig) -> Self {
        Self { ledger, config }
    }

    /// Runs one claim, dispatch and settle cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the claim or the final release fails. Failures
    /// settling individual records are logged and the cycle continues.
    pub async fn run_cycle(&self, tx: &mpsc::Sender<WalEntry>) -> Result<CycleStats> {
        let start = Instant::now();
        let claimed =
            self.ledger.claim_due(self.config.batch_size, self.config.lease_duration()).await?;
        let mut stats = CycleStats { claimed: claimed.len(), ..CycleStats::default() };
        if claimed.is_empty() {
            return Ok(stats);
        }

        // Claims arrive newest first.
        let mut seen = HashSet::new();
        let newest: Vec<&ConsistencyRecord> = claimed
            .iter()
            .filter(|r| seen.insert((r.domain.as_str(), r.object_id.as_str())))
            .collect();
        debug!(claimed = claimed.len(), objects = newest.len(), "Claimed due records");

        let mut pending = FuturesUnordered::new();
        let mut in_flight = HashSet::new();
        for record in newest {
            let (entry, rx) = WalEntry::new(record.clone());
            if tx.send(entry).await.is_err() {
                warn!("Repair pipeline closed, stopping dispatch");
                break;
            }
            stats.dispatched += 1;
            in_flight.insert((record.domain.as_str(), record.object_id.as_str()));
            pending.push(async move { (record, rx.await) });
        }
        gauge!("shardgate_feeder_in_flight").set(in_flight.len() as f64);

        let deadline = tokio::time::Instant::now() + self.config.cycle_timeout_duration();
        loop {
            let next = match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    warn!(outstanding = pending.len(), "Feeder cycle timed out");
                    stats.abandoned += pending.len();
                    break;
                }
            };
            let (record, outcome) = next;
            in_flight.remove(&(record.domain.as_str(), record.object_id.as_str()));
            let outcome = outcome.unwrap_or(EntryOutcome::Abandoned);
            self.settle(record, outcome, &mut stats).await;
        }
        drop(pending);

        let release: Vec<ConsistencyRecord> = claimed
            .iter()
            .filter(|r| !in_flight.contains(&(r.domain.as_str(), r.object_id.as_str())))
            .cloned()
            .collect();
        self.ledger.release(&release).await?;
        gauge!("shardgate_feeder_in_flight").set(0.0);
        histogram!("shardgate_feeder_cycle_duration_seconds").record(start.elapsed().as_secs_f64());

        info!(
            claimed = stats.claimed,
            repaired = stats.repaired,
            deferred = stats.deferred,
            dropped = stats.dropped,
            abandoned = stats.abandoned,
            duration_ms = start.elapsed().as_millis(),
            "Feeder cycle finished"
        );
        Ok(stats)
    }

    async fn settle(
        &self,
        record: &ConsistencyRecord,
        outcome: EntryOutcome,
        stats: &mut CycleStats,
    ) {
        let (label, result) = match outcome {
            EntryOutcome::Repaired => {
                stats.repaired += 1;
                ("repaired", self.ledger.delete(&record.marker()).await.map(drop))
            }
            EntryOutcome::Failed(e) if e.is_retryable() => {
                stats.deferred += 1;
                let delay = self.config.failure_delay_duration();
                debug!(object = %record.object_id, error = %e, "Deferring record");
                ("deferred", self.ledger.defer(record, &e.to_string(), delay).await)
            }
            EntryOutcome::Failed(e) => {
                stats.dropped += 1;
                error!(
                    domain = %record.domain,
                    object = %record.object_id,
                    version = %record.object_version,
                    error = %e,
                    "Dropping unrepairable record"
                );
                ("dropped", self.ledger.delete(&record.marker()).await.map(drop))
            }
            EntryOutcome::Abandoned => {
                stats.abandoned += 1;
                ("abandoned", Ok(()))
            }
        };
        counter!("shardgate_feeder_records_total", "outcome" => label).increment(1);
        if let Err(e) = result {
            warn!(object = %record.object_id, outcome = label, error = %e, "Failed to settle");
        }
    }

    /// Runs cycles until `shutdown` fires or the pipeline goes away.
    ///
    /// Sleeps for the poll interval whenever a cycle finds nothing due or
    /// fails.
    pub async fn run(self, tx: mpsc::Sender<WalEntry>, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "WAL feeder started"
        );

        loop {
            let idle = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.run_cycle(&tx) => match result {
                    Ok(stats) => stats.claimed == 0,
                    Err(e) => {
                        warn!(error = %e, "Feeder cycle failed");
                        true
                    }
                },
            };
            if tx.is_closed() {
                break;
            }
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval_duration()) => {}
                }
            }
        }
        info!("WAL feeder stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shardgate_core::{HlcTimestamp, ObjectVersion};
    use shardgate_watchdog::{NewRecord, RecordMethod, RedbLedger};

    use super::*;
    use crate::error::{RepairError, RepairErrorKind};

    const DOMAIN: &str = "s3.example.com";

    fn version(n: u64) -> ObjectVersion {
        ObjectVersion::new(HlcTimestamp::from_parts(n, 0))
    }

    async fn ledger_with(records: &[(&str, u64)]) -> Arc<RedbLedger> {
        let ledger = Arc::new(RedbLedger::open_in_memory().unwrap());
        for (i, (object, v)) in records.iter().enumerate() {
            let record = NewRecord::new(DOMAIN, *object, RecordMethod::Put, Duration::ZERO)
                .request_id(format!("r{i}"))
                .version(version(*v));
            ledger.insert(record).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        ledger
    }

    fn feeder(ledger: &Arc<RedbLedger>) -> WalFeeder {
        let config = FeederConfig::default().failure_delay(Duration::from_secs(600));
        WalFeeder::new(Arc::clone(ledger) as Arc<dyn Ledger>, config)
    }

    /// Answers every entry with `result` and returns the records seen.
    fn pipeline(
        result: Option<RepairError>,
    ) -> (mpsc::Sender<WalEntry>, tokio::task::JoinHandle<Vec<ConsistencyRecord>>) {
        let (tx, mut rx) = mpsc::channel::<WalEntry>(16);
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(entry) = rx.recv().await {
                seen.push(entry.record().clone());
                match &result {
                    Some(e) => entry.finish(Err(e.clone())),
                    None => entry.finish(Ok(())),
                }
            }
            seen
        });
        (tx, handle)
    }

    #[tokio::test]
    async fn test_repaired_records_are_compacted() {
        let ledger = ledger_with(&[("b/k", 1), ("b/other", 2)]).await;
        let (tx, handle) = pipeline(None);

        let stats = feeder(&ledger).run_cycle(&tx).await.unwrap();
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.repaired, 2);
        assert!(ledger.is_empty().await.unwrap());

        drop(tx);
        assert_eq!(handle.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_only_newest_record_per_object_is_dispatched() {
        let ledger = ledger_with(&[("b/k", 1), ("b/k", 3), ("b/k", 2)]).await;
        let (tx, handle) = pipeline(None);

        let stats = feeder(&ledger).run_cycle(&tx).await.unwrap();
        assert_eq!(stats.claimed, 3);
        assert_eq!(stats.dispatched, 1);
        assert!(ledger.is_empty().await.unwrap());

        drop(tx);
        let seen = handle.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].object_version, version(3));
    }

    #[tokio::test]
    async fn test_retryable_failure_defers_record() {
        let ledger = ledger_with(&[("b/k", 1)]).await;
        let (tx, _handle) = pipeline(Some(RepairError::new(RepairErrorKind::Transport, "down")));

        let stats = feeder(&ledger).run_cycle(&tx).await.unwrap();
        assert_eq!(stats.deferred, 1);

        let records = ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].error.as_deref().is_some_and(|e| e.contains("down")));

        let next = feeder(&ledger).run_cycle(&tx).await.unwrap();
        assert_eq!(next.claimed, 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_drops_record() {
        let ledger = ledger_with(&[("b/k", 1)]).await;
        let (tx, _handle) = pipeline(Some(RepairError::new(RepairErrorKind::Permission, "no")));

        let stats = feeder(&ledger).run_cycle(&tx).await.unwrap();
        assert_eq!(stats.dropped, 1);
        assert!(ledger.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_entry_is_released() {
        let ledger = ledger_with(&[("b/k", 1)]).await;
        let (tx, mut rx) = mpsc::channel::<WalEntry>(16);
        let dropper = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                drop(entry);
            }
        });

        let stats = feeder(&ledger).run_cycle(&tx).await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(ledger.len().await.unwrap(), 1);

        // Released, so the next cycle claims it again.
        let next = feeder(&ledger).run_cycle(&tx).await.unwrap();
        assert_eq!(next.claimed, 1);

        drop(tx);
        dropper.await.unwrap();
    }

    #[tokio::test]
    async fn test_records_not_yet_due_are_skipped() {
        let ledger = Arc::new(RedbLedger::open_in_memory().unwrap());
        ledger
            .insert(NewRecord::new(DOMAIN, "b/k", RecordMethod::Put, Duration::from_secs(300)))
            .await
            .unwrap();
        let (tx, _handle) = pipeline(None);

        let stats = feeder(&ledger).run_cycle(&tx).await.unwrap();
        assert_eq!(stats, CycleStats::default());
        assert_eq!(ledger.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let ledger = ledger_with(&[("b/k", 1)]).await;
        let (tx, _handle) = pipeline(None);
        let shutdown = CancellationToken::new();

        let config = FeederConfig::default().poll_interval(Duration::from_millis(10));
        let feeder = WalFeeder::new(Arc::clone(&ledger) as Arc<dyn Ledger>, config);
        let run = tokio::spawn(feeder.run(tx, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ledger.is_empty().await.unwrap());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
    }
}
