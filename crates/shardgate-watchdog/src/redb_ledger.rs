//! redb-based consistency ledger.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use metrics::counter;
use redb::{Database, Durability, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use shardgate_core::{HlcClock, HlcTimestamp, ObjectVersion};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::record::{ConsistencyRecord, DeleteMarker, NewRecord, RecordMethod};

/// Records table: "domain\0object_id\0version\0request_id" -> StoredRecord (bincode)
const RECORDS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("consistency_records");

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    request_id: String,
    object_id: String,
    method: RecordMethod,
    domain: String,
    access_key: String,
    version: u64,
    execution_delay_ms: u64,
    error: Option<String>,
    updated_at_millis: i64,
    leased_until_millis: Option<i64>,
}

impl StoredRecord {
    fn to_record(&self) -> ConsistencyRecord {
        ConsistencyRecord {
            request_id: self.request_id.clone(),
            object_id: self.object_id.clone(),
            method: self.method,
            domain: self.domain.clone(),
            access_key: self.access_key.clone(),
            object_version: ObjectVersion::new(HlcTimestamp::from_raw(self.version)),
            execution_delay: Duration::from_millis(self.execution_delay_ms),
            error: self.error.clone(),
            updated_at: Utc
                .timestamp_millis_opt(self.updated_at_millis)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }

    fn key(&self) -> String {
        record_key(
            &self.domain,
            &self.object_id,
            ObjectVersion::new(HlcTimestamp::from_raw(self.version)),
            &self.request_id,
        )
    }

    fn is_leased(&self, now_millis: i64) -> bool {
        self.leased_until_millis.is_some_and(|until| until > now_millis)
    }
}

fn db_err(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Database(e.to_string())
}

fn codec_err(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Codec(e.to_string())
}

fn task_err(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Task(e.to_string())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Prefix shared by every record of one object: "domain\0object_id\0"
fn object_prefix(domain: &str, object_id: &str) -> String {
    format!("{domain}\0{object_id}\0")
}

/// Versions are fixed-width decimals, so keys sort by version within an
/// object.
fn record_key(domain: &str, object_id: &str, version: ObjectVersion, request_id: &str) -> String {
    format!("{}{version}\0{request_id}", object_prefix(domain, object_id))
}

fn marker_key(marker: &DeleteMarker) -> String {
    record_key(&marker.domain, &marker.object_id, marker.version, &marker.request_id)
}

/// Consistency ledger backed by redb.
///
/// All redb work runs on the blocking pool. Versions come from an HLC that
/// is advanced past the newest stored record on open.
pub struct RedbLedger {
    db: Arc<Database>,
    durability: Durability,
    clock: Arc<HlcClock>,
}

impl RedbLedger {
    /// Open or create a ledger at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        debug!(?path, "Opening redb consistency ledger");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(db_err)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        Self::init(db, Durability::Immediate)
    }

    /// Open an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(db_err)?;
        Self::init(db, Durability::None)
    }

    fn init(db: Database, durability: Durability) -> Result<Self> {
        // Create the table so reads never race its creation.
        {
            let txn = db.begin_write().map_err(db_err)?;
            let _ = txn.open_table(RECORDS).map_err(db_err)?;
            txn.commit().map_err(db_err)?;
        }

        let clock = Arc::new(HlcClock::new());
        let (count, newest) = {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(RECORDS).map_err(db_err)?;
            let mut count = 0usize;
            let mut newest = 0u64;
            for entry in table.iter().map_err(db_err)? {
                let (_, value) = entry.map_err(db_err)?;
                let stored: StoredRecord =
                    bincode::deserialize(value.value()).map_err(codec_err)?;
                newest = newest.max(stored.version);
                count += 1;
            }
            (count, newest)
        };
        let newest = HlcTimestamp::from_raw(newest);
        match clock.validate_timestamp(newest) {
            Ok(()) => clock.observe(newest),
            Err(e) => warn!(error = %e, "Not advancing clock past stored version"),
        }
        let newest = ObjectVersion::new(clock.current());
        info!(records = count, newest = %newest, "Consistency ledger ready");

        Ok(Self { db: Arc::new(db), durability, clock })
    }

    /// Returns the clock versions are stamped from.
    pub fn clock(&self) -> &Arc<HlcClock> {
        &self.clock
    }
}

#[async_trait]
impl Ledger for RedbLedger {
    async fn insert(&self, record: NewRecord) -> Result<DeleteMarker> {
        let version = match record.version {
            Some(version) => {
                self.clock.validate_timestamp(version.timestamp())?;
                self.clock.observe(version.timestamp());
                version
            }
            None => ObjectVersion::new(self.clock.now()),
        };
        let stored = StoredRecord {
            request_id: record.request_id,
            object_id: record.object_id,
            method: record.method,
            domain: record.domain,
            access_key: record.access_key,
            version: version.timestamp().as_raw(),
            execution_delay_ms: millis(record.execution_delay),
            error: None,
            updated_at_millis: Utc::now().timestamp_millis(),
            leased_until_millis: None,
        };
        let marker = DeleteMarker {
            domain: stored.domain.clone(),
            object_id: stored.object_id.clone(),
            version,
            request_id: stored.request_id.clone(),
        };
        let method = stored.method;
        let db = Arc::clone(&self.db);
        let durability = self.durability;

        tokio::task::spawn_blocking(move || {
            let mut txn = db.begin_write().map_err(db_err)?;

            {
                let mut table = txn.open_table(RECORDS).map_err(db_err)?;
                let serialized = bincode::serialize(&stored).map_err(codec_err)?;
                table.insert(stored.key().as_str(), serialized.as_slice()).map_err(db_err)?;
            }

            txn.set_durability(durability).map_err(db_err)?;
            txn.commit().map_err(db_err)?;

            Ok::<_, LedgerError>(())
        })
        .await
        .map_err(task_err)??;

        counter!("shardgate_ledger_inserts_total", "method" => method.name()).increment(1);
        debug!(
            domain = %marker.domain,
            object = %marker.object_id,
            version = %marker.version,
            "Inserted consistency record"
        );
        Ok(marker)
    }

    async fn delete(&self, marker: &DeleteMarker) -> Result<usize> {
        let start = object_prefix(&marker.domain, &marker.object_id);
        let end = format!("{start}{}\x01", marker.version);
        let db = Arc::clone(&self.db);
        let durability = self.durability;

        let removed = tokio::task::spawn_blocking(move || {
            let mut txn = db.begin_write().map_err(db_err)?;

            let removed = {
                let mut table = txn.open_table(RECORDS).map_err(db_err)?;

                let mut keys_to_delete = Vec::new();
                {
                    let range = table.range(start.as_str()..end.as_str()).map_err(db_err)?;
                    for entry in range {
                        let (key, _) = entry.map_err(db_err)?;
                        keys_to_delete.push(key.value().to_string());
                    }
                }

                for key in &keys_to_delete {
                    table.remove(key.as_str()).map_err(db_err)?;
                }

                keys_to_delete.len()
            };

            txn.set_durability(durability).map_err(db_err)?;
            txn.commit().map_err(db_err)?;

            Ok::<_, LedgerError>(removed)
        })
        .await
        .map_err(task_err)??;

        counter!("shardgate_ledger_compacted_total").increment(removed as u64);
        debug!(
            domain = %marker.domain,
            object = %marker.object_id,
            version = %marker.version,
            removed,
            "Compacted consistency records"
        );
        Ok(removed)
    }

    async fn extend_execution_delay(&self, marker: &DeleteMarker, extra: Duration) -> Result<()> {
        let key = marker_key(marker);
        let db = Arc::clone(&self.db);
        let durability = self.durability;

        tokio::task::spawn_blocking(move || {
            let mut txn = db.begin_write().map_err(db_err)?;

            {
                let mut table = txn.open_table(RECORDS).map_err(db_err)?;

                let mut stored: StoredRecord = match table.get(key.as_str()).map_err(db_err)? {
                    Some(value) => bincode::deserialize(value.value()).map_err(codec_err)?,
                    None => return Err(LedgerError::NotFound(key.replace('\0', "/"))),
                };
                stored.execution_delay_ms = stored.execution_delay_ms.saturating_add(millis(extra));

                let serialized = bincode::serialize(&stored).map_err(codec_err)?;
                table.insert(key.as_str(), serialized.as_slice()).map_err(db_err)?;
            }

            txn.set_durability(durability).map_err(db_err)?;
            txn.commit().map_err(db_err)?;

            Ok(())
        })
        .await
        .map_err(task_err)?
    }

    async fn claim_due(&self, limit: usize, lease: Duration) -> Result<Vec<ConsistencyRecord>> {
        let db = Arc::clone(&self.db);
        let durability = self.durability;
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let now_ms = now.timestamp_millis();
            let mut txn = db.begin_write().map_err(db_err)?;

            let claimed = {
                let mut table = txn.open_table(RECORDS).map_err(db_err)?;

                let mut due = Vec::new();
                for entry in table.iter().map_err(db_err)? {
                    let (key, value) = entry.map_err(db_err)?;
                    let stored: StoredRecord =
                        bincode::deserialize(value.value()).map_err(codec_err)?;
                    if stored.is_leased(now_ms) || !stored.to_record().is_due(now) {
                        continue;
                    }
                    due.push((key.value().to_string(), stored));
                }

                // Newest first
                due.sort_by(|a, b| b.1.version.cmp(&a.1.version));
                due.truncate(limit);

                let mut claimed = Vec::with_capacity(due.len());
                for (key, mut stored) in due {
                    stored.leased_until_millis = Some(now_ms.saturating_add(lease_ms));
                    let serialized = bincode::serialize(&stored).map_err(codec_err)?;
                    table.insert(key.as_str(), serialized.as_slice()).map_err(db_err)?;
                    claimed.push(stored.to_record());
                }
                claimed
            };

            txn.set_durability(durability).map_err(db_err)?;
            txn.commit().map_err(db_err)?;

            Ok(claimed)
        })
        .await
        .map_err(task_err)?
    }

    async fn defer(
        &self,
        record: &ConsistencyRecord,
        error: &str,
        failure_delay: Duration,
    ) -> Result<()> {
        let key = record_key(
            &record.domain,
            &record.object_id,
            record.object_version,
            &record.request_id,
        );
        let error = error.to_string();
        let db = Arc::clone(&self.db);
        let durability = self.durability;

        tokio::task::spawn_blocking(move || {
            let mut txn = db.begin_write().map_err(db_err)?;

            {
                let mut table = txn.open_table(RECORDS).map_err(db_err)?;

                let existing: Option<StoredRecord> = table
                    .get(key.as_str())
                    .map_err(db_err)?
                    .map(|value| bincode::deserialize(value.value()))
                    .transpose()
                    .map_err(codec_err)?;
                let Some(mut stored) = existing else {
                    debug!(key = %key.replace('\0', "/"), "Deferred record already compacted");
                    return Ok(());
                };

                // Due time becomes now + failure_delay, measured from updated_at.
                let elapsed =
                    Utc::now().timestamp_millis().saturating_sub(stored.updated_at_millis);
                let elapsed = u64::try_from(elapsed).unwrap_or(0);
                stored.execution_delay_ms = elapsed.saturating_add(millis(failure_delay));
                stored.error = Some(error);

                let serialized = bincode::serialize(&stored).map_err(codec_err)?;
                table.insert(key.as_str(), serialized.as_slice()).map_err(db_err)?;
            }

            txn.set_durability(durability).map_err(db_err)?;
            txn.commit().map_err(db_err)?;

            Ok(())
        })
        .await
        .map_err(task_err)?
    }

    async fn release(&self, records: &[ConsistencyRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = records
            .iter()
            .map(|r| record_key(&r.domain, &r.object_id, r.object_version, &r.request_id))
            .collect();
        let db = Arc::clone(&self.db);
        let durability = self.durability;

        tokio::task::spawn_blocking(move || {
            let mut txn = db.begin_write().map_err(db_err)?;

            {
                let mut table = txn.open_table(RECORDS).map_err(db_err)?;

                for key in keys {
                    let existing: Option<StoredRecord> = table
                        .get(key.as_str())
                        .map_err(db_err)?
                        .map(|value| bincode::deserialize(value.value()))
                        .transpose()
                        .map_err(codec_err)?;
                    if let Some(mut stored) = existing {
                        stored.leased_until_millis = None;
                        let serialized = bincode::serialize(&stored).map_err(codec_err)?;
                        table.insert(key.as_str(), serialized.as_slice()).map_err(db_err)?;
                    }
                }
            }

            txn.set_durability(durability).map_err(db_err)?;
            txn.commit().map_err(db_err)?;

            Ok(())
        })
        .await
        .map_err(task_err)?
    }

    async fn records(&self, domain: &str, object_id: &str) -> Result<Vec<ConsistencyRecord>> {
        let start = object_prefix(domain, object_id);
        let end = format!("{domain}\0{object_id}\x01");
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(RECORDS).map_err(db_err)?;

            let mut records = Vec::new();
            for entry in table.range(start.as_str()..end.as_str()).map_err(db_err)? {
                let (_, value) = entry.map_err(db_err)?;
                let stored: StoredRecord =
                    bincode::deserialize(value.value()).map_err(codec_err)?;
                records.push(stored.to_record());
            }

            Ok(records)
        })
        .await
        .map_err(task_err)?
    }

    async fn len(&self) -> Result<usize> {
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(RECORDS).map_err(db_err)?;

            let mut count = 0;
            for entry in table.iter().map_err(db_err)? {
                entry.map_err(db_err)?;
                count += 1;
            }

            Ok(count)
        })
        .await
        .map_err(task_err)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "s3.example.com";

    fn version(physical_ms: u64) -> ObjectVersion {
        ObjectVersion::new(HlcTimestamp::from_parts(physical_ms, 0))
    }

    fn put(object_id: &str) -> NewRecord {
        NewRecord::new(DOMAIN, object_id, RecordMethod::Put, Duration::ZERO)
    }

    async fn wait_until_due() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn test_insert_stamps_increasing_versions() {
        let ledger = RedbLedger::open_in_memory().unwrap();

        let first = ledger.insert(put("b/k").request_id("r1")).await.unwrap();
        let second = ledger.insert(put("b/k").request_id("r2")).await.unwrap();

        assert!(second.version > first.version);
        assert_eq!(ledger.len().await.unwrap(), 2);

        let records = ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].request_id, "r1");
        assert_eq!(records[1].object_version, second.version);
    }

    #[tokio::test]
    async fn test_compaction_removes_older_keeps_newer() {
        let ledger = RedbLedger::open_in_memory().unwrap();

        let v1 = ledger.insert(put("b/k").request_id("r1").version(version(1_000))).await.unwrap();
        let v2 = ledger.insert(put("b/k").request_id("r2").version(version(2_000))).await.unwrap();
        let v3 = ledger.insert(put("b/k").request_id("r3").version(version(3_000))).await.unwrap();
        ledger.insert(put("b/other").version(version(1_500))).await.unwrap();

        let removed = ledger.delete(&v2).await.unwrap();
        assert_eq!(removed, 2);

        let remaining = ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].object_version, v3.version);
        assert!(v1.version < v2.version);
        assert_eq!(ledger.records(DOMAIN, "b/other").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_compaction_is_scoped_to_object_and_domain() {
        let ledger = RedbLedger::open_in_memory().unwrap();

        let marker = ledger.insert(put("b/k").version(version(5_000))).await.unwrap();
        ledger.insert(put("b/k2").version(version(1_000))).await.unwrap();
        ledger
            .insert(
                NewRecord::new("other.example.com", "b/k", RecordMethod::Put, Duration::ZERO)
                    .version(version(1_000)),
            )
            .await
            .unwrap();

        assert_eq!(ledger.delete(&marker).await.unwrap(), 1);
        assert_eq!(ledger.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_due_is_newest_first_and_leased() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        for (i, key) in ["b/a", "b/b", "b/c"].iter().enumerate() {
            ledger.insert(put(key).version(version(1_000 + i as u64))).await.unwrap();
        }
        ledger
            .insert(NewRecord::new(DOMAIN, "b/later", RecordMethod::Put, Duration::from_secs(300)))
            .await
            .unwrap();
        wait_until_due().await;

        let claimed = ledger.claim_due(2, Duration::from_secs(60)).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|r| r.object_id.as_str()).collect();
        assert_eq!(ids, vec!["b/c", "b/b"]);

        // Leased rows are skipped by a concurrent cycle.
        let claimed_again = ledger.claim_due(10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(claimed_again.len(), 1);
        assert_eq!(claimed_again[0].object_id, "b/a");

        ledger.release(&claimed).await.unwrap();
        let after_release = ledger.claim_due(10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(after_release.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_lease_is_claimable() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        ledger.insert(put("b/k")).await.unwrap();
        wait_until_due().await;

        assert_eq!(ledger.claim_due(10, Duration::ZERO).await.unwrap().len(), 1);
        wait_until_due().await;
        assert_eq!(ledger.claim_due(10, Duration::from_secs(60)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_defer_annotates_and_delays() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        ledger.insert(put("b/k")).await.unwrap();
        wait_until_due().await;

        let claimed = ledger.claim_due(10, Duration::from_secs(60)).await.unwrap();
        ledger.defer(&claimed[0], "backend b unreachable", Duration::from_secs(600)).await.unwrap();
        ledger.release(&claimed).await.unwrap();

        assert!(ledger.claim_due(10, Duration::from_secs(60)).await.unwrap().is_empty());
        let records = ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(records[0].error.as_deref(), Some("backend b unreachable"));
        assert!(records[0].due_at() > Utc::now() + chrono::Duration::seconds(590));
    }

    #[tokio::test]
    async fn test_defer_after_compaction_is_noop() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let marker = ledger.insert(put("b/k")).await.unwrap();
        wait_until_due().await;

        let claimed = ledger.claim_due(10, Duration::from_secs(60)).await.unwrap();
        ledger.delete(&marker).await.unwrap();
        ledger.defer(&claimed[0], "late", Duration::from_secs(1)).await.unwrap();
        assert!(ledger.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_execution_delay() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let marker = ledger.insert(put("b/k")).await.unwrap();

        ledger.extend_execution_delay(&marker, Duration::from_secs(300)).await.unwrap();
        let records = ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(records[0].execution_delay, Duration::from_secs(300));

        ledger.delete(&marker).await.unwrap();
        let result = ledger.extend_execution_delay(&marker, Duration::from_secs(300)).await;
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clock_continues_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.redb");
        // Ahead of the wall clock, but within the allowed skew.
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap();
        let ahead = ObjectVersion::new(HlcTimestamp::from_parts(now_ms + 400, 9));

        {
            let ledger = RedbLedger::open(&path).unwrap();
            ledger.insert(put("b/k").version(ahead)).await.unwrap();
        }

        let ledger = RedbLedger::open(&path).unwrap();
        assert_eq!(ledger.len().await.unwrap(), 1);
        let next = ledger.insert(put("b/k2")).await.unwrap();
        assert!(next.version > ahead);
    }

    #[tokio::test]
    async fn test_insert_rejects_version_from_future() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let before = ledger.insert(put("b/k").request_id("r1")).await.unwrap();

        let bogus = ObjectVersion::new(HlcTimestamp::from_raw(u64::MAX));
        let result = ledger.insert(put("b/x").version(bogus)).await;
        assert!(matches!(result, Err(LedgerError::Clock(_))));
        assert!(ledger.records(DOMAIN, "b/x").await.unwrap().is_empty());

        // The clock keeps moving forward from where it was.
        let after = ledger.insert(put("b/k").request_id("r2")).await.unwrap();
        assert!(after.version > before.version);
        assert!(after.version.timestamp().physical_time() < (1 << 47));
    }
}
