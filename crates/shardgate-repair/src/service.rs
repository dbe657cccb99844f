//! The repair service: feeder, drift filter and worker wired together.

use std::sync::Arc;

use http::header::HeaderName;
use shardgate_core::Config;
use shardgate_replication::ShardResolver;
use shardgate_watchdog::{ConsistencyRecord, Ledger};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entry::WalEntry;
use crate::error::Result;
use crate::feeder::WalFeeder;
use crate::filter::DriftFilter;
use crate::worker::RepairWorker;

/// Runs the repair pipeline until shutdown.
///
/// ```text
/// ledger --claim--> WalFeeder --WalEntry--> DriftFilter --RepairTask--> RepairWorker
///    ^                                                                      |
///    +---------------------- delete / defer <------- outcome ---------------+
/// ```
pub struct RepairService {
    feeder: WalFeeder,
    filter: Arc<DriftFilter>,
    worker: Arc<RepairWorker>,
    queue_depth: usize,
}

impl RepairService {
    /// Creates a service from its parts.
    pub fn new(feeder: WalFeeder, filter: DriftFilter, worker: RepairWorker) -> Self {
        Self { feeder, filter: Arc::new(filter), worker: Arc::new(worker), queue_depth: 64 }
    }

    /// Builds the service described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured version header is not a valid
    /// header name.
    pub fn from_config(
        config: &Config,
        ledger: Arc<dyn Ledger>,
        resolver: Arc<dyn ShardResolver>,
    ) -> shardgate_core::Result<Self> {
        let name = &config.watchdog.version_header;
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            shardgate_core::Error::Config(format!("invalid header name {name:?}: {e}"))
        })?;
        let service = Self::new(
            WalFeeder::new(ledger, config.feeder.clone()),
            DriftFilter::new(resolver, header),
            RepairWorker::new(config.repair.clone()),
        );
        Ok(service.queue_depth(config.feeder.batch_size))
    }

    /// Sets how many entries may wait between the feeder and the pipeline.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Spawns [`run`](Self::run) onto the runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs the feeder and the pipeline until `shutdown` fires, then waits
    /// for in-flight repairs.
    pub async fn run(self, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<WalEntry>(self.queue_depth);
        let feeder = tokio::spawn(self.feeder.run(tx, shutdown));
        info!("Repair service started");

        let mut repairs = JoinSet::new();
        while let Some(entry) = rx.recv().await {
            let filter = Arc::clone(&self.filter);
            let worker = Arc::clone(&self.worker);
            repairs.spawn(async move {
                let result = repair(&filter, &worker, entry.record()).await;
                entry.finish(result);
            });
            while let Some(done) = repairs.try_join_next() {
                if let Err(e) = done {
                    warn!(error = %e, "Repair task panicked");
                }
            }
        }

        while let Some(done) = repairs.join_next().await {
            if let Err(e) = done {
                warn!(error = %e, "Repair task panicked");
            }
        }
        if let Err(e) = feeder.await {
            warn!(error = %e, "WAL feeder panicked");
        }
        info!("Repair service stopped");
    }
}

/// Plans and executes the repair of one record.
///
/// # Errors
///
/// Returns the probe or migration failure.
pub async fn repair(
    filter: &DriftFilter,
    worker: &RepairWorker,
    record: &ConsistencyRecord,
) -> Result<()> {
    let task = filter.plan(record).await?;
    if task.is_empty() {
        debug!(object = %record.object_id, version = %record.object_version, "Already converged");
        return Ok(());
    }
    worker.execute(&task).await
}
