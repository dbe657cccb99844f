//! Fan-out of one logical request to every backend of a shard.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::backend::{clone_request, Backend, S3Request};
use crate::error::{BackendError, ReplicationError};
use crate::response::BackendResponse;

/// Issues requests concurrently to a fixed set of backends.
///
/// Every call to [`send`](Self::send) yields one [`BackendResponse`] per
/// backend on the returned channel, in completion order. The channel closes
/// only after all of them were delivered.
pub struct ReplicationClient {
    backends: Vec<Arc<dyn Backend>>,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter when a backend call ends, however it ends.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ReplicationClient {
    /// Creates a client over `backends`.
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self {
            backends,
            cancel: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the backends this client fans out to.
    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    /// Returns the number of backend calls still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Sends `request` to every backend.
    pub fn send(&self, request: S3Request) -> mpsc::Receiver<BackendResponse> {
        let (tx, rx) = mpsc::channel(self.backends.len().max(1));

        for backend in &self.backends {
            let backend = Arc::clone(backend);
            let request = clone_request(&request);
            let tx = tx.clone();
            let cancel = self.cancel.clone();

            self.in_flight.fetch_add(1, Ordering::AcqRel);
            let guard = InFlightGuard(Arc::clone(&self.in_flight));

            tokio::spawn(async move {
                let name = backend.name().to_string();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(BackendError::Canceled { backend: name.clone() }),
                    result = backend.send(request) => result,
                };
                drop(guard);

                match &result {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        debug!(backend = %name, status, "Backend responded");
                    }
                    Err(e) => {
                        counter!("shardgate_backend_errors_total", "backend" => name.clone())
                            .increment(1);
                        debug!(backend = %name, error = %e, "Backend call failed");
                    }
                }

                let outcome = BackendResponse::new(name, backend.is_maintenance(), result);
                if let Err(mpsc::error::SendError(outcome)) = tx.send(outcome).await {
                    outcome.discard();
                }
            });
        }

        rx
    }

    /// Returns a guard that cancels every call of this client when dropped.
    /// [`DropGuard::disarm`] lets the calls run to completion.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    /// Aborts every in-flight backend call. Aborted calls report
    /// [`BackendError::Canceled`].
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::NothingInProgress`] if no call is running.
    pub fn cancel(&self) -> Result<(), ReplicationError> {
        if self.in_flight() == 0 {
            return Err(ReplicationError::NothingInProgress);
        }
        debug!(in_flight = self.in_flight(), "Canceling backend calls");
        self.cancel.cancel();
        Ok(())
    }
}
