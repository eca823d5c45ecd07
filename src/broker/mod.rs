//! Scratch-disk admission control.
//!
//! A [`DiskBroker`] serializes all allocation decisions on one dedicated
//! background task fed by a FIFO request queue. Callers block in
//! [`DiskBroker::acquire`] until their demand fits the remaining budget, the
//! timeout elapses, or the broker is stopped. Requests are served strictly in
//! arrival order: when the head request does not fit, the broker re-checks it
//! every polling interval before looking at anything behind it, so a large
//! request can hold up smaller ones (admission order == request order; no
//! size-based reordering).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(test)]
mod tests;

/// Errors surfaced by the disk broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The request could not be granted within the caller's deadline. The
    /// request stays queued; a late grant is reclaimed by the broker.
    #[error("disk request for {demand} bytes timed out after {timeout:?}")]
    Timeout { demand: u64, timeout: Duration },

    /// The broker was stopped before the request could be granted.
    #[error("disk broker is stopped")]
    Stopped,

    #[error("disk broker filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// A granted unit of scratch-disk capacity.
///
/// Exists between grant and release; releasing consumes the value so a
/// resource cannot be returned to the budget twice. Removing the directory
/// itself is the owner's responsibility (see [`crate::task::TaskNode`]'s
/// clean step).
#[derive(Debug)]
pub struct Resource {
    id: Uuid,
    path: PathBuf,
    size: u64,
}

impl Resource {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Directory created for the owning job.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Granted size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// One pending admission request travelling through the broker queue.
struct ResourceRequest {
    requester: String,
    demand: u64,
    subdir: Option<String>,
    grant: oneshot::Sender<Result<Resource, BrokerError>>,
}

struct BrokerShared {
    root: PathBuf,
    budget: Option<u64>,
    polling_interval: Duration,
    /// Live grant sizes by resource id. Mutated by the broker task on grant
    /// and by [`DiskBroker::release`], so a freed size is visible to the
    /// very next poll.
    live: Mutex<HashMap<Uuid, u64>>,
    stopped: AtomicBool,
}

/// Single-task disk-space admission broker.
///
/// The background loop starts lazily on the first [`acquire`](Self::acquire),
/// exactly once, and lives until the broker is dropped.
pub struct DiskBroker {
    shared: Arc<BrokerShared>,
    tx: mpsc::UnboundedSender<ResourceRequest>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ResourceRequest>>>,
    started: AtomicBool,
}

impl DiskBroker {
    /// Create a broker managing `budget` bytes of scratch space under `root`.
    ///
    /// `budget = None` disables admission limits (every request is granted as
    /// soon as it reaches the head of the queue).
    pub fn new(root: impl Into<PathBuf>, budget: Option<u64>, polling_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(BrokerShared {
                root: root.into(),
                budget,
                polling_interval,
                live: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
        }
    }

    /// Root directory grants are created under.
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Sum of currently granted sizes.
    pub fn in_use(&self) -> u64 {
        live_total(&self.shared.live.lock().unwrap())
    }

    /// Remaining budget, or `None` when the broker is unbudgeted.
    pub fn available(&self) -> Option<u64> {
        self.shared.budget.map(|b| b.saturating_sub(self.in_use()))
    }

    /// Block until `demand` bytes are granted, the `timeout` elapses, or the
    /// broker stops.
    ///
    /// The grant directory is `root/subdir` when a hint is given, else
    /// `root/requester`. On timeout the request is *not* dequeued; it keeps
    /// its FIFO position until the broker next looks at it, at which point
    /// an abandoned request is dropped and an already-issued orphan grant is
    /// reclaimed.
    pub async fn acquire(
        &self,
        requester: &str,
        demand: u64,
        timeout: Duration,
        subdir: Option<String>,
    ) -> Result<Resource, BrokerError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }
        self.ensure_started();

        let (grant_tx, grant_rx) = oneshot::channel();
        let request = ResourceRequest {
            requester: requester.to_string(),
            demand,
            subdir,
            grant: grant_tx,
        };
        self.tx.send(request).map_err(|_| BrokerError::Stopped)?;

        match tokio::time::timeout(timeout, grant_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Stopped),
            Err(_) => {
                debug!(requester, demand, ?timeout, "disk request timed out");
                Err(BrokerError::Timeout { demand, timeout })
            }
        }
    }

    /// Return a grant's size to the budget. The directory is left in place
    /// for the caller to remove.
    pub fn release(&self, resource: Resource) {
        let removed = self
            .shared
            .live
            .lock()
            .unwrap()
            .remove(&resource.id)
            .is_some();
        if removed {
            debug!(id = %resource.id, size = resource.size, "released disk resource");
        } else {
            warn!(id = %resource.id, "released a resource the broker no longer tracks");
        }
    }

    /// Stop admitting requests. Queued and future acquires fail with
    /// [`BrokerError::Stopped`]; live resources stay valid until released.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        info!("disk broker stopped");
    }

    /// Spawn the broker loop on first use, guarded by a start flag.
    fn ensure_started(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let rx = self
                .rx
                .lock()
                .unwrap()
                .take()
                .expect("broker receiver taken twice");
            let shared = Arc::clone(&self.shared);
            tokio::spawn(broker_loop(shared, rx));
            debug!("disk broker loop started");
        }
    }
}

/// The admission loop: one request at a time, strictly FIFO.
async fn broker_loop(shared: Arc<BrokerShared>, mut rx: mpsc::UnboundedReceiver<ResourceRequest>) {
    while let Some(request) = rx.recv().await {
        serve_request(&shared, request).await;
    }
    debug!("disk broker loop exited");
}

/// Busy-wait on one request until it fits, the broker stops, or the caller
/// turns out to be gone.
async fn serve_request(shared: &BrokerShared, request: ResourceRequest) {
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            let _ = request.grant.send(Err(BrokerError::Stopped));
            return;
        }

        // A caller that timed out has dropped its receiver. Granting it would
        // only be reclaimed again, and a never-satisfiable request would pin
        // the head of the queue forever, so drop it here.
        if request.grant.is_closed() {
            debug!(
                requester = %request.requester,
                demand = request.demand,
                "dropping disk request abandoned by its caller"
            );
            return;
        }

        let in_use = live_total(&shared.live.lock().unwrap());
        let available = match shared.budget {
            Some(budget) => budget.saturating_sub(in_use),
            None => u64::MAX,
        };

        if request.demand <= available {
            let outcome = grant(shared, &request).await;
            match outcome {
                Ok(resource) => {
                    let id = resource.id;
                    let path = resource.path.clone();
                    let size = resource.size;
                    if request.grant.send(Ok(resource)).is_err() {
                        // Caller timed out before the grant landed. Reclaim
                        // immediately so the budget is not leaked.
                        shared.live.lock().unwrap().remove(&id);
                        if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                            warn!(path = %path.display(), error = %err, "failed to remove orphaned grant directory");
                        }
                        warn!(
                            requester = %request.requester,
                            size,
                            "reclaimed grant abandoned by a timed-out caller"
                        );
                    } else {
                        debug!(
                            requester = %request.requester,
                            size,
                            path = %path.display(),
                            "granted disk resource"
                        );
                    }
                }
                Err(err) => {
                    let _ = request.grant.send(Err(err));
                }
            }
            return;
        }

        debug!(
            requester = %request.requester,
            demand = request.demand,
            available,
            "insufficient disk budget, retrying after polling interval"
        );
        tokio::time::sleep(shared.polling_interval).await;
    }
}

/// Saturating sum of live grant sizes; unbudgeted brokers can hold demands
/// whose plain sum overflows.
fn live_total(live: &HashMap<Uuid, u64>) -> u64 {
    live.values().fold(0u64, |total, size| total.saturating_add(*size))
}

/// Create the grant directory and record the live resource.
async fn grant(shared: &BrokerShared, request: &ResourceRequest) -> Result<Resource, BrokerError> {
    let dir = match &request.subdir {
        Some(subdir) => shared.root.join(subdir),
        None => shared.root.join(&request.requester),
    };
    tokio::fs::create_dir_all(&dir).await?;

    let resource = Resource {
        id: Uuid::new_v4(),
        path: dir,
        size: request.demand,
    };
    shared
        .live
        .lock()
        .unwrap()
        .insert(resource.id, resource.size);
    Ok(resource)
}
