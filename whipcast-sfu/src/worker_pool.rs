//! Fixed-size pool of media workers
//!
//! Routers are spread round-robin over the live workers. A watcher task per
//! worker reacts to its death: the worker id is broadcast so the stream
//! manager can tear down the streams hosted there, then the slot is either
//! refilled (`restart`) or the process shutdown token is cancelled
//! (`fail_fast`).

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use whipcast_core::config::WorkerDeathPolicy;

use crate::engine::{MediaEngine, Worker, WorkerEvent};
use crate::error::{SfuError, SfuResult};
use crate::types::WorkerId;

pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    slots: RwLock<Vec<Arc<dyn Worker>>>,
    next: AtomicUsize,
    policy: WorkerDeathPolicy,
    deaths: broadcast::Sender<WorkerId>,
    /// Cancelled to stop watchers; its parent is the process shutdown token
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Create `size` workers and start watching them
    ///
    /// `shutdown` is cancelled when a worker dies under the `fail_fast` policy.
    pub async fn start(
        engine: Arc<dyn MediaEngine>,
        size: usize,
        policy: WorkerDeathPolicy,
        shutdown: CancellationToken,
    ) -> SfuResult<Arc<Self>> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            workers.push(engine.create_worker().await?);
        }

        let pool = Arc::new(Self {
            engine,
            slots: RwLock::new(workers.clone()),
            next: AtomicUsize::new(0),
            policy,
            deaths: broadcast::channel(size * 4).0,
            cancel: shutdown.child_token(),
            shutdown,
        });

        for worker in workers {
            pool.watch(worker);
        }

        info!(workers = size, policy = ?policy, "Worker pool started");
        Ok(pool)
    }

    /// Next live worker in round-robin order
    pub fn acquire_worker(&self) -> SfuResult<Arc<dyn Worker>> {
        let slots = self.slots.read();
        let len = slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);

        (0..len)
            .map(|i| &slots[(start + i) % len])
            .find(|worker| worker.is_alive())
            .cloned()
            .ok_or_else(|| SfuError::WorkerFailure("no live media worker".to_string()))
    }

    /// Receive the id of every worker that dies from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerId> {
        self.deaths.subscribe()
    }

    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.slots.read().iter().filter(|w| w.is_alive()).count()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.read().len()
    }

    /// Stop watchers and close every worker
    pub fn close(&self) {
        self.cancel.cancel();
        for worker in self.slots.read().iter() {
            worker.close();
        }
    }

    fn watch(self: &Arc<Self>, worker: Arc<dyn Worker>) {
        let mut events = worker.subscribe();
        let pool = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let worker_id = worker.id().clone();
        drop(worker);

        tokio::spawn(async move {
            let reason = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(WorkerEvent::Died { reason }) => reason,
                    Err(_) => "worker event channel closed".to_string(),
                },
            };
            Self::handle_death(pool, worker_id, reason).await;
        });
    }

    async fn handle_death(pool: Weak<Self>, worker_id: WorkerId, reason: String) {
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if pool.cancel.is_cancelled() {
            return;
        }

        error!(worker_id = %worker_id, reason = %reason, "Media worker died");
        let _ = pool.deaths.send(worker_id.clone());

        match pool.policy {
            WorkerDeathPolicy::FailFast => {
                error!(worker_id = %worker_id, "Shutting down after worker death");
                pool.shutdown.cancel();
            }
            WorkerDeathPolicy::Restart => match pool.engine.create_worker().await {
                Ok(replacement) => {
                    let replaced = {
                        let mut slots = pool.slots.write();
                        match slots.iter().position(|w| w.id() == &worker_id) {
                            Some(index) => {
                                slots[index] = Arc::clone(&replacement);
                                true
                            }
                            None => false,
                        }
                    };
                    if replaced {
                        info!(
                            dead_worker = %worker_id,
                            worker_id = %replacement.id(),
                            "Replaced dead media worker"
                        );
                        pool.watch(replacement);
                    } else {
                        replacement.close();
                    }
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Failed to restart media worker");
                }
            },
        }
    }
}
