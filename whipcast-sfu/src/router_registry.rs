//! One router per active stream

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{Router, RtpCodecCapability};
use crate::error::{SfuError, SfuResult};
use crate::types::{StreamId, WorkerId};
use crate::worker_pool::WorkerPool;

pub struct RouterRegistry {
    pool: Arc<WorkerPool>,
    media_codecs: Vec<RtpCodecCapability>,
    routers: DashMap<StreamId, Arc<dyn Router>>,
}

impl RouterRegistry {
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, media_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            pool,
            media_codecs,
            routers: DashMap::new(),
        }
    }

    /// Create the router of `stream_id` on the next worker
    ///
    /// Fails with `AlreadyExists` when the stream already has one; a router
    /// that loses that race is closed before returning.
    pub async fn create_router(&self, stream_id: &StreamId) -> SfuResult<Arc<dyn Router>> {
        if self.routers.contains_key(stream_id) {
            return Err(SfuError::AlreadyExists(stream_id.clone()));
        }

        let worker = self.pool.acquire_worker()?;
        let router = worker.create_router(&self.media_codecs).await?;

        match self.routers.entry(stream_id.clone()) {
            Entry::Occupied(_) => {
                warn!(stream_id = %stream_id, router_id = %router.id(), "Closing router that lost creation race");
                router.close();
                Err(SfuError::AlreadyExists(stream_id.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&router));
                info!(
                    stream_id = %stream_id,
                    router_id = %router.id(),
                    worker_id = %router.worker_id(),
                    "Router created"
                );
                Ok(router)
            }
        }
    }

    pub fn get_router(&self, stream_id: &StreamId) -> SfuResult<Arc<dyn Router>> {
        self.routers
            .get(stream_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| SfuError::StreamNotFound(stream_id.clone()))
    }

    /// Close and forget the router of `stream_id`; unknown ids are ignored
    pub fn remove_router(&self, stream_id: &StreamId) {
        if let Some((_, router)) = self.routers.remove(stream_id) {
            router.close();
            debug!(stream_id = %stream_id, router_id = %router.id(), "Router removed");
        }
    }

    /// Like [`remove_router`](Self::remove_router), but only while `router`
    /// is still the one registered for `stream_id`
    pub fn remove_router_if_current(&self, stream_id: &StreamId, router: &Arc<dyn Router>) -> bool {
        let removed = self
            .routers
            .remove_if(stream_id, |_, current| current.id() == router.id());
        if let Some((_, router)) = &removed {
            router.close();
            debug!(stream_id = %stream_id, router_id = %router.id(), "Router removed");
        }
        removed.is_some()
    }

    /// Streams whose router lives on `worker_id`
    #[must_use]
    pub fn stream_ids_on_worker(&self, worker_id: &WorkerId) -> Vec<StreamId> {
        self.routers
            .iter()
            .filter(|entry| entry.value().worker_id() == worker_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}
