//! Per-stream aggregate: router, producers by kind and attached viewers

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{Producer, Router};
use crate::error::{SfuError, SfuResult};
use crate::types::{MediaKind, ProducerId, StreamId, ViewerId};
use crate::viewer::{Viewer, ViewerNotice};

pub struct Stream {
    id: StreamId,
    router: Arc<dyn Router>,
    producers: RwLock<HashMap<MediaKind, Arc<dyn Producer>>>,
    viewers: RwLock<HashMap<ViewerId, Weak<Viewer>>>,
    closed: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl Stream {
    #[must_use]
    pub fn new(id: StreamId, router: Arc<dyn Router>, cancel: CancellationToken) -> Self {
        Self {
            id,
            router,
            producers: RwLock::new(HashMap::new()),
            viewers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attach `producer` for its kind, closing any producer it replaces
    pub fn add_producer(&self, producer: Arc<dyn Producer>) -> SfuResult<()> {
        let replaced = {
            let mut producers = self.producers.write();
            if self.is_closed() {
                None
            } else {
                Some(producers.insert(producer.kind(), Arc::clone(&producer)))
            }
        };

        match replaced {
            None => {
                producer.close();
                Err(SfuError::StreamNotFound(self.id.clone()))
            }
            Some(Some(old)) => {
                info!(
                    stream_id = %self.id,
                    kind = %producer.kind(),
                    old_producer_id = %old.id(),
                    producer_id = %producer.id(),
                    "Producer replaced"
                );
                old.close();
                Ok(())
            }
            Some(None) => {
                info!(stream_id = %self.id, kind = %producer.kind(), producer_id = %producer.id(), "Producer attached");
                Ok(())
            }
        }
    }

    /// Detach and close `producer_id` if it is still the producer of its kind
    pub fn remove_producer(&self, producer_id: &ProducerId) {
        let removed = {
            let mut producers = self.producers.write();
            let kind = producers
                .iter()
                .find(|(_, p)| p.id() == producer_id)
                .map(|(kind, _)| *kind);
            kind.and_then(|kind| producers.remove(&kind))
        };
        if let Some(producer) = removed {
            producer.close();
        }
    }

    #[must_use]
    pub fn producers(&self) -> Vec<Arc<dyn Producer>> {
        let mut producers: Vec<_> = self.producers.read().values().cloned().collect();
        producers.sort_by_key(|p| p.kind());
        producers
    }

    pub fn producer(&self, kind: MediaKind) -> Option<Arc<dyn Producer>> {
        self.producers.read().get(&kind).cloned()
    }

    #[must_use]
    pub fn producer_kinds(&self) -> Vec<MediaKind> {
        let mut kinds: Vec<_> = self.producers.read().keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Register a viewer; fails once the stream has been closed
    pub fn attach_viewer(&self, viewer: &Arc<Viewer>) -> SfuResult<()> {
        let mut viewers = self.viewers.write();
        if self.is_closed() {
            return Err(SfuError::StreamNotFound(self.id.clone()));
        }
        viewers.insert(viewer.id().clone(), Arc::downgrade(viewer));
        Ok(())
    }

    pub fn detach_viewer(&self, viewer_id: &ViewerId) -> bool {
        self.viewers.write().remove(viewer_id).is_some()
    }

    #[must_use]
    pub fn has_viewer(&self, viewer_id: &ViewerId) -> bool {
        self.viewers.read().contains_key(viewer_id)
    }

    #[must_use]
    pub fn viewers(&self) -> Vec<Arc<Viewer>> {
        self.viewers.read().values().filter_map(Weak::upgrade).collect()
    }

    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.viewers
            .read()
            .values()
            .filter(|v| v.strong_count() > 0)
            .count()
    }

    /// Record the first successful publish; true only for the first call
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    #[must_use]
    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Close producers, viewer consumers and the router
    ///
    /// Attached viewers are told the stream ended but stay connected. Returns
    /// the ids of the viewers that were attached, or `None` when the stream
    /// was already closed.
    pub fn close(&self) -> Option<Vec<ViewerId>> {
        let (producers, viewers) = {
            let mut producers = self.producers.write();
            let mut viewers = self.viewers.write();
            if self.closed.swap(true, Ordering::SeqCst) {
                return None;
            }
            (
                std::mem::take(&mut *producers),
                std::mem::take(&mut *viewers),
            )
        };

        self.cancel.cancel();

        for producer in producers.into_values() {
            producer.close();
        }
        let mut detached = Vec::with_capacity(viewers.len());
        for (viewer_id, viewer) in viewers {
            detached.push(viewer_id);
            let Some(viewer) = viewer.upgrade() else {
                continue;
            };
            viewer.close_consumers_for(&self.id);
            viewer.notify(ViewerNotice::StreamEnded {
                stream_id: self.id.clone(),
            });
        }
        self.router.close();

        info!(stream_id = %self.id, viewers = detached.len(), "Stream closed");
        Some(detached)
    }

    /// Ask every attached viewer's consumers for a keyframe every `period`
    pub fn spawn_keyframe_ticker(self: &Arc<Self>, period: Duration) {
        let stream = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }

                let Some(stream) = stream.upgrade() else {
                    break;
                };
                let consumers: Vec<_> = stream
                    .viewers()
                    .iter()
                    .flat_map(|viewer| viewer.consumers_for(&stream.id))
                    .collect();
                for consumer in consumers {
                    if let Err(e) = consumer.request_key_frame().await {
                        warn!(stream_id = %stream.id, consumer_id = %consumer.id(), error = %e, "Periodic keyframe request failed");
                    }
                }
            }
            debug!("Keyframe ticker stopped");
        });
    }
}
