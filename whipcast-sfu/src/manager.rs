//! Stream Manager - single source of truth for live streams
//!
//! This module provides:
//! - At-most-once stream creation per stream id
//! - The teardown cascade (producers, viewer consumers, router, ingest transport)
//! - Viewer transport bookkeeping
//! - A background reaper reacting to transport failures and worker deaths

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use whipcast_core::config::MediaConfig;
use whipcast_core::events::{DomainEvent, EventPublisher};

use crate::engine::codecs::router_media_codecs;
use crate::engine::{Router, Transport, TransportOptions};
use crate::error::{SfuError, SfuResult};
use crate::router_registry::RouterRegistry;
use crate::stream::Stream;
use crate::transport_registry::{TeardownRequest, TransportRegistry};
use crate::types::{MediaKind, StreamId, ViewerId, WorkerId};
use crate::viewer::Viewer;
use crate::worker_pool::WorkerPool;

/// Row of the active streams listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub stream_id: StreamId,
    pub viewers: usize,
    pub producers: Vec<MediaKind>,
}

pub struct StreamManager {
    media: MediaConfig,
    streams: DashMap<StreamId, Arc<Stream>>,
    creation_locks: DashMap<StreamId, Arc<Mutex<()>>>,
    pool: Arc<WorkerPool>,
    routers: RouterRegistry,
    ingest_transports: TransportRegistry<StreamId>,
    viewer_transports: TransportRegistry<ViewerId>,
    events: EventPublisher,
    cancel: CancellationToken,
}

impl StreamManager {
    /// Create the manager and start its reaper task
    pub fn new(media: MediaConfig, pool: Arc<WorkerPool>, events: EventPublisher) -> Arc<Self> {
        let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let options = TransportOptions {
            listen_ip: media.listen_ip.clone(),
            announced_ip: media.announced_ip.clone(),
            ..TransportOptions::default()
        };
        let stats_interval =
            (media.stats_interval_secs > 0).then(|| Duration::from_secs(media.stats_interval_secs));

        let deaths = pool.subscribe();
        let manager = Arc::new(Self {
            routers: RouterRegistry::new(Arc::clone(&pool), router_media_codecs()),
            ingest_transports: TransportRegistry::new(
                options.clone(),
                stats_interval,
                teardown_tx.clone(),
                cancel.child_token(),
            ),
            viewer_transports: TransportRegistry::new(
                options,
                stats_interval,
                teardown_tx,
                cancel.child_token(),
            ),
            streams: DashMap::new(),
            creation_locks: DashMap::new(),
            pool,
            events,
            cancel,
            media,
        });

        info!(
            workers = manager.pool.size(),
            preferred_video_codec = ?manager.media.preferred_video_codec,
            consumer_start_paused = manager.media.consumer_start_paused,
            "Stream manager initialized"
        );

        tokio::spawn(Self::reaper_task(
            Arc::downgrade(&manager),
            teardown_rx,
            deaths,
            manager.cancel.clone(),
        ));

        manager
    }

    #[must_use]
    pub fn media_config(&self) -> &MediaConfig {
        &self.media
    }

    #[must_use]
    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn get_stream(&self, stream_id: &StreamId) -> Option<Arc<Stream>> {
        self.streams.get(stream_id).map(|s| Arc::clone(s.value()))
    }

    /// Like [`Self::get_stream`] but with the signaling error for absence
    pub fn stream(&self, stream_id: &StreamId) -> SfuResult<Arc<Stream>> {
        self.get_stream(stream_id)
            .ok_or_else(|| SfuError::StreamNotFound(stream_id.clone()))
    }

    pub fn get_router(&self, stream_id: &StreamId) -> SfuResult<Arc<dyn Router>> {
        self.routers.get_router(stream_id)
    }

    pub fn ingest_transport(&self, stream_id: &StreamId) -> Option<Arc<dyn Transport>> {
        self.ingest_transports.get(stream_id)
    }

    pub fn viewer_transport(&self, viewer_id: &ViewerId) -> Option<Arc<dyn Transport>> {
        self.viewer_transports.get(viewer_id)
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Return the stream, creating router, ingest transport and aggregate if needed
    ///
    /// Concurrent callers for one id serialize on a per-id lock, so the
    /// creation happens at most once. The flag is true for the caller that
    /// created the stream.
    pub async fn get_or_create_stream(&self, stream_id: &StreamId) -> SfuResult<(Arc<Stream>, bool)> {
        if let Some(stream) = self.get_stream(stream_id) {
            return Ok((stream, false));
        }

        let lock = Arc::clone(
            self.creation_locks
                .entry(stream_id.clone())
                .or_default()
                .value(),
        );
        let result = {
            let _guard = lock.lock().await;
            match self.get_stream(stream_id) {
                Some(stream) => Ok((stream, false)),
                None => self.create_stream(stream_id).await.map(|s| (s, true)),
            }
        };
        drop(lock);
        self.creation_locks
            .remove_if(stream_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn create_stream(&self, stream_id: &StreamId) -> SfuResult<Arc<Stream>> {
        // leftovers of a stream whose removal is still in flight
        self.routers.remove_router(stream_id);
        self.ingest_transports.remove(stream_id);

        let router = self.routers.create_router(stream_id).await?;

        if let Err(e) = self.ingest_transports.create(stream_id.clone(), &router).await {
            self.routers.remove_router(stream_id);
            return Err(e);
        }

        let stream = Arc::new(Stream::new(
            stream_id.clone(),
            router,
            self.cancel.child_token(),
        ));
        if self.media.keyframe_interval_secs > 0 {
            stream.spawn_keyframe_ticker(Duration::from_secs(self.media.keyframe_interval_secs));
        }
        self.streams.insert(stream_id.clone(), Arc::clone(&stream));

        info!(stream_id = %stream_id, total_streams = self.streams.len(), "Stream created");
        Ok(stream)
    }

    /// Record a successful publish and emit `stream-start` the first time
    pub fn mark_stream_started(&self, stream: &Stream) {
        if stream.mark_started() {
            self.events.publish(DomainEvent::stream_start(stream.id().as_str()));
        }
    }

    /// Tear a stream down; safe to call repeatedly and concurrently
    ///
    /// Only the router and ingest transport of the removed stream are
    /// released, so a publish that recreates the id meanwhile keeps its own.
    /// Returns whether this call removed a live stream.
    pub fn remove_stream(&self, stream_id: &StreamId) -> bool {
        let Some((_, stream)) = self.streams.remove(stream_id) else {
            return false;
        };
        let Some(detached_viewers) = stream.close() else {
            return false;
        };
        self.routers.remove_router_if_current(stream_id, stream.router());
        // closing the router closed its transports
        self.ingest_transports.remove_if_closed(stream_id);

        for viewer_id in detached_viewers {
            self.events
                .publish(DomainEvent::viewer_leave(stream_id.as_str(), viewer_id.as_str()));
        }
        if stream.was_started() {
            self.events.publish(DomainEvent::stream_stop(stream_id.as_str()));
        }
        info!(stream_id = %stream_id, remaining_streams = self.streams.len(), "Stream removed");
        true
    }

    /// Create the transport a viewer will receive `stream` on
    pub async fn create_viewer_transport(
        &self,
        viewer_id: &ViewerId,
        stream: &Stream,
    ) -> SfuResult<Arc<dyn Transport>> {
        self.viewer_transports
            .create(viewer_id.clone(), stream.router())
            .await
    }

    pub fn remove_viewer_transport(&self, viewer_id: &ViewerId) -> bool {
        self.viewer_transports.remove(viewer_id)
    }

    /// Register `viewer` on `stream` and emit `viewer-join`
    pub fn attach_viewer(&self, stream: &Stream, viewer: &Arc<Viewer>) -> SfuResult<()> {
        stream.attach_viewer(viewer)?;
        // a teardown that raced the attach already dropped the stream from the map
        if self.get_stream(stream.id()).is_none() {
            stream.detach_viewer(viewer.id());
            return Err(SfuError::StreamNotFound(stream.id().clone()));
        }
        self.events
            .publish(DomainEvent::viewer_join(stream.id().as_str(), viewer.id().as_str()));
        Ok(())
    }

    /// Detach `viewer_id` from one stream and emit `viewer-leave`
    pub fn detach_viewer(&self, stream_id: &StreamId, viewer_id: &ViewerId) -> bool {
        let detached = self
            .get_stream(stream_id)
            .is_some_and(|stream| stream.detach_viewer(viewer_id));
        if detached {
            self.events
                .publish(DomainEvent::viewer_leave(stream_id.as_str(), viewer_id.as_str()));
        }
        detached
    }

    /// Detach `viewer_id` from every stream it is attached to
    pub fn detach_viewer_everywhere(&self, viewer_id: &ViewerId) -> Vec<StreamId> {
        let streams: Vec<Arc<Stream>> = self
            .streams
            .iter()
            .filter(|entry| entry.value().has_viewer(viewer_id))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut detached = Vec::new();
        for stream in streams {
            if stream.detach_viewer(viewer_id) {
                self.events
                    .publish(DomainEvent::viewer_leave(stream.id().as_str(), viewer_id.as_str()));
                detached.push(stream.id().clone());
            }
        }
        detached
    }

    /// Active streams ordered by id
    #[must_use]
    pub fn list(&self) -> Vec<StreamSummary> {
        let mut summaries: Vec<StreamSummary> = self
            .streams
            .iter()
            .map(|entry| {
                let stream = entry.value();
                StreamSummary {
                    stream_id: stream.id().clone(),
                    viewers: stream.viewer_count(),
                    producers: stream.producer_kinds(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        summaries
    }

    /// Tear down every stream and viewer transport and close the workers
    pub fn shutdown(&self) {
        let ids: Vec<StreamId> = self.streams.iter().map(|e| e.key().clone()).collect();
        info!(streams = ids.len(), "Shutting down stream manager");
        for id in &ids {
            self.remove_stream(id);
        }
        self.cancel.cancel();
        self.viewer_transports.close_all();
        self.ingest_transports.close_all();
        self.pool.close();
    }

    fn handle_teardown(&self, request: TeardownRequest) {
        match request {
            TeardownRequest::Ingest {
                stream_id,
                transport_id,
                state,
            } => {
                if !self.ingest_transports.is_current(&stream_id, &transport_id) {
                    debug!(stream_id = %stream_id, transport_id = %transport_id, "Ignoring stale ingest teardown");
                    return;
                }
                info!(stream_id = %stream_id, ?state, "Ingest transport ended, tearing down stream");
                self.remove_stream(&stream_id);
            }
            TeardownRequest::Viewer {
                viewer_id,
                transport_id,
                state,
            } => {
                if !self.viewer_transports.is_current(&viewer_id, &transport_id) {
                    debug!(viewer_id = %viewer_id, transport_id = %transport_id, "Ignoring stale viewer teardown");
                    return;
                }
                info!(viewer_id = %viewer_id, ?state, "Viewer transport ended, evicting viewer");
                self.detach_viewer_everywhere(&viewer_id);
                self.viewer_transports.remove(&viewer_id);
            }
            TeardownRequest::WorkerDied { worker_id } => self.handle_worker_death(&worker_id),
        }
    }

    fn handle_worker_death(&self, worker_id: &WorkerId) {
        let stream_ids = self.routers.stream_ids_on_worker(worker_id);
        warn!(
            worker_id = %worker_id,
            streams = stream_ids.len(),
            "Tearing down streams of dead worker"
        );
        for stream_id in stream_ids {
            self.remove_stream(&stream_id);
        }
    }

    async fn reaper_task(
        manager: Weak<Self>,
        mut teardown: mpsc::UnboundedReceiver<TeardownRequest>,
        mut deaths: broadcast::Receiver<WorkerId>,
        cancel: CancellationToken,
    ) {
        loop {
            let request = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                dead = deaths.recv() => match dead {
                    Ok(worker_id) => TeardownRequest::WorkerDied { worker_id },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed worker death notifications");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                request = teardown.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.handle_teardown(request);
        }
        debug!("Stream manager reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::{LocalEngine, LocalEngineOptions};
    use whipcast_core::config::WorkerDeathPolicy;
    use whipcast_core::events::EventType;

    async fn manager() -> (Arc<StreamManager>, mpsc::Receiver<DomainEvent>) {
        let engine = Arc::new(LocalEngine::new(&LocalEngineOptions::default()));
        let pool = WorkerPool::start(engine, 2, WorkerDeathPolicy::Restart, CancellationToken::new())
            .await
            .unwrap();
        let (events, rx) = EventPublisher::channel(64);
        let media = MediaConfig {
            stats_interval_secs: 0,
            ..MediaConfig::default()
        };
        (StreamManager::new(media, pool, events), rx)
    }

    #[tokio::test]
    async fn test_never_ingested_stream_is_absent() {
        let (manager, _rx) = manager().await;
        let id = StreamId::from("ghost");
        assert!(manager.get_stream(&id).is_none());
        assert!(matches!(manager.stream(&id), Err(SfuError::StreamNotFound(_))));
        assert!(matches!(manager.get_router(&id), Err(SfuError::StreamNotFound(_))));
        assert!(!manager.remove_stream(&id));
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_stream() {
        let (manager, _rx) = manager().await;
        let id = StreamId::from("cam");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let id = id.clone();
                tokio::spawn(async move { manager.get_or_create_stream(&id).await })
            })
            .collect();

        let mut created = 0;
        let mut router_ids = Vec::new();
        for task in tasks {
            let (stream, fresh) = task.await.unwrap().unwrap();
            created += usize::from(fresh);
            router_ids.push(stream.router().id().clone());
        }

        assert_eq!(created, 1);
        router_ids.dedup();
        assert_eq!(router_ids.len(), 1);
        assert_eq!(manager.stream_count(), 1);
        assert!(manager.creation_locks.is_empty());
    }

    #[tokio::test]
    async fn test_remove_stream_cascades_and_emits_stop() {
        let (manager, mut rx) = manager().await;
        let id = StreamId::from("cam");
        let (stream, _) = manager.get_or_create_stream(&id).await.unwrap();
        manager.mark_stream_started(&stream);
        let ingest = manager.ingest_transport(&id).unwrap();

        assert!(manager.remove_stream(&id));
        assert!(!manager.remove_stream(&id));

        assert!(stream.is_closed());
        assert!(stream.router().is_closed());
        assert!(ingest.is_closed());
        assert!(manager.ingest_transport(&id).is_none());
        assert!(manager.get_router(&id).is_err());

        assert_eq!(rx.recv().await.unwrap().event_type, EventType::StreamStart);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::StreamStop);
    }

    #[tokio::test]
    async fn test_recreate_during_removal_keeps_new_resources() {
        let (manager, _rx) = manager().await;
        let id = StreamId::from("cam");
        let (old, _) = manager.get_or_create_stream(&id).await.unwrap();
        let old_ingest = manager.ingest_transport(&id).unwrap();

        // a removal that has taken the map entry but not yet released the router
        let (_, taken) = manager.streams.remove(&id).unwrap();
        let (fresh, created) = manager.get_or_create_stream(&id).await.unwrap();
        assert!(created);
        assert!(old_ingest.is_closed());
        assert_ne!(fresh.router().id(), old.router().id());

        // the rest of that removal leaves the new stream alone
        assert!(taken.close().is_some());
        assert!(!manager.routers.remove_router_if_current(&id, taken.router()));
        assert!(!manager.ingest_transports.remove_if_closed(&id));

        assert!(!fresh.router().is_closed());
        assert_eq!(manager.get_router(&id).unwrap().id(), fresh.router().id());
        assert!(!manager.ingest_transport(&id).unwrap().is_closed());
        assert!(manager.remove_stream(&id));
    }

    #[tokio::test]
    async fn test_unstarted_stream_emits_no_stop() {
        let (manager, mut rx) = manager().await;
        let id = StreamId::from("cam");
        manager.get_or_create_stream(&id).await.unwrap();
        manager.remove_stream(&id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_reports_active_streams() {
        let (manager, _rx) = manager().await;
        manager.get_or_create_stream(&"b".into()).await.unwrap();
        manager.get_or_create_stream(&"a".into()).await.unwrap();

        let list = manager.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].stream_id, StreamId::from("a"));
        assert_eq!(list[0].viewers, 0);
        assert!(list[0].producers.is_empty());
    }
}
