//! Live transports keyed by their owner
//!
//! The same registry type backs both the ingest side (keyed by stream id) and
//! the viewer side (keyed by viewer id). Every registered transport gets a
//! monitor task and, when enabled, a stats reporter; both stop when the entry
//! is removed.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::engine::{DtlsState, Router, Transport, TransportEvent, TransportOptions};
use crate::error::{SfuError, SfuResult};
use crate::stats::spawn_stats_reporter;
use crate::types::{StreamId, TransportId, ViewerId, WorkerId};

/// Cleanup work handed to the stream manager from background tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownRequest {
    /// The publisher's transport can no longer carry media
    Ingest {
        stream_id: StreamId,
        transport_id: TransportId,
        state: DtlsState,
    },
    /// A viewer's transport can no longer carry media
    Viewer {
        viewer_id: ViewerId,
        transport_id: TransportId,
        state: DtlsState,
    },
    WorkerDied { worker_id: WorkerId },
}

/// Key type of a transport registry
pub trait TransportOwner: Clone + Eq + Hash + Display + Send + Sync + 'static {
    /// Short label used in logs
    const ROLE: &'static str;

    fn teardown_request(&self, transport_id: TransportId, state: DtlsState) -> TeardownRequest;
}

impl TransportOwner for StreamId {
    const ROLE: &'static str = "ingest";

    fn teardown_request(&self, transport_id: TransportId, state: DtlsState) -> TeardownRequest {
        TeardownRequest::Ingest {
            stream_id: self.clone(),
            transport_id,
            state,
        }
    }
}

impl TransportOwner for ViewerId {
    const ROLE: &'static str = "viewer";

    fn teardown_request(&self, transport_id: TransportId, state: DtlsState) -> TeardownRequest {
        TeardownRequest::Viewer {
            viewer_id: self.clone(),
            transport_id,
            state,
        }
    }
}

struct Entry {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

pub struct TransportRegistry<K: TransportOwner> {
    entries: DashMap<K, Entry>,
    options: TransportOptions,
    stats_interval: Option<Duration>,
    teardown: mpsc::UnboundedSender<TeardownRequest>,
    cancel: CancellationToken,
}

impl<K: TransportOwner> TransportRegistry<K> {
    #[must_use]
    pub fn new(
        options: TransportOptions,
        stats_interval: Option<Duration>,
        teardown: mpsc::UnboundedSender<TeardownRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            options,
            stats_interval,
            teardown,
            cancel,
        }
    }

    /// Create a transport on `router` and register it under `key`
    pub async fn create(&self, key: K, router: &Arc<dyn Router>) -> SfuResult<Arc<dyn Transport>> {
        if self.entries.contains_key(&key) {
            return Err(SfuError::TransportFailure(format!(
                "{} transport for {key} already exists",
                K::ROLE
            )));
        }

        let transport = router.create_transport(&self.options).await?;
        let events = transport.subscribe();

        match self.entries.entry(key.clone()) {
            MapEntry::Occupied(_) => {
                transport.close();
                Err(SfuError::TransportFailure(format!(
                    "{} transport for {key} already exists",
                    K::ROLE
                )))
            }
            MapEntry::Vacant(slot) => {
                let cancel = self.cancel.child_token();
                slot.insert(Entry {
                    transport: Arc::clone(&transport),
                    cancel: cancel.clone(),
                });

                info!(
                    role = K::ROLE,
                    owner = %key,
                    transport_id = %transport.id(),
                    "Transport created"
                );

                if let Some(period) = self.stats_interval {
                    spawn_stats_reporter(
                        format!("{}:{key}", K::ROLE),
                        Arc::clone(&transport),
                        period,
                        cancel.clone(),
                    );
                }
                spawn_monitor(key, transport.id().clone(), events, self.teardown.clone(), cancel);

                Ok(transport)
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<dyn Transport>> {
        self.entries.get(key).map(|e| Arc::clone(&e.transport))
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether `key` is currently served by `transport_id`
    #[must_use]
    pub fn is_current(&self, key: &K, transport_id: &TransportId) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.transport.id() == transport_id)
    }

    /// Stop the tasks, close and forget the transport of `key`
    ///
    /// Returns whether an entry existed.
    pub fn remove(&self, key: &K) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        entry.cancel.cancel();
        entry.transport.close();
        debug!(role = K::ROLE, owner = %key, transport_id = %entry.transport.id(), "Transport removed");
        true
    }

    /// Remove the entry of `key` only if its transport has already closed
    pub fn remove_if_closed(&self, key: &K) -> bool {
        let Some((_, entry)) = self.entries.remove_if(key, |_, entry| entry.transport.is_closed()) else {
            return false;
        };
        entry.cancel.cancel();
        debug!(role = K::ROLE, owner = %key, transport_id = %entry.transport.id(), "Closed transport removed");
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn close_all(&self) {
        let keys: Vec<K> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(&key);
        }
    }
}

fn spawn_monitor<K: TransportOwner>(
    key: K,
    transport_id: TransportId,
    mut events: broadcast::Receiver<TransportEvent>,
    teardown: mpsc::UnboundedSender<TeardownRequest>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(TransportEvent::IceStateChange(state)) => {
                    debug!(role = K::ROLE, owner = %key, transport_id = %transport_id, ?state, "ICE state changed");
                }
                Ok(TransportEvent::DtlsStateChange(state)) => {
                    info!(role = K::ROLE, owner = %key, transport_id = %transport_id, ?state, "DTLS state changed");
                    if state.is_terminal() {
                        let _ = teardown.send(key.teardown_request(transport_id.clone(), state));
                        break;
                    }
                }
                Ok(TransportEvent::ConnectionStateChange(state)) => {
                    debug!(role = K::ROLE, owner = %key, transport_id = %transport_id, ?state, "Connection state changed");
                }
                Ok(TransportEvent::Trace(message)) => {
                    trace!(role = K::ROLE, owner = %key, transport_id = %transport_id, %message, "Transport trace");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(role = K::ROLE, owner = %key, skipped, "Transport monitor lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::codecs::router_media_codecs;
    use crate::engine::local::{LocalEngine, LocalEngineOptions};
    use crate::engine::{ConnectParameters, DtlsFingerprint, DtlsParameters, DtlsRole, MediaEngine};

    async fn router() -> Arc<dyn Router> {
        let engine = LocalEngine::new(&LocalEngineOptions::default());
        let worker = engine.create_worker().await.unwrap();
        worker.create_router(&router_media_codecs()).await.unwrap()
    }

    fn registry<K: TransportOwner>() -> (TransportRegistry<K>, mpsc::UnboundedReceiver<TeardownRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry =
            TransportRegistry::new(TransportOptions::default(), None, tx, CancellationToken::new());
        (registry, rx)
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_closes() {
        let router = router().await;
        let (registry, _rx) = registry::<ViewerId>();
        let key = ViewerId::from("v1");

        let transport = registry.create(key.clone(), &router).await.unwrap();
        assert!(registry.create(key.clone(), &router).await.is_err());
        assert!(registry.is_current(&key, transport.id()));

        assert!(registry.remove(&key));
        assert!(!registry.remove(&key));
        assert!(transport.is_closed());
        assert!(registry.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_dtls_close_requests_teardown() {
        let router = router().await;
        let (registry, mut rx) = registry::<StreamId>();
        let key = StreamId::from("cam");

        let transport = registry.create(key.clone(), &router).await.unwrap();
        transport
            .connect(ConnectParameters {
                dtls_parameters: DtlsParameters {
                    role: DtlsRole::Auto,
                    fingerprints: vec![DtlsFingerprint {
                        algorithm: "sha-256".into(),
                        value: "AA".into(),
                    }],
                },
                ice_parameters: None,
            })
            .await
            .unwrap();
        transport.close();

        let request = rx.recv().await.unwrap();
        assert_eq!(
            request,
            TeardownRequest::Ingest {
                stream_id: key,
                transport_id: transport.id().clone(),
                state: DtlsState::Closed,
            }
        );
    }

    #[tokio::test]
    async fn test_removed_transport_sends_no_teardown() {
        let router = router().await;
        let (registry, mut rx) = registry::<StreamId>();
        let key = StreamId::from("cam");

        registry.create(key.clone(), &router).await.unwrap();
        registry.remove(&key);
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err());
    }
}
