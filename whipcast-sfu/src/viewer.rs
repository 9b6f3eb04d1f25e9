use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{Consumer, Transport};
use crate::types::{ConsumerId, StreamId, ViewerId};

/// Server-initiated message for a viewer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ViewerNotice {
    #[serde(rename_all = "camelCase")]
    StreamEnded { stream_id: StreamId },
}

struct GrantedConsumer {
    stream_id: StreamId,
    consumer: Arc<dyn Consumer>,
}

/// One viewer connection: its transport and the consumers granted to it
///
/// Owned by the signaling session; streams only keep a weak reference.
pub struct Viewer {
    id: ViewerId,
    transport: Arc<dyn Transport>,
    consumers: Mutex<HashMap<ConsumerId, GrantedConsumer>>,
    notifier: Option<mpsc::Sender<ViewerNotice>>,
}

impl Viewer {
    #[must_use]
    pub fn new(
        id: ViewerId,
        transport: Arc<dyn Transport>,
        notifier: Option<mpsc::Sender<ViewerNotice>>,
    ) -> Self {
        Self {
            id,
            transport,
            consumers: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    pub fn id(&self) -> &ViewerId {
        &self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn add_consumer(&self, stream_id: StreamId, consumer: Arc<dyn Consumer>) {
        self.consumers.lock().insert(
            consumer.id().clone(),
            GrantedConsumer {
                stream_id,
                consumer,
            },
        );
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<Arc<dyn Consumer>> {
        self.consumers
            .lock()
            .get(consumer_id)
            .map(|granted| Arc::clone(&granted.consumer))
    }

    pub fn consumers_for(&self, stream_id: &StreamId) -> Vec<Arc<dyn Consumer>> {
        self.consumers
            .lock()
            .values()
            .filter(|granted| &granted.stream_id == stream_id)
            .map(|granted| Arc::clone(&granted.consumer))
            .collect()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Close and forget every consumer taken from `stream_id`
    pub fn close_consumers_for(&self, stream_id: &StreamId) -> usize {
        let removed: Vec<GrantedConsumer> = {
            let mut consumers = self.consumers.lock();
            let ids: Vec<ConsumerId> = consumers
                .iter()
                .filter(|(_, granted)| &granted.stream_id == stream_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| consumers.remove(id)).collect()
        };

        for granted in &removed {
            granted.consumer.close();
        }
        if !removed.is_empty() {
            debug!(viewer_id = %self.id, stream_id = %stream_id, count = removed.len(), "Closed viewer consumers");
        }
        removed.len()
    }

    /// Push a notice to the connection; dropped when the connection is gone or backed up
    pub fn notify(&self, notice: ViewerNotice) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(notice)) = notifier.try_send(notice) {
            warn!(viewer_id = %self.id, ?notice, "Viewer notice queue full");
        }
    }

    /// Close every consumer; the transport is left to its registry
    pub fn close(&self) {
        let consumers: Vec<GrantedConsumer> =
            self.consumers.lock().drain().map(|(_, granted)| granted).collect();
        for granted in consumers {
            granted.consumer.close();
        }
    }
}
