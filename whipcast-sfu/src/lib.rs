//! Whipcast SFU (Selective Forwarding Unit) control plane
//!
//! Accepts one published stream per stream id over WHIP and fans it out to
//! any number of viewers negotiated over a WebSocket signaling protocol. Media
//! is forwarded, never transcoded; packet handling lives behind the
//! [`engine`] traits.
//!
//! ## Architecture
//!
//! - **`WorkerPool`**: round-robin over media engine workers, restart or fail fast on death
//! - **`RouterRegistry`** / **`TransportRegistry`**: one router per stream, transports keyed by owner
//! - **`Stream`**: router, producers by kind and weakly held viewers
//! - **`Viewer`**: a viewer transport and the consumers granted to it
//! - **`StreamManager`**: source of truth for live streams and the teardown cascade
//! - **`whip`**: publish negotiation (SDP offer in, SDP answer out)
//! - **`SignalingSession`**: per-connection viewer state machine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use whipcast_sfu::{engine::local::LocalEngine, StreamManager, WorkerPool};
//!
//! let engine = Arc::new(LocalEngine::new(&(&config.media).into()));
//! let pool = WorkerPool::start(engine, config.media.worker_count(), config.media.on_worker_death, shutdown).await?;
//! let manager = StreamManager::new(config.media.clone(), pool, events);
//! let answer = whipcast_sfu::whip::publish(&manager, &"cam".into(), &offer).await?;
//! ```

pub mod engine;
mod error;
mod manager;
mod router_registry;
pub mod sdp;
pub mod signaling;
mod stats;
mod stream;
mod transport_registry;
mod types;
mod viewer;
pub mod whip;
mod worker_pool;

pub use error::{SfuError, SfuResult};
pub use manager::{StreamManager, StreamSummary};
pub use router_registry::RouterRegistry;
pub use signaling::{ClientRequest, Reply, SessionState, SignalingSession};
pub use stream::Stream;
pub use transport_registry::{TeardownRequest, TransportOwner, TransportRegistry};
pub use types::{ConsumerId, MediaKind, ProducerId, RouterId, StreamId, TransportId, ViewerId, WorkerId};
pub use viewer::{Viewer, ViewerNotice};
pub use worker_pool::WorkerPool;
