//! Shared infrastructure for whipcast: configuration, logging and
//! downstream event publishing.

pub mod config;
pub mod events;
pub mod logging;

pub use config::Config;
pub use events::{DomainEvent, EventPublisher, EventType};
