//! Queue transports the router consumes raw deliveries from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

mod memory;
mod spool;

pub use memory::MemoryQueue;
pub use spool::SpoolQueue;

/// One message body as it came off the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueHealth {
    Up,
    Down,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is unavailable")]
    Unavailable,
    #[error("queue already has a subscriber")]
    AlreadySubscribed,
    #[error("queue is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("could not watch spool directory: {0}")]
    Watch(#[from] notify::Error),
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Subscribes to deliveries. A transport serves a single subscriber.
    async fn receive(&self) -> Result<mpsc::Receiver<Delivery>, QueueError>;

    /// Publishes `body`. `Ok` means the transport confirmed the publish.
    async fn send(&self, body: Vec<u8>) -> Result<(), QueueError>;

    fn health(&self) -> watch::Receiver<QueueHealth>;

    async fn shutdown(&self) {}
}
