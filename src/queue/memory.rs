use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{Delivery, QueueError, QueueHealth, QueueTransport};

/// In-process queue backed by a bounded channel.
pub struct MemoryQueue {
    tx: mpsc::Sender<Delivery>,
    rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
    health: watch::Sender<QueueHealth>,
    next_tag: AtomicU64,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (health, _) = watch::channel(QueueHealth::Up);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            health,
            next_tag: AtomicU64::new(1),
        }
    }

    pub fn set_health(&self, health: QueueHealth) {
        self.health.send_replace(health);
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn receive(&self) -> Result<mpsc::Receiver<Delivery>, QueueError> {
        self.rx
            .lock()
            .map_err(|_| QueueError::Closed)?
            .take()
            .ok_or(QueueError::AlreadySubscribed)
    }

    async fn send(&self, body: Vec<u8>) -> Result<(), QueueError> {
        if *self.health.borrow() == QueueHealth::Down {
            return Err(QueueError::Unavailable);
        }
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        self.tx
            .send(Delivery { tag, body })
            .await
            .map_err(|_| QueueError::Closed)
    }

    fn health(&self) -> watch::Receiver<QueueHealth> {
        self.health.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_to_one_subscriber() {
        let queue = MemoryQueue::new(4);
        let mut rx = queue.receive().await.unwrap();
        assert!(matches!(queue.receive().await, Err(QueueError::AlreadySubscribed)));

        queue.send(b"a".to_vec()).await.unwrap();
        queue.send(b"b".to_vec()).await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.body, b"a");
        assert_eq!(second.body, b"b");
        assert_ne!(first.tag, second.tag);
    }

    #[tokio::test]
    async fn refuses_to_publish_while_down() {
        let queue = MemoryQueue::new(4);
        let mut health = queue.health();
        queue.set_health(QueueHealth::Down);
        health.changed().await.unwrap();
        assert_eq!(*health.borrow(), QueueHealth::Down);
        assert!(matches!(queue.send(b"x".to_vec()).await, Err(QueueError::Unavailable)));

        queue.set_health(QueueHealth::Up);
        queue.send(b"x".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn send_fails_once_subscriber_is_gone() {
        let queue = MemoryQueue::new(1);
        drop(queue.receive().await.unwrap());
        assert!(matches!(queue.send(b"x".to_vec()).await, Err(QueueError::Closed)));
    }
}
