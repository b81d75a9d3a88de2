//! Durable file-spool queue.
//!
//! A publish writes `<id>.tmp` and renames it to `<id>.msg`; the rename is the
//! publish confirm. The subscriber claims a file by renaming it to
//! `<id>.claimed`, hands its bytes over and then deletes it. Claimed files left
//! behind by a crash are put back on the spool when the next subscriber starts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use crossbeam_utils::atomic::AtomicCell;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Delivery, QueueError, QueueHealth, QueueTransport};
use crate::ksuid::Ksuid;
use crate::watcher::{DirectoryWatcher, WatchedType};

const MESSAGE_EXT: &str = "msg";
const CLAIMED_EXT: &str = "claimed";
const DELIVERY_BUFFER: usize = 64;

pub struct SpoolQueue {
    dir: PathBuf,
    poll_interval: Duration,
    health: Arc<watch::Sender<QueueHealth>>,
    subscribed: AtomicCell<bool>,
    watcher: Mutex<Option<DirectoryWatcher>>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl SpoolQueue {
    /// Opens (creating if needed) the spool at `dir` and starts probing its
    /// health every `health_interval`.
    pub async fn open(
        dir: impl Into<PathBuf>,
        poll_interval: Duration,
        health_interval: Duration,
    ) -> Result<Self, QueueError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let (health, _) = watch::channel(probe(&dir).await);
        let health = Arc::new(health);
        let probe = tokio::spawn(probe_loop(dir.clone(), Arc::clone(&health), health_interval));
        info!(dir = %dir.display(), "spool queue opened");

        Ok(Self {
            dir,
            poll_interval,
            health,
            subscribed: AtomicCell::new(false),
            watcher: Mutex::new(None),
            probe: Mutex::new(Some(probe)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn recover_claimed(&self) -> Result<(), QueueError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if has_extension(&path, CLAIMED_EXT) {
                warn!(path = %path.display(), "returning unfinished claim to the spool");
                tokio::fs::rename(&path, path.with_extension(MESSAGE_EXT)).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for SpoolQueue {
    async fn receive(&self) -> Result<mpsc::Receiver<Delivery>, QueueError> {
        if self.subscribed.swap(true) {
            return Err(QueueError::AlreadySubscribed);
        }
        self.recover_claimed().await?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let reader = Arc::new(SpoolReader { tx });
        let watcher = DirectoryWatcher::new(self.dir.clone(), reader, self.poll_interval, true)?;
        *self.watcher.lock().map_err(|_| QueueError::Closed)? = Some(watcher);
        Ok(rx)
    }

    async fn send(&self, body: Vec<u8>) -> Result<(), QueueError> {
        if *self.health.borrow() == QueueHealth::Down {
            return Err(QueueError::Unavailable);
        }
        let id = Ksuid::new().to_string();
        let tmp = self.dir.join(format!("{id}.tmp"));
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, self.dir.join(format!("{id}.{MESSAGE_EXT}"))).await?;
        debug!(id = %id, bytes = body.len(), "published to spool");
        Ok(())
    }

    fn health(&self) -> watch::Receiver<QueueHealth> {
        self.health.subscribe()
    }

    async fn shutdown(&self) {
        if let Ok(mut probe) = self.probe.lock() {
            if let Some(probe) = probe.take() {
                probe.abort();
            }
        }
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(watcher) = watcher.take() {
                watcher.shutdown();
            }
        }
    }
}

struct SpoolReader {
    tx: mpsc::Sender<Delivery>,
}

#[async_trait]
impl WatchedType for SpoolReader {
    fn is_relevant(&self, path: &Path) -> bool {
        has_extension(path, MESSAGE_EXT)
    }

    async fn on_create_or_modify(&self, path: &Path) -> anyhow::Result<()> {
        let claimed = path.with_extension(CLAIMED_EXT);
        match tokio::fs::rename(path, &claimed).await {
            Ok(()) => {}
            // already claimed by an earlier event for the same file
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let body = tokio::fs::read(&claimed).await?;
        let tag = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.tx
            .send(Delivery { tag, body })
            .await
            .map_err(|_| anyhow!("spool subscriber is gone"))?;
        tokio::fs::remove_file(&claimed).await?;
        Ok(())
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

async fn probe(dir: &Path) -> QueueHealth {
    let file = dir.join(".probe");
    let writable = tokio::fs::write(&file, b"").await.is_ok() && tokio::fs::remove_file(&file).await.is_ok();
    if writable { QueueHealth::Up } else { QueueHealth::Down }
}

async fn probe_loop(dir: PathBuf, health: Arc<watch::Sender<QueueHealth>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let current = probe(&dir).await;
        let changed = health.send_if_modified(|h| {
            let changed = *h != current;
            *h = current;
            changed
        });
        if changed {
            match current {
                QueueHealth::Up => info!(dir = %dir.display(), "spool queue is up"),
                QueueHealth::Down => warn!(dir = %dir.display(), "spool queue is down"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spool(dir: &Path) -> SpoolQueue {
        SpoolQueue::open(dir, Duration::from_millis(50), Duration::from_secs(60))
            .await
            .unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_published_and_spooled_files() {
        let dir = tempfile::tempdir().unwrap();
        let queue = spool(dir.path()).await;
        assert_eq!(*queue.health().borrow(), QueueHealth::Up);

        queue.send(b"before".to_vec()).await.unwrap();
        let mut rx = queue.receive().await.unwrap();
        assert_eq!(next(&mut rx).await.body, b"before");

        queue.send(b"after".to_vec()).await.unwrap();
        let delivery = next(&mut rx).await;
        assert_eq!(delivery.body, b"after");
        assert_eq!(delivery.tag.len(), 27);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let left: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(left.is_empty());
        queue.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unfinished_claims_are_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("crashed.claimed"), b"again").unwrap();

        let queue = spool(dir.path()).await;
        let mut rx = queue.receive().await.unwrap();
        let delivery = next(&mut rx).await;
        assert_eq!(delivery.tag, "crashed");
        assert_eq!(delivery.body, b"again");
        assert!(matches!(queue.receive().await, Err(QueueError::AlreadySubscribed)));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn ignores_temporary_files() {
        let reader = SpoolReader { tx: mpsc::channel(1).0 };
        assert!(reader.is_relevant(Path::new("/spool/a.msg")));
        assert!(!reader.is_relevant(Path::new("/spool/a.tmp")));
        assert!(!reader.is_relevant(Path::new("/spool/a.claimed")));
    }
}
