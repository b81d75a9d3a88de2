use anyhow::Result;
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};
use tracing::{debug, warn};

/// Something that reacts to files appearing in (or leaving) a directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Polls one directory and dispatches relevant events, one at a time, to a
/// [`WatchedType`]. Dropping it (or calling `shutdown`) stops dispatch.
pub struct DirectoryWatcher {
    _watcher: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl DirectoryWatcher {
    /// Starts watching `dir`. With `initial_scan`, files already present are
    /// dispatched first, in file name order, before any polled event.
    pub fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        poll_interval: Duration,
        initial_scan: bool,
    ) -> notify::Result<DirectoryWatcher> {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "directory does not exist");
            return Err(notify::Error::path_not_found().add_path(dir));
        }

        let (tx, rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        // The poller snapshots the directory when it starts; anything already
        // there is picked up by the initial scan instead.
        let mut watcher = PollWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let dispatch = tokio::spawn(dispatch(dir, watched, rx, initial_scan));
        Ok(DirectoryWatcher {
            _watcher: watcher,
            dispatch,
        })
    }

    pub fn shutdown(self) {
        self.dispatch.abort();
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

async fn dispatch(
    dir: PathBuf,
    watched: Arc<dyn WatchedType>,
    mut rx: UnboundedReceiver<notify::Result<Event>>,
    initial_scan: bool,
) {
    if initial_scan {
        match scan(&dir).await {
            Ok(paths) => {
                for path in paths.iter().filter(|p| watched.is_relevant(p)) {
                    if let Err(e) = watched.on_create_or_modify(path).await {
                        warn!(?path, ?e, "Failed to handle existing file");
                    }
                }
            }
            Err(e) => warn!(dir = %dir.display(), ?e, "Initial scan failed"),
        }
    }

    while let Some(res) = rx.recv().await {
        match res {
            Ok(Event {
                kind: EventKind::Create(CreateKind::Any) | EventKind::Modify(ModifyKind::Data(_)),
                mut paths,
                ..
            }) => {
                paths.sort();
                for path in paths.iter().filter(|p| watched.is_relevant(p)) {
                    if let Err(e) = watched.on_create_or_modify(path).await {
                        warn!(?path, ?e, "Failed to handle create/modify");
                    }
                }
            }
            Ok(Event {
                kind: EventKind::Remove(_),
                paths,
                ..
            }) => {
                for path in paths.iter().filter(|p| watched.is_relevant(p)) {
                    if let Err(e) = watched.on_remove(path).await {
                        warn!(?path, ?e, "Failed to handle removal");
                    }
                }
            }
            Err(e) => warn!(?e, "Watcher error"),
            _ => {}
        }
    }
    debug!(dir = %dir.display(), "watcher dispatch stopped");
}

async fn scan(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}
