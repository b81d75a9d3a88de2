//! Claims incoming messages, processes them on the blocking pool and
//! persists exactly one terminal state per claimed message.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ingest::{self, InFlight};
use super::processor::{Processor, StepErrorKind};
use crate::logger::BrokerMetrics;
use crate::message::{Message, Status};
use crate::plugins::PluginManager;
use crate::queue::{QueueError, QueueTransport};
use crate::store::MessageStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub poll_interval: Duration,
    pub poll_batch_size: usize,
    pub channel_capacity: usize,
    pub workers: usize,
    pub default_procedure: String,
    /// How long `destroy` waits for running steps before aborting.
    pub shutdown_grace: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_batch_size: 10,
            channel_capacity: 64,
            workers: 4,
            default_procedure: "example-procedure".into(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router is already running")]
    AlreadyRunning,
    #[error("router was destroyed and cannot be restarted")]
    Destroyed,
    #[error("could not subscribe to the queue: {0}")]
    Queue(#[from] QueueError),
}

/// State shared by the consumer and its workers.
struct Shared {
    store: Arc<dyn MessageStore>,
    processor: Processor,
    in_flight: InFlight,
    metrics: BrokerMetrics,
    cancel: CancellationToken,
}

pub struct Router {
    shared: Arc<Shared>,
    queue: Option<Arc<dyn QueueTransport>>,
    config: RouterConfig,
    state: AtomicCell<RouterState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    pub fn new(
        store: Arc<dyn MessageStore>,
        plugins: Arc<PluginManager>,
        queue: Option<Arc<dyn QueueTransport>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                processor: Processor::new(plugins),
                in_flight: Arc::new(DashMap::new()),
                metrics: BrokerMetrics::new(),
                cancel: CancellationToken::new(),
            }),
            queue,
            config,
            state: AtomicCell::new(RouterState::Stopped),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> RouterState {
        self.state.load()
    }

    /// Number of messages handed to the router and not yet finalised.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    /// Spawns the store poller, the queue consumer (if a queue is set) and
    /// the message consumer.
    pub async fn start(&self) -> Result<(), RouterError> {
        if self.shared.cancel.is_cancelled() {
            return Err(RouterError::Destroyed);
        }
        self.state
            .compare_exchange(RouterState::Stopped, RouterState::Running)
            .map_err(|_| RouterError::AlreadyRunning)?;

        let deliveries = match &self.queue {
            Some(queue) => match queue.receive().await {
                Ok(deliveries) => Some(deliveries),
                Err(e) => {
                    self.state.store(RouterState::Stopped);
                    return Err(e.into());
                }
            },
            None => None,
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let shared = &self.shared;
        let mut handles = Vec::new();

        handles.push(tokio::spawn(ingest::poll_store(
            Arc::clone(&shared.store),
            tx.clone(),
            Arc::clone(&shared.in_flight),
            self.config.poll_interval,
            self.config.poll_batch_size,
            shared.cancel.clone(),
        )));
        if let Some(deliveries) = deliveries {
            handles.push(tokio::spawn(ingest::consume_queue(
                Arc::clone(&shared.store),
                deliveries,
                tx.clone(),
                Arc::clone(&shared.in_flight),
                self.config.default_procedure.clone(),
                shared.cancel.clone(),
            )));
        }
        drop(tx);
        handles.push(tokio::spawn(consume(Arc::clone(shared), rx, self.config.workers)));

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        info!(workers = self.config.workers, "router started");
        Ok(())
    }

    /// Stops intake and waits for running steps to reach a step boundary.
    /// Messages interrupted there stay `in_process`.
    pub async fn destroy(&self) {
        self.state.store(RouterState::Stopping);
        self.shared.cancel.cancel();

        let handles: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for mut handle in handles {
            if tokio::time::timeout(self.config.shutdown_grace, &mut handle).await.is_err() {
                warn!("router task did not stop in time, aborting it");
                handle.abort();
            }
        }

        self.state.store(RouterState::Stopped);
        info!(in_flight = self.in_flight(), "router stopped");
    }
}

async fn consume(shared: Arc<Shared>, mut rx: mpsc::Receiver<Message>, workers: usize) {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut running = JoinSet::new();

    loop {
        let message = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let permit = tokio::select! {
            _ = shared.cancel.cancelled() => None,
            permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            shared.in_flight.remove(&message.correlation_id);
            break;
        };

        let Some(claimed) = claim(&shared, message).await else {
            continue;
        };

        let shared = Arc::clone(&shared);
        running.spawn(async move {
            let _permit = permit;
            work(shared, claimed).await;
        });

        while let Some(joined) = running.try_join_next() {
            if let Err(e) = joined {
                error!("message worker failed: {e}");
            }
        }
    }

    // everything still buffered is in the store as waiting
    rx.close();
    while let Ok(message) = rx.try_recv() {
        shared.in_flight.remove(&message.correlation_id);
    }

    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!("message worker failed: {e}");
        }
    }
}

async fn claim(shared: &Shared, mut message: Message) -> Option<Message> {
    let correlation_id = message.correlation_id.clone();

    // a poll snapshot can outlive the message's whole run
    if message.id.is_some() {
        match shared.store.find_by_correlation_id(&correlation_id).await {
            Ok(Some(current)) if current.status == Status::WaitingForProcessing => {}
            Ok(_) => {
                debug!(correlation_id = %correlation_id, "message is no longer waiting");
                shared.in_flight.remove(&correlation_id);
                return None;
            }
            Err(e) => {
                error!(correlation_id = %correlation_id, "could not check message state: {e}");
                shared.in_flight.remove(&correlation_id);
                return None;
            }
        }
    }

    message.claim();
    match shared.store.save(message).await {
        Ok(claimed) => {
            shared.metrics.messages_claimed.add(1, &[]);
            info!(target: "message", correlation_id = %claimed.correlation_id, procedure = %claimed.procedure, "message claimed");
            Some(claimed)
        }
        Err(e) => {
            error!(correlation_id = %correlation_id, "could not claim message: {e}");
            shared.in_flight.remove(&correlation_id);
            None
        }
    }
}

async fn work(shared: Arc<Shared>, message: Message) {
    let started = Instant::now();
    let correlation_id = message.correlation_id.clone();
    let fallback = message.clone();

    let processor = shared.processor.clone();
    let cancel = shared.cancel.clone();
    let outcome = tokio::task::spawn_blocking(move || processor.process(message, &cancel)).await;

    let finalised = match outcome {
        Ok(Ok(mut done)) => {
            done.finish();
            shared.metrics.messages_finished.add(1, &[]);
            Some(done)
        }
        Ok(Err(e)) if e.kind == StepErrorKind::Interrupted => {
            warn!(correlation_id = %correlation_id, next_step = ?e.message.next_step, "processing interrupted, message stays in process");
            None
        }
        Ok(Err(e)) => {
            let rendered = e.render();
            error!(correlation_id = %correlation_id, "{}", rendered.trim_end());
            let mut failed = *e.message;
            failed.fail(rendered);
            shared.metrics.messages_failed.add(1, &[]);
            Some(failed)
        }
        Err(e) => {
            error!(correlation_id = %correlation_id, "processing panicked: {e}");
            let mut failed = fallback;
            failed.fail(format!("Processing panicked.\n  correlation id: {correlation_id}\nCaused by: {e}\n"));
            shared.metrics.messages_failed.add(1, &[]);
            Some(failed)
        }
    };

    if let Some(message) = finalised {
        let status = message.status;
        match shared.store.save(message).await {
            Ok(_) => info!(target: "message", correlation_id = %correlation_id, %status, "message finalised"),
            Err(e) => error!(correlation_id = %correlation_id, %status, "could not persist final state: {e}"),
        }
    }

    shared.in_flight.remove(&correlation_id);
    shared
        .metrics
        .message_latency_ms
        .record(started.elapsed().as_secs_f64() * 1_000.0, &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use courier_plugin::{Payload, Plugin, PluginError, PluginInfo, Procedure, Task};
    use example_procedure::ExampleProcedure;
    use example_task::ExampleTask;
    use serde_json::json;

    use crate::plugins::{PluginSource, SharedNamespace};
    use crate::queue::MemoryQueue;
    use crate::store::SqliteMessageStore;

    async fn example_plugins(dir: &tempfile::TempDir) -> Arc<PluginManager> {
        let config = dir.path().join("example-task.yaml");
        std::fs::write(&config, "example: routed\n").unwrap();
        let plugins = PluginManager::load(
            vec![PluginSource::instance(Arc::new(ExampleTask::new()) as Arc<dyn Task>).with_config(&config)],
            vec![PluginSource::instance(Arc::new(ExampleProcedure::new()) as Arc<dyn Procedure>)],
            SharedNamespace::default(),
        )
        .await
        .unwrap();
        Arc::new(plugins)
    }

    fn fast_config() -> RouterConfig {
        RouterConfig {
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(5),
            ..RouterConfig::default()
        }
    }

    async fn wait_for_terminal(store: &SqliteMessageStore, ids: &[String]) -> Vec<Message> {
        for _ in 0..200 {
            let mut done = Vec::new();
            for id in ids {
                if let Some(m) = store.find_by_correlation_id(id).await.unwrap() {
                    if m.status.is_terminal() {
                        done.push(m);
                    }
                }
            }
            if done.len() == ids.len() {
                return done;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("messages did not reach a terminal state");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn polled_messages_finish() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let mut payload = Payload::new();
        payload.insert("string".into(), json!("x"));
        let saved = store.save(Message::new("example-procedure", payload)).await.unwrap();

        let router = Router::new(store.clone(), example_plugins(&dir).await, None, fast_config());
        router.start().await.unwrap();
        assert_eq!(router.state(), RouterState::Running);
        assert!(matches!(router.start().await, Err(RouterError::AlreadyRunning)));

        let done = wait_for_terminal(&store, &[saved.correlation_id.clone()]).await;
        router.destroy().await;
        assert_eq!(router.state(), RouterState::Stopped);

        let m = &done[0];
        assert_eq!(m.status, Status::Finished);
        assert_eq!(m.previous_step.as_deref(), Some("step-5"));
        assert_eq!(m.next_step, None);
        assert_eq!(m.error, None);
        assert!(m.last_changed_time >= saved.last_changed_time);
        assert!(m.payload["example-string"].as_str().unwrap().starts_with("integer=5;"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_procedure_finishes_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let saved = store.save(Message::new("missing-procedure", Payload::new())).await.unwrap();

        let router = Router::new(store.clone(), example_plugins(&dir).await, None, fast_config());
        router.start().await.unwrap();
        let done = wait_for_terminal(&store, &[saved.correlation_id.clone()]).await;
        router.destroy().await;

        assert_eq!(done[0].status, Status::FinishedWithError);
        assert!(done[0].error.as_deref().unwrap().contains("Unknown procedure."));
        assert_eq!(done[0].next_step, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_messages_are_persisted_and_finished() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let queue = Arc::new(MemoryQueue::new(8));

        let router = Router::new(
            store.clone(),
            example_plugins(&dir).await,
            Some(queue.clone() as Arc<dyn QueueTransport>),
            fast_config(),
        );
        router.start().await.unwrap();
        queue.send(b"from the queue".to_vec()).await.unwrap();

        let mut finished = Vec::new();
        for _ in 0..200 {
            finished = store
                .find_top_n_by_status_order_by_reception_time_asc(Status::Finished, 10)
                .await
                .unwrap();
            if !finished.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        router.destroy().await;

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].procedure, "example-procedure");
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn destroyed_router_cannot_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let router = Router::new(store, example_plugins(&dir).await, None, fast_config());
        router.start().await.unwrap();
        router.destroy().await;
        assert!(matches!(router.start().await, Err(RouterError::Destroyed)));
    }

    /// The example task, slowed down so steps are still running at shutdown.
    struct SlowTask(ExampleTask);

    impl Plugin for SlowTask {
        fn info(&self) -> PluginInfo {
            self.0.info()
        }
        fn init(&self, config: Option<&Path>) -> Result<(), PluginError> {
            self.0.init(config)
        }
    }

    impl Task for SlowTask {
        fn run(&self, correlation_id: &str, input: Payload) -> Result<Payload, PluginError> {
            std::thread::sleep(Duration::from_millis(300));
            self.0.run(correlation_id, input)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn destroy_keeps_the_queued_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("example-task.yaml");
        std::fs::write(&config, "example: slow\n").unwrap();
        let plugins = PluginManager::load(
            vec![PluginSource::instance(Arc::new(SlowTask(ExampleTask::new())) as Arc<dyn Task>).with_config(&config)],
            vec![PluginSource::instance(Arc::new(ExampleProcedure::new()) as Arc<dyn Procedure>)],
            SharedNamespace::default(),
        )
        .await
        .unwrap();

        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let queue = Arc::new(MemoryQueue::new(16));
        let router = Router::new(
            store.clone(),
            Arc::new(plugins),
            Some(queue.clone() as Arc<dyn QueueTransport>),
            RouterConfig { workers: 1, ..fast_config() },
        );
        router.start().await.unwrap();
        for i in 0..10 {
            queue.send(format!("m{i}").into_bytes()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        router.destroy().await;

        let mut by_status = Vec::new();
        for status in [
            Status::WaitingForProcessing,
            Status::InProcess,
            Status::Finished,
            Status::FinishedWithError,
        ] {
            let found = store
                .find_top_n_by_status_order_by_reception_time_asc(status, 100)
                .await
                .unwrap();
            by_status.push(found.len());
        }

        // one message was mid-step and stays in process, none is lost
        assert_eq!(by_status, vec![9, 1, 0, 0]);
        assert_eq!(router.in_flight(), 0);
    }
}
