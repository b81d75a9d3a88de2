//! Plugin-side runtime: wires line-delimited JSON-RPC traffic to a
//! [`Task`] or [`Procedure`] implementation.
//!
//! Usage, in a plugin binary:
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     courier_plugin::plugin_runtime::run_task(MyTask::default()).await
//! }
//! ```
//!
//! Every request runs on the blocking pool, so a slow `run` does not stop the
//! plugin from answering other calls. Responses funnel through one writer
//! task. Stdout belongs to the protocol: log with `tracing`, which the runtime
//! forwards to the host as `log.record` notifications.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    sync::mpsc::{self, UnboundedSender},
    task::JoinSet,
};
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

use crate::{
    contract::{Capability, Procedure, Task},
    host_log::HostLogLayer,
    jsonrpc::{Id, Message, Request, Response, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR},
    message::*,
    plugin::PluginError,
    plugin_actor::Method,
};

/// Environment variable naming a directory for the plugin's own log files.
pub const LOG_DIR_ENV: &str = "COURIER_PLUGIN_LOG_DIR";

/// The plugin instance a runtime serves.
#[derive(Clone)]
pub enum Served {
    Task(Arc<dyn Task>),
    Procedure(Arc<dyn Procedure>),
}

impl Served {
    pub fn capability(&self) -> Capability {
        match self {
            Served::Task(_) => Capability::Task,
            Served::Procedure(_) => Capability::Procedure,
        }
    }
}

/// Serves `task` on stdin/stdout until the host closes stdin.
pub async fn run_task<T: Task + 'static>(task: T) -> Result<()> {
    run(Served::Task(Arc::new(task))).await
}

/// Serves `procedure` on stdin/stdout until the host closes stdin.
pub async fn run_procedure<P: Procedure + 'static>(procedure: P) -> Result<()> {
    run(Served::Procedure(Arc::new(procedure))).await
}

async fn run(served: Served) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    init_plugin_tracing(tx.clone());
    serve_with(served, io::stdin(), io::stdout(), tx, rx).await
}

/// Serves `served` over any reader/writer pair until the reader hits EOF.
pub async fn serve<R, W>(served: Served, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    serve_with(served, reader, writer, tx, rx).await
}

async fn serve_with<R, W>(
    served: Served,
    reader: R,
    writer: W,
    tx: UnboundedSender<String>,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer_task = tokio::spawn(async move {
        let mut w = BufWriter::new(writer);
        while let Some(line) = rx.recv().await {
            if let Err(e) = w.write_all(line.as_bytes()).await {
                eprintln!("plugin output write error: {e}");
                break;
            }
            if w.flush().await.is_err() {
                eprintln!("plugin output flush error");
                break;
            }
        }
    });

    let mut handlers = JoinSet::new();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? != 0 {
        trim_newlines(&mut line);
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Message>(&line) {
            Ok(Message::Request(req)) => {
                let served = served.clone();
                let tx = tx.clone();
                handlers.spawn_blocking(move || {
                    let id = req.id.clone();
                    let response = dispatch(&served, req);
                    if let Some(id) = id {
                        enqueue(&tx, &response.with_id(id));
                    }
                });
            }
            Ok(Message::Response(rsp)) => {
                warn!(id = ?rsp.id, "ignoring unexpected response from host");
            }
            Err(e) => {
                let err = Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(e.to_string())));
                enqueue(&tx, &err);
            }
        }
        line.clear();
    }

    while let Some(joined) = handlers.join_next().await {
        if let Err(e) = joined {
            error!("plugin request handler panicked: {e}");
        }
    }
    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

fn trim_newlines(s: &mut String) {
    while matches!(s.chars().last(), Some('\n' | '\r')) {
        s.pop();
    }
}

fn enqueue<T: Serialize>(tx: &UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            let _ = tx.send(format!("{line}\n"));
        }
        Err(e) => eprintln!("could not serialise plugin output: {e}"),
    }
}

/// Outcome of one method call before an id is attached.
enum Reply {
    Ok(Value),
    Err(crate::jsonrpc::Error),
}

impl Reply {
    fn with_id(self, id: Id) -> Response {
        match self {
            Reply::Ok(v) => Response::success(id, v),
            Reply::Err(e) => Response::failure(id, e),
        }
    }
}

fn dispatch(served: &Served, req: Request) -> Reply {
    let method = match req.method.parse::<Method>() {
        Ok(m) => m,
        Err(_) => return not_found(&req.method),
    };
    let params = req.params.unwrap_or(Value::Null);

    match (method, served) {
        (Method::Describe, Served::Task(t)) => answer(Ok(DescribeResult {
            capability: Capability::Task,
            info: t.info(),
        })),
        (Method::Describe, Served::Procedure(p)) => answer(Ok(DescribeResult {
            capability: Capability::Procedure,
            info: p.info(),
        })),
        (Method::Init, _) => with_params(params, |p: InitParams| {
            let config: Option<PathBuf> = p.config;
            match served {
                Served::Task(t) => t.init(config.as_deref()),
                Served::Procedure(p) => p.init(config.as_deref()),
            }
        }),
        (Method::Destroy, Served::Task(t)) => answer(t.destroy()),
        (Method::Destroy, Served::Procedure(p)) => answer(p.destroy()),
        (Method::Health, Served::Task(t)) => with_params(params, |p: HealthParams| {
            Ok::<_, PluginError>(t.health(Duration::from_millis(p.timeout_ms)))
        }),
        (Method::Run, Served::Task(t)) => {
            with_params(params, |p: RunParams| t.run(&p.correlation_id, p.input))
        }
        (Method::TaskPluginInfos, Served::Procedure(p)) => {
            answer(p.try_task_plugin_infos())
        }
        (Method::TaskPluginInfo, Served::Procedure(p)) => {
            with_params(params, |s: StepParams| p.task_plugin_info(&s.step))
        }
        (Method::NextStep, Served::Procedure(p)) => with_params(params, |n: NextStepParams| {
            p.get_next_step(
                &n.correlation_id,
                n.previous_step.as_deref(),
                n.next_step.as_deref(),
                &n.payload,
            )
            .map(|next_step| NextStepResult { next_step })
        }),
        (Method::MapInput, Served::Procedure(p)) => with_params(params, |m: MapParams| {
            p.map_input(&m.correlation_id, &m.step, m.previous_step.as_deref(), &m.payload)
        }),
        (Method::MapOutput, Served::Procedure(p)) => with_params(params, |m: MapParams| {
            p.map_output(&m.correlation_id, &m.step, m.previous_step.as_deref(), m.payload)
        }),
        (method, served) => {
            warn!(%method, capability = %served.capability(), "method not offered by this plugin");
            not_found(method.as_ref())
        }
    }
}

fn not_found(method: &str) -> Reply {
    Reply::Err(crate::jsonrpc::Error {
        code: METHOD_NOT_FOUND,
        message: "Method not found".to_string(),
        data: Some(json!(method)),
    })
}

fn with_params<P, T, F>(params: Value, f: F) -> Reply
where
    P: DeserializeOwned,
    T: Serialize,
    F: FnOnce(P) -> Result<T, PluginError>,
{
    match serde_json::from_value::<P>(params) {
        Ok(p) => answer(f(p)),
        Err(e) => Reply::Err(crate::jsonrpc::Error {
            code: INVALID_PARAMS,
            message: "Invalid params".to_string(),
            data: Some(json!(e.to_string())),
        }),
    }
}

fn answer<T: Serialize>(result: Result<T, PluginError>) -> Reply {
    match result.and_then(|v| serde_json::to_value(v).map_err(PluginError::from)) {
        Ok(v) => Reply::Ok(v),
        Err(e) => Reply::Err(e.to_rpc()),
    }
}

/// Installs the plugin's tracing subscriber: every event goes to the host as
/// a `log.record` notification, and additionally to a daily log file when
/// [`LOG_DIR_ENV`] is set.
fn init_plugin_tracing(tx: UnboundedSender<String>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let host_layer = HostLogLayer::new(tx);

    let file_layer = std::env::var_os(LOG_DIR_ENV).map(|dir| {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir).ok();
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(tracing_appender::rolling::daily(dir, "plugin.log"))
            .boxed()
    });

    let installed = Registry::default()
        .with(filter)
        .with(host_layer)
        .with(file_layer)
        .try_init();
    if installed.is_err() {
        eprintln!("a tracing subscriber was already installed; plugin logs stay local");
    }
}
