use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::contract::{Health, Payload, PluginInfo};
use crate::jsonrpc::{Id, METHOD_NOT_FOUND, Message, Request, Response};
use crate::message::*;
use crate::plugin::PluginError;
use crate::plugin_runtime::{self, Served};

/// Methods the host invokes on a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    Describe,
    Init,
    Destroy,
    Health,
    Run,
    TaskPluginInfos,
    TaskPluginInfo,
    NextStep,
    MapInput,
    MapOutput,
}

/// Answers requests and notifications a plugin sends to the host.
pub trait HostServices: Send + Sync + 'static {
    /// Returns the response for a call, `None` for a notification.
    fn handle(&self, plugin_id: &str, request: Request) -> Option<Response>;
}

/// Offers nothing: every call is answered with "Method not found".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostServices;

impl HostServices for NoHostServices {
    fn handle(&self, _plugin_id: &str, request: Request) -> Option<Response> {
        request
            .id
            .map(|id| Response::fail(id, METHOD_NOT_FOUND, "Method not found", Some(json!(request.method))))
    }
}

enum Outbound {
    Call(Request, oneshot::Sender<Response>),
    Notify(Request),
    Reply(Response),
}

/// How to start a plugin executable.
///
/// The child starts with an empty environment plus `env`.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Cloneable client for one plugin. Calls from any number of tasks are
/// multiplexed over the same pipe and matched to their responses by id.
#[derive(Clone, Debug)]
pub struct PluginHandle {
    tx: mpsc::Sender<Outbound>,
    plugin_id: String,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Call(req, _) => write!(f, "Call({})", req.method),
            Outbound::Notify(req) => write!(f, "Notify({})", req.method),
            Outbound::Reply(rsp) => write!(f, "Reply({:?})", rsp.id),
        }
    }
}

impl PluginHandle {
    pub fn id(&self) -> &str {
        &self.plugin_id
    }

    pub async fn call(&self, req: Request) -> Result<Response, PluginError> {
        let (tx_resp, rx_resp) = oneshot::channel();
        self.tx
            .send(Outbound::Call(req, tx_resp))
            .await
            .map_err(|_| PluginError::Transport(format!("plugin '{}' is gone", self.plugin_id)))?;
        rx_resp.await.map_err(|_| {
            PluginError::Transport(format!("plugin '{}' dropped the response", self.plugin_id))
        })
    }

    /// Calls `method` and deserialises `.result` into `T`.
    pub async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Option<Value>,
    ) -> Result<T, PluginError> {
        let req = Request::call(Id::String(Uuid::new_v4().to_string()), method, params);
        let value = self.call(req).await?.into_result()?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn rpc_notify<P: Serialize>(
        &self,
        method: Method,
        params: Option<P>,
    ) -> Result<(), PluginError> {
        let params = params.map(|p| serde_json::to_value(p)).transpose()?;
        self.tx
            .send(Outbound::Notify(Request::notification(method.as_ref(), params)))
            .await
            .map_err(|_| PluginError::Transport(format!("plugin '{}' is gone", self.plugin_id)))
    }

    pub async fn describe(&self) -> Result<DescribeResult, PluginError> {
        self.rpc_call(Method::Describe, None).await
    }

    pub async fn init(&self, config: Option<&Path>) -> Result<(), PluginError> {
        let params = InitParams {
            config: config.map(Path::to_path_buf),
        };
        let _: Value = self.rpc_call(Method::Init, Some(serde_json::to_value(params)?)).await?;
        Ok(())
    }

    pub async fn destroy(&self) -> Result<(), PluginError> {
        let _: Value = self.rpc_call(Method::Destroy, None).await?;
        Ok(())
    }

    pub async fn health(&self, timeout: Duration) -> Result<Health, PluginError> {
        let params = HealthParams {
            timeout_ms: timeout.as_millis() as u64,
        };
        self.rpc_call(Method::Health, Some(serde_json::to_value(params)?)).await
    }

    pub async fn run(&self, correlation_id: &str, input: Payload) -> Result<Payload, PluginError> {
        let params = RunParams {
            correlation_id: correlation_id.to_string(),
            input,
        };
        self.rpc_call(Method::Run, Some(serde_json::to_value(params)?)).await
    }

    pub async fn task_plugin_infos(&self) -> Result<Vec<PluginInfo>, PluginError> {
        self.rpc_call(Method::TaskPluginInfos, None).await
    }

    pub async fn task_plugin_info(&self, step: &str) -> Result<PluginInfo, PluginError> {
        let params = StepParams { step: step.to_string() };
        self.rpc_call(Method::TaskPluginInfo, Some(serde_json::to_value(params)?)).await
    }

    pub async fn next_step(
        &self,
        correlation_id: &str,
        previous_step: Option<&str>,
        next_step: Option<&str>,
        payload: &Payload,
    ) -> Result<Option<String>, PluginError> {
        let params = NextStepParams {
            correlation_id: correlation_id.to_string(),
            previous_step: previous_step.map(str::to_string),
            next_step: next_step.map(str::to_string),
            payload: payload.clone(),
        };
        let result: NextStepResult = self
            .rpc_call(Method::NextStep, Some(serde_json::to_value(params)?))
            .await?;
        Ok(result.next_step)
    }

    pub async fn map_input(
        &self,
        correlation_id: &str,
        step: &str,
        previous_step: Option<&str>,
        payload: &Payload,
    ) -> Result<Payload, PluginError> {
        self.map(Method::MapInput, correlation_id, step, previous_step, payload.clone())
            .await
    }

    pub async fn map_output(
        &self,
        correlation_id: &str,
        step: &str,
        previous_step: Option<&str>,
        output: Payload,
    ) -> Result<Payload, PluginError> {
        self.map(Method::MapOutput, correlation_id, step, previous_step, output)
            .await
    }

    async fn map(
        &self,
        method: Method,
        correlation_id: &str,
        step: &str,
        previous_step: Option<&str>,
        payload: Payload,
    ) -> Result<Payload, PluginError> {
        let params = MapParams {
            correlation_id: correlation_id.to_string(),
            step: step.to_string(),
            previous_step: previous_step.map(str::to_string),
            payload,
        };
        self.rpc_call(method, Some(serde_json::to_value(params)?)).await
    }

    /* ────────────────────────────────────────────────────────────────────────
     * 1)  In-process, over an in-memory pipe
     * ──────────────────────────────────────────────────────────────────────── */
    pub fn in_process(served: Served, services: Arc<dyn HostServices>) -> Self {
        let plugin_id = match &served {
            Served::Task(t) => t.info().id,
            Served::Procedure(p) => p.info().id,
        };
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        let id = plugin_id.clone();
        tokio::spawn(async move {
            if let Err(e) = plugin_runtime::serve(served, plugin_read, plugin_write).await {
                error!(plugin = %id, "in-process plugin stopped: {e:#}");
            }
        });
        let (host_read, host_write) = tokio::io::split(host);
        Self::connect(format!("in-process:{plugin_id}"), host_read, host_write, services)
    }

    /* ────────────────────────────────────────────────────────────────────────
     * 2)  Child-process (binary on disk)
     * ──────────────────────────────────────────────────────────────────────── */
    pub fn spawn(
        exe_path: &Path,
        options: SpawnOptions,
        services: Arc<dyn HostServices>,
    ) -> Result<Self, PluginError> {
        let mut command = TokioCommand::new(exe_path);
        command
            .args(&options.args)
            .env_clear()
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            PluginError::Transport(format!("could not start '{}': {e}", exe_path.display()))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Transport("plugin stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Transport("plugin stdout unavailable".into()))?;

        let plugin_id = exe_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("plugin")
            .to_string();

        let id = plugin_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!(plugin = %id, "plugin exited"),
                Ok(status) => warn!(plugin = %id, %status, "plugin exited abnormally"),
                Err(e) => warn!(plugin = %id, "could not wait for plugin: {e}"),
            }
        });

        Ok(Self::connect(plugin_id, stdout, stdin, services))
    }

    /// Wires JSON-RPC over `reader`/`writer` and returns the client end.
    ///
    /// Requests the plugin sends are handed to `services`. The plugin sees
    /// EOF on its input once every clone of the handle is dropped.
    pub fn connect<R, W>(
        plugin_id: impl Into<String>,
        reader: R,
        mut writer: W,
        services: Arc<dyn HostServices>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let plugin_id = plugin_id.into();
        let (tx, mut rx) = mpsc::channel::<Outbound>(32);

        // in-flight calls by encoded `id`
        let inflight: Arc<DashMap<String, oneshot::Sender<Response>>> = Arc::new(DashMap::new());

        {
            let inflight = Arc::clone(&inflight);
            let plugin_id = plugin_id.clone();
            tokio::spawn(async move {
                while let Some(out) = rx.recv().await {
                    let line = match out {
                        Outbound::Call(req, rsp_tx) => {
                            if let Some(id) = &req.id {
                                inflight.insert(id.key(), rsp_tx);
                            }
                            serde_json::to_string(&req)
                        }
                        Outbound::Notify(req) => serde_json::to_string(&req),
                        Outbound::Reply(rsp) => serde_json::to_string(&rsp),
                    };
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            error!(plugin = %plugin_id, "could not serialise message for plugin: {e}");
                            continue;
                        }
                    };
                    if writer.write_all(line.as_bytes()).await.is_err()
                        || writer.write_all(b"\n").await.is_err()
                        || writer.flush().await.is_err()
                    {
                        warn!(plugin = %plugin_id, "plugin input closed");
                        break;
                    }
                }
                let _ = writer.shutdown().await;
                inflight.clear();
            });
        }

        {
            let inflight = Arc::clone(&inflight);
            let replies = tx.downgrade();
            let plugin_id = plugin_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(&line) {
                        Ok(Message::Response(rsp)) => match inflight.remove(&rsp.id.key()) {
                            Some((_, waiter)) => {
                                let _ = waiter.send(rsp);
                            }
                            None => warn!(plugin = %plugin_id, id = ?rsp.id, error = ?rsp.error, "response matches no call"),
                        },
                        Ok(Message::Request(req)) => {
                            if let Some(reply) = services.handle(&plugin_id, req) {
                                if let Some(tx) = replies.upgrade() {
                                    let _ = tx.send(Outbound::Reply(reply)).await;
                                }
                            }
                        }
                        Err(e) => warn!(plugin = %plugin_id, "unparseable line from plugin: {e}"),
                    }
                }
                debug!(plugin = %plugin_id, "plugin output closed");
                inflight.clear();
            });
        }

        Self { tx, plugin_id }
    }
}
