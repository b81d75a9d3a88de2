//! Contract implementations backed by a plugin process.
//!
//! Contract calls are synchronous, so each one blocks on its RPC. They must
//! be made from the blocking pool (`spawn_blocking`), never from an async
//! task.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use courier_plugin::{
    Health, Payload, Plugin, PluginError, PluginHandle, PluginInfo, Procedure, Task,
};
use tokio::runtime::Handle;

struct Remote {
    handle: PluginHandle,
    info: PluginInfo,
    runtime: Handle,
}

impl Remote {
    /// Must be called inside the runtime that owns `handle`.
    fn new(handle: PluginHandle, info: PluginInfo) -> Self {
        Self {
            handle,
            info,
            runtime: Handle::current(),
        }
    }

    fn block<T>(&self, call: impl Future<Output = Result<T, PluginError>>) -> Result<T, PluginError> {
        self.runtime.block_on(call)
    }
}

pub struct RemoteTask(Remote);

impl RemoteTask {
    pub fn new(handle: PluginHandle, info: PluginInfo) -> Self {
        Self(Remote::new(handle, info))
    }

    pub fn handle(&self) -> &PluginHandle {
        &self.0.handle
    }
}

impl Plugin for RemoteTask {
    fn info(&self) -> PluginInfo {
        self.0.info.clone()
    }

    fn init(&self, config: Option<&Path>) -> Result<(), PluginError> {
        self.0.block(self.0.handle.init(config))
    }

    fn destroy(&self) -> Result<(), PluginError> {
        self.0.block(self.0.handle.destroy())
    }
}

impl Task for RemoteTask {
    /// A plugin that cannot answer within `timeout` is reported down.
    fn health(&self, timeout: Duration) -> Health {
        let call = async {
            tokio::time::timeout(timeout, self.0.handle.health(timeout))
                .await
                .map_err(|_| PluginError::Timeout(timeout.as_millis() as u64))?
        };
        self.0
            .block(call)
            .unwrap_or_else(|e| Health::down(e.to_string()))
    }

    fn run(&self, correlation_id: &str, input: Payload) -> Result<Payload, PluginError> {
        self.0.block(self.0.handle.run(correlation_id, input))
    }
}

pub struct RemoteProcedure(Remote);

impl RemoteProcedure {
    pub fn new(handle: PluginHandle, info: PluginInfo) -> Self {
        Self(Remote::new(handle, info))
    }

    pub fn handle(&self) -> &PluginHandle {
        &self.0.handle
    }
}

impl Plugin for RemoteProcedure {
    fn info(&self) -> PluginInfo {
        self.0.info.clone()
    }

    fn init(&self, config: Option<&Path>) -> Result<(), PluginError> {
        self.0.block(self.0.handle.init(config))
    }

    fn destroy(&self) -> Result<(), PluginError> {
        self.0.block(self.0.handle.destroy())
    }
}

impl Procedure for RemoteProcedure {
    /// Lossy view of [`Procedure::try_task_plugin_infos`]: an unreachable
    /// procedure lists nothing.
    fn task_plugin_infos(&self) -> Vec<PluginInfo> {
        self.try_task_plugin_infos().unwrap_or_else(|e| {
            tracing::error!(plugin = %self.0.info.id, "could not list required tasks: {e}");
            Vec::new()
        })
    }

    fn try_task_plugin_infos(&self) -> Result<Vec<PluginInfo>, PluginError> {
        self.0.block(self.0.handle.task_plugin_infos())
    }

    fn task_plugin_info(&self, step: &str) -> Result<PluginInfo, PluginError> {
        self.0.block(self.0.handle.task_plugin_info(step))
    }

    fn get_next_step(
        &self,
        correlation_id: &str,
        previous_step: Option<&str>,
        next_step: Option<&str>,
        payload: &Payload,
    ) -> Result<Option<String>, PluginError> {
        self.0
            .block(self.0.handle.next_step(correlation_id, previous_step, next_step, payload))
    }

    fn map_input(
        &self,
        correlation_id: &str,
        step: &str,
        previous_step: Option<&str>,
        payload: &Payload,
    ) -> Result<Payload, PluginError> {
        self.0
            .block(self.0.handle.map_input(correlation_id, step, previous_step, payload))
    }

    fn map_output(
        &self,
        correlation_id: &str,
        step: &str,
        previous_step: Option<&str>,
        output: Payload,
    ) -> Result<Payload, PluginError> {
        self.0
            .block(self.0.handle.map_output(correlation_id, step, previous_step, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use courier_plugin::{HealthStatus, NoHostServices, Served};
    use example_procedure::ExampleProcedure;
    use example_task::ExampleTask;
    use serde_json::json;

    async fn remote_task() -> RemoteTask {
        let handle = PluginHandle::in_process(Served::Task(Arc::new(ExampleTask::new())), Arc::new(NoHostServices));
        let info = handle.describe().await.unwrap().info;
        RemoteTask::new(handle, info)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_task_runs_through_the_wire() {
        let task = remote_task().await;
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("example-task.yaml");
        std::fs::write(&config, "example: wired\n").unwrap();

        let out = tokio::task::spawn_blocking(move || {
            assert_eq!(task.health(Duration::from_secs(1)).status, HealthStatus::Down);
            task.init(Some(&config)).unwrap();
            assert_eq!(task.health(Duration::from_secs(1)).status, HealthStatus::Up);
            let mut input = Payload::new();
            input.insert("integer".into(), json!(7));
            input.insert("string".into(), json!("s"));
            input.insert("bool".into(), json!(true));
            task.run("cid", input)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(out["example-string"], json!("integer=7; string=s; bool=true; example=wired"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_task_errors_keep_their_message() {
        let task = remote_task().await;
        let err = tokio::task::spawn_blocking(move || task.run("cid", Payload::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, PluginError::Rpc { .. }), "got {err:?}");
        assert!(err.to_string().contains("not been initialised"), "got {err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_procedure_answers_like_the_local_one() {
        let handle = PluginHandle::in_process(
            Served::Procedure(Arc::new(ExampleProcedure::new())),
            Arc::new(NoHostServices),
        );
        let info = handle.describe().await.unwrap().info;
        let procedure = RemoteProcedure::new(handle, info);

        let (first, required) = tokio::task::spawn_blocking(move || {
            let first = procedure.get_next_step("cid", None, None, &Payload::new()).unwrap();
            (first, procedure.task_plugin_infos())
        })
        .await
        .unwrap();

        assert_eq!(first.as_deref(), Some("step-1"));
        assert_eq!(required.len(), 1);
        assert_eq!(required[0].id, "example-task");
    }
}
