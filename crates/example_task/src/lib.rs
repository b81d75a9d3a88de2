//! `example-task`: formats its input together with a configured value.

use std::{fs, path::Path, sync::OnceLock, time::Duration};

use courier_plugin::{
    Health, Payload, Plugin, PluginError, PluginInfo, SPI_VERSION, Task, json,
};
use serde::Deserialize;
use tracing::info;

pub mod mapper;

use mapper::{TaskInput, TaskOutput};

pub const ID: &str = "example-task";

#[derive(Debug, Clone, Deserialize)]
pub struct ExampleTaskConfig {
    pub example: String,
}

#[derive(Debug, Default)]
pub struct ExampleTask {
    config: OnceLock<ExampleTaskConfig>,
}

impl ExampleTask {
    pub fn new() -> Self {
        Self::default()
    }

    fn config(&self) -> Result<&ExampleTaskConfig, PluginError> {
        self.config.get().ok_or(PluginError::NotInitialised)
    }
}

fn render<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "null".to_string(), ToString::to_string)
}

impl Plugin for ExampleTask {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(ID, env!("CARGO_PKG_VERSION"), SPI_VERSION)
    }

    fn init(&self, config: Option<&Path>) -> Result<(), PluginError> {
        let path = config
            .ok_or_else(|| PluginError::Config(format!("{ID} needs a configuration file")))?;
        info!(config_file = %path.display(), "init task");

        let raw = fs::read_to_string(path)
            .map_err(|e| PluginError::Config(format!("{}: {e}", path.display())))?;
        let parsed: ExampleTaskConfig = serde_yaml_bw::from_str(&raw)
            .map_err(|e| PluginError::Config(format!("{}: {e}", path.display())))?;

        self.config
            .set(parsed)
            .map_err(|_| PluginError::Config("Cannot create instance twice.".into()))?;
        info!("task initialized");
        Ok(())
    }

    fn destroy(&self) -> Result<(), PluginError> {
        info!("task destroyed");
        Ok(())
    }
}

impl Task for ExampleTask {
    fn health(&self, _timeout: Duration) -> Health {
        match self.config.get() {
            Some(_) => Health::up(),
            None => Health::down("not initialised"),
        }
    }

    fn run(&self, correlation_id: &str, input: Payload) -> Result<Payload, PluginError> {
        info!(correlation_id, payload = %json(&input), "run task");
        let config = self.config()?;
        let input = TaskInput::from_payload(&input)?;

        let output = TaskOutput {
            example_string: format!(
                "integer={}; string={}; bool={}; example={}",
                render(&input.integer),
                render(&input.string),
                render(&input.bool),
                config.example
            ),
        }
        .to_payload();

        info!(correlation_id, payload = %json(&output), "task ran");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_plugin::HealthStatus;
    use serde_json::json as j;
    use std::io::Write;

    fn configured(example: &str) -> (ExampleTask, tempfile::NamedTempFile) {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "example: {example}").unwrap();
        let task = ExampleTask::new();
        task.init(Some(file.path())).unwrap();
        (task, file)
    }

    #[test]
    fn formats_input_with_config() {
        let (task, _file) = configured("hello");
        let input = TaskInput::new(1, Some("x".into()), true).to_payload();
        let out = task.run("cid", input).unwrap();
        assert_eq!(out["example-string"], j!("integer=1; string=x; bool=true; example=hello"));
    }

    #[test]
    fn missing_string_renders_null() {
        let (task, _file) = configured("e");
        let out = task.run("cid", TaskInput::new(2, None, false).to_payload()).unwrap();
        assert_eq!(out["example-string"], j!("integer=2; string=null; bool=false; example=e"));
    }

    #[test]
    fn run_before_init_fails() {
        let task = ExampleTask::new();
        assert!(matches!(task.run("cid", Payload::new()), Err(PluginError::NotInitialised)));
        assert_eq!(task.health(Duration::from_secs(1)).status, HealthStatus::Down);
    }

    #[test]
    fn init_twice_fails() {
        let (task, file) = configured("e");
        let err = task.init(Some(file.path())).unwrap_err();
        assert_eq!(err.to_string(), "configuration error: Cannot create instance twice.");
    }

    #[test]
    fn init_without_config_fails() {
        assert!(matches!(ExampleTask::new().init(None), Err(PluginError::Config(_))));
    }
}
