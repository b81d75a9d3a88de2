//! The contract every courier plugin implements.
//!
//! A *task* is a stateless unit of work; a *procedure* sequences steps and
//! reshapes the payload before and after every task invocation. Both are
//! identified by a [`PluginInfo`] that carries the SPI version the plugin was
//! built against, distinct from the plugin's own release version.
//!
//! All methods take `&self`: a plugin instance is shared between concurrently
//! processed messages, so configuration loaded in [`Plugin::init`] lives
//! behind interior mutability.

use std::{fmt, path::Path, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::plugin::PluginError;

/// Contract version of this crate. Tasks and procedures must agree on it.
pub const SPI_VERSION: &str = "1.0.0";

/// Open key/value map handed from step to step.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct PluginInfo {
    pub id: String,
    pub version: String,
    #[serde(rename = "spi-version")]
    pub spi_version: String,
}

impl PluginInfo {
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        spi_version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            spi_version: spi_version.into(),
        }
    }
}

impl fmt::Display for PluginInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (spi {})", self.id, self.version, self.spi_version)
    }
}

/// The two kinds of plugin a unit can provide.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
    EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    Task,
    Procedure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    #[default]
    Up,
    Down,
    OutOfService,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Payload,
}

impl Health {
    pub fn up() -> Self {
        Self::default()
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Down,
            details: Payload::new(),
        }
        .with_detail("reason", Value::String(reason.into()))
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Identity and lifecycle shared by tasks and procedures.
pub trait Plugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    /// Called once before any other call, with the companion configuration
    /// file of the plugin unit if one was configured.
    fn init(&self, _config: Option<&Path>) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once at shutdown. The instance is not used afterwards.
    fn destroy(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

pub trait Task: Plugin {
    fn health(&self, _timeout: Duration) -> Health {
        Health::up()
    }

    /// Executes the task. May block.
    fn run(&self, correlation_id: &str, input: Payload) -> Result<Payload, PluginError>;
}

pub trait Procedure: Plugin {
    /// The tasks this procedure needs, one entry per distinct task.
    fn task_plugin_infos(&self) -> Vec<PluginInfo>;

    /// Like [`Procedure::task_plugin_infos`], for procedures that can fail
    /// to answer.
    fn try_task_plugin_infos(&self) -> Result<Vec<PluginInfo>, PluginError> {
        Ok(self.task_plugin_infos())
    }

    /// The task backing `step`.
    fn task_plugin_info(&self, step: &str) -> Result<PluginInfo, PluginError>;

    /// Returns `next_step` unchanged when it is already set, the first step
    /// when `previous_step` is `None`, and otherwise the step following
    /// `previous_step` or `None` once the procedure is complete.
    fn get_next_step(
        &self,
        correlation_id: &str,
        previous_step: Option<&str>,
        next_step: Option<&str>,
        payload: &Payload,
    ) -> Result<Option<String>, PluginError>;

    fn map_input(
        &self,
        correlation_id: &str,
        step: &str,
        previous_step: Option<&str>,
        payload: &Payload,
    ) -> Result<Payload, PluginError>;

    fn map_output(
        &self,
        correlation_id: &str,
        step: &str,
        previous_step: Option<&str>,
        output: Payload,
    ) -> Result<Payload, PluginError>;
}

/// A fixed, linear chain of steps, each backed by one task.
///
/// Procedures with a static step order can delegate cursor handling to this
/// type and only implement the payload mappings themselves.
#[derive(Debug, Clone, Default)]
pub struct StepSequence {
    steps: Vec<(String, PluginInfo)>,
}

impl StepSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, id: impl Into<String>, task: PluginInfo) -> Self {
        self.steps.push((id.into(), task));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Position of `step` in the chain.
    pub fn position(&self, step: &str) -> Result<usize, PluginError> {
        self.steps
            .iter()
            .position(|(id, _)| id == step)
            .ok_or_else(|| PluginError::UnknownStep(step.to_string()))
    }

    pub fn task(&self, step: &str) -> Result<PluginInfo, PluginError> {
        let index = self.position(step)?;
        Ok(self.steps[index].1.clone())
    }

    /// Distinct tasks in step order.
    pub fn tasks(&self) -> Vec<PluginInfo> {
        let mut seen = Vec::<PluginInfo>::new();
        for (_, info) in &self.steps {
            if !seen.contains(info) {
                seen.push(info.clone());
            }
        }
        seen
    }

    pub fn next(
        &self,
        previous_step: Option<&str>,
        next_step: Option<&str>,
    ) -> Result<Option<String>, PluginError> {
        if let Some(next) = next_step {
            return Ok(Some(next.to_string()));
        }
        let following = match previous_step {
            None => 0,
            Some(previous) => self.position(previous)? + 1,
        };
        Ok(self.steps.get(following).map(|(id, _)| id.clone()))
    }
}
