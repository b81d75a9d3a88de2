//! Plugin contract and plugin host/runtime plumbing for the courier broker.
//!
//! Plugins run out of process. The host talks to each one with
//! [`PluginHandle`] over line-delimited JSON-RPC on the child's stdin/stdout;
//! a plugin binary hands its [`Task`] or [`Procedure`] to
//! [`plugin_runtime::run_task`] / [`plugin_runtime::run_procedure`].

pub mod contract;
pub mod host_log;
pub mod json;
pub mod jsonrpc;
pub mod message;
pub mod plugin;
pub mod plugin_actor;
pub mod plugin_runtime;

pub use contract::{
    Capability, Health, HealthStatus, Payload, Plugin, PluginInfo, Procedure, SPI_VERSION,
    StepSequence, Task,
};
pub use json::json;
pub use plugin::{LogLevel, PluginError};
pub use plugin_actor::{HostServices, NoHostServices, PluginHandle, SpawnOptions};
pub use plugin_runtime::Served;
