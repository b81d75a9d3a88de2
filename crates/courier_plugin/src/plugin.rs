use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::jsonrpc::{self, PLUGIN_FAILURE};

/// What log levels are supported?
/// Higher-value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// Everything a plugin call can fail with, on either side of the wire.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// Something went wrong serialising or parsing JSON.
    #[error("JSON error: {0}")]
    Json(String),

    /// The companion configuration could not be read or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A call arrived before `init`.
    #[error("plugin has not been initialised")]
    NotInitialised,

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    /// The plugin process answered with a JSON-RPC error.
    #[error("{message} (code {code})")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The plugin process is gone or the pipe broke.
    #[error("plugin transport failed: {0}")]
    Transport(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("plugin error: {0}")]
    Other(String),
}

impl PluginError {
    pub fn other(message: impl Into<String>) -> Self {
        PluginError::Other(message.into())
    }

    /// Stable name of the variant, sent along with remote failures.
    pub fn kind(&self) -> &'static str {
        match self {
            PluginError::Json(_) => "json",
            PluginError::Config(_) => "config",
            PluginError::NotInitialised => "not_initialised",
            PluginError::UnknownStep(_) => "unknown_step",
            PluginError::Rpc { .. } => "rpc",
            PluginError::Transport(_) => "transport",
            PluginError::Timeout(_) => "timeout",
            PluginError::Other(_) => "other",
        }
    }

    /// Encodes the failure as a JSON-RPC error object.
    pub fn to_rpc(&self) -> jsonrpc::Error {
        jsonrpc::Error {
            code: PLUGIN_FAILURE,
            message: self.to_string(),
            data: Some(json!({ "kind": self.kind() })),
        }
    }
}

impl From<jsonrpc::Error> for PluginError {
    fn from(err: jsonrpc::Error) -> Self {
        PluginError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> PluginError {
        PluginError::Json(err.to_string())
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(err: anyhow::Error) -> PluginError {
        PluginError::Other(format!("{err:#}"))
    }
}
