//! What a plugin process may see of the host, and what the host answers
//! when a plugin calls back.

use courier_plugin::host_log::LOG_RECORD;
use courier_plugin::jsonrpc::{INVALID_PARAMS, METHOD_NOT_FOUND, Request, Response};
use courier_plugin::message::LogRecord;
use courier_plugin::{HostServices, LogLevel, json};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

/// Prefix allow-lists for plugin-to-host methods and for environment
/// variables inherited by plugin processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SharedNamespace {
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default = "default_env")]
    pub env: Vec<String>,
}

fn default_methods() -> Vec<String> {
    vec!["log.".into()]
}

fn default_env() -> Vec<String> {
    vec!["RUST_LOG".into(), "COURIER_PLUGIN_".into()]
}

impl Default for SharedNamespace {
    fn default() -> Self {
        Self {
            methods: default_methods(),
            env: default_env(),
        }
    }
}

impl SharedNamespace {
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|prefix| method.starts_with(prefix.as_str()))
    }

    pub fn allows_env(&self, name: &str) -> bool {
        self.env.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// The environment a plugin process starts with.
    pub fn child_env(&self) -> Vec<(String, String)> {
        self.filter_env(std::env::vars())
    }

    fn filter_env(&self, vars: impl IntoIterator<Item = (String, String)>) -> Vec<(String, String)> {
        vars.into_iter().filter(|(name, _)| self.allows_env(name)).collect()
    }
}

/// Host side of plugin callbacks, gated by a [`SharedNamespace`].
#[derive(Debug, Clone, Default)]
pub struct HostBridge {
    shared: SharedNamespace,
}

impl HostBridge {
    pub fn new(shared: SharedNamespace) -> Self {
        Self { shared }
    }

    fn forward_log(plugin_id: &str, params: Option<Value>) -> Result<(), serde_json::Error> {
        let record: LogRecord = serde_json::from_value(params.unwrap_or(Value::Null))?;
        let fields = json(&record.fields);
        let source = record.target.as_str();
        let message = record.message.as_str();
        match record.level {
            LogLevel::Trace => trace!(plugin = plugin_id, source, %fields, "{message}"),
            LogLevel::Debug => debug!(plugin = plugin_id, source, %fields, "{message}"),
            LogLevel::Info => info!(plugin = plugin_id, source, %fields, "{message}"),
            LogLevel::Warn => warn!(plugin = plugin_id, source, %fields, "{message}"),
            LogLevel::Error => error!(plugin = plugin_id, source, %fields, "{message}"),
            LogLevel::Critical => error!(plugin = plugin_id, source, %fields, "[CRITICAL] {message}"),
        }
        Ok(())
    }
}

impl HostServices for HostBridge {
    fn handle(&self, plugin_id: &str, request: Request) -> Option<Response> {
        if !self.shared.allows_method(&request.method) {
            warn!(plugin = plugin_id, method = %request.method, "plugin called a method outside the shared namespace");
            return request.id.map(|id| {
                Response::fail(id, METHOD_NOT_FOUND, "Method not shared", Some(Value::String(request.method)))
            });
        }

        match request.method.as_str() {
            LOG_RECORD => match Self::forward_log(plugin_id, request.params) {
                Ok(()) => request.id.map(|id| Response::success(id, Value::Null)),
                Err(e) => {
                    warn!(plugin = plugin_id, "malformed log record: {e}");
                    request
                        .id
                        .map(|id| Response::fail(id, INVALID_PARAMS, "Invalid params", Some(Value::String(e.to_string()))))
                }
            },
            _ => request.id.map(|id| {
                Response::fail(id, METHOD_NOT_FOUND, "Method not found", Some(Value::String(request.method)))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_plugin::jsonrpc::Id;
    use serde_json::json as j;

    fn log_params() -> Value {
        j!({"level": "info", "target": "example_task", "message": "hi", "at": "2025-01-01T00:00:00Z"})
    }

    #[test]
    fn default_namespace_shares_logging_only() {
        let shared = SharedNamespace::default();
        assert!(shared.allows_method("log.record"));
        assert!(!shared.allows_method("store.save"));
        assert!(shared.allows_env("RUST_LOG"));
        assert!(shared.allows_env("COURIER_PLUGIN_LOG_DIR"));
        assert!(!shared.allows_env("COURIER_DATABASE"));
    }

    #[test]
    fn child_env_keeps_only_shared_names() {
        let shared = SharedNamespace::default();
        let vars = vec![
            ("RUST_LOG".to_string(), "debug".to_string()),
            ("HOME".to_string(), "/root".to_string()),
            ("COURIER_PLUGIN_X".to_string(), "1".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "s".to_string()),
        ];
        let names: Vec<_> = shared.filter_env(vars).into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["RUST_LOG", "COURIER_PLUGIN_X"]);
    }

    #[test]
    fn log_notifications_get_no_reply() {
        let bridge = HostBridge::default();
        let reply = bridge.handle("p", Request::notification(LOG_RECORD, Some(log_params())));
        assert!(reply.is_none());
    }

    #[test]
    fn log_calls_are_acknowledged() {
        let bridge = HostBridge::default();
        let reply = bridge
            .handle("p", Request::call(Id::Number(1), LOG_RECORD, Some(log_params())))
            .unwrap();
        assert!(reply.error.is_none());
    }

    #[test]
    fn unshared_methods_are_refused() {
        let bridge = HostBridge::default();
        let reply = bridge
            .handle("p", Request::call(Id::Number(2), "store.drop", None))
            .unwrap();
        assert_eq!(reply.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn shared_but_unknown_methods_are_not_found() {
        let bridge = HostBridge::new(SharedNamespace {
            methods: vec!["log.".into(), "metrics.".into()],
            env: vec![],
        });
        let reply = bridge
            .handle("p", Request::call(Id::Number(3), "metrics.count", None))
            .unwrap();
        assert_eq!(reply.error.unwrap().message, "Method not found");
    }

    #[test]
    fn malformed_log_records_are_invalid_params() {
        let bridge = HostBridge::default();
        let reply = bridge
            .handle("p", Request::call(Id::Number(4), LOG_RECORD, Some(j!({"level": "loud"}))))
            .unwrap();
        assert_eq!(reply.error.unwrap().code, INVALID_PARAMS);
    }
}
