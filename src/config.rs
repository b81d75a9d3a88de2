//! Broker configuration: `<root>/config/courier.yaml`, with `COURIER_*`
//! overrides loaded from the process environment and `<root>/config/.env`.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::plugins::SharedNamespace;
use crate::routing::RouterConfig;

pub const ROOT_ENV: &str = "COURIER_ROOT";
pub const DATABASE_ENV: &str = "COURIER_DATABASE";
pub const SPOOL_DIR_ENV: &str = "COURIER_SPOOL_DIR";

pub const CONFIG_FILE: &str = "config/courier.yaml";
pub const ENV_FILE: &str = "config/.env";

/// Extensions a plugin's companion config file may have.
pub const CONFIG_EXTENSIONS: [&str; 5] = ["config", "yaml", "yml", "properties", "json"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },
    #[error("could not load {path}: {source}")]
    Env {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("at least one {0} plugin must be configured")]
    NoPlugins(&'static str),
    #[error("plugin unit '{0}' does not exist")]
    MissingUnit(PathBuf),
    #[error("plugin config '{0}' does not exist")]
    MissingPluginConfig(PathBuf),
    #[error("plugin config '{0}' must end in one of: config, yaml, yml, properties, json")]
    PluginConfigExtension(PathBuf),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
}

/// The broker root: `COURIER_ROOT` or `./courier`.
pub fn resolve_root_dir() -> PathBuf {
    env::var_os(ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./courier"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file, relative to the root.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/courier.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct QueueConfig {
    /// Spool directory, relative to the root.
    pub spool_dir: PathBuf,
    /// Procedure every queued message is routed through.
    pub default_procedure: String,
    pub poll_interval_ms: u64,
    pub health_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("spool"),
            default_procedure: "example-procedure".into(),
            poll_interval_ms: 500,
            health_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RouterSettings {
    pub poll_interval_ms: u64,
    pub poll_batch_size: usize,
    pub channel_capacity: usize,
    pub workers: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            poll_batch_size: 10,
            channel_capacity: 64,
            workers: 4,
            shutdown_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PluginEntry {
    /// Unit directory, relative to the root.
    pub unit: PathBuf,
    /// Companion config handed to the plugin's `init`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PluginsConfig {
    pub shared_namespace: SharedNamespace,
    pub tasks: Vec<PluginEntry>,
    pub procedures: Vec<PluginEntry>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BrokerConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub router: RouterSettings,
    pub plugins: PluginsConfig,
}

impl BrokerConfig {
    /// Reads `<root>/config/courier.yaml` (defaults if absent), applies the
    /// environment overrides and resolves every path against `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        load_env_file(&root.join(ENV_FILE))?;

        let file = root.join(CONFIG_FILE);
        let mut config = if file.exists() {
            let text = std::fs::read_to_string(&file).map_err(|source| ConfigError::Read {
                path: file.clone(),
                source,
            })?;
            Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
                path: file.clone(),
                source,
            })?
        } else {
            debug!(file = %file.display(), "no config file, using defaults");
            Self::default()
        };

        config.apply_env(|key| env::var_os(key).map(PathBuf::from));
        config.resolve(root);
        info!(file = %file.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml_bw::Error> {
        serde_yaml_bw::from_str(text)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml_bw::Error> {
        serde_yaml_bw::to_string(self)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<PathBuf>) {
        if let Some(path) = lookup(DATABASE_ENV) {
            self.database.path = path;
        }
        if let Some(dir) = lookup(SPOOL_DIR_ENV) {
            self.queue.spool_dir = dir;
        }
    }

    fn resolve(&mut self, root: &Path) {
        self.database.path = root.join(&self.database.path);
        self.queue.spool_dir = root.join(&self.queue.spool_dir);
        for entry in self.plugins.tasks.iter_mut().chain(self.plugins.procedures.iter_mut()) {
            entry.unit = root.join(&entry.unit);
            if let Some(config) = entry.config.as_mut() {
                *config = root.join(&*config);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plugins.tasks.is_empty() {
            return Err(ConfigError::NoPlugins("task"));
        }
        if self.plugins.procedures.is_empty() {
            return Err(ConfigError::NoPlugins("procedure"));
        }
        for entry in self.plugins.tasks.iter().chain(&self.plugins.procedures) {
            if !entry.unit.exists() {
                return Err(ConfigError::MissingUnit(entry.unit.clone()));
            }
            if let Some(config) = &entry.config {
                let known = config
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| CONFIG_EXTENSIONS.contains(&e));
                if !known {
                    return Err(ConfigError::PluginConfigExtension(config.clone()));
                }
                if !config.exists() {
                    return Err(ConfigError::MissingPluginConfig(config.clone()));
                }
            }
        }

        let router = &self.router;
        for (name, value) in [
            ("router.poll_interval_ms", router.poll_interval_ms as usize),
            ("router.poll_batch_size", router.poll_batch_size),
            ("router.channel_capacity", router.channel_capacity),
            ("router.workers", router.workers),
            ("queue.poll_interval_ms", self.queue.poll_interval_ms as usize),
            ("queue.health_interval_ms", self.queue.health_interval_ms as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive(name));
            }
        }
        Ok(())
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            poll_interval: Duration::from_millis(self.router.poll_interval_ms),
            poll_batch_size: self.router.poll_batch_size,
            channel_capacity: self.router.channel_capacity,
            workers: self.router.workers,
            default_procedure: self.queue.default_procedure.clone(),
            shutdown_grace: Duration::from_millis(self.router.shutdown_grace_ms),
        }
    }
}

fn load_env_file(path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        return Ok(());
    }
    dotenvy::from_path(path).map_err(|source| ConfigError::Env {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Loaded .env from {}", path.display());
    Ok(())
}

/// The config `courier init` writes.
pub fn default_config() -> BrokerConfig {
    BrokerConfig {
        plugins: PluginsConfig {
            tasks: vec![PluginEntry {
                unit: PathBuf::from("plugins/tasks/example-task"),
                config: Some(PathBuf::from("plugins/tasks/example-task.yaml")),
            }],
            procedures: vec![PluginEntry {
                unit: PathBuf::from("plugins/procedures/example-procedure"),
                config: None,
            }],
            ..PluginsConfig::default()
        },
        ..BrokerConfig::default()
    }
}
