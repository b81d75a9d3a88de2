use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error, Result};
use courier_plugin::{Procedure, Task};
use tracing::{error, info};

use crate::config::{self, BrokerConfig, PluginsConfig};
use crate::plugins::{PluginManager, PluginSource};
use crate::queue::{QueueTransport, SpoolQueue};
use crate::routing::Router;
use crate::store::{MessageStore, SqliteMessageStore};

/// A running broker: store, plugins, spool queue and router.
pub struct App {
    config: BrokerConfig,
    store: Arc<SqliteMessageStore>,
    plugins: Arc<PluginManager>,
    queue: Arc<SpoolQueue>,
    router: Router,
}

impl App {
    pub async fn bootstrap(config: BrokerConfig) -> Result<Self, Error> {
        config.validate().context("invalid configuration")?;

        let store = Arc::new(
            SqliteMessageStore::open(&config.database.path)
                .with_context(|| format!("could not open {}", config.database.path.display()))?,
        );
        info!(database = %config.database.path.display(), "message store opened");

        let plugins = Arc::new(load_plugins(&config.plugins).await?);

        let queue = match SpoolQueue::open(
            &config.queue.spool_dir,
            Duration::from_millis(config.queue.poll_interval_ms),
            Duration::from_millis(config.queue.health_interval_ms),
        )
        .await
        {
            Ok(queue) => Arc::new(queue),
            Err(e) => {
                destroy_plugins(&plugins).await;
                return Err(Error::new(e).context("could not open the spool queue"));
            }
        };

        let router = Router::new(
            store.clone(),
            Arc::clone(&plugins),
            Some(queue.clone() as Arc<dyn QueueTransport>),
            config.router_config(),
        );
        if let Err(e) = router.start().await {
            queue.shutdown().await;
            destroy_plugins(&plugins).await;
            return Err(Error::new(e).context("could not start the router"));
        }

        Ok(Self {
            config,
            store,
            plugins,
            queue,
            router,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Stops the router first, then the queue, then destroys the plugins.
    pub async fn shutdown(self) {
        self.router.destroy().await;
        self.queue.shutdown().await;
        destroy_plugins(&self.plugins).await;
        info!("courier stopped");
    }
}

async fn destroy_plugins(plugins: &PluginManager) {
    if let Err(errors) = plugins.destroy_plugins().await {
        for (id, e) in &errors.0 {
            error!(plugin = %id, "plugin did not shut down cleanly: {e}");
        }
    }
}

/// The plugin sources a config names, each unit with its companion config.
pub fn plugin_sources(
    config: &PluginsConfig,
) -> (Vec<PluginSource<dyn Task>>, Vec<PluginSource<dyn Procedure>>) {
    fn source<P: ?Sized>(entry: &config::PluginEntry) -> PluginSource<P> {
        let source = PluginSource::unit(&entry.unit);
        match &entry.config {
            Some(file) => source.with_config(file),
            None => source,
        }
    }
    (
        config.tasks.iter().map(source).collect(),
        config.procedures.iter().map(source).collect(),
    )
}

pub async fn load_plugins(config: &PluginsConfig) -> Result<PluginManager, Error> {
    let (tasks, procedures) = plugin_sources(config);
    PluginManager::load(tasks, procedures, config.shared_namespace.clone())
        .await
        .context("could not load plugins")
}

/// Creates the root layout, a default config and the example plugin units.
/// Existing files are left alone.
pub async fn cmd_init(root: &Path) -> Result<(), Error> {
    let dirs = [
        "config",
        "logs",
        "data",
        "spool",
        "schemas",
        "plugins/tasks/example-task/services",
        "plugins/procedures/example-procedure/services",
    ];
    for d in &dirs {
        let path = root.join(d);
        fs::create_dir_all(&path).with_context(|| format!("failed to create {}", path.display()))?;
    }

    let default_yaml = config::default_config()
        .to_yaml()
        .context("could not render the default config")?;
    let files = [
        (config::CONFIG_FILE, default_yaml.as_str()),
        (config::ENV_FILE, "# COURIER_DATABASE=\n# COURIER_SPOOL_DIR=\n"),
        ("plugins/tasks/example-task.yaml", "example: example\n"),
        ("plugins/tasks/example-task/services/task", "example_task\n"),
        (
            "plugins/procedures/example-procedure/services/procedure",
            "example_procedure\n",
        ),
    ];
    for (file, content) in files {
        let path = root.join(file);
        if path.exists() {
            println!("Skipping {}, already exists", path.display());
            continue;
        }
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
        println!("Created {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn init_writes_a_valid_layout_once() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).await.unwrap();

        let config = BrokerConfig::load(dir.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.database.path, dir.path().join("data/courier.db"));

        std::fs::write(dir.path().join(config::CONFIG_FILE), "router:\n  workers: 1\n").unwrap();
        cmd_init(dir.path()).await.unwrap();
        let kept = std::fs::read_to_string(dir.path().join(config::CONFIG_FILE)).unwrap();
        assert_eq!(kept, "router:\n  workers: 1\n");
    }

    #[test]
    fn sources_carry_their_config() {
        let config = config::default_config().plugins;
        let (tasks, procedures) = plugin_sources(&config);
        match &tasks[0] {
            PluginSource::Unit { path, config } => {
                assert_eq!(path, &PathBuf::from("plugins/tasks/example-task"));
                assert_eq!(config.as_deref(), Some(Path::new("plugins/tasks/example-task.yaml")));
            }
            PluginSource::Instance { .. } => panic!("expected a unit"),
        }
        assert!(matches!(&procedures[0], PluginSource::Unit { config: None, .. }));
    }

    #[tokio::test]
    async fn bootstrap_reports_plugin_failures() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).await.unwrap();
        let config = BrokerConfig::load(dir.path()).unwrap();

        // the units exist but no provider binary was installed
        let err = App::bootstrap(config).await.err().unwrap();
        let chain = format!("{err:#}");
        assert!(chain.contains("could not load plugins"));
        assert!(chain.contains("could not be loaded."));
    }
}
