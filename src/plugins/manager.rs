use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use courier_plugin::{Capability, Health, Plugin, PluginError, PluginInfo, Procedure, Task, json};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use super::isolation::SharedNamespace;
use super::loader::{LoadError, PluginLoader};
use super::remote::{RemoteProcedure, RemoteTask};

/// Where a plugin comes from, plus its optional companion config file.
pub enum PluginSource<P: ?Sized> {
    /// A unit directory on disk, run as a child process.
    Unit { path: PathBuf, config: Option<PathBuf> },
    /// An instance living in the host process.
    Instance { plugin: Arc<P>, config: Option<PathBuf> },
}

impl<P: ?Sized> PluginSource<P> {
    pub fn unit(path: impl Into<PathBuf>) -> Self {
        PluginSource::Unit {
            path: path.into(),
            config: None,
        }
    }

    pub fn instance(plugin: Arc<P>) -> Self {
        PluginSource::Instance { plugin, config: None }
    }

    pub fn with_config(self, file: impl Into<PathBuf>) -> Self {
        let file = Some(file.into());
        match self {
            PluginSource::Unit { path, .. } => PluginSource::Unit { path, config: file },
            PluginSource::Instance { plugin, .. } => PluginSource::Instance { plugin, config: file },
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginManagerError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Could not initialise plugin '{id}'.")]
    Init {
        id: String,
        #[source]
        source: PluginError,
    },

    #[error("Could not list the tasks procedure '{id}' requires.")]
    RequiredTasks {
        id: String,
        #[source]
        source: PluginError,
    },

    #[error("Plugin id '{0}' is registered twice.")]
    Duplicate(String),

    #[error("Task plugin not present. Procedure '{procedure}' requires task '{task}'.")]
    TaskNotPresent { procedure: String, task: String },

    #[error(
        "Task plugin SPI version mismatch. Procedure '{procedure}' expects task '{task}' with SPI {expected}, found {actual}."
    )]
    SpiMismatch {
        procedure: String,
        task: String,
        expected: String,
        actual: String,
    },

    #[error("plugin worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
#[error("{} plugin(s) failed to shut down", .0.len())]
pub struct DestroyErrors(pub Vec<(String, PluginError)>);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcedureReport {
    #[serde(flatten)]
    pub info: PluginInfo,
    #[serde(rename = "required-tasks")]
    pub required_tasks: Vec<PluginInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginsReport {
    pub tasks: Vec<PluginInfo>,
    pub procedures: Vec<ProcedureReport>,
}

/// Registry of initialised plugins. Read-only once loaded.
pub struct PluginManager {
    tasks: HashMap<String, Arc<dyn Task>>,
    procedures: HashMap<String, Arc<dyn Procedure>>,
    required: HashMap<String, Vec<PluginInfo>>,
}

async fn init_plugin<P>(plugin: Arc<P>, config: Option<PathBuf>) -> Result<Arc<P>, PluginManagerError>
where
    P: Plugin + ?Sized + 'static,
{
    let id = plugin.info().id;
    let worker = Arc::clone(&plugin);
    tokio::task::spawn_blocking(move || worker.init(config.as_deref()))
        .await?
        .map_err(|source| PluginManagerError::Init { id, source })?;
    Ok(plugin)
}

impl PluginManager {
    /// Loads and initialises every task, then every procedure, and checks
    /// that the tasks each procedure requires are present.
    pub async fn load(
        tasks: Vec<PluginSource<dyn Task>>,
        procedures: Vec<PluginSource<dyn Procedure>>,
        shared: SharedNamespace,
    ) -> Result<Self, PluginManagerError> {
        let loader = PluginLoader::new(shared);

        info!(count = tasks.len(), "load task plugins");
        let mut loaded_tasks: HashMap<String, Arc<dyn Task>> = HashMap::new();
        for source in tasks {
            let (task, config): (Arc<dyn Task>, _) = match source {
                PluginSource::Unit { path, config } => {
                    let loaded = loader.load(&path, Capability::Task).await?;
                    let remote: Arc<dyn Task> = Arc::new(RemoteTask::new(loaded.handle, loaded.info));
                    (remote, config)
                }
                PluginSource::Instance { plugin, config } => (plugin, config),
            };
            let task = init_plugin(task, config).await?;
            let id = task.info().id;
            if loaded_tasks.insert(id.clone(), task).is_some() {
                return Err(PluginManagerError::Duplicate(id));
            }
        }
        info!(loaded_tasks = %json(&infos(&loaded_tasks)), "task plugins loaded");

        info!(count = procedures.len(), "load procedure plugins");
        let mut loaded_procedures: HashMap<String, Arc<dyn Procedure>> = HashMap::new();
        let mut required = HashMap::new();
        for source in procedures {
            let (procedure, config): (Arc<dyn Procedure>, _) = match source {
                PluginSource::Unit { path, config } => {
                    let loaded = loader.load(&path, Capability::Procedure).await?;
                    let remote: Arc<dyn Procedure> =
                        Arc::new(RemoteProcedure::new(loaded.handle, loaded.info));
                    (remote, config)
                }
                PluginSource::Instance { plugin, config } => (plugin, config),
            };
            let procedure = init_plugin(procedure, config).await?;
            let info = procedure.info();

            let worker = Arc::clone(&procedure);
            let needs = tokio::task::spawn_blocking(move || worker.try_task_plugin_infos())
                .await?
                .map_err(|source| PluginManagerError::RequiredTasks {
                    id: info.id.clone(),
                    source,
                })?;
            check_required_tasks(&info, &needs, &loaded_tasks)?;

            if loaded_procedures.insert(info.id.clone(), procedure).is_some() {
                return Err(PluginManagerError::Duplicate(info.id));
            }
            required.insert(info.id, needs);
        }
        info!(loaded_procedures = %json(&infos(&loaded_procedures)), "procedure plugins loaded");

        Ok(Self {
            tasks: loaded_tasks,
            procedures: loaded_procedures,
            required,
        })
    }

    pub fn task(&self, id: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(id).cloned()
    }

    pub fn procedure(&self, id: &str) -> Option<Arc<dyn Procedure>> {
        self.procedures.get(id).cloned()
    }

    pub fn tasks(&self) -> &HashMap<String, Arc<dyn Task>> {
        &self.tasks
    }

    pub fn procedures(&self) -> &HashMap<String, Arc<dyn Procedure>> {
        &self.procedures
    }

    /// Destroys every task, then every procedure. Keeps going past
    /// failures and returns all of them.
    pub async fn destroy_plugins(&self) -> Result<(), DestroyErrors> {
        let mut destroyers: Vec<(String, Destroyer)> = Vec::new();
        for (id, task) in sorted(&self.tasks) {
            let task = Arc::clone(task);
            let destroy: Destroyer = Box::new(move || task.destroy());
            destroyers.push((id.clone(), destroy));
        }
        for (id, procedure) in sorted(&self.procedures) {
            let procedure = Arc::clone(procedure);
            let destroy: Destroyer = Box::new(move || procedure.destroy());
            destroyers.push((id.clone(), destroy));
        }

        let mut failures = Vec::new();
        for (id, destroy) in destroyers {
            let outcome = tokio::task::spawn_blocking(destroy)
                .await
                .unwrap_or_else(|e| Err(PluginError::other(format!("destroy panicked: {e}"))));
            match outcome {
                Ok(()) => info!(plugin = %id, "plugin destroyed"),
                Err(e) => {
                    error!(plugin = %id, "could not destroy plugin: {e}");
                    failures.push((id, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DestroyErrors(failures))
        }
    }

    /// Loaded plugins and, per procedure, the tasks it requires; sorted by id.
    pub fn report(&self) -> PluginsReport {
        let tasks = sorted(&self.tasks).into_iter().map(|(_, t)| t.info()).collect();
        let procedures = sorted(&self.procedures)
            .into_iter()
            .map(|(id, p)| ProcedureReport {
                info: p.info(),
                required_tasks: self.required.get(id).cloned().unwrap_or_default(),
            })
            .collect();
        PluginsReport { tasks, procedures }
    }

    /// Health of every task, by id.
    pub async fn health(&self, timeout: Duration) -> BTreeMap<String, Health> {
        let mut report = BTreeMap::new();
        for (id, task) in sorted(&self.tasks) {
            let task = Arc::clone(task);
            let health = tokio::task::spawn_blocking(move || task.health(timeout))
                .await
                .unwrap_or_else(|e| Health::down(format!("health check panicked: {e}")));
            report.insert(id.clone(), health);
        }
        report
    }
}

type Destroyer = Box<dyn FnOnce() -> Result<(), PluginError> + Send>;

fn sorted<V: ?Sized>(map: &HashMap<String, Arc<V>>) -> Vec<(&String, &Arc<V>)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn infos<P: Plugin + ?Sized>(map: &HashMap<String, Arc<P>>) -> Vec<PluginInfo> {
    sorted(map).into_iter().map(|(_, p)| p.info()).collect()
}

fn check_required_tasks(
    procedure: &PluginInfo,
    needs: &[PluginInfo],
    tasks: &HashMap<String, Arc<dyn Task>>,
) -> Result<(), PluginManagerError> {
    for expected in needs {
        let Some(task) = tasks.get(&expected.id) else {
            error!(procedure = %procedure.id, task = %expected.id, "Task plugin not present.");
            return Err(PluginManagerError::TaskNotPresent {
                procedure: procedure.id.clone(),
                task: expected.id.clone(),
            });
        };
        let actual = task.info();

        if expected.version != actual.version {
            warn!(
                procedure = %procedure.id,
                task = %actual.id,
                expected_version = %expected.version,
                actual_version = %actual.version,
                "the task version differs from the one the procedure expects; this might lead to unexpected behaviour"
            );
        }

        if expected.spi_version != actual.spi_version {
            error!(
                procedure = %procedure.id,
                task = %actual.id,
                expected_spi_version = %expected.spi_version,
                actual_spi_version = %actual.spi_version,
                "Task plugin SPI version mismatch."
            );
            return Err(PluginManagerError::SpiMismatch {
                procedure: procedure.id.clone(),
                task: actual.id,
                expected: expected.spi_version.clone(),
                actual: actual.spi_version,
            });
        }
    }
    Ok(())
}
