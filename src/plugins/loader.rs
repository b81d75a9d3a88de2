//! Starts the single provider a plugin unit registers for a capability.
//!
//! A unit is a directory. `<unit>/services/<capability>` lists provider
//! executables, one per line and relative to the unit; blank lines and
//! `#` comments are ignored. Exactly one provider must be listed.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use courier_plugin::{Capability, HostServices, PluginHandle, PluginInfo, SpawnOptions};
use thiserror::Error;
use tracing::info;

use super::isolation::{HostBridge, SharedNamespace};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Plugin '{}' does not exist.", .0.display())]
    Missing(PathBuf),

    #[error("No plugin was loaded in '{}'.", .0.display())]
    NoProvider(PathBuf),

    #[error("Expected only one plugin '{}' but was {count}.", path.display())]
    TooManyProviders { path: PathBuf, count: usize },

    #[error("Plugin '{}' could not be loaded.", path.display())]
    Failed {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

impl LoadError {
    fn failed(path: &Path, source: impl Into<BoxError>) -> Self {
        LoadError::Failed {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }
}

/// A started provider that answered the `describe` handshake.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    pub unit: PathBuf,
    pub executable: PathBuf,
    pub capability: Capability,
    pub info: PluginInfo,
    pub handle: PluginHandle,
}

#[derive(Clone)]
pub struct PluginLoader {
    shared: SharedNamespace,
    services: Arc<dyn HostServices>,
    handshake_timeout: Duration,
}

impl PluginLoader {
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(shared: SharedNamespace) -> Self {
        let services: Arc<dyn HostServices> = Arc::new(HostBridge::new(shared.clone()));
        Self {
            shared,
            services,
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub async fn load(&self, unit: &Path, capability: Capability) -> Result<LoadedPlugin, LoadError> {
        if !unit.exists() {
            return Err(LoadError::Missing(unit.to_path_buf()));
        }
        info!(plugin = %unit.display(), %capability, "load plugin");

        let providers = providers(unit, capability)?;
        let executable = match providers.as_slice() {
            [] => return Err(LoadError::NoProvider(unit.to_path_buf())),
            [one] => unit.join(one),
            many => {
                return Err(LoadError::TooManyProviders {
                    path: unit.to_path_buf(),
                    count: many.len(),
                });
            }
        };

        let options = SpawnOptions {
            args: Vec::new(),
            working_dir: Some(unit.to_path_buf()),
            env: self.shared.child_env(),
        };
        let handle = PluginHandle::spawn(&executable, options, Arc::clone(&self.services))
            .map_err(|e| LoadError::failed(unit, e))?;

        let described = tokio::time::timeout(self.handshake_timeout, handle.describe())
            .await
            .map_err(|_| {
                LoadError::failed(
                    unit,
                    format!("no describe answer within {} ms", self.handshake_timeout.as_millis()),
                )
            })?
            .map_err(|e| LoadError::failed(unit, e))?;

        if described.capability != capability {
            return Err(LoadError::failed(
                unit,
                format!("provider is a {} plugin, expected {capability}", described.capability),
            ));
        }

        info!(plugin = %unit.display(), id = %described.info.id, version = %described.info.version, "plugin loaded");
        Ok(LoadedPlugin {
            unit: unit.to_path_buf(),
            executable,
            capability,
            info: described.info,
            handle,
        })
    }
}

/// Provider entries of `<unit>/services/<capability>`; none when the file is
/// absent.
fn providers(unit: &Path, capability: Capability) -> Result<Vec<String>, LoadError> {
    let services = unit.join("services").join(capability.as_ref());
    let raw = match std::fs::read_to_string(&services) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LoadError::failed(unit, e)),
    };
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn unit_with_services(capability: &str, content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("services")).unwrap();
        fs::write(dir.path().join("services").join(capability), content).unwrap();
        dir
    }

    fn loader() -> PluginLoader {
        PluginLoader::new(SharedNamespace::default()).with_handshake_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn missing_unit() {
        let dir = tempfile::tempdir().unwrap();
        let unit = dir.path().join("absent");
        let err = loader().load(&unit, Capability::Task).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Plugin '{}' does not exist.", unit.display()));
    }

    #[tokio::test]
    async fn zero_providers() {
        let unit = unit_with_services("task", "# nothing here\n\n");
        let err = loader().load(unit.path(), Capability::Task).await.unwrap_err();
        assert_eq!(err.to_string(), format!("No plugin was loaded in '{}'.", unit.path().display()));
    }

    #[tokio::test]
    async fn provider_for_another_capability_does_not_count() {
        let unit = unit_with_services("procedure", "bin/procedure\n");
        let err = loader().load(unit.path(), Capability::Task).await.unwrap_err();
        assert!(matches!(err, LoadError::NoProvider(_)));
    }

    #[tokio::test]
    async fn two_providers() {
        let unit = unit_with_services("task", "bin/a\n# comment\nbin/b\n");
        let err = loader().load(unit.path(), Capability::Task).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Expected only one plugin '{}' but was 2.", unit.path().display())
        );
    }

    #[tokio::test]
    async fn unstartable_provider_is_wrapped() {
        let unit = unit_with_services("task", "bin/not-there\n");
        let err = loader().load(unit.path(), Capability::Task).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Plugin '{}' could not be loaded.", unit.path().display()));
        let source = std::error::Error::source(&err).unwrap().to_string();
        assert!(source.contains("could not start"), "got {source}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn provider_that_exits_fails_the_handshake() {
        use std::os::unix::fs::PermissionsExt;

        let unit = unit_with_services("task", "bin/quits\n");
        let script = unit.path().join("bin").join("quits");
        fs::create_dir_all(script.parent().unwrap()).unwrap();
        fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let err = loader().load(unit.path(), Capability::Task).await.unwrap_err();
        assert!(matches!(err, LoadError::Failed { .. }), "got {err:?}");
    }
}
