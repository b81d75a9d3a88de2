//! Plugin units: loading, isolation and the registry the router reads.

pub mod isolation;
pub mod loader;
pub mod manager;
pub mod remote;

pub use isolation::{HostBridge, SharedNamespace};
pub use loader::{LoadError, LoadedPlugin, PluginLoader};
pub use manager::{DestroyErrors, PluginManager, PluginManagerError, PluginSource, PluginsReport};
pub use remote::{RemoteProcedure, RemoteTask};
