//! courier: a message broker that routes each message through a procedure's
//! steps, each step run by an out-of-process task plugin.

pub mod app;
pub mod config;
pub mod ksuid;
pub mod logger;
pub mod message;
pub mod plugins;
pub mod queue;
pub mod routing;
pub mod schema;
pub mod store;
pub mod watcher;
