use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod init;
pub mod plugins;
pub mod requeue;
pub mod run;
pub mod schema;
pub mod send;

use plugins::PluginsArgs;
use requeue::RequeueArgs;
use run::RunArgs;
use schema::SchemaArgs;
use send::SendArgs;

#[derive(Parser, Debug)]
#[command(
    name = "courier",
    about = "Routes messages through task and procedure plugins",
    version = "0.1.0"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broker until Ctrl-C
    Run(RunArgs),

    /// Emit JSON-Schema for the config and stored messages
    Schema(SchemaArgs),

    /// Initialize a fresh layout
    Init,

    /// Load the configured plugins and print what they provide
    Plugins(PluginsArgs),

    /// Publish a message onto the spool queue
    Send(SendArgs),

    /// Put stuck in-process messages back in the waiting state
    Requeue(RequeueArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub root: PathBuf,
}

impl CliContext {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Init => init::execute(context).await,
        Commands::Plugins(args) => plugins::execute(args, context).await,
        Commands::Send(args) => send::execute(args, context).await,
        Commands::Requeue(args) => requeue::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}

/// Logs of one-shot commands go to their own files under `<root>/logs`.
pub(crate) fn init_command_logs(context: &CliContext, command: &str, log_level: &str) {
    let log_file = format!("logs/courier-{command}.log");
    let event_file = format!("logs/courier-{command}.json");
    if let Err(e) = courier::logger::init_tracing(&context.root, &log_file, &event_file, log_level, None) {
        eprintln!("logging disabled: {e:#}");
    }
}
