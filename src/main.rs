use clap::Parser;

mod cli;

use cli::{Cli, CliContext};
use courier::config::resolve_root_dir;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let context = CliContext::new(resolve_root_dir());
    let command = args.command.unwrap_or_else(cli::default_command);
    cli::execute(&context, command).await
}
