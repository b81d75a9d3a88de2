use std::time::Duration;

use clap::Args;

use super::{CliContext, init_command_logs};
use courier::app::load_plugins;
use courier::config::BrokerConfig;

#[derive(Args, Debug)]
pub struct PluginsArgs {
    /// Also ask every task for its health
    #[arg(long)]
    pub health: bool,

    /// Health check timeout in milliseconds
    #[arg(long, default_value_t = 2_000)]
    pub timeout_ms: u64,
}

pub async fn execute(args: PluginsArgs, context: &CliContext) -> anyhow::Result<()> {
    init_command_logs(context, "plugins", "info");
    let config = BrokerConfig::load(&context.root)?;
    config.validate()?;

    let plugins = load_plugins(&config.plugins).await?;
    let mut report = serde_json::to_value(plugins.report())?;
    if args.health {
        let health = plugins.health(Duration::from_millis(args.timeout_ms)).await;
        report["health"] = serde_json::to_value(health)?;
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    plugins.destroy_plugins().await?;
    Ok(())
}
