use anyhow::{Context, bail};
use clap::Args;
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use courier::app::App;
use courier::config::BrokerConfig;
use courier::logger::init_tracing;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4317)
    #[arg(long)]
    pub otel_endpoint: Option<String>,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_endpoint: None,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let root = &context.root;
    if !root.exists() {
        bail!(
            "Root directory `{}` does not exist. Please run `courier init` first.",
            root.display()
        );
    }

    let telemetry = init_tracing(
        root,
        "logs/courier.log",
        "logs/courier-events.json",
        &args.log_level,
        args.otel_endpoint.as_deref(),
    )
    .context("could not create logger")?;

    info!("courier starting up");
    println!("courier starting up…");

    let config = BrokerConfig::load(root)?;
    let app = match App::bootstrap(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to bootstrap courier: {e:#}");
            telemetry.shutdown();
            return Err(e);
        }
    };

    info!("courier running; press Ctrl-C to exit");
    println!("courier running; press Ctrl-C to exit");

    signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("courier shutting down");
    app.shutdown().await;
    telemetry.shutdown();

    println!("Goodbye!");
    Ok(())
}
