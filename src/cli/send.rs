use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Args;

use super::{CliContext, init_command_logs};
use courier::config::BrokerConfig;
use courier::queue::{QueueTransport, SpoolQueue};

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct SendArgs {
    /// File whose bytes become the message body
    pub file: Option<PathBuf>,

    /// Literal message body
    #[arg(long)]
    pub text: Option<String>,
}

pub async fn execute(args: SendArgs, context: &CliContext) -> anyhow::Result<()> {
    init_command_logs(context, "send", "info");
    let config = BrokerConfig::load(&context.root)?;

    let body = match (args.file, args.text) {
        (Some(file), _) => tokio::fs::read(&file)
            .await
            .with_context(|| format!("could not read {}", file.display()))?,
        (None, Some(text)) => text.into_bytes(),
        (None, None) => anyhow::bail!("nothing to send"),
    };

    let queue = SpoolQueue::open(
        &config.queue.spool_dir,
        Duration::from_millis(config.queue.poll_interval_ms),
        Duration::from_millis(config.queue.health_interval_ms),
    )
    .await?;
    let bytes = body.len();
    let sent = queue.send(body).await;
    queue.shutdown().await;
    sent.context("publish was not confirmed")?;

    println!("Published {bytes} bytes to {}", config.queue.spool_dir.display());
    Ok(())
}
