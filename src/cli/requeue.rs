use clap::Args;

use super::{CliContext, init_command_logs};
use courier::config::BrokerConfig;
use courier::store::{MessageStore, SqliteMessageStore};

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct RequeueArgs {
    /// Correlation id of the message to requeue
    pub correlation_id: Option<String>,

    /// Requeue every message currently in process
    #[arg(long)]
    pub in_process: bool,
}

pub async fn execute(args: RequeueArgs, context: &CliContext) -> anyhow::Result<()> {
    init_command_logs(context, "requeue", "info");
    let config = BrokerConfig::load(&context.root)?;
    let store = SqliteMessageStore::open(&config.database.path)?;

    if args.in_process {
        let requeued = store.requeue_in_process().await?;
        for id in &requeued {
            println!("{id}");
        }
        println!("Requeued {} message(s)", requeued.len());
    } else if let Some(id) = args.correlation_id {
        if store.requeue(&id).await? {
            println!("Requeued {id}");
        } else {
            println!("{id} is not in process, left as is");
        }
    }
    Ok(())
}
