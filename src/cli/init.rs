use super::{CliContext, init_command_logs};
use courier::app::cmd_init;

pub async fn execute(context: &CliContext) -> anyhow::Result<()> {
    cmd_init(&context.root).await?;
    init_command_logs(context, "init", "info");
    println!(
        "courier has been initialised at {}. Install the plugin binaries into their units, then start it with 'courier run'",
        context.root.display()
    );
    Ok(())
}
