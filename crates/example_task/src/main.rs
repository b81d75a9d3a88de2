use example_task::ExampleTask;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_plugin::plugin_runtime::run_task(ExampleTask::new()).await
}
