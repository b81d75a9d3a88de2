use example_procedure::ExampleProcedure;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_plugin::plugin_runtime::run_procedure(ExampleProcedure::new()).await
}
