use waldiez_runner_server::config::Settings;
use waldiez_runner_server::{init_tracing, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load();
    init_tracing(&settings);
    run(settings).await
}
