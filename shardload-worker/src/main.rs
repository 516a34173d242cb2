use envconfig::Envconfig;
use tokio::signal;
use tracing::error;
use tracing_subscriber::EnvFilter;

use shardload_worker::config::Config;
use shardload_worker::run::run;

async fn shutdown() {
    if let Err(err) = signal::ctrl_c().await {
        // without a signal handler the import simply runs to completion
        error!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env()?;

    let summary = run(config, shutdown()).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
