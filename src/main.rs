use clap::Parser;
use grid_proxy::{
    analyst::{self, AnalystArgs},
    Proxy, ProxyConfig,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Second Life protocol proxy.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    proxy: ProxyConfig,
    #[command(flatten)]
    analyst: AnalystArgs,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.proxy.log_level())
        .init();

    let proxy = Proxy::start(cli.proxy).await?;
    analyst::install(&proxy, &cli.analyst)?;
    tracing::info!("Point the viewer's login URI at {}", proxy.base_url());

    tokio::signal::ctrl_c().await?;
    proxy.shutdown();
    Ok(())
}
