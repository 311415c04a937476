use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use replica_daemon::{config::ResourceConfig, p2p::ReplicationServer};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "replicad", version, about = "Replica block-level replication daemon")]
struct Args {
    /// Path to the resource configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn setup_logger(level: LevelFilter) -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .context("logger setup failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logger(args.log_level)?;

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("cannot read {}", args.config.display()))?;
    let config: ResourceConfig =
        serde_json::from_str(&raw).context("cannot parse resource configuration")?;

    info!(
        "starting resource {} as node {} with {} volume(s), {} connection(s)",
        config.name,
        config.node_id,
        config.devices.len(),
        config.connections.len()
    );

    let server = ReplicationServer::new(config).await?;
    server.start().await;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await;
    // give the teardown paths a moment to drain
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    Ok(())
}
