//! # Bridge Settler
//!
//! Settlement engine matching cross-chain deposits to maker payouts.

use bridge_settler::{cli::Args, config::SettlerConfig, constants::APP_NAME, spawn::try_spawn};
use clap::Parser;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

async fn run(args: Args) -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = args.merge_config(SettlerConfig::load_from_file(&args.config)?);
    info!(app = APP_NAME, port = config.server.port, "starting settlement engine");

    try_spawn(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

#[doc(hidden)]
#[tokio::main]
async fn main() {
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
