mod cli;
mod config;
mod indexer;

use crate::config::load_config;
use crate::indexer::{BackgroundIndexer, open_store};
use clap::Parser;
use cli::{Cli, Commands};
use log::{error, info};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config)?;
            let store = open_store(&cfg.coordination).await?;
            let indexer = BackgroundIndexer::new(&cfg, store)?;

            let cancel_token = CancellationToken::new();
            {
                let token = cancel_token.clone();
                tokio::spawn(async move {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("failed to listen for ctrl_c: {e:?}");
                    } else {
                        info!("Received CTRL-C, finishing the current round...");
                    }
                    token.cancel();
                });
            }
            indexer.run(cancel_token).await?;
        }
        Commands::Once { config } => {
            let cfg = load_config(config)?;
            let store = open_store(&cfg.coordination).await?;
            let indexer = BackgroundIndexer::new(&cfg, store)?;
            let summary = indexer.run_once().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
