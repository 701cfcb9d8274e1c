mod cli;

use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Commands, MirrorArgs};
use mirrorbox::chat::MemoryChat;
use mirrorbox::config::Config;
use mirrorbox::mirror::Mirror;
use mirrorbox::observability::init_tracing;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// Chat id used for jobs submitted from the command line
const CLI_CHAT: i64 = 0;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => mirrorbox::api::run(args.address).await?,
        Commands::Mirror(args) => run_mirror(args).await?,
    }

    Ok(())
}

/// Runs until every submitted job reached an outcome or Ctrl+C
async fn run_mirror(args: MirrorArgs) -> Result<(), AnyError> {
    if args.uris.is_empty() && args.torrent.is_none() {
        return Err("nothing to mirror: pass URIs or --torrent".into());
    }
    let config = Config::load().map_err(|e| format!("Failed to load config: {}", e))?;
    let chat = Arc::new(MemoryChat::new());
    let mirror = Mirror::start(&config, chat).await?;
    let mut outcomes = mirror.subscribe();

    if !args.uris.is_empty() {
        let job_id = mirror.submit_uris(CLI_CHAT, args.uris).await?;
        info!(job_id = %job_id, "Submitted URIs");
    }
    if let Some(path) = &args.torrent {
        let metainfo = tokio::fs::read(path).await?;
        let job_id = mirror.submit_torrent(CLI_CHAT, &metainfo).await?;
        info!(job_id = %job_id, "Submitted torrent");
    }

    let mut failed = false;
    let interrupted = tokio::select! {
        _ = mirrorbox::api::shutdown_signal() => true,
        _ = async {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => {
                        failed |= !outcome.is_success();
                        match outcome.render() {
                            Some(text) => println!("{}\n", text),
                            None => println!("{} cancelled\n", outcome.job_id()),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed transfer outcomes"),
                    Err(RecvError::Closed) => break,
                }
                if mirror.jobs().is_empty() {
                    break;
                }
            }
        } => false,
    };

    mirror.shutdown().await;
    if interrupted {
        return Err("interrupted".into());
    }
    if failed {
        return Err("one or more transfers failed".into());
    }
    Ok(())
}
