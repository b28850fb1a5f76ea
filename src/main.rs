use std::path::PathBuf;

use clap::Parser;
use corrente::{config::Config, error::Error, torrent::{Torrent, TorrentState}};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "corrente", version, about, long_about = None)]
struct Args {
    /// Path to the .torrent file.
    torrent: PathBuf,

    /// Folder to place the downloaded files in; defaults to the
    /// configured download directory.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Run without the interactive progress readout.
    #[clap(long)]
    batch: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corrente=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let config = Config::load()?;
    let download_dir = args
        .output
        .unwrap_or_else(|| PathBuf::from(&config.download_dir));

    let torrent = Torrent::new(&args.torrent, &download_dir)?;
    torrent.start().await?;

    loop {
        sleep(Duration::from_secs(1)).await;

        let status = torrent.status();
        if !args.batch {
            let progress = status.progress;
            info!(
                "{}: {}/{} pieces",
                torrent.name(),
                progress.count(),
                progress.piece_count(),
            );
        }

        if status.state == TorrentState::Ready {
            break;
        }
    }

    info!("{} is complete", torrent.name());
    torrent.stop();

    Ok(())
}
