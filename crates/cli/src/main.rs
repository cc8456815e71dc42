use clap::{Args, Parser, Subcommand};
use futures::stream::{self, StreamExt, TryStreamExt};
use sealstream::{
    HttpTransport, LoaderError, Packager, PlaybackSession, SealStreamError, StreamConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

/// Package media segments into encrypted assets and play them back.
#[derive(Debug, Parser)]
#[command(name = "sealstream", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file. Environment overrides still apply.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Pack(PackArgs),
    Play(PlayArgs),
}

/// Encrypt every segment in a directory and write the extended manifest.
#[derive(Debug, Args)]
struct PackArgs {
    input: PathBuf,
    output: PathBuf,
}

/// Fetch and decrypt an asset, writing the concatenated plaintext.
#[derive(Debug, Args)]
struct PlayArgs {
    /// Manifest URL, or a local manifest file resolved against `content_root`.
    manifest: String,
    output: PathBuf,

    /// Segments fetched in parallel.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    SealStream(#[from] SealStreamError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid playlist: {0}")]
    Playlist(String),

    #[error("Invalid URL {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Local manifests need content_root set in the configuration")]
    MissingContentRoot,
}

impl From<LoaderError> for CliError {
    fn from(e: LoaderError) -> Self {
        CliError::SealStream(e.into())
    }
}

fn load_config(path: Option<&Path>) -> Result<StreamConfig, CliError> {
    let config = match path {
        Some(path) => StreamConfig::from_file(path),
        None => StreamConfig::from_env(),
    };
    config.map_err(|e| CliError::SealStream(e.into()))
}

fn pack(config: StreamConfig, args: &PackArgs) -> Result<(), CliError> {
    let packager = Packager::new(config);
    let asset = packager
        .package_dir(&args.input, &args.output)
        .map_err(|e| CliError::SealStream(e.into()))?;

    let bytes: usize = asset.segments.iter().map(|s| s.data.len()).sum();
    println!("asset     {}", asset.metadata.asset_id);
    println!("segments  {}", asset.segments.len());
    println!("bytes     {}", bytes);
    println!(
        "manifest  {}",
        args.output.join(&packager.config().manifest_name).display()
    );
    Ok(())
}

async fn play(config: StreamConfig, args: &PlayArgs) -> Result<(), CliError> {
    let session = PlaybackSession::new(
        Arc::new(HttpTransport::new()),
        config.codec(),
        config.loader_config(),
    );

    let (base, cleaned) = match Url::parse(&args.manifest) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            let cleaned = session.open(url.as_str()).await?;
            (url, cleaned)
        }
        _ => {
            let root = config
                .content_root
                .clone()
                .ok_or(CliError::MissingContentRoot)?;
            let text = tokio::fs::read_to_string(&args.manifest).await?;
            (root, session.open_local(&text)?)
        }
    };

    let playlist = m3u8_rs::parse_media_playlist_res(cleaned.as_bytes())
        .map_err(|e| CliError::Playlist(e.to_string()))?;
    let urls = playlist
        .segments
        .iter()
        .map(|segment| {
            base.join(&segment.uri).map_err(|source| CliError::Url {
                url: segment.uri.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    info!(segments = urls.len(), "fetching segments");

    let session = &session;
    let bodies: Vec<_> = stream::iter(urls)
        .map(|url| async move {
            debug!(url = %url, "fetching segment");
            session.fetch_segment(url.as_str()).await
        })
        .buffered(args.concurrency.max(1))
        .try_collect()
        .await?;

    let mut file = tokio::fs::File::create(&args.output).await?;
    let mut written = 0usize;
    for body in &bodies {
        file.write_all(body).await?;
        written += body.len();
    }
    file.flush().await?;
    session.close();

    println!("wrote {} bytes to {}", written, args.output.display());
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match load_config(cli.config.as_deref()) {
        Ok(config) => match &cli.command {
            Command::Pack(args) => pack(config, args),
            Command::Play(args) => play(config, args).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("{}", e);
        if let CliError::SealStream(inner) = &e {
            if let Some(hint) = inner.suggestion() {
                eprintln!("hint: {}", hint);
            }
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pack_command() {
        let cli = Cli::parse_from(["sealstream", "pack", "in", "out", "--config", "c.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
        match cli.command {
            Command::Pack(args) => {
                assert_eq!(args.input, PathBuf::from("in"));
                assert_eq!(args.output, PathBuf::from("out"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_play_defaults() {
        let cli = Cli::parse_from(["sealstream", "play", "https://x/p.m3u8", "out.ts"]);
        match cli.command {
            Command::Play(args) => {
                assert_eq!(args.manifest, "https://x/p.m3u8");
                assert_eq!(args.concurrency, 4);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
