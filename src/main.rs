use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

mod config;
mod media;
mod server;
mod utils;

use config::Config;
use media::{MediaService, TargetKind, YtDlpExtractor};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default)
    Serve {
        /// Address to listen on, overrides the config
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Print the format catalog of a media URL as JSON
    Info {
        url: String,
        /// Netscape cookie file passed to the extractor
        #[arg(long)]
        cookies: Option<PathBuf>,
    },
    /// Resolve one format and write its bytes to stdout
    Fetch {
        url: String,
        itag: String,
        /// video or audio
        #[arg(short = 't', long = "type", default_value = "video")]
        kind: String,
        /// Netscape cookie file passed to the extractor
        #[arg(long)]
        cookies: Option<PathBuf>,
    },
}

fn get_config_path(args: &Args) -> Option<String> {
    if let Some(path) = &args.config {
        return Some(path.clone());
    }

    if let Ok(path) = std::env::var("CONFIG_FILE") {
        return Some(path);
    }

    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        let config_path = format!("{}/grabby-relay/config.toml", xdg_config_home);
        if std::path::Path::new(&config_path).exists() {
            return Some(config_path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let config_path = format!("{}/.config/grabby-relay/config.toml", home.display());
        if std::path::Path::new(&config_path).exists() {
            return Some(config_path);
        }
    }

    None
}

fn load_config(args: &Args) -> Result<Config> {
    let config = match get_config_path(args) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::default(),
    };
    Ok(config.with_env_overrides())
}

fn init_logging(format: &str) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    // stdout may carry media bytes (fetch), so logs go to stderr
    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn read_cookies(path: Option<&PathBuf>) -> Result<Option<Vec<u8>>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .map(Some)
            .with_context(|| format!("Failed to read cookies from {}", path.display())),
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(config.get_logging_format());

    info!("Starting grabby-relay...");

    let config = Arc::new(config);
    let extractor = Arc::new(YtDlpExtractor::new(&config.extractor.binary));
    let service = Arc::new(MediaService::new(&config, extractor)?);

    if let Err(e) = service.test_setup().await {
        warn!("Extractor check failed, requests will error until it is fixed: {}", e);
    }

    match args.command.unwrap_or(Command::Serve { listen: None }) {
        Command::Serve { listen } => {
            let listen = listen.unwrap_or(config.server.listen);
            server::run(config, service, listen).await?;
        }
        Command::Info { url, cookies } => {
            let cookies = read_cookies(cookies.as_ref()).await?;
            let info = service.describe(&url, cookies.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Fetch {
            url,
            itag,
            kind,
            cookies,
        } => {
            let kind = TargetKind::parse(&kind)
                .with_context(|| format!("Unsupported type: {}", kind))?;
            let cookies = read_cookies(cookies.as_ref()).await?;
            let resolved = service.prepare(&url, &itag, cookies.as_deref()).await?;
            info!("Fetching format {} ({:?}) of {}", resolved.format_id, kind, url);

            let token = CancellationToken::new();
            let ctrl_c_token = token.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Interrupted, cancelling transfer");
                        ctrl_c_token.cancel();
                    }
                    Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
                }
            });

            let mut stdout = tokio::io::stdout();
            let outcome = service
                .relay_engine()
                .relay(&resolved.locator, &mut stdout, &token)
                .await?;
            info!(
                "Wrote {} in {} chunks",
                utils::format_size(outcome.bytes_sent),
                outcome.chunks
            );
        }
    }

    Ok(())
}
