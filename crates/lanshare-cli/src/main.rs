//! lanshare CLI
//!
//! Share a folder with peers on the local network.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use lanshare_core::discovery::{advertised_url, local_ip};
use lanshare_core::listing::validate_name;
use lanshare_core::watcher::spawn_directory_watcher;
use lanshare_core::{FileServer, FsDirectory, PeerClient};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{FetchProgress, format_bytes};

/// lanshare - share a folder with peers on the local network
#[derive(Parser)]
#[command(name = "lanshare")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share the folder and serve connected peers
    Serve {
        /// Listen address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Shared folder (overrides config)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Do not poll the folder for changes
        #[arg(long)]
        no_watch: bool,
    },

    /// Copy a file into the shared folder
    Share {
        /// File to share
        #[arg(required = true)]
        file: PathBuf,

        /// Shared folder (overrides config)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Connect to a server and print its listing
    List {
        /// Server URL (ws://host:port)
        #[arg(required = true)]
        url: String,
    },

    /// Download one file from a server
    Fetch {
        /// Server URL (ws://host:port)
        #[arg(required = true)]
        url: String,

        /// File name as shown in the listing
        #[arg(required = true)]
        name: String,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Seconds to wait for the file
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Serve { bind, dir, no_watch } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.listen_addr = bind;
            }
            if let Some(dir) = dir {
                config.server.shared_dir = dir;
            }
            if no_watch {
                config.watch.enabled = false;
            }
            config.validate()?;
            serve(&config).await?;
        }
        Commands::Share { file, dir } => {
            config.validate()?;
            let dir = dir.unwrap_or_else(|| config.server.shared_dir.clone());
            share_file(file, dir, &config).await?;
        }
        Commands::List { url } => {
            list_remote(&url).await?;
        }
        Commands::Fetch {
            url,
            name,
            output,
            timeout,
        } => {
            fetch_file(&url, &name, output, Duration::from_secs(timeout)).await?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Install the tracing subscriber
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    Ok(())
}

/// Run the server until Ctrl+C
async fn serve(config: &Config) -> anyhow::Result<()> {
    let server = FileServer::new(config.server_config()?)?;
    let addr = server.start().await?;

    let ip = if addr.ip().is_unspecified() {
        local_ip()
    } else {
        addr.ip()
    };

    println!("lanshare {}", env!("CARGO_PKG_VERSION"));
    println!("Sharing: {}", server.directory().root().display());
    println!("Connect: {}", advertised_url(ip, addr.port()));
    println!("Watch: {}", config.watch.enabled);

    let files = server.listing().await?;
    println!("\nAvailable files ({}):", files.len());
    for name in &files {
        println!("  {name}");
    }

    let watcher = config
        .watch
        .enabled
        .then(|| spawn_directory_watcher(server.clone(), config.watch_interval()));

    println!("\nPress Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    server.stop().await?;
    if let Some(watcher) = watcher {
        watcher.await?;
    }

    Ok(())
}

/// Copy a file into the shared folder
async fn share_file(file: PathBuf, dir: PathBuf, config: &Config) -> anyhow::Result<()> {
    if !file.is_file() {
        anyhow::bail!("File not found: {:?}", file);
    }

    let shared = FsDirectory::open(&dir, config.server.max_file_size)?;
    let name = shared.import(&file).await?;
    let size = std::fs::metadata(shared.root().join(&name))?.len();

    tracing::info!("File added: {}", name);
    println!("Shared {} ({}) in {}", name, format_bytes(size), dir.display());
    if !config.watch.enabled {
        println!("Note: watch is disabled; a running server will not announce it");
    }

    Ok(())
}

/// Print a server's listing
async fn list_remote(url: &str) -> anyhow::Result<()> {
    let mut client = PeerClient::connect(url).await?;

    let Some(files) = client.wait_for_listing(Duration::from_secs(10)).await? else {
        anyhow::bail!("Server at {} sent no listing", url);
    };

    println!("Available files ({}):", files.len());
    for name in &files {
        println!("  {name}");
    }

    client.close().await?;
    Ok(())
}

/// Download one file into `output`
async fn fetch_file(url: &str, name: &str, output: PathBuf, wait: Duration) -> anyhow::Result<()> {
    // The name becomes a path on this machine too
    validate_name(name)?;

    let mut client = PeerClient::connect(url).await?;
    let progress = FetchProgress::new(name);

    let Some(bytes) = client.fetch(name, wait).await? else {
        progress.abandon(format!("No reply for {name}"));
        anyhow::bail!(
            "Server did not send {} within {}s (not shared?)",
            name,
            wait.as_secs()
        );
    };

    std::fs::create_dir_all(&output)?;
    let path = output.join(name);
    tokio::fs::write(&path, &bytes).await?;
    progress.finish(name, bytes.len() as u64);

    println!("Saved to {}", path.display());
    client.close().await?;
    Ok(())
}
