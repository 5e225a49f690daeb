mod config;
mod server;

use clap::{Parser, Subcommand};
use config::Config;
use peerstash_core::{PeerSet, placement};
use server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "peerstash")]
#[command(about = "Peer-to-peer content-addressed blob storage node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Print the placement ranking of a key over the configured hosts
    Rank {
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        key: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerstash=info,peerstash_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Peerstash server with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            tracing::info!(
                "Host: {}, Bind: {}, Peers: {}, R: {}",
                cfg.host,
                cfg.bind_addr,
                cfg.peers.len(),
                cfg.repair.replication_factor
            );

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {:#}", e);
                std::process::exit(1);
            }
        }
        Commands::Rank { config, key } => {
            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            let peers = PeerSet::new(cfg.host.clone(), cfg.peers.clone(), cfg.decommissioned.clone());
            let replication_factor = cfg.repair.replication_factor;
            for (index, host) in placement::rank(&key, &peers.hosts()).iter().enumerate() {
                let marker = if index < replication_factor { "*" } else { " " };
                println!("{} {:>3} {}", marker, index, host);
            }
        }
    }
}
