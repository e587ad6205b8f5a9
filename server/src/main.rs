use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::network::Server;
use server::store::{FileStore, MemoryStore, ProfileStore};
use std::sync::Arc;

/// Main-method of the application.
/// Parses command-line arguments, opens the profile store and runs the server until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = ServerConfig::parse();

    let store: Arc<dyn ProfileStore> = match &config.data_dir {
        Some(dir) => {
            info!("Saving profiles to {}", dir.display());
            Arc::new(FileStore::open(dir).await?)
        }
        None => {
            info!("No --data-dir given, profiles are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let mut server = Server::new(&config, store).await?;
    server.run().await?;

    Ok(())
}
