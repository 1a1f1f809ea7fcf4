//! `polygon-sync` - standalone sync server.
//!
//! Configuration comes from `POLYGON_*` environment variables; see
//! [`ServerConfig::from_env`]. `POLYGON_MEMBERSHIPS` names a JSON file of
//! documents and organization members.

use std::sync::Arc;

use log::{error, info, warn};
use polygon_collab::{MembershipDirectory, ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting polygon-sync on {} (storage: {})",
        config.bind_addr,
        config.storage_path.display()
    );

    let directory = match std::env::var("POLYGON_MEMBERSHIPS") {
        Ok(path) => match MembershipDirectory::load(&path) {
            Ok(directory) => {
                info!("Loaded {} documents from {path}", directory.document_count());
                directory
            }
            Err(e) => {
                error!("Cannot load memberships: {e}");
                std::process::exit(1);
            }
        },
        Err(_) => {
            warn!("POLYGON_MEMBERSHIPS not set; every join will be refused");
            MembershipDirectory::new()
        }
    };

    let server = match SyncServer::new(config, Arc::new(directory)) {
        Ok(server) => server,
        Err(e) => {
            error!("Cannot open operation log: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
