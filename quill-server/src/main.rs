//! `quilld`: runs the collaborative sync server.
//!
//! ```text
//! quilld [config.toml]
//! ```
//!
//! Without a config file every setting takes its default and documents are
//! kept in memory. Log output is controlled with `RUST_LOG`.

use std::error::Error;
use std::path::PathBuf;

use log::info;
use quill_sync::{Config, SyncServer};

fn load_config() -> Result<Config, Box<dyn Error>> {
    match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(Config::load(&path)?)
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = load_config()?;
    let server = SyncServer::new(config)?;
    info!("Starting quilld on {}", server.bind_addr());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                let e: Box<dyn Error> = e;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    if let Err(e) = server.hub().documents().flush_all().await {
        log::warn!("Final flush failed: {e}");
    }
    Ok(())
}
