use std::sync::Arc;

use appdepot_core::{DownloadManager, ServiceConfig};
use tracing_subscriber::EnvFilter;

mod auth;
mod server;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServiceConfig::from_env();
    tracing::info!(
        "starting appdepot (data dir {}, threads {})",
        config.data_dir.display(),
        config.download_threads
    );

    let manager = match DownloadManager::new(config) {
        Ok(manager) => Arc::new(manager),
        Err(err) => {
            tracing::error!("failed to initialize: {}", err);
            std::process::exit(1);
        }
    };
    manager.spawn_maintenance();

    if let Err(err) = server::serve(manager) {
        tracing::error!("server error: {}", err);
        std::process::exit(1);
    }
}
