// src/main.rs
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use verso::{Config, Server};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Optional config file as the only argument.
    let config = match std::env::args().nth(1) {
        Some(path) => match Config::load(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path, error = %e, "unable to load configuration");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("shutdown signal received");
        signal.store(true, Ordering::Release);
    }) {
        error!(error = %e, "unable to install signal handler");
        std::process::exit(1);
    }

    let workers = config.workers.min(num_cpus::get().max(1));
    let result = Server::bind(&config.host_port())
        .workers(workers)
        .storage(config.storage_root.clone())
        .serve(shutdown);

    if let Err(e) = result {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
