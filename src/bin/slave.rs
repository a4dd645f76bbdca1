//! Slave process entry point: runs the Stratum accept loops against a
//! single daemon RPC endpoint, forwarding share/block/worker events to the
//! master over an encrypted link.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use equiforge_pool::config;
use equiforge_pool::crypto;
use equiforge_pool::pool::{self, SlaveState};
use equiforge_pool::rpc::DaemonClient;

#[derive(Parser)]
#[command(name = "slave", version = "1.0.0")]
#[command(about = "Stratum-facing mining pool slave")]
struct Cli {
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match config::load(&cli.data_dir) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(config::log_filter_directives(cfg.log_level))
        .init();

    let slave_config = match config::slave_config(&cfg) {
        Ok(c) => c.clone(),
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let (tls_cert, tls_key) = match config::load_or_generate_tls(&cli.data_dir) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!("❌ tls bootstrap failed: {}", e);
            std::process::exit(1);
        }
    };

    let master_key = crypto::derive_master_key(&cfg.master_pass);
    let daemon = DaemonClient::new(cfg.daemon_rpc.clone());

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handle = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("🚫 shutdown requested");
        shutdown_handle.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!("could not install signal handler: {}", e);
    }

    tracing::info!("📦 starting slave, master at {}", slave_config.master_address);
    let state = Arc::new(SlaveState::new(cfg, slave_config, daemon, master_key));

    tokio::select! {
        result = pool::run(state, tls_cert, tls_key) => {
            if let Err(e) = result {
                tracing::error!("❌ slave exited: {}", e);
            }
        }
        _ = async {
            while !shutdown.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        } => {
            tracing::info!("🚫 slave shutting down");
        }
    }
}
