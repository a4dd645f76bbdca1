//! Master process entry point: accounting authority for the pool — ledger,
//! PPLNS credit computation, payout engine, stats tick, and the read-only
//! HTTP stats API.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use equiforge_pool::api::{self, ApiState};
use equiforge_pool::config;
use equiforge_pool::core::params::STATS_TICK_MINUTES;
use equiforge_pool::crypto;
use equiforge_pool::database::Store;
use equiforge_pool::master::{self, MasterState};
use equiforge_pool::rpc::{DaemonClient, WalletClient};
use equiforge_pool::stats::{self, StatsHandle};
use equiforge_pool::storage;
use equiforge_pool::wallet as payout;

#[derive(Parser)]
#[command(name = "master", version = "1.0.0")]
#[command(about = "PPLNS accounting master for a mining pool")]
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

    let master_config = match config::master_config(&cfg) {
        Ok(c) => c.clone(),
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let store = match Store::open(cli.data_dir.join("db")) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("❌ failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let (removed, kept) = storage::database_cleanup(&store, equiforge_pool::core::params::PPLNS_WINDOW_DEFAULT)
        .unwrap_or((0, 0));
    tracing::info!("📦 startup database cleanup: removed {} kept {}", removed, kept);

    let stats = Arc::new(StatsHandle::load_or_default(&cli.data_dir));
    let master_key = crypto::derive_master_key(&cfg.master_pass);
    let daemon = DaemonClient::new(cfg.daemon_rpc.clone());
    let wallet = WalletClient::new(master_config.wallet_rpc.clone());

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handle = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("🚫 shutdown requested");
        shutdown_handle.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!("could not install signal handler: {}", e);
    }

    let master_state = Arc::new(MasterState::new(cfg.clone(), master_config.clone(), store.clone(), stats.clone(), master_key));

    let api_state = Arc::new(ApiState {
        store: store.clone(),
        stats: stats.clone(),
        config: cfg.clone(),
        master_config: master_config.clone(),
    });

    tokio::spawn(api::serve(api_state, master_config.api_port));
    tokio::spawn(updater_loop(cfg.clone(), master_config.clone(), store.clone(), daemon, wallet.clone(), master_state.clone()));
    tokio::spawn(payout_loop(cfg.clone(), master_config.clone(), store.clone(), wallet, stats.clone()));
    tokio::spawn(stats_loop(store.clone(), stats.clone(), master_state.clone()));

    tracing::info!("📦 master ready, listening for slaves on {}", master_config.listen_address);
    tokio::select! {
        result = master::run(master_state) => {
            if let Err(e) = result {
                tracing::error!("❌ master exited: {}", e);
            }
        }
        _ = async {
            while !shutdown.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        } => {
            tracing::info!("🚫 master shutting down");
        }
    }
}

/// Polls daemon height; on every advance, processes new incoming wallet
/// transfers into pending balances and confirms the head of the
/// unconfirmed-tx queue.
async fn updater_loop(
    cfg: equiforge_pool::config::Config,
    master_config: equiforge_pool::config::MasterConfig,
    store: Arc<Store>,
    daemon: DaemonClient,
    wallet: WalletClient,
    master_state: Arc<MasterState>,
) {
    let mut last_height = 0u64;
    loop {
        tokio::time::sleep(Duration::from_secs(15)).await;
        let height = match daemon.get_height().await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("🌐 updater get_height failed: {}", e);
                continue;
            }
        };
        if height <= last_height {
            continue;
        }
        last_height = height;

        *master_state.height.write().await = height;

        let pplns_window = {
            let net = daemon.get_info().await.map(|i| i.difficulty as f64).unwrap_or(0.0);
            *master_state.net_hashrate.write().await = net;
            let pool_hashrate = stats::Statistics::pool_hashrate_now(&store);
            storage::pplns_window(net, pool_hashrate, 120)
        };

        match storage::process_pending_balances(
            &store,
            &wallet,
            &cfg.fee_address,
            master_config.fee_percent,
            cfg.min_confs,
            pplns_window,
            height,
        )
        .await
        {
            Ok(processed) if processed > 0 => tracing::info!("💰 processed {} new incoming transfers", processed),
            Ok(_) => {}
            Err(e) => tracing::warn!("❌ pending balance update failed: {}", e),
        }

        match storage::confirm_head(&store, &daemon, height).await {
            Ok(true) => tracing::debug!("pending tx queue head advanced at height {}", height),
            Ok(false) => {}
            Err(e) => tracing::warn!("❌ confirmation step failed: {}", e),
        }
    }
}

async fn payout_loop(
    cfg: equiforge_pool::config::Config,
    master_config: equiforge_pool::config::MasterConfig,
    store: Arc<Store>,
    wallet: WalletClient,
    stats: Arc<StatsHandle>,
) {
    loop {
        tokio::time::sleep(Duration::from_secs(master_config.withdrawal_interval_minutes * 60)).await;
        match payout::run_payout_cycle(
            &store,
            &wallet,
            &cfg.fee_address,
            master_config.min_withdrawal,
            master_config.withdrawal_fee,
        )
        .await
        {
            Ok(Some(w)) => {
                tracing::info!("✅ payout cycle sent tx {} to {} destinations", w.tx_hash, w.destinations.len());
                stats.inner.write().await.record_withdrawal(stats::RecentWithdrawal {
                    tx_hash: w.tx_hash,
                    destinations: w.destinations.into_iter().map(|d| (d.address, d.amount)).collect(),
                    timestamp: w.timestamp,
                });
            }
            Ok(None) => tracing::debug!("payout cycle: below threshold, skipped"),
            Err(e) => tracing::warn!("❌ payout cycle failed: {}", e),
        }
    }
}

async fn stats_loop(store: Arc<Store>, stats: Arc<StatsHandle>, master_state: Arc<MasterState>) {
    let tick_interval_s = STATS_TICK_MINUTES * 60;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = now_unix();
        let last_update = stats.inner.read().await.last_update;
        let (should, fast_forward) = stats::should_tick(last_update, now, tick_interval_s);
        if let Some(ff) = fast_forward {
            stats.inner.write().await.last_update = ff;
            continue;
        }
        if !should {
            continue;
        }
        let worker_count = master::total_worker_count(&master_state).await;
        let pool_hashrate = stats::Statistics::pool_hashrate_now(&store);
        let net_hashrate = *master_state.net_hashrate.read().await;
        let height = *master_state.height.read().await;
        let pplns_window_s = storage::pplns_window(net_hashrate, pool_hashrate, 120);
        let mut snapshot = stats.inner.write().await;
        snapshot.tick(&store, pool_hashrate, worker_count, net_hashrate, height, pplns_window_s);
        drop(snapshot);
        if let Err(e) = stats.persist().await {
            tracing::warn!("❌ failed to persist stats: {}", e);
        }
    }
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}
