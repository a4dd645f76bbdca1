//! Master event handler (C6): accepts connections from slaves and dispatches
//! decrypted frames to the ledger, payout, and stats layers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};

use crate::config::{Config, MasterConfig};
use crate::database::Store;
use crate::network::{self, NetMsg};
use crate::stats::{BlockFoundRecord, StatsHandle};
use crate::storage;

pub struct MasterState {
    pub config: Config,
    pub master_config: MasterConfig,
    pub store: Arc<Store>,
    pub stats: Arc<StatsHandle>,
    pub master_key: [u8; 32],
    pub net_hashrate: RwLock<f64>,
    pub height: RwLock<u64>,
    worker_counts: Mutex<HashMap<u64, u64>>,
    next_conn_id: AtomicU64,
}

impl MasterState {
    pub fn new(config: Config, master_config: MasterConfig, store: Arc<Store>, stats: Arc<StatsHandle>, master_key: [u8; 32]) -> Self {
        MasterState {
            config,
            master_config,
            store,
            stats,
            master_key,
            net_hashrate: RwLock::new(0.0),
            height: RwLock::new(0),
            worker_counts: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
        }
    }

    async fn total_workers(&self) -> u64 {
        self.worker_counts.lock().await.values().sum()
    }
}

pub async fn run(state: Arc<MasterState>) -> Result<(), crate::error::PoolError> {
    let addr = state.master_config.listen_address.clone();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("🔌 master listening for slaves on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state.clone(), stream, conn_id).await {
                        tracing::debug!("slave connection {} from {} ended: {}", conn_id, peer, e);
                    }
                    state.worker_counts.lock().await.remove(&conn_id);
                });
            }
            Err(e) => tracing::warn!("master accept error: {}", e),
        }
    }
}

async fn handle_connection(state: Arc<MasterState>, mut stream: TcpStream, conn_id: u64) -> Result<(), crate::error::PoolError> {
    loop {
        let msg = network::read_frame(&mut stream, &state.master_key).await?;
        dispatch(&state, conn_id, msg).await;
    }
}

async fn dispatch(state: &Arc<MasterState>, conn_id: u64, msg: NetMsg) {
    match msg {
        NetMsg::ShareBatch { wallet, diff, .. } => {
            let addr = if crate::address::is_address_valid(&wallet, &state.config.addr_prefix, &state.config.subaddr_prefix)
                || wallet == state.config.fee_address
            {
                wallet
            } else {
                tracing::warn!("⚠️ invalid address in share batch, rerouting to fee address: {}", wallet);
                state.config.fee_address.clone()
            };
            if let Err(e) = storage::record_share_batch(&state.store, &addr, diff) {
                tracing::warn!("❌ failed to record share batch: {}", e);
            }
        }
        NetMsg::BlockFound { height, reward, hash } => {
            if state.config.use_p2pool {
                tracing::error!("❌ BlockFound received while master is configured for P2Pool mode, ignoring");
                return;
            }
            let mut stats = state.stats.inner.write().await;
            stats.record_block_found(BlockFoundRecord {
                height,
                hash: hex::encode(hash),
                reward,
                timestamp: now_unix(),
            });
        }
        NetMsg::WorkerCount { count } => {
            state.worker_counts.lock().await.insert(conn_id, count);
        }
        NetMsg::P2PoolShareFound { height } => {
            if !state.config.use_p2pool {
                tracing::error!("❌ P2PoolShareFound received while master is not in P2Pool mode, ignoring");
                return;
            }
            tracing::info!("🌐 p2pool parent share found at height {}", height);
        }
    }
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Total connected worker count across every slave link, used by the stats
/// tick.
pub async fn total_worker_count(state: &Arc<MasterState>) -> u64 {
    state.total_workers().await
}
