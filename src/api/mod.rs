//! HTTP stats API (C12, ambient, thin): a hand-rolled HTTP/1.1 responder —
//! manual request-line parsing over a buffered TCP stream, matching the
//! scope-note in §4.12 that this surface is modeled only at its interface,
//! not built out with a web framework.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{Config, MasterConfig};
use crate::database::Store;
use crate::stats::{BlockFoundRecord, HashrateSample, RecentWithdrawal, StatsHandle};
use crate::storage;

pub struct ApiState {
    pub store: Arc<Store>,
    pub stats: Arc<StatsHandle>,
    pub config: Config,
    pub master_config: MasterConfig,
}

pub async fn serve(state: Arc<ApiState>, port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("stats api failed to bind {}: {}", addr, e);
            return;
        }
    };
    tracing::info!("📊 stats api listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, state).await {
                        tracing::debug!("stats api connection from {} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("stats api accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ApiState>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    // Drain headers without acting on them; this API has no request body.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
    let (status, body) = route(&path, peer, &state).await;
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

async fn route(path: &str, peer: SocketAddr, state: &Arc<ApiState>) -> (&'static str, String) {
    if path == "/ping" {
        return ("200 OK", json!({ "status": "pong" }).to_string());
    }
    if path == "/stats" {
        return ("200 OK", stats_body(state).await);
    }
    if path == "/info" {
        return ("200 OK", info_body(state));
    }
    if let Some(addr) = path.strip_prefix("/stats/") {
        if addr == state.config.pool_address && !peer.ip().is_loopback() {
            return ("404 Not Found", json!({ "error": "not found" }).to_string());
        }
        return ("200 OK", address_stats_body(state, addr).await);
    }
    ("404 Not Found", json!({ "error": "not found" }).to_string())
}

#[derive(Serialize)]
struct PoolStatsResponse {
    pool_hashrate: f64,
    pool_hashrate_chart: Vec<HashrateSample>,
    net_hashrate: f64,
    height: u64,
    workers: u64,
    workers_chart: Vec<HashrateSample>,
    known_addresses: usize,
    addresses_chart: Vec<HashrateSample>,
    last_block: Option<BlockFoundRecord>,
    blocks_found: Vec<BlockFoundRecord>,
    num_found: u64,
    pplns_window_s: u64,
    recent_withdrawals: Vec<RecentWithdrawal>,
    fee_percent: f64,
    min_withdrawal: u64,
}

async fn stats_body(state: &Arc<ApiState>) -> String {
    let snapshot = state.stats.inner.read().await;
    let resp = PoolStatsResponse {
        pool_hashrate: snapshot.pool_hashrate,
        pool_hashrate_chart: snapshot.pool_hashrate_chart.clone(),
        net_hashrate: snapshot.net_hashrate,
        height: snapshot.height,
        workers: snapshot.workers,
        workers_chart: snapshot.workers_chart.clone(),
        known_addresses: snapshot.known_addresses.len(),
        addresses_chart: snapshot.addresses_chart.clone(),
        last_block: snapshot.last_block.clone(),
        blocks_found: snapshot.blocks_found.clone(),
        num_found: snapshot.num_found,
        pplns_window_s: snapshot.pplns_window_s,
        recent_withdrawals: snapshot.recent_withdrawals.clone(),
        fee_percent: state.master_config.fee_percent,
        min_withdrawal: state.master_config.min_withdrawal,
    };
    serde_json::to_string(&resp).unwrap_or_else(|_| "{}".to_string())
}

async fn address_stats_body(state: &Arc<ApiState>, addr: &str) -> String {
    let balances = storage::address_balances(&state.store, addr).unwrap_or_default();
    let snapshot = state.stats.inner.read().await;
    let hr_5m = snapshot.hashrate_5m(&state.store, addr);
    let hr_15m = snapshot.hashrate_15m(&state.store, addr);
    let chart = snapshot.hashrate_charts.get(addr).cloned().unwrap_or_default();
    let withdrawals: Vec<_> = snapshot
        .recent_withdrawals
        .iter()
        .filter(|w| w.destinations.iter().any(|(a, _)| a == addr))
        .collect();

    json!({
        "address": addr,
        "balance": balances.balance,
        "balance_pending": balances.balance_pending,
        "paid": balances.paid,
        "hashrate_5m": hr_5m,
        "hashrate_15m": hr_15m,
        "hashrate_chart": chart,
        "withdrawals": withdrawals,
    })
    .to_string()
}

fn info_body(state: &Arc<ApiState>) -> String {
    json!({
        "fee_percent": state.master_config.fee_percent,
        "min_withdrawal": state.master_config.min_withdrawal,
        "withdrawal_interval_minutes": state.master_config.withdrawal_interval_minutes,
        "stratums": state.master_config.stratums,
    })
    .to_string()
}
