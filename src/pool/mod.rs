//! Slave coordinator: owns the Stratum accept loops, the daemon-template
//! refresher, the server-wide NiceHash partition allocator, and the
//! share-batch flush to the master. The pure per-submission protocol logic
//! lives in [`crate::miner`]; this module is the orchestration around it.

pub mod pool_miner;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, RngCore};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio_rustls::rustls::{self, pki_types::PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::address;
use crate::config::{Config, SlaveConfig};
use crate::core::params::NICEHASH_PARTITION_MAX;
use crate::miner::{
    self, ConnJob, JobSlot, LoginParams, RpcEnvelope, RpcResponse, Session, SubmitError, SubmitParams,
};
use crate::network::{self, NetMsg};
use crate::pool::pool_miner::{P2PoolClient, P2PoolJob};
use crate::pow;
use crate::rpc::{BlockTemplate, DaemonClient};

const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const REFRESH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const LOGIN_READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(20);

fn clone_template(tpl: &BlockTemplate) -> BlockTemplate {
    BlockTemplate {
        blocktemplate_blob: tpl.blocktemplate_blob.clone(),
        blockhashing_blob: tpl.blockhashing_blob.clone(),
        difficulty: tpl.difficulty,
        height: tpl.height,
        seed_hash: tpl.seed_hash.clone(),
        reserved_offset: tpl.reserved_offset,
        expected_reward: tpl.expected_reward,
    }
}

struct NiceHashState {
    counter: u8,
    template: Option<BlockTemplate>,
}

/// Server-wide rolling NiceHash allocator: one shared template, a
/// mutex-serialized 1..=255 partition counter (§4.4 "NiceHash job allocator").
struct NiceHashAllocator {
    state: Mutex<NiceHashState>,
}

impl NiceHashAllocator {
    fn new() -> Self {
        NiceHashAllocator { state: Mutex::new(NiceHashState { counter: 0, template: None }) }
    }

    /// Returns (template, partition byte), minting a fresh template when
    /// none is cached or the counter has wrapped past 255.
    async fn allocate(&self, daemon: &DaemonClient, pool_address: &str) -> Result<(BlockTemplate, u8), crate::error::PoolError> {
        let mut state = self.state.lock().await;
        if state.template.is_none() || state.counter >= NICEHASH_PARTITION_MAX {
            state.template = Some(daemon.get_block_template(pool_address, 8).await?);
            state.counter = 0;
        }
        state.counter += 1;
        let partition = state.counter;
        Ok((clone_template(state.template.as_ref().expect("just populated")), partition))
    }

    async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.template = None;
        state.counter = 0;
    }
}

/// Shared state for every Stratum connection handled by this slave process.
pub struct SlaveState {
    pub config: Config,
    pub slave_config: SlaveConfig,
    pub daemon: DaemonClient,
    pub master_key: [u8; 32],
    pub master_addr: String,
    pub network_difficulty: AtomicU64,
    pub network_height: AtomicU64,
    pub current_template: RwLock<Option<BlockTemplate>>,
    nicehash: NiceHashAllocator,
    refresh_signal: Notify,
    worker_count: AtomicU64,
    share_batch: Mutex<HashMap<String, (u64, u64)>>,
    master_writer: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    pub p2pool: Option<Arc<P2PoolClient>>,
}

impl SlaveState {
    pub fn new(config: Config, slave_config: SlaveConfig, daemon: DaemonClient, master_key: [u8; 32]) -> Self {
        let p2pool = if config.use_p2pool {
            Some(Arc::new(P2PoolClient::new(config.p2pool_address.clone())))
        } else {
            None
        };
        SlaveState {
            master_addr: slave_config.master_address.clone(),
            config,
            slave_config,
            daemon,
            master_key,
            network_difficulty: AtomicU64::new(0),
            network_height: AtomicU64::new(0),
            current_template: RwLock::new(None),
            nicehash: NiceHashAllocator::new(),
            refresh_signal: Notify::new(),
            worker_count: AtomicU64::new(0),
            share_batch: Mutex::new(HashMap::new()),
            master_writer: Mutex::new(None),
            p2pool,
        }
    }

    pub fn signal_refresh(&self) {
        self.refresh_signal.notify_waiters();
    }

    async fn credit_share(&self, wallet: &str, diff: u64) {
        let mut batch = self.share_batch.lock().await;
        let entry = batch.entry(wallet.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += diff;
    }

    async fn send_to_master(&self, msg: &NetMsg) {
        let mut guard = self.master_writer.lock().await;
        if guard.is_none() {
            match TcpStream::connect(&self.master_addr).await {
                Ok(stream) => {
                    let (_, w) = stream.into_split();
                    *guard = Some(w);
                }
                Err(e) => {
                    tracing::warn!("❌ could not connect to master at {}: {}", self.master_addr, e);
                    return;
                }
            }
        }
        if let Some(w) = guard.as_mut() {
            if let Err(e) = network::write_frame(w, &self.master_key, msg).await {
                tracing::warn!("❌ master connection dropped: {}", e);
                *guard = None;
            }
        }
    }
}

/// Refreshes the daemon-derived template and network difficulty whenever
/// height changes, the template timeout elapses, or a solve signals via
/// [`SlaveState::signal_refresh`].
async fn refresher_task(state: Arc<SlaveState>) {
    let mut last_height = 0u64;
    loop {
        let tick = tokio::time::sleep(REFRESH_POLL_INTERVAL);
        tokio::select! {
            _ = tick => {}
            _ = state.refresh_signal.notified() => {}
        }

        match state.daemon.get_info().await {
            Ok(info) => {
                state.network_difficulty.store(info.difficulty, Ordering::Relaxed);
                if info.height != last_height {
                    last_height = info.height;
                    state.network_height.store(info.height, Ordering::Relaxed);
                    refresh_template(&state).await;

                    let state2 = state.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        state2.nicehash.invalidate().await;
                    });
                }
            }
            Err(e) => tracing::warn!("🌐 get_info failed: {}", e),
        }
    }
}

async fn refresh_template(state: &Arc<SlaveState>) {
    if state.config.use_p2pool {
        return;
    }
    match state.daemon.get_block_template(&state.config.pool_address, 8).await {
        Ok(tpl) => {
            tracing::info!("🔄 new template at height {}", tpl.height);
            *state.current_template.write().await = Some(tpl);
        }
        Err(e) => tracing::warn!("❌ get_block_template failed: {}", e),
    }
}

async fn flush_task(state: Arc<SlaveState>) {
    loop {
        tokio::time::sleep(FLUSH_INTERVAL).await;
        let drained: Vec<(String, (u64, u64))> = {
            let mut batch = state.share_batch.lock().await;
            batch.drain().collect()
        };
        for (wallet, (count, diff)) in drained {
            state.send_to_master(&NetMsg::ShareBatch { count, wallet, diff }).await;
        }
        state.send_to_master(&NetMsg::WorkerCount { count: state.worker_count.load(Ordering::Relaxed) }).await;
    }
}

/// Runs the slave process: spawns the refresher, flush task, plain and TLS
/// accept loops, and (if configured) the P2Pool client.
pub async fn run(state: Arc<SlaveState>, tls_cert: Vec<u8>, tls_key: Vec<u8>) -> Result<(), crate::error::PoolError> {
    if let Some(p2pool) = &state.p2pool {
        p2pool.clone().spawn();
    }

    tokio::spawn(refresher_task(state.clone()));
    tokio::spawn(flush_task(state.clone()));

    let plain = {
        let state = state.clone();
        let port = state.slave_config.pool_port;
        tokio::spawn(async move { accept_plain(state, port).await })
    };
    let tls = {
        let state = state.clone();
        let port = state.slave_config.pool_port_tls;
        tokio::spawn(async move { accept_tls(state, port, tls_cert, tls_key).await })
    };

    let _ = tokio::join!(plain, tls);
    Ok(())
}

async fn accept_plain(state: Arc<SlaveState>, port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("❌ stratum bind {} failed: {}", addr, e);
            return;
        }
    };
    tracing::info!("🔌 stratum (plain) listening on {}", addr);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    let (r, w) = stream.into_split();
                    handle_connection(state, r, w, false, peer.to_string()).await;
                });
            }
            Err(e) => tracing::warn!("stratum accept error: {}", e),
        }
    }
}

async fn accept_tls(state: Arc<SlaveState>, port: u16, cert_pem: Vec<u8>, key_pem: Vec<u8>) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("❌ stratum tls bind {} failed: {}", addr, e);
            return;
        }
    };

    let certs = match rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("❌ tls cert parse failed: {}", e);
            return;
        }
    };
    let key = match rustls_pemfile::private_key(&mut &key_pem[..]) {
        Ok(Some(k)) => k,
        Ok(None) | Err(_) => {
            tracing::error!("❌ tls key parse failed");
            return;
        }
    };
    let key: PrivateKeyDer<'static> = key;

    let tls_config = match rustls::ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("❌ tls config failed: {}", e);
            return;
        }
    };
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    tracing::info!("🔑 stratum (tls) listening on {}", addr);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let acceptor = acceptor.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let (r, w) = tokio::io::split(tls_stream);
                            handle_connection(state, r, w, true, peer.to_string()).await;
                        }
                        Err(e) => tracing::debug!("tls handshake failed from {}: {}", peer, e),
                    }
                });
            }
            Err(e) => tracing::warn!("stratum tls accept error: {}", e),
        }
    }
}

async fn handle_connection<R, W>(state: Arc<SlaveState>, reader: R, mut writer: W, tls: bool, peer: String)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    state.worker_count.fetch_add(1, Ordering::Relaxed);
    let mut reader = BufReader::new(reader);
    let mut session: Option<Session> = None;
    let mut p2pool_jobs: Option<mpsc::Receiver<P2PoolJob>> = None;

    loop {
        let deadline = match &session {
            Some(s) => Duration::from_secs(10 * s.target_share_time_s.max(1)),
            None => LOGIN_READ_TIMEOUT,
        };

        let mut line = String::new();
        let read_result = tokio::select! {
            r = tokio::time::timeout(deadline, reader.read_line(&mut line)) => r,
            job = async {
                match &mut p2pool_jobs {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                if let (Some(job), Some(sess)) = (job, session.as_mut()) {
                    dispatch_p2pool_job(&state, sess, job);
                    if let Some(notif) = sess.job_notification(&state.config.algo_name) {
                        let _ = send_line(&mut writer, json!({"jsonrpc":"2.0","method":"job","params":notif})).await;
                    }
                }
                continue;
            }
        };

        let n = match read_result {
            Ok(Ok(n)) => n,
            _ => break,
        };
        if n == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(envelope) = serde_json::from_str::<RpcEnvelope>(trimmed) else { continue };

        match envelope.method.as_str() {
            "login" => {
                let Ok(params) = serde_json::from_value::<LoginParams>(envelope.params.clone()) else {
                    let _ = send_line(&mut writer, to_value(&RpcResponse::err(envelope.id, "malformed login"))).await;
                    break;
                };
                match handle_login(&state, &params, tls).await {
                    Ok((sess, job, maybe_jobs)) => {
                        p2pool_jobs = maybe_jobs;
                        let notif = sess.job_notification(&state.config.algo_name);
                        let nicehash = sess.nicehash;
                        session = Some(sess);
                        let extensions: Vec<&str> = if nicehash { vec!["keepalive", "nicehash"] } else { vec!["keepalive"] };
                        let result = json!({
                            "id": hex::encode(job.job_id),
                            "job": notif,
                            "status": "OK",
                            "extensions": extensions,
                        });
                        if send_line(&mut writer, to_value(&RpcResponse::ok(envelope.id, result))).await.is_err() {
                            break;
                        }
                    }
                    Err(msg) => {
                        let _ = send_line(&mut writer, to_value(&RpcResponse::err(envelope.id, msg))).await;
                        break;
                    }
                }
            }
            "submit" => {
                let Some(sess) = session.as_mut() else { break };
                let Ok(params) = serde_json::from_value::<SubmitParams>(envelope.params.clone()) else {
                    let _ = send_line(&mut writer, to_value(&RpcResponse::err(envelope.id, "malformed share"))).await;
                    continue;
                };
                match handle_submit(&state, sess, &params, &peer).await {
                    Ok(()) => {
                        let _ = send_line(&mut writer, to_value(&RpcResponse::ok(envelope.id, json!({"status":"OK"})))).await;
                        if let Some(notif) = sess.job_notification(&state.config.algo_name) {
                            let _ = send_line(&mut writer, json!({"jsonrpc":"2.0","method":"job","params":notif})).await;
                        }
                    }
                    Err(e) => {
                        let _ = send_line(&mut writer, to_value(&RpcResponse::err(envelope.id, e.message()))).await;
                    }
                }
            }
            "keepalived" => {
                if send_line(&mut writer, json!({"status": "KEEPALIVED"})).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }

    state.worker_count.fetch_sub(1, Ordering::Relaxed);
}

fn to_value(resp: &RpcResponse) -> Value {
    serde_json::to_value(resp).unwrap_or_else(|_| json!({}))
}

async fn send_line<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, v: Value) -> std::io::Result<()> {
    tokio::time::timeout(WRITE_TIMEOUT, async {
        let mut line = serde_json::to_vec(&v).unwrap_or_default();
        line.push(b'\n');
        w.write_all(&line).await?;
        w.flush().await
    })
    .await
    .unwrap_or(Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out")))
}

async fn handle_login(
    state: &Arc<SlaveState>,
    params: &LoginParams,
    tls: bool,
) -> Result<(Session, ConnJob, Option<mpsc::Receiver<P2PoolJob>>), &'static str> {
    let (bare_address, requested_diff) = miner::parse_login_address(&params.login);
    if !address::is_address_valid(bare_address, &state.config.addr_prefix, &state.config.subaddr_prefix) {
        return Err("Invalid payment address provided");
    }

    let network_difficulty = state.network_difficulty.load(Ordering::Relaxed).max(1);
    let min_diff = state.slave_config.min_diff;
    let initial_diff = match requested_diff {
        Some(requested) => pow::clamp_initial_difficulty(requested, min_diff, network_difficulty),
        None => 2 * min_diff,
    };

    let nicehash = miner::is_nicehash(&params.agent, params.nicehash_support);
    let mut session = Session::new(
        bare_address.to_string(),
        nicehash,
        tls,
        initial_diff,
        state.slave_config.share_target_time,
    );

    let (job, jobs_rx) = if let Some(p2pool) = &state.p2pool {
        let mut rx = p2pool.subscribe();
        let first = rx.recv().await.ok_or("P2Pool upstream unavailable")?;
        session.p2pool_job_diff = Some(first.diff);
        (p2pool_to_connjob(&first), Some(rx))
    } else if nicehash {
        let (tpl, partition) = state
            .nicehash
            .allocate(&state.daemon, &state.config.pool_address)
            .await
            .map_err(|_| "template unavailable")?;
        (template_to_connjob(&tpl, Some(partition)), None)
    } else {
        let guard = state.current_template.read().await;
        let tpl = guard.as_ref().ok_or("template unavailable")?;
        (template_to_connjob(tpl, None), None)
    };

    let cap = session.upstream_cap(network_difficulty).saturating_sub(1).max(min_diff);
    session.diff = session.diff.min(cap);
    session.jobs.push(job.clone());
    Ok((session, job, jobs_rx))
}

fn template_to_connjob(tpl: &BlockTemplate, nicehash_byte: Option<u8>) -> ConnJob {
    let mut hashing_blob = hex::decode(&tpl.blockhashing_blob).unwrap_or_default();
    let mut rng = rand::thread_rng();
    let mut job_id = [0u8; 8];
    rng.fill_bytes(&mut job_id);
    if let Some(byte) = nicehash_byte {
        if hashing_blob.len() > pow::NICEHASH_BYTE_OFFSET {
            hashing_blob[pow::NICEHASH_BYTE_OFFSET] = byte;
        }
    }
    ConnJob {
        blob: hex::decode(&tpl.blocktemplate_blob).unwrap_or_default(),
        hashing_blob,
        diff: tpl.difficulty,
        job_id,
        nicehash_byte,
        height: tpl.height,
        seed_hash: tpl.seed_hash.clone(),
        block_reward: tpl.expected_reward,
    }
}

fn p2pool_to_connjob(job: &P2PoolJob) -> ConnJob {
    let hashing_blob = job.hashing_blob.clone();
    let nicehash_byte = pow::read_embedded_nicehash_byte(&hashing_blob);
    let mut rng = rand::thread_rng();
    let mut job_id = [0u8; 8];
    rng.fill_bytes(&mut job_id);
    ConnJob {
        blob: job.blob.clone(),
        hashing_blob,
        diff: job.diff,
        job_id,
        nicehash_byte,
        height: job.height,
        seed_hash: job.seed_hash.clone(),
        block_reward: 0,
    }
}

fn dispatch_p2pool_job(state: &Arc<SlaveState>, session: &mut Session, job: P2PoolJob) {
    let diff = job.diff;
    session.p2pool_job_diff = Some(diff);
    let conn_job = p2pool_to_connjob(&job);
    session.jobs.push(conn_job);
    session.apply_vardiff(state.slave_config.min_diff, u64::MAX);
}

async fn handle_submit(
    state: &Arc<SlaveState>,
    session: &mut Session,
    params: &SubmitParams,
    peer: &str,
) -> Result<(), SubmitError> {
    let (slot, job, nonce, result, share_diff) = {
        let (slot, job, nonce, result, diff) = miner::validate_submit(&session.jobs, session.nicehash, params)?;
        (slot, job.clone(), nonce, result, diff)
    };

    let network_difficulty = state.network_difficulty.load(Ordering::Relaxed).max(1);
    let needs_full_verify =
        pow::requires_full_verification(share_diff, network_difficulty, session.trust_score, state.slave_config.trust_score);

    if needs_full_verify {
        let mut full_blob = job.blob.clone();
        pow::patch_nonce(&mut full_blob, &nonce);
        match state.daemon.calc_pow(job.height, &hex::encode(&full_blob), &job.seed_hash).await {
            Ok(computed_hex) => {
                if computed_hex != hex::encode(result) {
                    session.trust_score.record_fraud();
                    return Err(SubmitError::WrongHash);
                }
            }
            Err(e) => {
                tracing::warn!("❌ calc_pow rpc failed: {}", e);
                return Err(SubmitError::InternalServerError);
            }
        }
    }
    session.trust_score.record_valid_share();

    if let Some(p2pool_diff) = session.p2pool_job_diff {
        if share_diff > p2pool_diff {
            if let Some(p2pool) = &state.p2pool {
                let mut full_blob = job.blob.clone();
                pow::patch_nonce(&mut full_blob, &nonce);
                if let Err(e) = p2pool.submit(hex::encode(&full_blob)).await {
                    tracing::warn!("❌ p2pool submit failed: {}", e);
                } else {
                    state.send_to_master(&NetMsg::P2PoolShareFound { height: job.height }).await;
                }
            }
        }
    } else if share_diff >= network_difficulty {
        let mut full_blob = job.blob.clone();
        pow::patch_nonce(&mut full_blob, &nonce);
        match state.daemon.submit_block(&hex::encode(&full_blob)).await {
            Ok(submit_result) => {
                let hash = match submit_result.block_id {
                    Some(id) if id.len() == 64 => id,
                    _ => {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        state.daemon.get_block_header_by_height(job.height).await.map(|h| h.hash).unwrap_or_default()
                    }
                };
                tracing::info!("✅ block found at height {} hash {}", job.height, hash);
                let mut hash_bytes = [0u8; 32];
                if let Ok(decoded) = hex::decode(&hash) {
                    if decoded.len() == 32 {
                        hash_bytes.copy_from_slice(&decoded);
                    }
                }
                state
                    .send_to_master(&NetMsg::BlockFound { height: job.height, reward: job.block_reward, hash: hash_bytes })
                    .await;
                state.signal_refresh();
            }
            Err(e) => tracing::warn!("❌ submit_block failed: {}", e),
        }
    }

    let mut rng = rand::thread_rng();
    let fee_roll: f32 = rng.gen_range(0.0f32..1.0f32);
    let surcharge_roll: f32 = rng.gen_range(0.0f32..1.0f32);
    let to_fee = fee_roll < (state.slave_config.slave_fee / 100.0) as f32
        || (!session.tls && surcharge_roll < crate::core::params::NON_TLS_FEE_SURCHARGE_PROBABILITY);
    let credited_wallet = if to_fee { state.config.fee_address.clone() } else { session.address.clone() };
    state.credit_share(&credited_wallet, share_diff).await;

    tracing::debug!("share from {} ({}) slot={:?} diff={}", peer, session.address, slot, share_diff);

    session.record_share_and_update_vardiff();
    let cap = session.p2pool_job_diff.unwrap_or(network_difficulty);
    session.apply_vardiff(state.slave_config.min_diff, cap);
    Ok(())
}
