//! P2Pool outbound client (C3): a JSON-RPC-over-line-delimited-JSON session
//! to a local P2Pool daemon, reconnecting under an explicit state machine.
//!
//! Login uses a fixed identity — P2Pool proxying never forwards the miner's
//! own login (§4.5).

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

use crate::error::PoolError;

const SUBMIT_ID: u64 = 541;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const GIVE_UP_AFTER: Duration = Duration::from_secs(25);
const JOB_IDLE_DEADLINE: Duration = Duration::from_secs(3600);
const SUBMIT_DEADLINE: Duration = Duration::from_secs(60);
const JOB_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Receiving,
    Backoff,
    Dead,
}

/// One job forwarded from the P2Pool parent.
#[derive(Debug, Clone)]
pub struct P2PoolJob {
    pub blob: Vec<u8>,
    pub hashing_blob: Vec<u8>,
    pub diff: u64,
    pub height: u64,
    pub seed_hash: String,
}

#[derive(Debug, Deserialize)]
struct P2PoolJobPayload {
    blob: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    height: u64,
    #[serde(default)]
    seed_hash: String,
}

#[derive(Debug, Deserialize)]
struct P2PoolEnvelope {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Long-lived outbound connection to a P2Pool daemon, shared across every
/// Stratum session currently in P2Pool mode.
pub struct P2PoolClient {
    address: String,
    state: Mutex<ClientState>,
    job_tx: broadcast::Sender<P2PoolJob>,
    writer: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    last_job_at: Mutex<Instant>,
    pending_submit: Mutex<Option<mpsc::Sender<Result<(), PoolError>>>>,
}

impl P2PoolClient {
    pub fn new(address: String) -> Self {
        let (job_tx, _) = broadcast::channel(JOB_CHANNEL_CAPACITY);
        P2PoolClient {
            address,
            state: Mutex::new(ClientState::Connecting),
            job_tx,
            writer: Mutex::new(None),
            last_job_at: Mutex::new(Instant::now()),
            pending_submit: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<P2PoolJob> {
        let mut broadcast_rx = self.job_tx.subscribe();
        let (tx, rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Ok(job) = broadcast_rx.recv().await {
                if tx.send(job).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            self.run_loop().await;
        });
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            *self.state.lock().await = ClientState::Connecting;
            match self.connect_and_receive().await {
                Ok(()) => {}
                Err(e) => tracing::warn!("🌐 p2pool session ended: {}", e),
            }

            *self.state.lock().await = ClientState::Backoff;
            let backoff_start = Instant::now();
            loop {
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                let elapsed_since_job = self.last_job_at.lock().await.elapsed();
                if elapsed_since_job > GIVE_UP_AFTER {
                    *self.state.lock().await = ClientState::Dead;
                    tracing::error!("❌ p2pool upstream dead, no job for {:?}", elapsed_since_job);
                    return;
                }
                if backoff_start.elapsed() >= RECONNECT_BACKOFF {
                    break;
                }
            }
        }
    }

    async fn connect_and_receive(&self) -> Result<(), PoolError> {
        let stream = TcpStream::connect(&self.address).await?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let login = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "login",
            "params": { "login": "x", "pass": "x", "rigid": "myrigid", "agent": "XMRig/6.21.0" },
        });
        self.write_line(&login).await?;

        *self.state.lock().await = ClientState::Receiving;
        *self.last_job_at.lock().await = Instant::now();

        let mut reader = BufReader::new(read_half);
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(JOB_IDLE_DEADLINE, reader.read_line(&mut line))
                .await
                .map_err(|_| PoolError::Protocol("p2pool read idle timeout".into()))??;
            if read == 0 {
                return Err(PoolError::Protocol("p2pool connection closed".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let envelope: P2PoolEnvelope = serde_json::from_str(trimmed)
                .map_err(|e| PoolError::Protocol(format!("p2pool oversized or malformed line: {}", e)))?;

            if let Some(warning) = envelope.result.as_ref().and_then(|r| r.get("warning")) {
                tracing::warn!("🌐 p2pool login warning: {}", warning);
            }

            if envelope.id == json!(SUBMIT_ID) {
                let ok = envelope.error.is_none();
                if let Some(tx) = self.pending_submit.lock().await.take() {
                    let _ = tx
                        .send(if ok { Ok(()) } else { Err(PoolError::Rpc(format!("{:?}", envelope.error))) })
                        .await;
                }
                continue;
            }

            if envelope.method.as_deref() == Some("job") {
                if let Ok(payload) = serde_json::from_value::<P2PoolJobPayload>(envelope.params) {
                    if let Some(job) = self.parse_job(payload) {
                        *self.last_job_at.lock().await = Instant::now();
                        let _ = self.job_tx.send(job);
                    }
                }
                continue;
            }

            if let Some(result) = envelope.result {
                if let Ok(payload) = serde_json::from_value::<P2PoolJobPayload>(result.get("job").cloned().unwrap_or(Value::Null))
                {
                    if let Some(job) = self.parse_job(payload) {
                        *self.last_job_at.lock().await = Instant::now();
                        let _ = self.job_tx.send(job);
                    }
                }
            }
        }
    }

    fn parse_job(&self, payload: P2PoolJobPayload) -> Option<P2PoolJob> {
        let hashing_blob = hex::decode(&payload.blob).ok()?;
        let diff = if payload.target.len() == 8 {
            let bytes = hex::decode(&payload.target).ok()?;
            let mut full = [0u8; 8];
            full[4..8].copy_from_slice(&bytes);
            let short = u32::from_le_bytes(bytes.try_into().ok()?);
            if short == 0 { u64::MAX } else { u64::MAX / short as u64 }
        } else {
            1
        };
        Some(P2PoolJob {
            blob: hashing_blob.clone(),
            hashing_blob,
            diff,
            height: payload.height,
            seed_hash: payload.seed_hash,
        })
    }

    async fn write_line(&self, v: &Value) -> Result<(), PoolError> {
        let mut guard = self.writer.lock().await;
        let Some(w) = guard.as_mut() else {
            return Err(PoolError::Protocol("p2pool writer not connected".into()));
        };
        let mut line = serde_json::to_vec(v).map_err(|e| PoolError::Protocol(e.to_string()))?;
        line.push(b'\n');
        w.write_all(&line).await?;
        w.flush().await?;
        Ok(())
    }

    /// Submits a found parent share. Exactly one outstanding submit at a
    /// time, correlated by the fixed JSON-RPC id 541, with a 60s deadline.
    pub async fn submit(&self, blob_hex: String) -> Result<(), PoolError> {
        let (tx, mut rx) = mpsc::channel(1);
        *self.pending_submit.lock().await = Some(tx);

        let req = json!({
            "jsonrpc": "2.0",
            "id": SUBMIT_ID,
            "method": "submit",
            "params": { "id": "x", "job_id": "x", "nonce": "00000000", "result": blob_hex },
        });
        self.write_line(&req).await?;

        tokio::time::timeout(SUBMIT_DEADLINE, rx.recv())
            .await
            .map_err(|_| PoolError::Protocol("p2pool submit timed out".into()))?
            .ok_or_else(|| PoolError::Protocol("p2pool submit channel closed".into()))?
    }

    pub async fn state(&self) -> ClientState {
        self.state.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_state_transitions_are_distinct() {
        assert_ne!(ClientState::Connecting, ClientState::Dead);
        assert_eq!(ClientState::Backoff, ClientState::Backoff);
    }
}
