//! Thin JSON-RPC-over-HTTP clients for the daemon and wallet (C11, ambient).
//!
//! Scoped per §1: these are not full Monero RPC implementations, just the
//! handful of methods the core needs (method name + params in,
//! `serde_json::Value` result out), wrapped in typed helpers at the call
//! sites that need structure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::PoolError;

const DAEMON_RPC_TIMEOUT: Duration = Duration::from_secs(15);
const WALLET_RPC_TIMEOUT: Duration = Duration::from_secs(300);
const PENDING_TX_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    id: &'a str,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

async fn call(client: &reqwest::Client, url: &str, method: &str, params: Value) -> Result<Value, PoolError> {
    let req = JsonRpcRequest { jsonrpc: "2.0", id: "0", method, params };
    let resp = client
        .post(url)
        .json(&req)
        .send()
        .await
        .map_err(|e| PoolError::Rpc(format!("{}: transport error: {}", method, e)))?;
    let body: JsonRpcResponse = resp
        .json()
        .await
        .map_err(|e| PoolError::Rpc(format!("{}: bad response body: {}", method, e)))?;
    if let Some(err) = body.error {
        return Err(PoolError::Rpc(format!("{}: rpc error {}: {}", method, err.code, err.message)));
    }
    Ok(body.result)
}

// ─── Daemon client ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GetInfo {
    pub height: u64,
    pub difficulty: u64,
    #[serde(default)]
    pub target: u64,
    #[serde(default)]
    pub hashrate: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub blocktemplate_blob: String,
    pub blockhashing_blob: String,
    pub difficulty: u64,
    pub height: u64,
    pub seed_hash: String,
    pub reserved_offset: usize,
    pub expected_reward: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: String,
    pub difficulty: u64,
    pub reward: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitBlockResult {
    /// Present on some daemons; prefer this over a follow-up header lookup
    /// when it is exactly 64 hex characters (§4.4 block-found signal).
    #[serde(default)]
    pub block_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxInfo {
    pub tx_hash: String,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default)]
    pub in_pool: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetTransactionsResult {
    #[serde(default)]
    pub txs: Vec<TxInfo>,
}

#[derive(Clone)]
pub struct DaemonClient {
    http: reqwest::Client,
    url: String,
}

impl DaemonClient {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DAEMON_RPC_TIMEOUT)
            .build()
            .expect("reqwest client builds with valid TLS config");
        DaemonClient { http, url: url.into() }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, PoolError> {
        call(&self.http, &self.url, method, params).await
    }

    pub async fn get_info(&self) -> Result<GetInfo, PoolError> {
        let v = self.call("get_info", json!({})).await?;
        serde_json::from_value(v).map_err(|e| PoolError::Rpc(format!("get_info decode: {}", e)))
    }

    pub async fn get_last_block_header(&self) -> Result<BlockHeader, PoolError> {
        let v = self.call("get_last_block_header", json!({})).await?;
        let header = v
            .get("block_header")
            .cloned()
            .ok_or_else(|| PoolError::Rpc("get_last_block_header: missing block_header".into()))?;
        serde_json::from_value(header).map_err(|e| PoolError::Rpc(format!("get_last_block_header decode: {}", e)))
    }

    pub async fn get_block_header_by_height(&self, height: u64) -> Result<BlockHeader, PoolError> {
        let v = self
            .call("get_block_header_by_height", json!({ "height": height }))
            .await?;
        let header = v
            .get("block_header")
            .cloned()
            .ok_or_else(|| PoolError::Rpc("get_block_header_by_height: missing block_header".into()))?;
        serde_json::from_value(header)
            .map_err(|e| PoolError::Rpc(format!("get_block_header_by_height decode: {}", e)))
    }

    /// Fetches a fresh block template addressed to `wallet_address`, with a
    /// random 8-byte extra-nonce reserved in the template (§4.4).
    pub async fn get_block_template(
        &self,
        wallet_address: &str,
        reserve_size: u32,
    ) -> Result<BlockTemplate, PoolError> {
        let v = self
            .call(
                "get_block_template",
                json!({ "wallet_address": wallet_address, "reserve_size": reserve_size }),
            )
            .await?;
        serde_json::from_value(v).map_err(|e| PoolError::Rpc(format!("get_block_template decode: {}", e)))
    }

    pub async fn submit_block(&self, blob_hex: &str) -> Result<SubmitBlockResult, PoolError> {
        let v = self.call("submit_block", json!([blob_hex])).await?;
        Ok(serde_json::from_value(v).unwrap_or(SubmitBlockResult { block_id: None }))
    }

    /// Asks the daemon to recompute the PoW hash for `blob_hex` at `height`
    /// (with `seed_hash`) and returns the 64-hex-char result.
    pub async fn calc_pow(&self, height: u64, blob_hex: &str, seed_hash: &str) -> Result<String, PoolError> {
        let v = self
            .call(
                "calc_pow",
                json!({ "height": height, "block_blob": blob_hex, "seed_hash": seed_hash }),
            )
            .await?;
        v.as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| PoolError::Rpc("calc_pow: non-string result".into()))
    }

    pub async fn get_height(&self) -> Result<u64, PoolError> {
        let v = self.call("get_height", json!({})).await?;
        v.get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| PoolError::Rpc("get_height: missing height".into()))
    }

    /// Queries a set of transactions by hash, used by the confirmation step
    /// with the shorter 30s verification deadline rather than the general
    /// RPC timeout.
    pub async fn get_transactions(&self, hashes: &[String]) -> Result<GetTransactionsResult, PoolError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: "0",
            method: "get_transactions",
            params: json!({ "txs_hashes": hashes, "decode_as_json": false }),
        };
        let resp = tokio::time::timeout(
            PENDING_TX_VERIFY_TIMEOUT,
            self.http.post(&self.url).json(&req).send(),
        )
        .await
        .map_err(|_| PoolError::Rpc("get_transactions: timed out".into()))?
        .map_err(|e| PoolError::Rpc(format!("get_transactions: transport error: {}", e)))?;
        let body: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| PoolError::Rpc(format!("get_transactions: bad body: {}", e)))?;
        if let Some(err) = body.error {
            return Err(PoolError::Rpc(format!("get_transactions: rpc error {}: {}", err.code, err.message)));
        }
        serde_json::from_value(body.result).map_err(|e| PoolError::Rpc(format!("get_transactions decode: {}", e)))
    }
}

// ─── Wallet client ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Transfer {
    pub amount: u64,
    pub height: u64,
    pub txid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetTransfersResult {
    #[serde(default)]
    pub r#in: Vec<Transfer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferResult {
    pub tx_hash: String,
    pub tx_key: String,
    pub amount: u64,
    pub fee: u64,
    pub tx_metadata: String,
}

#[derive(Clone)]
pub struct WalletClient {
    http: reqwest::Client,
    url: String,
}

impl WalletClient {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WALLET_RPC_TIMEOUT)
            .build()
            .expect("reqwest client builds with valid TLS config");
        WalletClient { http, url: url.into() }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, PoolError> {
        call(&self.http, &self.url, method, params).await
    }

    pub async fn get_address_index(&self, address: &str) -> Result<u32, PoolError> {
        let v = self.call("get_address_index", json!({ "address": address })).await?;
        v.get("index")
            .and_then(|i| i.get("minor"))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .ok_or_else(|| PoolError::Rpc("get_address_index: missing index".into()))
    }

    /// Incoming transfers since `min_height`, used by the pending-balance
    /// scan with the 720-block lookback buffer applied by the caller.
    pub async fn get_transfers(&self, min_height: u64) -> Result<GetTransfersResult, PoolError> {
        let v = self
            .call("get_transfers", json!({ "in": true, "filter_by_height": true, "min_height": min_height }))
            .await?;
        serde_json::from_value(v).map_err(|e| PoolError::Rpc(format!("get_transfers decode: {}", e)))
    }

    /// Batched withdrawal transfer. `do_not_relay=true` so the payout
    /// engine can mutate balances before committing the tx to the network
    /// (§4.8).
    pub async fn transfer(&self, destinations: &[(String, u64)]) -> Result<TransferResult, PoolError> {
        let dests: Vec<Value> = destinations
            .iter()
            .map(|(addr, amt)| json!({ "address": addr, "amount": amt }))
            .collect();
        let v = self
            .call(
                "transfer",
                json!({
                    "destinations": dests,
                    "get_tx_metadata": true,
                    "do_not_relay": true,
                }),
            )
            .await?;
        serde_json::from_value(v).map_err(|e| PoolError::Rpc(format!("transfer decode: {}", e)))
    }

    pub async fn relay_tx(&self, tx_metadata: &str) -> Result<String, PoolError> {
        let v = self.call("relay_tx", json!({ "hex": tx_metadata })).await?;
        v.get("tx_hash")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| PoolError::Rpc("relay_tx: missing tx_hash".into()))
    }
}
