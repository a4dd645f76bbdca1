//! Stratum session protocol (C4): JSON-RPC message shapes, per-connection
//! job state, and the pure logic that drives login/submit/keepalive —
//! vardiff, NiceHash nonce checks, share-difficulty computation. The
//! accept loops, daemon polling, and frame forwarding that wire this to
//! the rest of the slave live in [`crate::pool`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::params::{clamp_delta_t, smooth_vardiff, vardiff_proposal};
use crate::crypto::{diff_to_short_target, hash_to_diff};
use crate::pow::{self, TrustScore};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

// ─── JSON-RPC request/response shapes ──────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    pub login: String,
    #[serde(default = "default_pass")]
    pub pass: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default)]
    pub algo: Option<String>,
    #[serde(default)]
    pub nicehash_support: bool,
}

fn default_pass() -> String {
    "x".to_string()
}

fn default_agent() -> String {
    "No agent specified".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SubmitParams {
    pub id: String,
    pub job_id: String,
    pub nonce: String,
    pub result: String,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        RpcError { code: -1, message: message.into() }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        RpcResponse { id, jsonrpc: "2.0", result: Some(result), error: None }
    }

    pub fn err(id: Value, message: impl Into<String>) -> Self {
        RpcResponse { id, jsonrpc: "2.0", result: None, error: Some(RpcError::new(message)) }
    }
}

/// Parses the login's `addr[+N]` suffix, returning the bare address and an
/// optional requested starting difficulty.
pub fn parse_login_address(login: &str) -> (&str, Option<u64>) {
    match login.split_once('+') {
        Some((addr, diff)) => match diff.parse::<u64>() {
            Ok(d) => (addr, Some(d)),
            Err(_) => (login, None),
        },
        None => (login, None),
    }
}

/// Whether this agent string or explicit flag puts the connection in
/// NiceHash mode (agent's first 5 chars are "XMRig", per §4.4).
pub fn is_nicehash(agent: &str, nicehash_support_flag: bool) -> bool {
    nicehash_support_flag || agent.get(0..5).map(|s| s.eq_ignore_ascii_case("XMRig")).unwrap_or(false)
}

// ─── Per-connection job state ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnJob {
    pub blob: Vec<u8>,
    pub hashing_blob: Vec<u8>,
    pub diff: u64,
    pub job_id: [u8; 8],
    pub nicehash_byte: Option<u8>,
    pub height: u64,
    pub seed_hash: String,
    pub block_reward: u64,
}

impl ConnJob {
    pub fn job_id_hex(&self) -> String {
        hex::encode(self.job_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSlot {
    Current,
    Last,
}

#[derive(Debug, Default)]
pub struct SessionJobs {
    pub current: Option<ConnJob>,
    pub last: Option<ConnJob>,
}

impl SessionJobs {
    /// Pushes a new job into `current`, demoting the prior current into
    /// `last` (which accepts exactly one more submission, per §4.4).
    pub fn push(&mut self, job: ConnJob) {
        self.last = self.current.take();
        self.current = Some(job);
    }

    pub fn find(&self, job_id_hex: &str) -> Option<(JobSlot, &ConnJob)> {
        if let Some(j) = &self.current {
            if j.job_id_hex() == job_id_hex {
                return Some((JobSlot::Current, j));
            }
        }
        if let Some(j) = &self.last {
            if j.job_id_hex() == job_id_hex {
                return Some((JobSlot::Last, j));
            }
        }
        None
    }
}

/// Mutable per-connection protocol state carried across the session's
/// lifetime.
pub struct Session {
    pub address: String,
    pub nicehash: bool,
    pub tls: bool,
    pub trust_score: TrustScore,
    pub jobs: SessionJobs,
    pub diff: u64,
    pub next_diff: f64,
    pub last_share_at_ms: Option<u64>,
    pub target_share_time_s: u64,
    pub p2pool_job_diff: Option<u64>,
}

impl Session {
    pub fn new(address: String, nicehash: bool, tls: bool, initial_diff: u64, target_share_time_s: u64) -> Self {
        Session {
            address,
            nicehash,
            tls,
            trust_score: TrustScore::default(),
            jobs: SessionJobs::default(),
            diff: initial_diff,
            next_diff: initial_diff as f64,
            last_share_at_ms: None,
            target_share_time_s,
            p2pool_job_diff: None,
        }
    }

    /// Upstream difficulty ceiling: network difficulty when solo, or the
    /// P2Pool parent job's difficulty when proxying. Callers subtract the
    /// one-below-cap margin themselves (§4.4).
    pub fn upstream_cap(&self, network_difficulty: u64) -> u64 {
        match self.p2pool_job_diff {
            Some(d) => d,
            None => network_difficulty,
        }
    }

    /// Builds the short-target-bearing job notification payload for the
    /// connection's current job and difficulty.
    pub fn job_notification(&self, algo_name: &str) -> Option<Value> {
        let job = self.jobs.current.as_ref()?;
        let short_target = diff_to_short_target(self.diff);
        Some(serde_json::json!({
            "job_id": job.job_id_hex(),
            "blob": hex::encode(&job.hashing_blob),
            "target": hex::encode(short_target),
            "algo": algo_name,
            "height": job.height,
        }))
    }

    /// Records an accepted share's timing and proposes the next vardiff
    /// value (§4.4 "Vardiff").
    pub fn record_share_and_update_vardiff(&mut self) {
        let now = now_ms();
        if let Some(prev) = self.last_share_at_ms {
            let raw_delta = now.saturating_sub(prev);
            let delta = clamp_delta_t(raw_delta.max(1), self.target_share_time_s);
            let proposal = vardiff_proposal(self.diff, delta, self.target_share_time_s);
            self.next_diff = smooth_vardiff(proposal, self.next_diff);
        }
        self.last_share_at_ms = Some(now);
    }

    /// Clamps the smoothed vardiff proposal into bounds and applies it as
    /// the difficulty for the next dispatched job.
    pub fn apply_vardiff(&mut self, min_diff: u64, network_difficulty: u64) {
        let cap = self.upstream_cap(network_difficulty).saturating_sub(1).max(min_diff);
        let clamped = self.next_diff.clamp(min_diff as f64, cap as f64);
        self.diff = clamped as u64;
    }
}

// ─── Submit validation ──────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SubmitError {
    Malformed,
    WrongJobId,
    WrongNicehashNonce,
    HashDoesNotMeetDiff,
    WrongHash,
    InternalServerError,
}

impl SubmitError {
    pub fn message(&self) -> &'static str {
        match self {
            SubmitError::Malformed => "malformed share",
            SubmitError::WrongJobId => "wrong job id",
            SubmitError::WrongNicehashNonce => "wrong nicehash nonce",
            SubmitError::HashDoesNotMeetDiff => "hash does not meet diff",
            SubmitError::WrongHash => "wrong hash",
            SubmitError::InternalServerError => "internal server error",
        }
    }
}

/// Parses and validates the wire format of a submit request: 8-hex-char
/// nonce, 64-hex-char result hash.
pub fn parse_submit(params: &SubmitParams) -> Result<([u8; 4], [u8; 32]), SubmitError> {
    if params.nonce.len() != 8 || params.result.len() != 64 {
        return Err(SubmitError::Malformed);
    }
    let nonce_v = hex::decode(&params.nonce).map_err(|_| SubmitError::Malformed)?;
    let result_v = hex::decode(&params.result).map_err(|_| SubmitError::Malformed)?;
    let mut nonce = [0u8; 4];
    nonce.copy_from_slice(&nonce_v);
    let mut result = [0u8; 32];
    result.copy_from_slice(&result_v);
    Ok((nonce, result))
}

/// Checks the NiceHash partition byte, if the job reserved one.
pub fn check_nicehash_nonce(nicehash: bool, job_nicehash_byte: Option<u8>, nonce: &[u8; 4]) -> Result<(), SubmitError> {
    if nicehash {
        if let Some(byte) = job_nicehash_byte {
            if byte != 0 && nonce[3] != byte {
                return Err(SubmitError::WrongNicehashNonce);
            }
        }
    }
    Ok(())
}

pub fn share_difficulty(result_hash: &[u8; 32]) -> u64 {
    hash_to_diff(result_hash)
}

/// Full decision pipeline for one submit: format, job lookup, nicehash
/// check, and difficulty check. Does not perform the probabilistic full
/// verification or share routing — those need daemon/network access and
/// live in the pool coordinator.
pub fn validate_submit<'a>(
    jobs: &'a SessionJobs,
    nicehash: bool,
    params: &SubmitParams,
) -> Result<(JobSlot, &'a ConnJob, [u8; 4], [u8; 32], u64), SubmitError> {
    let (nonce, result) = parse_submit(params)?;
    let (slot, job) = jobs.find(&params.job_id).ok_or(SubmitError::WrongJobId)?;
    check_nicehash_nonce(nicehash, job.nicehash_byte, &nonce)?;
    let diff = share_difficulty(&result);
    if diff < job.diff {
        return Err(SubmitError::HashDoesNotMeetDiff);
    }
    Ok((slot, job, nonce, result, diff))
}

pub use pow::{clamp_initial_difficulty, requires_full_verification};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_login_address_with_suffix() {
        assert_eq!(parse_login_address("44Ab+5000"), ("44Ab", Some(5000)));
        assert_eq!(parse_login_address("44Ab"), ("44Ab", None));
        assert_eq!(parse_login_address("44Ab+notanumber"), ("44Ab+notanumber", None));
    }

    #[test]
    fn nicehash_detection_by_agent_prefix() {
        assert!(is_nicehash("XMRig/6.20.0", false));
        assert!(is_nicehash("anything", true));
        assert!(!is_nicehash("cpuminer/2.5.1", false));
    }

    #[test]
    fn job_transition_keeps_last_slot_for_one_submission() {
        let mut jobs = SessionJobs::default();
        let job_a = ConnJob {
            blob: vec![],
            hashing_blob: vec![],
            diff: 1000,
            job_id: [1; 8],
            nicehash_byte: None,
            height: 1,
            seed_hash: "".into(),
            block_reward: 0,
        };
        let mut job_b = job_a.clone();
        job_b.job_id = [2; 8];

        jobs.push(job_a.clone());
        jobs.push(job_b.clone());

        assert!(jobs.find(&job_b.job_id_hex()).is_some());
        assert!(jobs.find(&job_a.job_id_hex()).is_some());
        assert!(jobs.find("deadbeefdeadbeef").is_none());
    }

    #[test]
    fn nicehash_nonce_rejected_on_mismatch() {
        let nonce = [0u8, 0, 0, 7];
        assert_eq!(check_nicehash_nonce(true, Some(9), &nonce), Err(SubmitError::WrongNicehashNonce));
        assert_eq!(check_nicehash_nonce(true, Some(7), &nonce), Ok(()));
        assert_eq!(check_nicehash_nonce(true, None, &nonce), Ok(()));
        assert_eq!(check_nicehash_nonce(false, Some(9), &nonce), Ok(()));
    }

    #[test]
    fn vardiff_converges_toward_target_over_many_shares() {
        let mut session = Session::new("addr".into(), false, false, 1000, 10);
        for _ in 0..500 {
            session.record_share_and_update_vardiff();
            session.apply_vardiff(100, 10_000_000);
            std::thread::sleep(std::time::Duration::from_millis(0));
        }
        // With no real elapsed time between calls the delta clamps to the
        // minimum, but the smoothing loop must still stay within bounds.
        assert!(session.diff >= 100);
    }

    #[test]
    fn submit_malformed_wrong_length() {
        let params = SubmitParams { id: "0".into(), job_id: "aa".into(), nonce: "short".into(), result: "x".repeat(64) };
        assert_eq!(parse_submit(&params), Err(SubmitError::Malformed));
    }
}
