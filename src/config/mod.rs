//! Configuration loading and bootstrap (C11, ambient).
//!
//! A single `config.json`, loaded once at process start. Missing config
//! writes a blank template and the process terminates rather than
//! panicking silently — the operator fills it in and restarts.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ED25519};
use serde::{Deserialize, Serialize};

use crate::error::PoolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumEndpoint {
    pub address: String,
    pub description: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub listen_address: String,
    pub wallet_rpc: String,
    pub fee_percent: f64,
    pub api_port: u16,
    pub withdrawal_fee: u64,
    pub min_withdrawal: u64,
    pub withdrawal_interval_minutes: u64,
    #[serde(default)]
    pub stratums: Vec<StratumEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    pub master_address: String,
    pub min_diff: u64,
    pub share_target_time: u64,
    pub trust_score: i32,
    pub pool_port: u16,
    pub pool_port_tls: u16,
    pub template_timeout: u64,
    pub slave_fee: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_level: u8,
    pub daemon_rpc: String,
    #[serde(default = "default_atomic")]
    pub atomic: u32,
    pub min_confs: u64,
    pub addr_prefix: Vec<u8>,
    pub subaddr_prefix: Vec<u8>,
    pub pool_address: String,
    pub fee_address: String,
    #[serde(default)]
    pub use_p2pool: bool,
    #[serde(default)]
    pub p2pool_address: String,
    pub master_pass: String,
    pub algo_name: String,
    #[serde(default)]
    pub master_config: Option<MasterConfig>,
    #[serde(default)]
    pub slave_config: Option<SlaveConfig>,
}

fn default_atomic() -> u32 {
    12
}

const BLANK_TEMPLATE: &str = r#"{
  "log_level": 0,
  "daemon_rpc": "http://127.0.0.1:18081/json_rpc",
  "atomic": 12,
  "min_confs": 10,
  "addr_prefix": [18],
  "subaddr_prefix": [42],
  "pool_address": "",
  "fee_address": "",
  "use_p2pool": false,
  "p2pool_address": "127.0.0.1:3333",
  "master_pass": "change-me",
  "algo_name": "rx/0",
  "master_config": {
    "listen_address": "0.0.0.0:4242",
    "wallet_rpc": "http://127.0.0.1:18082/json_rpc",
    "fee_percent": 1.0,
    "api_port": 8080,
    "withdrawal_fee": 10000000,
    "min_withdrawal": 100000000000,
    "withdrawal_interval_minutes": 60,
    "stratums": []
  },
  "slave_config": {
    "master_address": "127.0.0.1:4242",
    "min_diff": 1000,
    "share_target_time": 10,
    "trust_score": 5,
    "pool_port": 3333,
    "pool_port_tls": 3334,
    "template_timeout": 60,
    "slave_fee": 1.0
  }
}
"#;

/// Loads `config.json` from `dir`, falling back to `../config.json`. If
/// neither exists, writes a blank template to `dir/config.json` and returns
/// an error describing what happened — the caller logs it as fatal and
/// exits.
pub fn load(dir: &Path) -> Result<Config, PoolError> {
    let primary = dir.join("config.json");
    let fallback = dir.join("..").join("config.json");

    let path = if primary.exists() {
        primary.clone()
    } else if fallback.exists() {
        fallback
    } else {
        fs::write(&primary, BLANK_TEMPLATE)
            .map_err(|e| PoolError::Io(e))?;
        return Err(PoolError::Protocol(format!(
            "no config.json found; wrote a blank template to {} — fill it in and restart",
            primary.display()
        )));
    };

    let raw = fs::read_to_string(&path)?;
    serde_json::from_str(&raw).map_err(|e| PoolError::Protocol(format!("config.json: {}", e)))
}

pub fn master_config(cfg: &Config) -> Result<&MasterConfig, PoolError> {
    cfg.master_config
        .as_ref()
        .ok_or_else(|| PoolError::Protocol("config.json missing master_config".into()))
}

pub fn slave_config(cfg: &Config) -> Result<&SlaveConfig, PoolError> {
    cfg.slave_config
        .as_ref()
        .ok_or_else(|| PoolError::Protocol("config.json missing slave_config".into()))
}

/// Directives fed to `tracing_subscriber::EnvFilter`, mapped from the
/// configured `log_level`: 0=info/warn/error, 1=+debug/net, 2=+dev/netdev.
pub fn log_filter_directives(log_level: u8) -> &'static str {
    match log_level {
        0 => "info",
        1 => "info,equiforge_pool=debug",
        _ => "trace",
    }
}

/// Loads `cert.pem`/`key.pem` from `dir` if present, otherwise generates a
/// self-signed Ed25519 certificate valid for 15 years and persists both
/// files.
pub fn load_or_generate_tls(dir: &Path) -> Result<(Vec<u8>, Vec<u8>), PoolError> {
    let cert_path: PathBuf = dir.join("cert.pem");
    let key_path: PathBuf = dir.join("key.pem");

    if cert_path.exists() && key_path.exists() {
        let cert = fs::read(&cert_path)?;
        let key = fs::read(&key_path)?;
        return Ok((cert, key));
    }

    let key_pair = KeyPair::generate(&PKCS_ED25519)
        .map_err(|e| PoolError::Crypto(format!("tls keypair generation: {}", e)))?;

    let mut params = CertificateParams::new(Vec::new())
        .map_err(|e| PoolError::Crypto(format!("tls cert params: {}", e)))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "mining pool");
    params.distinguished_name = dn;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(15 * 365);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| PoolError::Crypto(format!("tls self-sign: {}", e)))?;

    let cert_pem = cert.pem().into_bytes();
    let key_pem = key_pair.serialize_pem().into_bytes();

    fs::write(&cert_path, &cert_pem)?;
    fs::write(&key_path, &key_pem)?;

    Ok((cert_pem, key_pem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_template_parses() {
        let cfg: Config = serde_json::from_str(BLANK_TEMPLATE).unwrap();
        assert_eq!(cfg.log_level, 0);
        assert!(cfg.master_config.is_some());
        assert!(cfg.slave_config.is_some());
    }

    #[test]
    fn log_filter_mapping() {
        assert_eq!(log_filter_directives(0), "info");
        assert_eq!(log_filter_directives(2), "trace");
    }
}
