//! Inter-node message protocol (C1 wire framing + C4.3 payload tags).
//!
//! Every message crosses the wire as two independently sealed records: a
//! 2-byte little-endian length, then that many plaintext payload bytes.
//! Both records go through [`crate::crypto::seal`]/[`crate::crypto::open`]
//! with the master pre-shared key, so a frame on the wire is
//! `seal(len) || seal(payload)`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{self, SEAL_OVERHEAD};
use crate::error::PoolError;
use crate::serializer::{Decoder, Encoder};

pub const TAG_SHARE_BATCH: u8 = 0;
pub const TAG_BLOCK_FOUND: u8 = 1;
pub const TAG_WORKER_COUNT: u8 = 2;
pub const TAG_P2POOL_SHARE_FOUND: u8 = 3;

/// Maximum plaintext payload length, bounded by the 2-byte length prefix.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq)]
pub enum NetMsg {
    /// slave -> master: aggregated shares for one address since the last flush.
    ShareBatch { count: u64, wallet: String, diff: u64 },
    /// slave -> master: a network block was found and submitted.
    BlockFound { height: u64, reward: u64, hash: [u8; 32] },
    /// slave -> master: current connected-miner count for this slave.
    WorkerCount { count: u64 },
    /// slave -> master: a P2Pool parent share was found and submitted.
    P2PoolShareFound { height: u64 },
}

impl NetMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        match self {
            NetMsg::ShareBatch { count, wallet, diff } => {
                e.put_u8(TAG_SHARE_BATCH);
                e.put_uvarint(*count);
                e.put_string(wallet);
                e.put_uvarint(*diff);
            }
            NetMsg::BlockFound { height, reward, hash } => {
                e.put_u8(TAG_BLOCK_FOUND);
                e.put_uvarint(*height);
                e.put_uvarint(*reward);
                e.put_fixed_bytes(hash, 32);
            }
            NetMsg::WorkerCount { count } => {
                e.put_u8(TAG_WORKER_COUNT);
                e.put_uvarint(*count);
            }
            NetMsg::P2PoolShareFound { height } => {
                e.put_u8(TAG_P2POOL_SHARE_FOUND);
                e.put_uvarint(*height);
            }
        }
        e.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PoolError> {
        let mut d = Decoder::new(data);
        let tag = d.read_u8();
        let msg = match tag {
            TAG_SHARE_BATCH => {
                let count = d.read_uvarint();
                let wallet = d.read_string();
                let diff = d.read_uvarint();
                NetMsg::ShareBatch { count, wallet, diff }
            }
            TAG_BLOCK_FOUND => {
                let height = d.read_uvarint();
                let reward = d.read_uvarint();
                let hash_v = d.read_fixed_bytes(32);
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&hash_v);
                NetMsg::BlockFound { height, reward, hash }
            }
            TAG_WORKER_COUNT => {
                let count = d.read_uvarint();
                NetMsg::WorkerCount { count }
            }
            TAG_P2POOL_SHARE_FOUND => {
                let height = d.read_uvarint();
                NetMsg::P2PoolShareFound { height }
            }
            other => return Err(PoolError::Protocol(format!("unknown frame tag {}", other))),
        };
        d.finish()?;
        Ok(msg)
    }
}

/// Writes one sealed frame: `seal(len_le_u16) || seal(payload)`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    key: &[u8; 32],
    msg: &NetMsg,
) -> Result<(), PoolError> {
    let payload = msg.encode();
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(PoolError::Protocol("frame payload too large".into()));
    }
    let len_bytes = (payload.len() as u16).to_le_bytes();
    let sealed_len = crypto::seal(key, &len_bytes);
    w.write_all(&sealed_len).await?;
    let sealed_payload = crypto::seal(key, &payload);
    w.write_all(&sealed_payload).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one sealed frame. Any decryption failure or I/O error is returned
/// as-is; the caller closes the connection without retry (§4.1).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, key: &[u8; 32]) -> Result<NetMsg, PoolError> {
    let mut len_record = [0u8; 2 + SEAL_OVERHEAD];
    r.read_exact(&mut len_record).await?;
    let len_plain = crypto::open(key, &len_record)?;
    if len_plain.len() != 2 {
        return Err(PoolError::Protocol("decrypted length record has wrong size".into()));
    }
    let len = u16::from_le_bytes([len_plain[0], len_plain[1]]) as usize;

    let mut payload_record = vec![0u8; len + SEAL_OVERHEAD];
    r.read_exact(&mut payload_record).await?;
    let payload_plain = crypto::open(key, &payload_record)?;

    NetMsg::decode(&payload_plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_all_variants() {
        let key = crypto::derive_master_key("test-secret");
        let msgs = vec![
            NetMsg::ShareBatch { count: 7, wallet: "44Ab...".into(), diff: 123_456 },
            NetMsg::BlockFound { height: 900_000, reward: 600_000_000_000, hash: [9u8; 32] },
            NetMsg::WorkerCount { count: 42 },
            NetMsg::P2PoolShareFound { height: 123 },
        ];
        for msg in msgs {
            let mut buf = Vec::new();
            write_frame(&mut buf, &key, &msg).await.unwrap();
            let mut cursor = std::io::Cursor::new(buf);
            let decoded = read_frame(&mut cursor, &key).await.unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[tokio::test]
    async fn tampered_length_record_fails() {
        let key = crypto::derive_master_key("test-secret");
        let msg = NetMsg::WorkerCount { count: 1 };
        let mut buf = Vec::new();
        write_frame(&mut buf, &key, &msg).await.unwrap();
        buf[0] ^= 0xFF;
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor, &key).await.is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut e = Encoder::new();
        e.put_u8(99);
        assert!(NetMsg::decode(&e.into_bytes()).is_err());
    }
}
