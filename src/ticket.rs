//! Short-lived tickets bound to a user and a client IP.
//!
//! A ticket is `nonce;user;ip;expiry&hash`, encrypted with ChaCha20-Poly1305
//! under a key that lives only as long as the process. Tickets issued before a
//! restart can no longer be examined.

use crate::error::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

const NONCE_LEN: usize = 12;

/// 默认有效期：7 天
pub const DEFAULT_TICKET_VALIDITY: u64 = 7 * 24 * 3600;

/// 解开后的票据内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketInfo {
    pub user: String,
    pub ip: String,
    pub valid_until: u64,
    pub nonce: String,
}

pub struct TicketCodec {
    cipher: ChaCha20Poly1305,
    hash_key: [u8; 32],
}

impl Default for TicketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketCodec {
    /// 生成进程内随机密钥
    pub fn new() -> Self {
        let key: [u8; 32] = rand::random();
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            hash_key: rand::random(),
        }
    }

    /// 签发票据
    pub fn issue(&self, user: &str, ip: &str, validity_secs: u64) -> Result<String> {
        let nonce_tag: [u8; 16] = rand::random();
        let data = format!(
            "{};{};{};{}",
            hex::encode(nonce_tag),
            user,
            ip,
            unix_now().saturating_add(validity_secs)
        );
        let plain = format!("{}&{}", data, self.keyed_hash(&data));

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plain.as_bytes())
            .map_err(|_| anyhow::anyhow!("Failed to seal ticket"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// 检查票据；解码、完整性或过期任一失败都返回 None
    pub fn examine(&self, ticket: &str) -> Option<TicketInfo> {
        self.examine_at(ticket, unix_now())
    }

    fn examine_at(&self, ticket: &str, now: u64) -> Option<TicketInfo> {
        let raw = STANDARD.decode(ticket.trim()).ok()?;
        if raw.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self.cipher.decrypt(Nonce::from_slice(nonce), sealed).ok()?;
        let plain = String::from_utf8(plain).ok()?;

        let (data, hash) = plain.split_once('&')?;
        if !bool::from(hash.as_bytes().ct_eq(self.keyed_hash(data).as_bytes())) {
            return None;
        }

        let parts: Vec<&str> = data.split(';').collect();
        let [nonce, user, ip, valid] = parts.as_slice() else {
            return None;
        };
        let valid_until: u64 = valid.parse().ok()?;
        if valid_until < now {
            return None;
        }

        Some(TicketInfo {
            user: user.to_string(),
            ip: ip.to_string(),
            valid_until,
            nonce: nonce.to_string(),
        })
    }

    fn keyed_hash(&self, data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hash_key);
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
