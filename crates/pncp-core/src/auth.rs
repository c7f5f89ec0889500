//! Challenge-response authentication primitives shared by controller and
//! agent.
//!
//! The MAC input is the exact byte string
//! `hex(nonce) 0x0A decimal(issued_at) 0x0A agent_id`, and the MAC itself is
//! HMAC-SHA256 over that input with the shared secret, hex lowercase. Agent
//! ids are restricted to `[A-Za-z0-9._-]` so the newline delimiter cannot
//! appear inside a field.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 16;
pub const MAX_AGENT_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("mac mismatch")]
    MacMismatch,
    #[error("mac is not valid hex")]
    InvalidMac,
    #[error("challenge timestamp outside replay window: skew {skew}s, window {window}s")]
    StaleTimestamp { skew: i64, window: i64 },
    #[error("agent id not in roster: {0}")]
    UnknownAgent(String),
    #[error("malformed agent id: {0}")]
    InvalidAgentId(String),
    #[error("expected auth_response, got {0}")]
    UnexpectedMessage(&'static str),
}

/// Fresh random nonce, hex lowercase.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn mac_input(nonce: &str, issued_at: i64, agent_id: &str) -> Vec<u8> {
    format!("{nonce}\n{issued_at}\n{agent_id}").into_bytes()
}

/// Compute the response MAC for a challenge, hex lowercase.
pub fn sign(secret: &[u8], nonce: &str, issued_at: i64, agent_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&mac_input(nonce, issued_at, agent_id));
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a claimed response MAC.
pub fn verify(
    secret: &[u8],
    nonce: &str,
    issued_at: i64,
    agent_id: &str,
    claimed_mac: &str,
) -> Result<(), AuthError> {
    let claimed = hex::decode(claimed_mac).map_err(|_| AuthError::InvalidMac)?;
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&mac_input(nonce, issued_at, agent_id));
    mac.verify_slice(&claimed).map_err(|_| AuthError::MacMismatch)
}

/// Agent ids are 1..=64 chars of `[A-Za-z0-9._-]`.
pub fn validate_agent_id(agent_id: &str) -> Result<(), AuthError> {
    if agent_id.is_empty() || agent_id.len() > MAX_AGENT_ID_LEN {
        return Err(AuthError::InvalidAgentId(agent_id.to_string()));
    }
    if !agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(AuthError::InvalidAgentId(agent_id.to_string()));
    }
    Ok(())
}

/// Rejects a challenge timestamp whose skew from `now` exceeds the window.
pub fn check_replay_window(issued_at: i64, now: i64, window_secs: i64) -> Result<(), AuthError> {
    let skew = (now - issued_at).abs();
    if skew > window_secs {
        return Err(AuthError::StaleTimestamp {
            skew,
            window: window_secs,
        });
    }
    Ok(())
}
