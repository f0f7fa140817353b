#![allow(missing_docs)]
//! Stateless HMAC cookies and session-key derivation.
//!
//! The server never stores a challenge: the cookie it hands out is
//! `HMAC-SHA256(secret, ip(16) || nonce(1) || timestamp_be(8))`, so any
//! echoed cookie can be re-verified from the peer's address and the recent
//! clock alone. Verification walks the accepted time window and compares in
//! constant time, which keeps replayed or forged cookies from learning
//! anything through timing.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Cookie length in bytes (full HMAC-SHA256 output).
pub const COOKIE_LEN: usize = 32;
/// Session key length in bytes.
pub const SESSION_KEY_LEN: usize = 8;
/// Seconds a cookie stays verifiable after it was minted.
pub const AUTH_WINDOW_SECS: u64 = 5;

fn mac_input(ip: &[u8; 16], nonce: u8, timestamp: u64) -> [u8; 25] {
    let mut data = [0u8; 25];
    data[..16].copy_from_slice(ip);
    data[16] = nonce;
    data[17..].copy_from_slice(&timestamp.to_be_bytes());
    data
}

/// Compute the challenge cookie for a peer at a given unix second.
pub fn compute_cookie(secret: &[u8], ip: &[u8; 16], nonce: u8, timestamp: u64) -> [u8; COOKIE_LEN] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&mac_input(ip, nonce, timestamp));
    let mut cookie = [0u8; COOKIE_LEN];
    cookie.copy_from_slice(&mac.finalize().into_bytes());
    cookie
}

/// Verify an echoed cookie against every second in `[now - AUTH_WINDOW_SECS, now]`.
///
/// Returns the timestamp the cookie was minted at, or `None` when no
/// candidate matches. Comparison is constant-time (`Mac::verify_slice`).
pub fn verify_cookie(
    secret: &[u8],
    ip: &[u8; 16],
    nonce: u8,
    cookie: &[u8; COOKIE_LEN],
    now: u64,
) -> Option<u64> {
    for dt in 0..=AUTH_WINDOW_SECS {
        let ts = match now.checked_sub(dt) {
            Some(ts) => ts,
            None => break,
        };
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(&mac_input(ip, nonce, ts));
        if mac.verify_slice(cookie).is_ok() {
            return Some(ts);
        }
    }
    None
}

/// Derive the 8-byte session key for an authenticated peer.
///
/// First [`SESSION_KEY_LEN`] bytes of `HKDF-SHA256(ikm = secret,
/// salt = timestamp_be(8))`.
pub fn derive_session_key(secret: &[u8], timestamp: u64) -> [u8; SESSION_KEY_LEN] {
    let salt = timestamp.to_be_bytes();
    let hk = Hkdf::<Sha256>::new(Some(&salt), secret);
    let mut okm = [0u8; 32];
    hk.expand(&[], &mut okm).expect("32 bytes is a valid hkdf length");
    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&okm[..SESSION_KEY_LEN]);
    key
}
