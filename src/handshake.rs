//! Authentication engine: cookie challenge lifecycle per peer.
//!
//! The state machine advances `None -> Challenged -> Authenticated` and never
//! moves backwards; the only way out is destruction of the session. The
//! engine holds per-peer attempt counters and challenge age so the transport
//! can sweep expired or exhausted handshakes each tick.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::crypto::{self, SESSION_KEY_LEN};

/// Authentication progress of one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    /// No handshake started
    None,
    /// CHALLENGE sent, waiting for AUTH
    Challenged,
    /// Cookie verified, session key issued
    Authenticated,
}

/// Failed AUTH attempts tolerated before the session is destroyed.
pub const MAX_AUTH_ATTEMPTS: u8 = 3;
/// Challenges older than this are destroyed.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

struct Challenge {
    attempts: u8,
    issued_at: Instant,
}

/// Result of verifying an AUTH response.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthVerdict {
    /// Cookie verified; session key derived from the matched timestamp
    Accepted([u8; SESSION_KEY_LEN]),
    /// Cookie did not verify; the peer may retry
    Retry,
    /// Cookie did not verify and no attempts remain
    Destroy,
    /// No outstanding challenge for this peer
    NoChallenge,
}

/// Stateless-cookie authentication gate for all peers of one socket.
pub struct AuthGate {
    secret: Vec<u8>,
    challenges: HashMap<SocketAddr, Challenge>,
}

impl AuthGate {
    /// Create a gate using the process-wide shared secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            challenges: HashMap::new(),
        }
    }

    /// Issue a challenge for `peer`: computes the cookie for `now_unix` and
    /// starts the attempt/expiry tracking.
    ///
    /// Re-issuing (duplicate JOIN) resets the challenge, which keeps a lost
    /// CHALLENGE packet from wedging the handshake.
    pub fn issue(
        &mut self,
        peer: SocketAddr,
        ip: &[u8; 16],
        nonce: u8,
        now_unix: u64,
        now: Instant,
    ) -> (u64, [u8; 32]) {
        let cookie = crypto::compute_cookie(&self.secret, ip, nonce, now_unix);
        self.challenges.insert(
            peer,
            Challenge {
                attempts: 0,
                issued_at: now,
            },
        );
        (now_unix, cookie)
    }

    /// Verify an AUTH response from `peer`.
    pub fn verify(
        &mut self,
        peer: SocketAddr,
        ip: &[u8; 16],
        nonce: u8,
        cookie: &[u8; 32],
        now_unix: u64,
    ) -> AuthVerdict {
        let challenge = match self.challenges.get_mut(&peer) {
            Some(c) => c,
            None => return AuthVerdict::NoChallenge,
        };

        match crypto::verify_cookie(&self.secret, ip, nonce, cookie, now_unix) {
            Some(timestamp) => {
                let key = crypto::derive_session_key(&self.secret, timestamp);
                self.challenges.remove(&peer);
                AuthVerdict::Accepted(key)
            }
            None => {
                challenge.attempts += 1;
                if challenge.attempts >= MAX_AUTH_ATTEMPTS {
                    self.challenges.remove(&peer);
                    AuthVerdict::Destroy
                } else {
                    AuthVerdict::Retry
                }
            }
        }
    }

    /// Remove challenges that aged past [`AUTH_TIMEOUT`], returning the peers
    /// whose sessions must be destroyed.
    pub fn sweep(&mut self, now: Instant) -> Vec<SocketAddr> {
        let expired: Vec<SocketAddr> = self
            .challenges
            .iter()
            .filter(|(_, c)| now.duration_since(c.issued_at) > AUTH_TIMEOUT)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &expired {
            self.challenges.remove(peer);
        }
        expired
    }

    /// Drop any outstanding challenge for `peer`.
    pub fn forget(&mut self, peer: &SocketAddr) {
        self.challenges.remove(peer);
    }

    /// Number of outstanding challenges.
    pub fn outstanding(&self) -> usize {
        self.challenges.len()
    }
}

/// Commands a peer may send before it is authenticated.
pub fn allowed_before_auth(cmd: crate::packet::Command) -> bool {
    use crate::packet::Command;
    matches!(
        cmd,
        Command::Join | Command::Ping | Command::Pong | Command::Auth | Command::Challenge
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::compute_cookie;

    const SECRET: &[u8] = b"gate-secret";
    const IP: [u8; 16] = [0; 16];

    fn peer() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    fn gate() -> AuthGate {
        AuthGate::new(SECRET.to_vec())
    }

    #[test]
    fn issue_then_accept() {
        let mut gate = gate();
        let now = Instant::now();
        let (ts, cookie) = gate.issue(peer(), &IP, 0xAB, 1000, now);
        assert_eq!(ts, 1000);
        match gate.verify(peer(), &IP, 0xAB, &cookie, 1003) {
            AuthVerdict::Accepted(key) => {
                assert_eq!(key, crypto::derive_session_key(SECRET, 1000));
            }
            other => panic!("expected Accepted, got {other:?}"),
        }
        assert_eq!(gate.outstanding(), 0);
    }

    #[test]
    fn expired_cookie_counts_as_attempt() {
        let mut gate = gate();
        let now = Instant::now();
        let (_, cookie) = gate.issue(peer(), &IP, 1, 1000, now);
        // Verified 6 seconds later: outside the window.
        assert_eq!(gate.verify(peer(), &IP, 1, &cookie, 1006), AuthVerdict::Retry);
        assert_eq!(gate.verify(peer(), &IP, 1, &cookie, 1006), AuthVerdict::Retry);
        assert_eq!(gate.verify(peer(), &IP, 1, &cookie, 1006), AuthVerdict::Destroy);
        assert_eq!(gate.outstanding(), 0);
    }

    #[test]
    fn garbage_cookie_retries_then_destroys() {
        let mut gate = gate();
        gate.issue(peer(), &IP, 1, 1000, Instant::now());
        let bogus = [0u8; 32];
        assert_eq!(gate.verify(peer(), &IP, 1, &bogus, 1000), AuthVerdict::Retry);
        assert_eq!(gate.verify(peer(), &IP, 1, &bogus, 1000), AuthVerdict::Retry);
        assert_eq!(gate.verify(peer(), &IP, 1, &bogus, 1000), AuthVerdict::Destroy);
    }

    #[test]
    fn verify_without_challenge() {
        let mut gate = gate();
        let cookie = compute_cookie(SECRET, &IP, 1, 1000);
        assert_eq!(gate.verify(peer(), &IP, 1, &cookie, 1000), AuthVerdict::NoChallenge);
    }

    #[test]
    fn sweep_expires_old_challenges() {
        let mut gate = gate();
        let start = Instant::now();
        gate.issue(peer(), &IP, 1, 1000, start);
        assert!(gate.sweep(start + Duration::from_secs(2)).is_empty());
        let expired = gate.sweep(start + Duration::from_secs(6));
        assert_eq!(expired, vec![peer()]);
        assert_eq!(gate.outstanding(), 0);
    }

    #[test]
    fn pre_auth_command_gating() {
        use crate::packet::Command;
        assert!(allowed_before_auth(Command::Join));
        assert!(allowed_before_auth(Command::Ping));
        assert!(allowed_before_auth(Command::Pong));
        assert!(allowed_before_auth(Command::Auth));
        assert!(!allowed_before_auth(Command::Input));
        assert!(!allowed_before_auth(Command::Resync));
        assert!(!allowed_before_auth(Command::Snapshot));
    }
}
