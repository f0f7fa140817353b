//! Client-side session state machine.
//!
//! Drives the JOIN / CHALLENGE / AUTH handshake, answers keepalives, and
//! reassembles fragmented snapshots. The type is socket-free: callers feed it
//! server datagrams and send whatever packets it returns, which keeps it
//! usable both behind a real socket and inside deterministic tests.

use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, warn};

use crate::channel::flags;
use crate::connection::Connection;
use crate::handshake::AuthState;
use crate::packet::{self, Command, PacketHeader, HEADER_LEN};
use crate::reassembly::{Assembler, FragmentOutcome};
use crate::sack::Receipt;

/// Client endpoint of a game-server session.
pub struct Client {
    server: SocketAddr,
    nonce: u8,
    conn: Connection,
    assembler: Assembler,
    /// Session key received in AUTH_OK
    session_key: Option<[u8; 8]>,
    /// Snapshots received, newest last; fragmented ones appear once assembled
    snapshots: Vec<(u32, Vec<u8>)>,
    kicked: bool,
}

impl Client {
    /// Create a client that will talk to `server` as `client_id`.
    pub fn new(server: SocketAddr, client_id: u32, nonce: u8, now: Instant) -> Self {
        Self {
            server,
            nonce,
            conn: Connection::new(client_id, now),
            assembler: Assembler::new(),
            session_key: None,
            snapshots: Vec::new(),
            kicked: false,
        }
    }

    /// Build the JOIN packet that starts the handshake.
    pub fn join_packet(&mut self) -> Vec<u8> {
        packet::build_join(self.conn.stamp(), self.nonce)
    }

    /// Build an INPUT packet (requires an authenticated session to be useful).
    pub fn input_packet(&mut self, pairs: &[(u8, u8)]) -> Vec<u8> {
        packet::build_input(self.conn.stamp(), pairs)
    }

    /// Build a RESYNC request.
    pub fn resync_packet(&mut self) -> Vec<u8> {
        packet::build_bare(
            Command::Resync,
            flags::RELIABLE,
            self.conn.stamp(),
            crate::channel::Channel::ReliableOrdered,
        )
    }

    /// Process one datagram from the server, returning packets to send back.
    pub fn handle_datagram(&mut self, bytes: &[u8], now: Instant) -> Vec<Vec<u8>> {
        let header = match PacketHeader::decode(bytes) {
            Ok(h) => h,
            Err(e) => {
                debug!("dropping bad server datagram: {}", e);
                return Vec::new();
            }
        };
        let payload = &bytes[HEADER_LEN..header.size as usize];

        if header.flags & flags::FRAGMENT != 0 || header.cmd == Command::Fragment {
            return self.handle_fragment(header, payload, now);
        }

        if self.conn.acks.record(header.seq) == Receipt::Duplicate {
            return Vec::new();
        }
        self.conn.last_update = now;

        match header.cmd {
            Command::Challenge => self.handle_challenge(payload),
            Command::AuthOk => {
                match packet::parse_auth_ok(payload) {
                    Ok((_, key)) => {
                        self.conn.auth = AuthState::Authenticated;
                        self.session_key = Some(key);
                        debug!("authenticated, session key received");
                    }
                    Err(e) => warn!("bad AUTH_OK: {}", e),
                }
                Vec::new()
            }
            Command::Snapshot => {
                match packet::parse_snapshot(payload) {
                    Ok((seq, state)) => self.snapshots.push((seq, state.to_vec())),
                    Err(e) => warn!("bad SNAPSHOT: {}", e),
                }
                Vec::new()
            }
            Command::Ping => vec![packet::build_pong(self.conn.stamp())],
            Command::Kick => {
                self.kicked = true;
                Vec::new()
            }
            other => {
                debug!("ignoring {:?} from server", other);
                Vec::new()
            }
        }
    }

    fn handle_challenge(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let (timestamp, cookie) = match packet::parse_challenge(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("bad CHALLENGE: {}", e);
                return Vec::new();
            }
        };
        debug!("challenge received (timestamp {})", timestamp);
        self.conn.auth = AuthState::Challenged;
        vec![packet::build_auth(self.conn.stamp(), self.nonce, &cookie)]
    }

    fn handle_fragment(&mut self, header: PacketHeader, payload: &[u8], now: Instant) -> Vec<Vec<u8>> {
        let frag = match packet::parse_fragment(payload) {
            Ok(f) => f,
            Err(e) => {
                warn!("bad FRAGMENT: {}", e);
                return Vec::new();
            }
        };
        if self.conn.acks.record(header.seq) == Receipt::Duplicate {
            return Vec::new();
        }
        self.conn.last_update = now;

        match self.assembler.insert(self.server, frag, now) {
            FragmentOutcome::Stored | FragmentOutcome::Rejected => Vec::new(),
            FragmentOutcome::Complete(message) => {
                // The only fragmented server message is a snapshot:
                // snapshot_seq(4) then state.
                match packet::parse_snapshot(&message) {
                    Ok((seq, state)) => self.snapshots.push((seq, state.to_vec())),
                    Err(e) => warn!("assembled message is not a snapshot: {}", e),
                }
                Vec::new()
            }
        }
    }

    /// Expire stale reassembly slots.
    pub fn sweep(&mut self, now: Instant) {
        self.assembler.sweep(now);
    }

    /// Session key issued by the server, once authenticated.
    pub fn session_key(&self) -> Option<[u8; 8]> {
        self.session_key
    }

    /// Current authentication state.
    pub fn auth_state(&self) -> AuthState {
        self.conn.auth
    }

    /// Snapshots received so far, oldest first.
    pub fn snapshots(&self) -> &[(u32, Vec<u8>)] {
        &self.snapshots
    }

    /// Whether the server kicked this client.
    pub fn is_kicked(&self) -> bool {
        self.kicked
    }
}
