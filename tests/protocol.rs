use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use starlane::client::Client;
use starlane::config::{self, Config};
use starlane::handshake::AuthState;
use starlane::packet::{self, Command, PacketHeader, Stamp, HEADER_LEN, MAX_PAYLOAD_SIZE};
use starlane::simulation::{LockstepWorld, Simulation, SlotError};
use starlane::transport::GameServer;

const SECRET: &[u8] = b"integration-secret";

/// Simulation double that records inputs and serves a canned snapshot.
struct ProbeSim {
    inputs: Arc<Mutex<Vec<(u32, u8, u8)>>>,
    state: Vec<u8>,
    snapshot_seq: u32,
    slots: usize,
}

impl Simulation for ProbeSim {
    fn apply_input(&mut self, client_id: u32, kind: u8, value: u8) {
        self.inputs.lock().push((client_id, kind, value));
    }

    fn latest_snapshot(&self) -> (u32, Vec<u8>) {
        (self.snapshot_seq, self.state.clone())
    }

    fn assign_player_slot(&mut self, _client_id: u32) -> Result<(), SlotError> {
        if self.slots == 0 {
            return Err(SlotError::Full);
        }
        self.slots -= 1;
        Ok(())
    }

    fn release_player_slot(&mut self, _client_id: u32) {
        self.slots += 1;
    }

    fn advance(&mut self) {
        self.snapshot_seq += 1;
    }
}

struct Harness {
    server: GameServer,
    client: Client,
    peer: SocketAddr,
    now: Instant,
}

impl Harness {
    fn new(state: Vec<u8>, slots: usize) -> (Self, Arc<Mutex<Vec<(u32, u8, u8)>>>) {
        let inputs: Arc<Mutex<Vec<(u32, u8, u8)>>> = Arc::new(Mutex::new(Vec::new()));
        let inputs_for_factory = inputs.clone();
        let server = GameServer::bind(
            Config::for_tests(SECRET),
            config::shutdown_flag(),
            Box::new(move |_| {
                Box::new(ProbeSim {
                    inputs: inputs_for_factory.clone(),
                    state: state.clone(),
                    snapshot_seq: 0,
                    slots,
                })
            }),
        )
        .expect("bind loopback");
        let now = Instant::now();
        let peer: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Client::new(server_addr, 7, 0xAB, now);
        (
            Self {
                server,
                client,
                peer,
                now,
            },
            inputs,
        )
    }

    /// Push one client packet into the server and shuttle replies back,
    /// returning the raw server packets for inspection.
    fn exchange(&mut self, pkt: Vec<u8>, now_unix: u64) -> Vec<Vec<u8>> {
        self.server.process_datagram(self.peer, &pkt, self.now, now_unix);
        let outgoing: Vec<Vec<u8>> = self
            .server
            .take_outgoing()
            .into_iter()
            .map(|(_, bytes)| bytes)
            .collect();
        for pkt in &outgoing {
            for reply in self.client.handle_datagram(pkt, self.now) {
                self.server.process_datagram(self.peer, &reply, self.now, now_unix);
            }
        }
        outgoing
    }

    fn drain_server_to_client(&mut self) -> Vec<Vec<u8>> {
        let outgoing: Vec<Vec<u8>> = self
            .server
            .take_outgoing()
            .into_iter()
            .map(|(_, bytes)| bytes)
            .collect();
        for pkt in &outgoing {
            self.client.handle_datagram(pkt, self.now);
        }
        outgoing
    }

    fn authenticate(&mut self, now_unix: u64) {
        let join = self.client.join_packet();
        self.exchange(join, now_unix);
        let followup = self.server.take_outgoing();
        for (_, pkt) in followup {
            self.client.handle_datagram(&pkt, self.now);
        }
        assert_eq!(self.client.auth_state(), AuthState::Authenticated);
    }
}

#[test]
fn auth_handshake_end_to_end() {
    let (mut h, _) = Harness::new(vec![1, 2, 3], 4);
    h.server.create_game(1);

    let join = h.client.join_packet();
    let server_pkts = h.exchange(join, 1000);

    // Server answered with a CHALLENGE on the reliable-ordered channel.
    let challenge = PacketHeader::decode(&server_pkts[0]).unwrap();
    assert_eq!(challenge.cmd, Command::Challenge);
    let (timestamp, _) = packet::parse_challenge(&server_pkts[0][HEADER_LEN..]).unwrap();
    assert_eq!(timestamp, 1000);

    // The client echoed AUTH inside exchange(); AUTH_OK is waiting.
    let auth_ok = h.drain_server_to_client();
    assert!(auth_ok
        .iter()
        .any(|p| PacketHeader::decode(p).unwrap().cmd == Command::AuthOk));

    assert_eq!(h.client.auth_state(), AuthState::Authenticated);
    assert_eq!(
        h.client.session_key(),
        Some(starlane::crypto::derive_session_key(SECRET, 1000))
    );
    assert_eq!(h.server.peer_auth_state(&h.peer), Some(AuthState::Authenticated));
    assert!(h.server.seat_of(7).is_some());
}

#[test]
fn auth_fails_after_expiry_and_destroys_session() {
    let (mut h, _) = Harness::new(vec![], 4);
    h.server.create_game(1);

    let join = h.client.join_packet();
    h.server.process_datagram(h.peer, &join, h.now, 1000);
    let challenge_pkt = h.server.take_outgoing().remove(0).1;
    let (_, cookie) = packet::parse_challenge(&challenge_pkt[HEADER_LEN..]).unwrap();

    // Echo the cookie 6 seconds late, three separate attempts.
    for (i, now_unix) in [(1u32, 1006u64), (2, 1006), (3, 1006)] {
        let stamp = Stamp {
            seq: i,
            ack_base: 0,
            ack_bits: 0,
            client_id: 7,
        };
        let auth = packet::build_auth(stamp, 0xAB, &cookie);
        h.server.process_datagram(h.peer, &auth, h.now, now_unix);
    }
    // Third failure destroyed the session.
    assert_eq!(h.server.peer_auth_state(&h.peer), None);
    assert_eq!(h.server.peer_count(), 0);
}

#[test]
fn duplicate_auth_does_not_double_count_attempts() {
    let (mut h, _) = Harness::new(vec![], 4);
    h.server.create_game(1);

    let join = h.client.join_packet();
    h.server.process_datagram(h.peer, &join, h.now, 1000);
    h.server.take_outgoing();

    let stamp = Stamp {
        seq: 1,
        ack_base: 0,
        ack_bits: 0,
        client_id: 7,
    };
    let bogus = packet::build_auth(stamp, 0xAB, &[0u8; 32]);
    // The same datagram three times: one attempt, two duplicates.
    for _ in 0..3 {
        h.server.process_datagram(h.peer, &bogus, h.now, 1000);
    }
    assert_eq!(h.server.peer_auth_state(&h.peer), Some(AuthState::Challenged));
    assert_eq!(*h.server.metrics.auth_failures_total.lock(), 1);
    assert_eq!(*h.server.metrics.duplicates_total.lock(), 2);
}

#[test]
fn input_is_gated_until_authenticated() {
    let (mut h, inputs) = Harness::new(vec![], 4);
    h.server.create_game(1);

    // INPUT before any session: ignored entirely.
    let stamp = Stamp {
        seq: 0,
        ack_base: 0,
        ack_bits: 0,
        client_id: 7,
    };
    let early = packet::build_input(stamp, &[(1, 5)]);
    h.server.process_datagram(h.peer, &early, h.now, 1000);
    assert!(inputs.lock().is_empty());

    // INPUT after JOIN but before AUTH: still rejected.
    let join = h.client.join_packet();
    h.server.process_datagram(h.peer, &join, h.now, 1000);
    h.server.take_outgoing();
    let stamp = Stamp {
        seq: 5,
        ack_base: 0,
        ack_bits: 0,
        client_id: 7,
    };
    let mid = packet::build_input(stamp, &[(1, 5)]);
    h.server.process_datagram(h.peer, &mid, h.now, 1000);
    assert!(inputs.lock().is_empty());
}

#[test]
fn input_reaches_simulation_once_authenticated_and_dedups() {
    let (mut h, inputs) = Harness::new(vec![], 4);
    h.server.create_game(1);
    h.authenticate(1000);

    let input = h.client.input_packet(&[(1, 3), (1, 4)]);
    h.server.process_datagram(h.peer, &input, h.now, 1000);
    assert_eq!(inputs.lock().as_slice(), &[(7, 1, 3), (7, 1, 4)]);

    // The identical datagram again: deduplicated, not re-applied.
    h.server.process_datagram(h.peer, &input, h.now, 1000);
    assert_eq!(inputs.lock().len(), 2);
}

#[test]
fn resync_returns_single_packet_snapshot() {
    let (mut h, _) = Harness::new(vec![0x42; 100], 4);
    h.server.create_game(1);
    h.authenticate(1000);

    let resync = h.client.resync_packet();
    h.server.process_datagram(h.peer, &resync, h.now, 1000);
    h.drain_server_to_client();

    let snapshots = h.client.snapshots();
    assert!(!snapshots.is_empty());
    assert_eq!(snapshots[0].1, vec![0x42; 100]);
}

#[test]
fn large_snapshot_fragments_and_reassembles_out_of_order() {
    let state: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let (mut h, _) = Harness::new(state.clone(), 4);
    h.server.create_game(1);
    h.authenticate(1000);

    let resync = h.client.resync_packet();
    h.server.process_datagram(h.peer, &resync, h.now, 1000);
    let mut fragments: Vec<Vec<u8>> = h
        .server
        .take_outgoing()
        .into_iter()
        .map(|(_, p)| p)
        .filter(|p| PacketHeader::decode(p).unwrap().cmd == Command::Fragment)
        .collect();
    assert_eq!(fragments.len(), 3);

    // Deliver in reversed order; the client reassembles regardless.
    fragments.reverse();
    for frag in &fragments {
        h.client.handle_datagram(frag, h.now);
    }
    let snapshots = h.client.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].1, state);
}

#[test]
fn snapshot_boundary_sizes() {
    // 1175 bytes of state fits one packet; 1176 fragments.
    let stamp = Stamp {
        seq: 0,
        ack_base: 0,
        ack_bits: 0,
        client_id: 1,
    };
    assert_eq!(packet::build_snapshot(stamp, 1, &vec![0; MAX_PAYLOAD_SIZE - 4]).len(), 1);
    assert!(packet::build_snapshot(stamp, 1, &vec![0; MAX_PAYLOAD_SIZE - 3]).len() > 1);
}

#[test]
fn kick_when_no_slot_is_free() {
    let (mut h, _) = Harness::new(vec![], 0);
    h.server.create_game(1);

    let join = h.client.join_packet();
    h.exchange(join, 1000);
    h.drain_server_to_client();

    assert!(h.client.is_kicked());
    assert_eq!(h.server.peer_count(), 0);
}

#[test]
fn ping_scheduler_and_pong_rtt() {
    let (mut h, _) = Harness::new(vec![], 4);
    h.server.create_game(1);
    h.authenticate(1000);
    h.server.take_outgoing();

    // First tick after authentication emits a PING.
    h.server.tick(h.now, 1000);
    let pings: Vec<Vec<u8>> = h
        .server
        .take_outgoing()
        .into_iter()
        .map(|(_, p)| p)
        .filter(|p| PacketHeader::decode(p).unwrap().cmd == Command::Ping)
        .collect();
    assert_eq!(pings.len(), 1);

    // Another tick at the same instant: no second ping inside the interval.
    h.server.tick(h.now, 1000);
    let again: Vec<_> = h
        .server
        .take_outgoing()
        .into_iter()
        .filter(|(_, p)| PacketHeader::decode(p).unwrap().cmd == Command::Ping)
        .collect();
    assert!(again.is_empty());

    // Client answers; the server folds the RTT sample in.
    for reply in h.client.handle_datagram(&pings[0], h.now) {
        h.server.process_datagram(h.peer, &reply, h.now, 1000);
    }
}

#[test]
fn malformed_udp_counts_and_destroys_peer() {
    let (mut h, _) = Harness::new(vec![], 4);
    h.server.create_game(1);
    h.authenticate(1000);
    assert_eq!(h.server.peer_count(), 1);

    // Wrong magic: silently dropped, never counted against the peer.
    let mut bad_magic = h.client.input_packet(&[(1, 1)]);
    bad_magic[0] = 0;
    for _ in 0..5 {
        h.server.process_datagram(h.peer, &bad_magic, h.now, 1000);
    }
    assert_eq!(h.server.peer_count(), 1);

    // Truncated garbage from the peer's address: three strikes destroy it.
    for _ in 0..3 {
        h.server
            .process_datagram(h.peer, &[0x42, 0x54, 0x01, 0x00], h.now, 1000);
    }
    assert_eq!(h.server.peer_count(), 0);
}

#[test]
fn lockstep_world_drives_snapshot_broadcast() {
    let server = GameServer::bind(
        Config::for_tests(SECRET),
        config::shutdown_flag(),
        Box::new(|_| Box::new(LockstepWorld::new())),
    );
    let mut server = server.unwrap();
    let game = server.create_game(1);
    assert_eq!(server.game_count(), 1);
    assert_eq!(server.gametype_of(game), Some(1));
    server.end_game(game);
    assert_eq!(server.game_count(), 0);
}
