//! Game-server process: multi-peer UDP transport and session layer.
//!
//! A single-threaded event loop drives everything: datagrams flow through
//! header validation, the acknowledgment window (dedup), the authentication
//! gate, and finally the per-command session handlers. Outbound packets are
//! stamped with the peer's sequence state and queued; the socket is drained
//! non-blocking each tick.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::channel::flags;
use crate::config::Config;
use crate::connection::Connection;
use crate::control;
use crate::error::CloseReason;
use crate::handshake::{allowed_before_auth, AuthGate, AuthState, AuthVerdict};
use crate::packet::{self, Command, PacketHeader, HEADER_LEN};
use crate::reassembly::{Assembler, FragmentOutcome};
use crate::sack::Receipt;
use crate::simulation::Simulation;
use crate::uplink::{Uplink, UplinkEvent};

/// Keepalive interval for authenticated peers.
pub const PING_INTERVAL: Duration = Duration::from_secs(1);
/// Event-loop tick, the only place the process waits.
const TICK: Duration = Duration::from_millis(1);

/// Factory producing one simulation instance per created game.
pub type SimFactory = Box<dyn Fn(u8) -> Box<dyn Simulation>>;

/// Operational counters, shared with monitoring callers.
///
/// All fields sit behind mutexes so an external thread can read a consistent
/// value while the event loop updates them.
#[derive(Clone, Default)]
pub struct TransportMetrics {
    /// Datagrams that passed header validation
    pub packets_received_total: Arc<Mutex<u64>>,
    /// Datagrams dropped for bad magic, version, or framing
    pub packets_dropped_invalid: Arc<Mutex<u64>>,
    /// Already-acknowledged sequences that only re-triggered an ACK
    pub duplicates_total: Arc<Mutex<u64>>,
    /// Failed AUTH attempts
    pub auth_failures_total: Arc<Mutex<u64>>,
    /// Messages reassembled from fragments
    pub reassembled_total: Arc<Mutex<u64>>,
    /// Live peer sessions
    pub peers_active: Arc<Mutex<usize>>,
}

impl TransportMetrics {
    /// Export metrics in Prometheus text exposition format.
    pub fn export_metrics(&self) -> String {
        format!(
            "starlane_packets_received_total {{}} {}\n\
             starlane_packets_dropped_invalid {{}} {}\n\
             starlane_duplicates_total {{}} {}\n\
             starlane_auth_failures_total {{}} {}\n\
             starlane_reassembled_total {{}} {}\n\
             starlane_peers_active {{}} {}\n",
            self.packets_received_total.lock(),
            self.packets_dropped_invalid.lock(),
            self.duplicates_total.lock(),
            self.auth_failures_total.lock(),
            self.reassembled_total.lock(),
            self.peers_active.lock(),
        )
    }
}

struct GameInstance {
    sim: Box<dyn Simulation>,
    gametype: u8,
    last_sent_snapshot: Option<u32>,
}

/// The game-server process.
pub struct GameServer {
    socket: UdpSocket,
    config: Config,
    /// Per-endpoint reliability and session state
    peers: HashMap<SocketAddr, Connection>,
    /// client_id -> endpoint, populated by JOIN
    clients: HashMap<u32, SocketAddr>,
    /// client_id -> game_id, populated on successful auth
    client_games: HashMap<u32, u32>,
    games: BTreeMap<u32, GameInstance>,
    /// Games the gateway told us to expect a player for
    pending_joins: VecDeque<u32>,
    auth: AuthGate,
    assembler: Assembler,
    uplink: Uplink,
    outbox: VecDeque<(SocketAddr, Vec<u8>)>,
    /// Occupancy last reported to the gateway
    reported_occupancy: Option<u8>,
    /// Operational counters
    pub metrics: TransportMetrics,
    shutdown: Arc<AtomicBool>,
    sim_factory: SimFactory,
}

impl GameServer {
    /// Bind the UDP socket and prepare the uplink (dialed lazily).
    pub fn bind(config: Config, shutdown: Arc<AtomicBool>, sim_factory: SimFactory) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.udp_bind)?;
        socket.set_nonblocking(true)?;
        info!("game server listening on {}", socket.local_addr()?);
        let uplink = Uplink::new(config.gateway_addr, config.udp_external);
        let auth = AuthGate::new(config.secret.clone());
        Ok(Self {
            socket,
            config,
            peers: HashMap::new(),
            clients: HashMap::new(),
            client_games: HashMap::new(),
            games: BTreeMap::new(),
            pending_joins: VecDeque::new(),
            auth,
            assembler: Assembler::new(),
            uplink,
            outbox: VecDeque::new(),
            reported_occupancy: None,
            metrics: TransportMetrics::default(),
            shutdown,
            sim_factory,
        })
    }

    /// Run until the shutdown flag is raised.
    pub fn run(&mut self) {
        let mut buf = [0u8; packet::MAX_PACKET_SIZE];
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            let now_unix = unix_seconds();

            loop {
                match self.socket.recv_from(&mut buf) {
                    Ok((len, peer)) => {
                        self.process_datagram(peer, &buf[..len], now, now_unix);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("recv error: {}", e);
                        break;
                    }
                }
            }

            self.tick(now, now_unix);
            self.flush_outbox();
            std::thread::sleep(TICK);
        }
        info!("game server shutting down");
    }

    /// One full datagram through the receive pipeline.
    pub fn process_datagram(&mut self, peer: SocketAddr, bytes: &[u8], now: Instant, now_unix: u64) {
        let header = match PacketHeader::decode(bytes) {
            Ok(h) => h,
            Err(e) if e.is_silent_drop() => {
                *self.metrics.packets_dropped_invalid.lock() += 1;
                return;
            }
            Err(e) => {
                *self.metrics.packets_dropped_invalid.lock() += 1;
                debug!("bad datagram from {}: {}", peer, e);
                self.count_parse_error(peer);
                return;
            }
        };
        *self.metrics.packets_received_total.lock() += 1;

        if header.flags & flags::CLOSE != 0 {
            self.destroy_peer(peer, CloseReason::PeerClosed);
            return;
        }

        let payload = &bytes[HEADER_LEN..header.size as usize];

        // JOIN creates the session; everything else needs one.
        if header.cmd == Command::Join {
            self.handle_join(peer, header, payload, now, now_unix);
            return;
        }
        if !self.peers.contains_key(&peer) {
            debug!("{:?} from unknown peer {}", header.cmd, peer);
            return;
        }

        // Fragments are acknowledged by their own sequence and complete
        // later with the base sequence.
        if header.flags & flags::FRAGMENT != 0 || header.cmd == Command::Fragment {
            self.handle_fragment(peer, header, payload, now);
            return;
        }

        // Dedup: an already-acknowledged sequence re-triggers an ACK on the
        // next outbound packet but never re-runs a handler.
        let receipt = self
            .peers
            .get_mut(&peer)
            .map(|c| c.acks.record(header.seq))
            .unwrap_or(Receipt::Duplicate);
        if receipt == Receipt::Duplicate {
            *self.metrics.duplicates_total.lock() += 1;
            return;
        }
        if let Some(conn) = self.peers.get_mut(&peer) {
            conn.last_update = now;
        }

        self.dispatch(peer, header, payload, now, now_unix);
    }

    fn dispatch(
        &mut self,
        peer: SocketAddr,
        header: PacketHeader,
        payload: &[u8],
        now: Instant,
        now_unix: u64,
    ) {
        let auth_state = self.peers.get(&peer).map(|c| c.auth).unwrap_or(AuthState::None);
        if auth_state != AuthState::Authenticated && !allowed_before_auth(header.cmd) {
            warn!("{:?} from unauthenticated peer {}", header.cmd, peer);
            return;
        }

        match header.cmd {
            Command::Auth => self.handle_auth(peer, payload, now_unix),
            Command::Input => self.handle_input(peer, payload),
            Command::Resync => self.handle_resync(peer),
            Command::Ping => self.handle_ping(peer),
            Command::Pong => self.handle_pong(peer, now),
            // JOIN and FRAGMENT are routed before dispatch; anything else a
            // client sends has no server-side meaning.
            other => {
                debug!("ignoring {:?} from {}", other, peer);
            }
        }
    }

    fn handle_join(
        &mut self,
        peer: SocketAddr,
        header: PacketHeader,
        payload: &[u8],
        now: Instant,
        now_unix: u64,
    ) {
        let (client_id, nonce, version) = match packet::parse_join(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("bad JOIN from {}: {}", peer, e);
                self.count_parse_error(peer);
                return;
            }
        };
        if client_id != header.client_id {
            warn!("client id mismatch in JOIN from {}", peer);
            self.count_parse_error(peer);
            return;
        }
        if version != packet::VERSION {
            warn!("JOIN with unsupported version {} from {}", version, peer);
            return;
        }

        // A re-sent JOIN (new sequence) restarts the handshake; a duplicated
        // datagram re-triggers an ACK only, and an authenticated session
        // never regresses.
        match self.peers.get_mut(&peer) {
            Some(conn) if conn.auth == AuthState::Authenticated => {
                debug!("JOIN from authenticated peer {}", peer);
                conn.acks.record(header.seq);
                return;
            }
            Some(conn) => {
                if conn.acks.record(header.seq) == Receipt::Duplicate {
                    *self.metrics.duplicates_total.lock() += 1;
                    return;
                }
                debug!("restarting handshake for {}", peer);
            }
            None => {
                let mut conn = Connection::new(client_id, now);
                conn.acks.record(header.seq);
                self.peers.insert(peer, conn);
                *self.metrics.peers_active.lock() = self.peers.len();
            }
        }
        info!("JOIN from client {} at {} (nonce={})", client_id, peer, nonce);
        self.clients.insert(client_id, peer);

        let ip = control::ip_octets(&peer);
        let (timestamp, cookie) = self.auth.issue(peer, &ip, nonce, now_unix, now);
        let conn = self.peers.get_mut(&peer).expect("peer just inserted");
        conn.auth = AuthState::Challenged;
        conn.last_update = now;
        let challenge = packet::build_challenge(conn.stamp(), timestamp, &cookie);
        self.outbox.push_back((peer, challenge));
    }

    fn handle_auth(&mut self, peer: SocketAddr, payload: &[u8], now_unix: u64) {
        let (nonce, cookie) = match packet::parse_auth(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("bad AUTH from {}: {}", peer, e);
                self.count_parse_error(peer);
                return;
            }
        };
        let state = self.peers.get(&peer).map(|c| c.auth);
        if state != Some(AuthState::Challenged) {
            warn!("AUTH in invalid state from {}", peer);
            return;
        }

        let ip = control::ip_octets(&peer);
        match self.auth.verify(peer, &ip, nonce, &cookie, now_unix) {
            AuthVerdict::Accepted(session_key) => {
                let conn = self.peers.get_mut(&peer).expect("challenged peer exists");
                conn.auth = AuthState::Authenticated;
                conn.session_key = Some(session_key);
                let client_id = conn.client_id;
                let auth_ok = packet::build_auth_ok(conn.stamp(), &session_key);
                self.outbox.push_back((peer, auth_ok));
                info!("client {} authenticated", client_id);
                self.seat_player(peer, client_id);
            }
            AuthVerdict::Retry => {
                *self.metrics.auth_failures_total.lock() += 1;
                warn!("invalid authentication cookie from {}", peer);
            }
            AuthVerdict::Destroy => {
                *self.metrics.auth_failures_total.lock() += 1;
                self.destroy_peer(peer, CloseReason::AuthFail);
            }
            AuthVerdict::NoChallenge => {
                warn!("AUTH without challenge from {}", peer);
            }
        }
    }

    /// Bind a freshly authenticated client to a game and reserve its slot.
    fn seat_player(&mut self, peer: SocketAddr, client_id: u32) {
        let game_id = self
            .pending_joins
            .pop_front()
            .filter(|id| self.games.contains_key(id))
            .or_else(|| self.games.keys().next().copied());
        let Some(game_id) = game_id else {
            warn!("client {} authenticated with no game to join", client_id);
            return;
        };
        let game = self.games.get_mut(&game_id).expect("game id checked");
        match game.sim.assign_player_slot(client_id) {
            Ok(()) => {
                self.client_games.insert(client_id, game_id);
                debug!("client {} seated in game {}", client_id, game_id);
            }
            Err(e) => {
                warn!("no slot for client {} in game {}: {}", client_id, game_id, e);
                if let Some(conn) = self.peers.get_mut(&peer) {
                    let kick = packet::build_kick(conn.stamp());
                    self.outbox.push_back((peer, kick));
                }
                self.destroy_peer(peer, CloseReason::PeerClosed);
            }
        }
    }

    fn handle_input(&mut self, peer: SocketAddr, payload: &[u8]) {
        let pairs = match packet::parse_input(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!("bad INPUT from {}: {}", peer, e);
                self.count_parse_error(peer);
                return;
            }
        };
        let Some(conn) = self.peers.get(&peer) else { return };
        let client_id = conn.client_id;
        let Some(&game_id) = self.client_games.get(&client_id) else {
            debug!("INPUT from unseated client {}", client_id);
            return;
        };
        if let Some(game) = self.games.get_mut(&game_id) {
            for (kind, value) in pairs {
                game.sim.apply_input(client_id, kind, value);
            }
        }
    }

    fn handle_resync(&mut self, peer: SocketAddr) {
        let Some(conn) = self.peers.get(&peer) else { return };
        let client_id = conn.client_id;
        debug!("resync requested by client {}", client_id);
        let Some(&game_id) = self.client_games.get(&client_id) else { return };
        let Some(game) = self.games.get(&game_id) else { return };
        let (snapshot_seq, state) = game.sim.latest_snapshot();
        self.send_snapshot(peer, snapshot_seq, &state);
    }

    fn handle_ping(&mut self, peer: SocketAddr) {
        if let Some(conn) = self.peers.get_mut(&peer) {
            let pong = packet::build_pong(conn.stamp());
            self.outbox.push_back((peer, pong));
        }
    }

    fn handle_pong(&mut self, peer: SocketAddr, now: Instant) {
        let Some(conn) = self.peers.get_mut(&peer) else { return };
        match conn.rtt.last_ping {
            Some(sent) => {
                let rtt = now.duration_since(sent);
                conn.rtt.record(rtt);
                debug!(
                    "PONG from client {}: rtt={:?} avg={:?}",
                    conn.client_id, rtt, conn.rtt.avg_rtt
                );
            }
            None => debug!("PONG from client {} with no matching ping", conn.client_id),
        }
    }

    fn handle_fragment(&mut self, peer: SocketAddr, header: PacketHeader, payload: &[u8], now: Instant) {
        let frag = match packet::parse_fragment(payload) {
            Ok(f) => f,
            Err(e) => {
                warn!("bad FRAGMENT from {}: {}", peer, e);
                self.count_parse_error(peer);
                return;
            }
        };
        // Each fragment is acknowledged with its own sequence.
        let receipt = self
            .peers
            .get_mut(&peer)
            .map(|c| {
                c.last_update = now;
                c.acks.record(header.seq)
            })
            .unwrap_or(Receipt::Duplicate);
        if receipt == Receipt::Duplicate {
            *self.metrics.duplicates_total.lock() += 1;
            return;
        }

        let base_seq = frag.base_seq;
        match self.assembler.insert(peer, frag, now) {
            FragmentOutcome::Stored => {}
            FragmentOutcome::Rejected => {
                warn!("rejected fragment from {}", peer);
                self.count_parse_error(peer);
            }
            FragmentOutcome::Complete(message) => {
                *self.metrics.reassembled_total.lock() += 1;
                // The server never solicits large client messages; the only
                // fragmenting producer is the snapshot path. Surface the
                // event for diagnostics and move on.
                debug!(
                    "assembled {}-byte message from {} (base_seq {})",
                    message.len(),
                    peer,
                    base_seq
                );
            }
        }
    }

    /// Periodic work: uplink, keepalives, expiries, simulation advance,
    /// snapshot broadcast, occupancy reporting.
    pub fn tick(&mut self, now: Instant, _now_unix: u64) {
        let events = self.uplink.service(now);
        for event in events {
            self.handle_uplink_event(event);
        }

        self.schedule_pings(now);

        for peer in self.auth.sweep(now) {
            self.destroy_peer(peer, CloseReason::AuthFail);
        }
        self.assembler.sweep(now);
        let idle: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, c)| c.is_idle(now))
            .map(|(p, _)| *p)
            .collect();
        for peer in idle {
            self.destroy_peer(peer, CloseReason::Timeout);
        }

        for game in self.games.values_mut() {
            game.sim.advance();
        }
        self.broadcast_snapshots();
        self.report_occupancy();
    }

    fn handle_uplink_event(&mut self, event: UplinkEvent) {
        match event {
            UplinkEvent::CreateGame { gametype } => {
                let game_id = self.create_game(gametype);
                let ip = control::ip_octets(&self.config.udp_external);
                let reply = control::build_join_reply(game_id, &ip, self.config.udp_external.port());
                self.uplink.send(reply);
            }
            UplinkEvent::IncomingPlayer { game_id } => {
                debug!("gateway routed a player to game {}", game_id);
                self.pending_joins.push_back(game_id);
            }
            UplinkEvent::Registered => {
                info!("registered with gateway");
                self.announce_game_ids();
                self.reported_occupancy = None;
            }
            UplinkEvent::Refused => {
                warn!("gateway refused our registration");
            }
        }
    }

    /// Create a game instance and return its freshly allocated id.
    pub fn create_game(&mut self, gametype: u8) -> u32 {
        let mut rng = rand::thread_rng();
        let game_id = loop {
            let id: u32 = rng.gen();
            if id != 0 && !self.games.contains_key(&id) {
                break id;
            }
        };
        info!("created game {} (gametype {})", game_id, gametype);
        self.games.insert(
            game_id,
            GameInstance {
                sim: (self.sim_factory)(gametype),
                gametype,
                last_sent_snapshot: None,
            },
        );
        game_id
    }

    /// Note that the gateway routed a player toward `game_id`.
    pub fn expect_player(&mut self, game_id: u32) {
        self.pending_joins.push_back(game_id);
    }

    /// Tear down a finished game and tell the gateway.
    pub fn end_game(&mut self, game_id: u32) {
        if self.games.remove(&game_id).is_none() {
            return;
        }
        let clients: Vec<u32> = self
            .client_games
            .iter()
            .filter(|(_, &g)| g == game_id)
            .map(|(&c, _)| c)
            .collect();
        for client_id in clients {
            self.client_games.remove(&client_id);
            if let Some(peer) = self.clients.get(&client_id).copied() {
                if let Some(conn) = self.peers.get_mut(&peer) {
                    let kick = packet::build_kick(conn.stamp());
                    self.outbox.push_back((peer, kick));
                }
            }
        }
        self.uplink.send(control::build_game_end(game_id));
    }

    fn announce_game_ids(&mut self) {
        let ids: Vec<u32> = self.games.keys().copied().collect();
        for chunk in ids.chunks(u8::MAX as usize) {
            if !chunk.is_empty() {
                self.uplink.send(control::build_game_ids(chunk));
            }
        }
    }

    fn schedule_pings(&mut self, now: Instant) {
        for (peer, conn) in self.peers.iter_mut() {
            if conn.auth != AuthState::Authenticated {
                continue;
            }
            let due = match conn.rtt.last_ping {
                None => true,
                Some(last) => now.duration_since(last) >= PING_INTERVAL,
            };
            if due {
                let ping = packet::build_ping(conn.stamp());
                self.outbox.push_back((*peer, ping));
                conn.rtt.last_ping = Some(now);
            }
        }
    }

    fn broadcast_snapshots(&mut self) {
        let mut sends: Vec<(SocketAddr, u32, Vec<u8>)> = Vec::new();
        for (&game_id, game) in self.games.iter_mut() {
            let (snapshot_seq, state) = game.sim.latest_snapshot();
            if game.last_sent_snapshot == Some(snapshot_seq) {
                continue;
            }
            game.last_sent_snapshot = Some(snapshot_seq);
            for (&client_id, &g) in self.client_games.iter() {
                if g != game_id {
                    continue;
                }
                if let Some(&peer) = self.clients.get(&client_id) {
                    sends.push((peer, snapshot_seq, state.clone()));
                }
            }
        }
        for (peer, snapshot_seq, state) in sends {
            self.send_snapshot(peer, snapshot_seq, &state);
        }
    }

    fn send_snapshot(&mut self, peer: SocketAddr, snapshot_seq: u32, state: &[u8]) {
        let Some(conn) = self.peers.get_mut(&peer) else { return };
        if conn.auth != AuthState::Authenticated {
            return;
        }
        let count = packet::snapshot_packet_count(state.len());
        let stamp = conn.stamp_many(count as u32);
        for pkt in packet::build_snapshot(stamp, snapshot_seq, state) {
            self.outbox.push_back((peer, pkt));
        }
    }

    fn report_occupancy(&mut self) {
        if !self.uplink.is_connected() {
            return;
        }
        let occupancy = self.games.len().min(u8::MAX as usize) as u8;
        if self.reported_occupancy != Some(occupancy) {
            self.reported_occupancy = Some(occupancy);
            self.uplink.send(control::build_occupancy(occupancy));
        }
    }

    fn count_parse_error(&mut self, peer: SocketAddr) {
        let destroy = match self.peers.get_mut(&peer) {
            Some(conn) => conn.record_parse_error(),
            None => false,
        };
        if destroy {
            self.destroy_peer(peer, CloseReason::TooManyParseErrors);
        }
    }

    fn destroy_peer(&mut self, peer: SocketAddr, reason: CloseReason) {
        let Some(conn) = self.peers.remove(&peer) else { return };
        info!("destroying peer {} ({:?})", peer, reason);
        let client_id = conn.client_id;
        self.clients.remove(&client_id);
        if let Some(game_id) = self.client_games.remove(&client_id) {
            if let Some(game) = self.games.get_mut(&game_id) {
                game.sim.release_player_slot(client_id);
            }
        }
        self.auth.forget(&peer);
        self.assembler.forget_peer(&peer);
        *self.metrics.peers_active.lock() = self.peers.len();
    }

    fn flush_outbox(&mut self) {
        while let Some((peer, pkt)) = self.outbox.pop_front() {
            match self.socket.send_to(&pkt, peer) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Socket pushed back: keep the packet for the next tick.
                    self.outbox.push_front((peer, pkt));
                    break;
                }
                Err(e) => {
                    warn!("send to {} failed, dropping packet: {}", peer, e);
                }
            }
        }
    }

    /// Drain queued outbound packets without touching the socket (test hook).
    pub fn take_outgoing(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.outbox.drain(..).collect()
    }

    /// Number of live peer sessions.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of live game instances.
    pub fn game_count(&self) -> usize {
        self.games.len()
    }

    /// Authentication state of a peer, if it exists.
    pub fn peer_auth_state(&self, peer: &SocketAddr) -> Option<AuthState> {
        self.peers.get(peer).map(|c| c.auth)
    }

    /// Game a client is seated in, if any.
    pub fn seat_of(&self, client_id: u32) -> Option<u32> {
        self.client_games.get(&client_id).copied()
    }

    /// Gametype of a game instance, if it exists.
    pub fn gametype_of(&self, game_id: u32) -> Option<u8> {
        self.games.get(&game_id).map(|g| g.gametype)
    }

    /// Local UDP address the server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Wall-clock seconds since the unix epoch.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
