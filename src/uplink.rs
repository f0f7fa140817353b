//! Game-server side of the gateway connection.
//!
//! A single non-blocking TCP stream toward the gateway. The game server
//! registers itself on connect, then receives CREATE requests and
//! incoming-player notices, and pushes occupancy updates, game-id batches,
//! and GAME_END notifications.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::control::{self, ControlCommand};
use crate::error::ProtocolError;
use crate::stream::{self, SendQueue, StreamRead};

/// Malformed packets tolerated from the gateway before dropping the link.
const MAX_PARSE_ERRORS: u8 = 3;
/// How long to wait between reconnect attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
/// Dial timeout for one connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Something the gateway asked of the game server.
#[derive(Debug, PartialEq, Eq)]
pub enum UplinkEvent {
    /// Create a new game of the given type and reply with its endpoint
    CreateGame {
        /// Requested game type
        gametype: u8,
    },
    /// A player was pointed at one of our games
    IncomingPlayer {
        /// Game the player was routed to
        game_id: u32,
    },
    /// Registration was acknowledged
    Registered,
    /// Registration was refused (duplicate key)
    Refused,
}

/// Connection state toward the gateway.
pub struct Uplink {
    gateway_addr: SocketAddr,
    advertise: SocketAddr,
    stream: Option<TcpStream>,
    inbox: Vec<u8>,
    outbox: SendQueue,
    parse_errors: u8,
    last_attempt: Option<Instant>,
}

impl Uplink {
    /// Create a disconnected uplink; `advertise` is the UDP endpoint sent in
    /// the registration packet.
    pub fn new(gateway_addr: SocketAddr, advertise: SocketAddr) -> Self {
        Self {
            gateway_addr,
            advertise,
            stream: None,
            inbox: Vec::new(),
            outbox: SendQueue::new(),
            parse_errors: 0,
            last_attempt: None,
        }
    }

    /// Whether the TCP link is currently up.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Queue a packet for the gateway. Queued packets survive a disconnect
    /// and flush after the next successful connect.
    pub fn send(&mut self, packet: Vec<u8>) {
        self.outbox.push(packet);
    }

    fn try_connect(&mut self, now: Instant) {
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < RECONNECT_INTERVAL {
                return;
            }
        }
        self.last_attempt = Some(now);

        match TcpStream::connect_timeout(&self.gateway_addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                if stream.set_nonblocking(true).is_err() {
                    return;
                }
                info!("connected to gateway {}", self.gateway_addr);
                self.stream = Some(stream);
                self.inbox.clear();
                self.parse_errors = 0;
                // Anything queued against the old link is stale; the gateway
                // forgot us on disconnect, so registration must come first.
                self.outbox = SendQueue::new();
                let ip = control::ip_octets(&self.advertise);
                self.outbox.push(control::build_register(&ip, self.advertise.port()));
            }
            Err(e) => {
                debug!("gateway {} not reachable: {}", self.gateway_addr, e);
            }
        }
    }

    fn drop_link(&mut self, why: &str) {
        warn!("gateway link lost: {}", why);
        self.stream = None;
        self.inbox.clear();
    }

    /// Drive the link one tick: reconnect if needed, read and parse whatever
    /// the gateway sent, flush the outbound queue.
    pub fn service(&mut self, now: Instant) -> Vec<UplinkEvent> {
        if self.stream.is_none() {
            self.try_connect(now);
        }
        let mut events = Vec::new();
        let Some(mut stream) = self.stream.take() else {
            return events;
        };

        let mut alive = true;
        loop {
            match stream::read_into(&mut stream, &mut self.inbox) {
                Ok(StreamRead::Data(_)) => continue,
                Ok(StreamRead::WouldBlock) => break,
                Ok(StreamRead::Closed) => {
                    alive = false;
                    break;
                }
                Err(_) => {
                    alive = false;
                    break;
                }
            }
        }

        if alive {
            match self.parse_inbox(&mut events) {
                Ok(()) => {}
                Err(e) => {
                    warn!("gateway sent malformed data: {}", e);
                    self.parse_errors = self.parse_errors.saturating_add(1);
                    if self.parse_errors >= MAX_PARSE_ERRORS {
                        alive = false;
                    }
                }
            }
        }

        if alive {
            match self.outbox.flush(&mut stream) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => alive = false,
            }
        }

        if alive {
            self.stream = Some(stream);
        } else {
            self.drop_link("read/write failure");
        }
        events
    }

    fn parse_inbox(&mut self, events: &mut Vec<UplinkEvent>) -> Result<(), ProtocolError> {
        let mut offset = 0usize;
        loop {
            let start = offset;
            let cmd = match control::parse_header(&self.inbox, &mut offset) {
                Ok(Some(cmd)) => cmd,
                Ok(None) => break,
                Err(e) => {
                    self.inbox.clear();
                    return Err(e);
                }
            };
            match cmd {
                ControlCommand::Create => match control::read_gametype(&self.inbox, &mut offset)? {
                    Some(gametype) => events.push(UplinkEvent::CreateGame { gametype }),
                    None => {
                        offset = start;
                        break;
                    }
                },
                ControlCommand::Join => {
                    match control::read_join_reply(&self.inbox, &mut offset)? {
                        Some((game_id, _ip, _port)) => {
                            events.push(UplinkEvent::IncomingPlayer { game_id })
                        }
                        None => {
                            offset = start;
                            break;
                        }
                    }
                }
                ControlCommand::RegisterOk => events.push(UplinkEvent::Registered),
                ControlCommand::RegisterKo => events.push(UplinkEvent::Refused),
                ControlCommand::JoinKo | ControlCommand::CreateKo => {
                    debug!("gateway refusal: {:?}", cmd);
                }
                other => {
                    debug!("unexpected gateway command {:?}", other);
                }
            }
        }
        if offset > 0 {
            self.inbox.drain(..offset.min(self.inbox.len()));
        }
        Ok(())
    }
}
