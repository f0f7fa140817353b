//! Gateway process: a single-threaded event loop over non-blocking TCP
//! connections, feeding the [`Router`].
//!
//! Each tick accepts pending connections, reads whatever every connection has
//! to offer into its accumulator, consumes complete control packets (leaving
//! a partial tail in place), and flushes outbound queues. Backpressure is
//! per-connection: an `EWOULDBLOCK` leaves the queue for the next tick.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::control::{self, ControlCommand};
use crate::error::CloseReason;
use crate::router::{Handle, Router};
use crate::stream::{self, SendQueue, StreamRead};

/// Malformed packets tolerated on one connection before it is closed.
pub const MAX_PARSE_ERRORS: u8 = 3;
/// Event-loop tick, the only place the process waits.
const TICK: Duration = Duration::from_millis(1);

struct GatewayConn {
    stream: TcpStream,
    addr: SocketAddr,
    inbox: Vec<u8>,
    outbox: SendQueue,
    parse_errors: u8,
}

/// The gateway process.
pub struct Gateway {
    listener: TcpListener,
    router: Router,
    conns: HashMap<Handle, GatewayConn>,
    next_handle: Handle,
    shutdown: Arc<AtomicBool>,
}

impl Gateway {
    /// Bind the gateway listener.
    pub fn bind(listen: SocketAddr, shutdown: Arc<AtomicBool>) -> io::Result<Self> {
        let listener = TcpListener::bind(listen)?;
        listener.set_nonblocking(true)?;
        info!("gateway listening on {}", listen);
        Ok(Self {
            listener,
            router: Router::new(),
            conns: HashMap::new(),
            next_handle: 1,
            shutdown,
        })
    }

    /// Run until the shutdown flag is raised.
    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.tick();
            std::thread::sleep(TICK);
        }
        info!("gateway shutting down");
    }

    /// One iteration of the event loop. Public so tests can drive the loop
    /// without threads.
    pub fn tick(&mut self) {
        self.accept_pending();

        let handles: Vec<Handle> = self.conns.keys().copied().collect();
        for handle in handles {
            if let Some(reason) = self.service_conn(handle) {
                self.close_conn(handle, reason);
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let handle = self.next_handle;
                    self.next_handle += 1;
                    debug!("accepted {} as handle {}", addr, handle);
                    self.conns.insert(
                        handle,
                        GatewayConn {
                            stream,
                            addr,
                            inbox: Vec::new(),
                            outbox: SendQueue::new(),
                            parse_errors: 0,
                        },
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Service one connection; a returned reason means it must be closed.
    fn service_conn(&mut self, handle: Handle) -> Option<CloseReason> {
        // Read phase.
        {
            let conn = self.conns.get_mut(&handle)?;
            loop {
                match stream::read_into(&mut conn.stream, &mut conn.inbox) {
                    Ok(StreamRead::Data(_)) => continue,
                    Ok(StreamRead::WouldBlock) => break,
                    Ok(StreamRead::Closed) => return Some(CloseReason::PeerClosed),
                    Err(_) => return Some(CloseReason::BufferOverflow),
                }
            }
        }

        // Parse phase.
        if let Some(reason) = self.parse_conn(handle) {
            return Some(reason);
        }

        // Write phase.
        let conn = self.conns.get_mut(&handle)?;
        match conn.outbox.flush(&mut conn.stream) {
            Ok(_) => None,
            Err(e) => {
                warn!("send to {} failed: {}", conn.addr, e);
                Some(CloseReason::PeerClosed)
            }
        }
    }

    /// Consume complete packets from the connection's accumulator.
    fn parse_conn(&mut self, handle: Handle) -> Option<CloseReason> {
        let mut offset = 0usize;
        let mut sends: Vec<(Handle, Vec<u8>)> = Vec::new();
        let mut close = None;

        {
            let inbox = std::mem::take(&mut self.conns.get_mut(&handle)?.inbox);
            loop {
                let start = offset;
                let cmd = match control::parse_header(&inbox, &mut offset) {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("parse error on handle {}: {}", handle, e);
                        close = self.record_parse_error(handle);
                        // A bad header desynchronizes the stream; drop the rest.
                        offset = inbox.len();
                        break;
                    }
                };

                match self.dispatch(handle, cmd, &inbox, &mut offset, &mut sends) {
                    Ok(true) => continue,
                    Ok(false) => {
                        // Payload incomplete: rewind to the packet start and
                        // wait for more bytes.
                        offset = start;
                        break;
                    }
                    Err(e) => {
                        warn!("handle {}: {}", handle, e);
                        close = self.record_parse_error(handle);
                        if close.is_some() {
                            break;
                        }
                    }
                }
            }

            let conn = self.conns.get_mut(&handle)?;
            conn.inbox = inbox;
            if offset > 0 {
                conn.inbox.drain(..offset.min(conn.inbox.len()));
            }
        }

        for (to, packet) in sends {
            self.queue_send(to, packet);
        }
        close
    }

    /// Dispatch one command. `Ok(false)` means the payload is not complete yet.
    fn dispatch(
        &mut self,
        handle: Handle,
        cmd: ControlCommand,
        buf: &[u8],
        offset: &mut usize,
        sends: &mut Vec<(Handle, Vec<u8>)>,
    ) -> Result<bool, crate::error::ProtocolError> {
        match cmd {
            ControlCommand::Register => {
                let (ip, port) = match control::read_endpoint(buf, offset)? {
                    Some(v) => v,
                    None => return Ok(false),
                };
                sends.push(self.router.handle_register(handle, ip, port));
            }
            ControlCommand::Occupancy => {
                let occ = match control::read_occupancy(buf, offset)? {
                    Some(v) => v,
                    None => return Ok(false),
                };
                self.router.handle_occupancy(handle, occ)?;
            }
            ControlCommand::GameIds => {
                let ids = match control::read_game_ids(buf, offset)? {
                    Some(v) => v,
                    None => return Ok(false),
                };
                self.router.handle_game_ids(handle, &ids)?;
            }
            ControlCommand::Create => {
                let gametype = match control::read_gametype(buf, offset)? {
                    Some(v) => v,
                    None => return Ok(false),
                };
                sends.push(self.router.handle_create(handle, gametype));
            }
            ControlCommand::Join => {
                if self.router.expects_create_reply(handle) {
                    let (game_id, ip, port) = match control::read_join_reply(buf, offset)? {
                        Some(v) => v,
                        None => return Ok(false),
                    };
                    if let Some(send) = self.router.handle_create_reply(handle, game_id, ip, port) {
                        sends.push(send);
                    }
                } else {
                    let game_id = match control::read_game_id(buf, offset)? {
                        Some(v) => v,
                        None => return Ok(false),
                    };
                    sends.push(self.router.handle_join_request(handle, game_id));
                }
            }
            ControlCommand::GameEnd => {
                let game_id = match control::read_game_id(buf, offset)? {
                    Some(v) => v,
                    None => return Ok(false),
                };
                self.router.handle_game_end(handle, game_id)?;
            }
            // Acknowledgments need no action beyond consuming the header.
            ControlCommand::JoinKo
            | ControlCommand::CreateKo
            | ControlCommand::RegisterOk
            | ControlCommand::RegisterKo => {}
        }
        Ok(true)
    }

    fn record_parse_error(&mut self, handle: Handle) -> Option<CloseReason> {
        let conn = self.conns.get_mut(&handle)?;
        conn.parse_errors = conn.parse_errors.saturating_add(1);
        if conn.parse_errors >= MAX_PARSE_ERRORS {
            Some(CloseReason::TooManyParseErrors)
        } else {
            None
        }
    }

    fn queue_send(&mut self, handle: Handle, packet: Vec<u8>) {
        match self.conns.get_mut(&handle) {
            Some(conn) => conn.outbox.push(packet),
            // The recipient vanished between dispatch and queueing.
            None => debug!("dropping packet for closed handle {}", handle),
        }
    }

    fn close_conn(&mut self, handle: Handle, reason: CloseReason) {
        if let Some(conn) = self.conns.remove(&handle) {
            info!("closing {} (handle {}): {:?}", conn.addr, handle, reason);
        }
        for (to, packet) in self.router.handle_disconnect(handle) {
            self.queue_send(to, packet);
        }
    }

    /// Router state, for inspection by tests and the binaries.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn start_gateway() -> (Gateway, SocketAddr) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let gw = Gateway::bind("127.0.0.1:0".parse().unwrap(), shutdown).unwrap();
        let addr = gw.local_addr().unwrap();
        (gw, addr)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let s = TcpStream::connect(addr).unwrap();
        s.set_nonblocking(false).unwrap();
        s.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        s
    }

    fn settle(gw: &mut Gateway) {
        for _ in 0..20 {
            gw.tick();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn gs_registration_end_to_end() {
        let (mut gw, addr) = start_gateway();
        let mut gs = connect(addr);

        gs.write_all(&control::build_register(&[0u8; 16], 4096)).unwrap();
        settle(&mut gw);
        assert_eq!(gw.router().registered(), 1);

        let mut resp = [0u8; 5];
        gs.read_exact(&mut resp).unwrap();
        assert_eq!(resp, [0x42, 0x57, 0x01, 0x00, 0x15]);
    }

    #[test]
    fn create_round_trip_through_gateway() {
        let (mut gw, addr) = start_gateway();
        let mut gs = connect(addr);
        gs.write_all(&control::build_register(&[0u8; 16], 4096)).unwrap();
        settle(&mut gw);

        let mut client = connect(addr);
        client.write_all(&control::build_create(1)).unwrap();
        settle(&mut gw);

        // The GS sees GS_OK then the forwarded CREATE.
        let mut buf = [0u8; 11];
        gs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..5], &[0x42, 0x57, 0x01, 0x00, 0x15]);
        assert_eq!(&buf[5..], &control::build_create(1)[..]);

        // GS answers with the created game's endpoint.
        let ip = control::ip_octets(&"10.1.2.3:0".parse().unwrap());
        gs.write_all(&control::build_join_reply(42, &ip, 5555)).unwrap();
        settle(&mut gw);

        let mut reply = [0u8; 27];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(
            &reply[..9],
            &[0x42, 0x57, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x2A]
        );
        assert_eq!(gw.router().owner_of(42), Some((ip, 5555)));
    }

    #[test]
    fn malformed_packets_close_after_three() {
        let (mut gw, addr) = start_gateway();
        let mut client = connect(addr);
        settle(&mut gw);
        assert_eq!(gw.connections(), 1);

        for _ in 0..3 {
            client.write_all(&[0xFF; 5]).unwrap();
            settle(&mut gw);
        }
        assert_eq!(gw.connections(), 0);
    }

    #[test]
    fn partial_packet_waits_without_error() {
        let (mut gw, addr) = start_gateway();
        let mut gs = connect(addr);

        let pkt = control::build_register(&[0u8; 16], 4096);
        gs.write_all(&pkt[..10]).unwrap();
        settle(&mut gw);
        assert_eq!(gw.router().registered(), 0);
        assert_eq!(gw.connections(), 1);

        gs.write_all(&pkt[10..]).unwrap();
        settle(&mut gw);
        assert_eq!(gw.router().registered(), 1);
    }

    #[test]
    fn gs_disconnect_fails_pending_create() {
        let (mut gw, addr) = start_gateway();
        let mut gs = connect(addr);
        gs.write_all(&control::build_register(&[0u8; 16], 4096)).unwrap();
        settle(&mut gw);

        let mut client = connect(addr);
        client.write_all(&control::build_create(1)).unwrap();
        settle(&mut gw);

        drop(gs);
        settle(&mut gw);

        let mut resp = [0u8; 5];
        client.read_exact(&mut resp).unwrap();
        assert_eq!(resp[4], ControlCommand::CreateKo as u8);
        assert_eq!(gw.router().registered(), 0);
    }
}
