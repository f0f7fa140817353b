//! Gateway protocol (GWP) packet format and serialization.
//!
//! A framed binary request/response protocol carried over reliable streams.
//! Every packet starts with a 5-byte header `MAGIC(2) VERSION(1) FLAGS(1)
//! CMD(1)`; the payload shape is fixed per command. The parser works against
//! a stream accumulator: it consumes complete packets and reports when more
//! bytes are needed, leaving a partial tail in place.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::error::{ParseKind, ProtocolError};

/// Leading magic bytes of every GWP packet ("BW").
pub const MAGIC: u16 = 0x4257;
/// Protocol version.
pub const VERSION: u8 = 1;
/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 5;

/// Command identifiers of the gateway protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Join a game (request from client, or reply carrying an endpoint)
    Join = 1,
    /// Join request failed
    JoinKo = 2,
    /// Create a new game
    Create = 3,
    /// Create request failed
    CreateKo = 4,
    /// A hosted game ended
    GameEnd = 5,
    /// Game-server registration
    Register = 20,
    /// Registration accepted
    RegisterOk = 21,
    /// Registration rejected
    RegisterKo = 22,
    /// Game-server load report
    Occupancy = 23,
    /// Batch of hosted game ids
    GameIds = 24,
}

impl ControlCommand {
    /// Create a ControlCommand from its wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Join),
            2 => Some(Self::JoinKo),
            3 => Some(Self::Create),
            4 => Some(Self::CreateKo),
            5 => Some(Self::GameEnd),
            20 => Some(Self::Register),
            21 => Some(Self::RegisterOk),
            22 => Some(Self::RegisterKo),
            23 => Some(Self::Occupancy),
            24 => Some(Self::GameIds),
            _ => None,
        }
    }
}

/// Parse a GWP header at `offset`.
///
/// Returns `Ok(None)` when the accumulator does not yet hold a full header.
/// On success the command is returned and `offset` points just past the
/// command byte.
pub fn parse_header(buf: &[u8], offset: &mut usize) -> Result<Option<ControlCommand>, ProtocolError> {
    let rest = &buf[*offset..];
    if rest.len() < HEADER_LEN {
        return Ok(None);
    }
    let magic = u16::from_be_bytes([rest[0], rest[1]]);
    if magic != MAGIC {
        return Err(ProtocolError::parse(ParseKind::BadMagic, rest));
    }
    if rest[2] != VERSION {
        return Err(ProtocolError::parse(ParseKind::BadVersion, rest));
    }
    let cmd = ControlCommand::from_byte(rest[4])
        .ok_or_else(|| ProtocolError::parse(ParseKind::UnknownCommand, rest))?;
    *offset += HEADER_LEN;
    Ok(Some(cmd))
}

fn read_u32(buf: &[u8], offset: &mut usize) -> Option<u32> {
    let rest = buf.get(*offset..*offset + 4)?;
    *offset += 4;
    Some(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]))
}

/// Read a `game_id(4)` payload (JOIN request, GAME_END).
///
/// `Ok(None)` means the payload is not complete yet.
pub fn read_game_id(buf: &[u8], offset: &mut usize) -> Result<Option<u32>, ProtocolError> {
    Ok(read_u32(buf, offset))
}

/// Read a `gametype(1)` payload (CREATE).
pub fn read_gametype(buf: &[u8], offset: &mut usize) -> Result<Option<u8>, ProtocolError> {
    match buf.get(*offset) {
        Some(&g) => {
            *offset += 1;
            Ok(Some(g))
        }
        None => Ok(None),
    }
}

/// Read an `occupancy(1)` payload.
pub fn read_occupancy(buf: &[u8], offset: &mut usize) -> Result<Option<u8>, ProtocolError> {
    read_gametype(buf, offset)
}

/// Read an `ip(16) port(2)` payload (GS registration).
pub fn read_endpoint(buf: &[u8], offset: &mut usize) -> Result<Option<([u8; 16], u16)>, ProtocolError> {
    let rest = match buf.get(*offset..*offset + 18) {
        Some(r) => r,
        None => return Ok(None),
    };
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&rest[..16]);
    let port = u16::from_be_bytes([rest[16], rest[17]]);
    *offset += 18;
    Ok(Some((ip, port)))
}

/// Read a `game_id(4) ip(16) port(2)` payload (JOIN reply).
pub fn read_join_reply(
    buf: &[u8],
    offset: &mut usize,
) -> Result<Option<(u32, [u8; 16], u16)>, ProtocolError> {
    if buf.len().saturating_sub(*offset) < 22 {
        return Ok(None);
    }
    let id = read_u32(buf, offset).expect("length checked");
    let (ip, port) = read_endpoint(buf, offset)?.expect("length checked");
    Ok(Some((id, ip, port)))
}

/// Read a `len(1) game_id(4)×len` payload (GID).
pub fn read_game_ids(buf: &[u8], offset: &mut usize) -> Result<Option<Vec<u32>>, ProtocolError> {
    let len = match buf.get(*offset) {
        Some(&l) => l as usize,
        None => return Ok(None),
    };
    if buf.len().saturating_sub(*offset) < 1 + len * 4 {
        return Ok(None);
    }
    *offset += 1;
    let mut ids = Vec::with_capacity(len);
    for _ in 0..len {
        ids.push(read_u32(buf, offset).expect("length checked"));
    }
    Ok(Some(ids))
}

fn build_header(cmd: ControlCommand, extra: usize) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(HEADER_LEN + extra);
    pkt.extend_from_slice(&MAGIC.to_be_bytes());
    pkt.push(VERSION);
    pkt.push(0);
    pkt.push(cmd as u8);
    pkt
}

/// Build a header-only packet (JOIN_KO, CREATE_KO, GS_OK, GS_KO).
pub fn build_simple(cmd: ControlCommand) -> Vec<u8> {
    build_header(cmd, 0)
}

/// Build a JOIN request: `game_id(4)`.
pub fn build_join_request(game_id: u32) -> Vec<u8> {
    let mut pkt = build_header(ControlCommand::Join, 4);
    pkt.extend_from_slice(&game_id.to_be_bytes());
    pkt
}

/// Build a JOIN reply: `game_id(4) ip(16) port(2)`.
pub fn build_join_reply(game_id: u32, ip: &[u8; 16], port: u16) -> Vec<u8> {
    let mut pkt = build_header(ControlCommand::Join, 22);
    pkt.extend_from_slice(&game_id.to_be_bytes());
    pkt.extend_from_slice(ip);
    pkt.extend_from_slice(&port.to_be_bytes());
    pkt
}

/// Build a CREATE: `gametype(1)`.
pub fn build_create(gametype: u8) -> Vec<u8> {
    let mut pkt = build_header(ControlCommand::Create, 1);
    pkt.push(gametype);
    pkt
}

/// Build a GAME_END: `game_id(4)`.
pub fn build_game_end(game_id: u32) -> Vec<u8> {
    let mut pkt = build_header(ControlCommand::GameEnd, 4);
    pkt.extend_from_slice(&game_id.to_be_bytes());
    pkt
}

/// Build a GS registration: `ip(16) port(2)`.
pub fn build_register(ip: &[u8; 16], port: u16) -> Vec<u8> {
    let mut pkt = build_header(ControlCommand::Register, 18);
    pkt.extend_from_slice(ip);
    pkt.extend_from_slice(&port.to_be_bytes());
    pkt
}

/// Build an OCCUPANCY report: `occupancy(1)`.
pub fn build_occupancy(occupancy: u8) -> Vec<u8> {
    let mut pkt = build_header(ControlCommand::Occupancy, 1);
    pkt.push(occupancy);
    pkt
}

/// Build a GID batch: `len(1) game_id(4)×len`.
///
/// At most 255 ids fit in one packet; longer lists must be split by the
/// caller.
pub fn build_game_ids(ids: &[u32]) -> Vec<u8> {
    debug_assert!(ids.len() <= u8::MAX as usize);
    let mut pkt = build_header(ControlCommand::GameIds, 1 + ids.len() * 4);
    pkt.push(ids.len() as u8);
    for id in ids {
        pkt.extend_from_slice(&id.to_be_bytes());
    }
    pkt
}

/// 16-byte wire form of an address: IPv6 octets, IPv4 mapped to
/// `::ffff:a.b.c.d`.
pub fn ip_octets(addr: &SocketAddr) -> [u8; 16] {
    match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Reconstruct a socket address from its wire form.
pub fn endpoint_from_octets(ip: &[u8; 16], port: u16) -> SocketAddr {
    let v6 = Ipv6Addr::from(*ip);
    match v6.to_ipv4_mapped() {
        Some(v4) => SocketAddr::new(IpAddr::V4(v4), port),
        None => SocketAddr::new(IpAddr::V6(v6), port),
    }
}
