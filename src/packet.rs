//! Game-server protocol (GSP) packet format and serialization.
//!
//! Every GSP datagram starts with a fixed 21-byte header:
//! `MAGIC(2) VERSION(1) FLAGS(1) SEQ(4) ACK_BASE(4) ACK_BITS(1) CHANNEL(1)
//! SIZE(2) CLIENT_ID(4) CMD(1)`, all integers big-endian. `SIZE` is the total
//! packet length including the header.

use crate::channel::{flags, Channel};
use crate::error::{ParseKind, ProtocolError};

/// Leading magic bytes of every GSP datagram ("BT").
pub const MAGIC: u16 = 0x4254;
/// Protocol version.
pub const VERSION: u8 = 1;
/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 21;
/// Largest datagram the protocol will emit or accept.
pub const MAX_PACKET_SIZE: usize = 1200;
/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_LEN;
/// Bytes of fragment bookkeeping inside a FRAGMENT payload.
pub const FRAGMENT_OVERHEAD: usize = 12;
/// Largest slice of message data a single FRAGMENT can carry.
pub const MAX_FRAGMENT_DATA: usize = MAX_PAYLOAD_SIZE - FRAGMENT_OVERHEAD;

/// Command identifiers used during gameplay.
///
/// Numbers 3 (chat) and 6 (explicit ack) are reserved on the wire but carry
/// no behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Player input pairs
    Input = 1,
    /// Game state snapshot
    Snapshot = 2,
    /// Latency measurement request
    Ping = 4,
    /// Latency measurement response
    Pong = 5,
    /// Join a game session
    Join = 7,
    /// Player removed from the game
    Kick = 8,
    /// Authentication challenge
    Challenge = 9,
    /// Authentication response
    Auth = 10,
    /// Authentication successful
    AuthOk = 11,
    /// Request full state resynchronization
    Resync = 12,
    /// Fragment of a larger message
    Fragment = 13,
}

impl Command {
    /// Create a Command from its wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Input),
            2 => Some(Self::Snapshot),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            7 => Some(Self::Join),
            8 => Some(Self::Kick),
            9 => Some(Self::Challenge),
            10 => Some(Self::Auth),
            11 => Some(Self::AuthOk),
            12 => Some(Self::Resync),
            13 => Some(Self::Fragment),
            _ => None,
        }
    }
}

/// Decoded GSP packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Flag bits (see [`crate::channel::flags`])
    pub flags: u8,
    /// Sender-assigned sequence number
    pub seq: u32,
    /// Highest sequence the sender has received from us
    pub ack_base: u32,
    /// Selective-ACK window relative to `ack_base`
    pub ack_bits: u8,
    /// Delivery channel
    pub channel: Channel,
    /// Total packet length including the header
    pub size: u16,
    /// Client identifier
    pub client_id: u32,
    /// Command
    pub cmd: Command,
}

impl PacketHeader {
    /// Decode a header from the start of a datagram.
    ///
    /// Validates magic, version, channel, command, and that `size` is
    /// consistent with the buffer. On success the payload occupies
    /// `buf[HEADER_LEN..size]`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::parse(ParseKind::Truncated, buf));
        }
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return Err(ProtocolError::parse(ParseKind::BadMagic, buf));
        }
        if buf[2] != VERSION {
            return Err(ProtocolError::parse(ParseKind::BadVersion, buf));
        }
        let flags = buf[3];
        let seq = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ack_base = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let ack_bits = buf[12];
        let channel =
            Channel::from_bits(buf[13]).ok_or_else(|| ProtocolError::parse(ParseKind::BadChannel, buf))?;
        let size = u16::from_be_bytes([buf[14], buf[15]]);
        let client_id = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let cmd = Command::from_byte(buf[20])
            .ok_or_else(|| ProtocolError::parse(ParseKind::UnknownCommand, buf))?;

        if (size as usize) < HEADER_LEN || (size as usize) > buf.len() {
            return Err(ProtocolError::parse(ParseKind::BadLength, buf));
        }

        Ok(Self {
            flags,
            seq,
            ack_base,
            ack_bits,
            channel,
            size,
            client_id,
            cmd,
        })
    }
}

/// Reliability fields stamped onto an outgoing packet.
///
/// Produced by the per-peer connection state; the codec never invents
/// sequence numbers of its own.
#[derive(Clone, Copy, Debug)]
pub struct Stamp {
    /// Sequence number for this packet
    pub seq: u32,
    /// Highest sequence received from the peer
    pub ack_base: u32,
    /// Selective-ACK window relative to `ack_base`
    pub ack_bits: u8,
    /// Client this packet addresses
    pub client_id: u32,
}

fn build_header(cmd: Command, flags: u8, stamp: Stamp, channel: Channel, size: u16) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(size as usize);
    pkt.extend_from_slice(&MAGIC.to_be_bytes());
    pkt.push(VERSION);
    pkt.push(flags);
    pkt.extend_from_slice(&stamp.seq.to_be_bytes());
    pkt.extend_from_slice(&stamp.ack_base.to_be_bytes());
    pkt.push(stamp.ack_bits);
    pkt.push(channel as u8);
    pkt.extend_from_slice(&size.to_be_bytes());
    pkt.extend_from_slice(&stamp.client_id.to_be_bytes());
    pkt.push(cmd as u8);
    pkt
}

/// Build a bare packet for a command that carries no payload.
pub fn build_bare(cmd: Command, flags: u8, stamp: Stamp, channel: Channel) -> Vec<u8> {
    build_header(cmd, flags, stamp, channel, HEADER_LEN as u16)
}

/// Build a PING keepalive (UU channel, CONN flag, no payload).
pub fn build_ping(stamp: Stamp) -> Vec<u8> {
    build_bare(Command::Ping, flags::CONN, stamp, Channel::UnreliableUnordered)
}

/// Build a PONG reply (UU channel, CONN flag, no payload).
pub fn build_pong(stamp: Stamp) -> Vec<u8> {
    build_bare(Command::Pong, flags::CONN, stamp, Channel::UnreliableUnordered)
}

/// Build a KICK notification (RO channel, RELIABLE flag, no payload).
pub fn build_kick(stamp: Stamp) -> Vec<u8> {
    build_bare(Command::Kick, flags::RELIABLE, stamp, Channel::ReliableOrdered)
}

/// Build a JOIN request: `client_id(4) nonce(1) version(1)`.
pub fn build_join(stamp: Stamp, nonce: u8) -> Vec<u8> {
    let size = (HEADER_LEN + 6) as u16;
    let mut pkt = build_header(Command::Join, flags::CONN, stamp, Channel::ReliableOrdered, size);
    pkt.extend_from_slice(&stamp.client_id.to_be_bytes());
    pkt.push(nonce);
    pkt.push(VERSION);
    pkt
}

/// Build a CHALLENGE: `timestamp(8) cookie(32)` on RO with the RELIABLE flag.
pub fn build_challenge(stamp: Stamp, timestamp: u64, cookie: &[u8; 32]) -> Vec<u8> {
    let size = (HEADER_LEN + 8 + 32) as u16;
    let mut pkt = build_header(
        Command::Challenge,
        flags::RELIABLE,
        stamp,
        Channel::ReliableOrdered,
        size,
    );
    pkt.extend_from_slice(&timestamp.to_be_bytes());
    pkt.extend_from_slice(cookie);
    pkt
}

/// Build an AUTH response: `nonce(1) cookie(32)`.
pub fn build_auth(stamp: Stamp, nonce: u8, cookie: &[u8; 32]) -> Vec<u8> {
    let size = (HEADER_LEN + 1 + 32) as u16;
    let mut pkt = build_header(Command::Auth, flags::RELIABLE, stamp, Channel::ReliableOrdered, size);
    pkt.push(nonce);
    pkt.extend_from_slice(cookie);
    pkt
}

/// Build an AUTH_OK: `client_id(4) session_key(8)` on RO.
pub fn build_auth_ok(stamp: Stamp, session_key: &[u8; 8]) -> Vec<u8> {
    let size = (HEADER_LEN + 4 + 8) as u16;
    let mut pkt = build_header(
        Command::AuthOk,
        flags::RELIABLE,
        stamp,
        Channel::ReliableOrdered,
        size,
    );
    pkt.extend_from_slice(&stamp.client_id.to_be_bytes());
    pkt.extend_from_slice(session_key);
    pkt
}

/// Build an INPUT packet from `(type, value)` pairs.
pub fn build_input(stamp: Stamp, pairs: &[(u8, u8)]) -> Vec<u8> {
    let size = (HEADER_LEN + pairs.len() * 2) as u16;
    let mut pkt = build_header(Command::Input, 0, stamp, Channel::UnreliableOrdered, size);
    for &(kind, value) in pairs {
        pkt.push(kind);
        pkt.push(value);
    }
    pkt
}

/// Build a single FRAGMENT packet: `base_seq(4) total_size(4) offset(4) bytes`.
///
/// Fails when `data` exceeds [`MAX_FRAGMENT_DATA`].
pub fn build_fragment(
    stamp: Stamp,
    base_seq: u32,
    total_size: u32,
    offset: u32,
    data: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if data.len() > MAX_FRAGMENT_DATA {
        return Err(ProtocolError::FragmentTooLarge);
    }
    let size = (HEADER_LEN + FRAGMENT_OVERHEAD + data.len()) as u16;
    let mut pkt = build_header(
        Command::Fragment,
        flags::RELIABLE | flags::FRAGMENT,
        stamp,
        Channel::ReliableOrdered,
        size,
    );
    pkt.extend_from_slice(&base_seq.to_be_bytes());
    pkt.extend_from_slice(&total_size.to_be_bytes());
    pkt.extend_from_slice(&offset.to_be_bytes());
    pkt.extend_from_slice(data);
    Ok(pkt)
}

/// Number of packets [`build_snapshot`] will emit for a state of `state_len`
/// bytes. Callers use this to reserve sequence numbers up front.
pub fn snapshot_packet_count(state_len: usize) -> usize {
    let message_len = 4 + state_len;
    if message_len <= MAX_PAYLOAD_SIZE {
        1
    } else {
        (message_len + MAX_FRAGMENT_DATA - 1) / MAX_FRAGMENT_DATA
    }
}

/// Build a SNAPSHOT, fragmenting automatically when the message does not fit.
///
/// The logical message is `snapshot_seq(4) state(N)`. When it fits in one
/// payload a single SNAPSHOT packet is returned; otherwise the message is cut
/// into FRAGMENT packets of up to [`MAX_FRAGMENT_DATA`] bytes each, with
/// `base_seq = stamp.seq` and consecutive sequence numbers. The caller must
/// advance its send sequence by the number of packets returned.
pub fn build_snapshot(stamp: Stamp, snapshot_seq: u32, state: &[u8]) -> Vec<Vec<u8>> {
    let mut message = Vec::with_capacity(4 + state.len());
    message.extend_from_slice(&snapshot_seq.to_be_bytes());
    message.extend_from_slice(state);

    if message.len() <= MAX_PAYLOAD_SIZE {
        let size = (HEADER_LEN + message.len()) as u16;
        let mut pkt = build_header(
            Command::Snapshot,
            flags::RELIABLE,
            stamp,
            Channel::ReliableOrdered,
            size,
        );
        pkt.extend_from_slice(&message);
        return vec![pkt];
    }

    let total_size = message.len() as u32;
    let mut packets = Vec::with_capacity(message.len() / MAX_FRAGMENT_DATA + 1);
    let mut offset = 0usize;
    while offset < message.len() {
        let chunk = (message.len() - offset).min(MAX_FRAGMENT_DATA);
        let frag_stamp = Stamp {
            seq: stamp.seq.wrapping_add(packets.len() as u32),
            ..stamp
        };
        // Chunk length is bounded by MAX_FRAGMENT_DATA, so build_fragment
        // cannot fail here.
        let pkt = build_fragment(
            frag_stamp,
            stamp.seq,
            total_size,
            offset as u32,
            &message[offset..offset + chunk],
        )
        .expect("fragment chunk within limit");
        packets.push(pkt);
        offset += chunk;
    }
    packets
}

/// Payload of a FRAGMENT packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentPayload {
    /// Sequence of the first packet of the fragmented message
    pub base_seq: u32,
    /// Total length of the reassembled message
    pub total_size: u32,
    /// Byte offset this fragment covers
    pub offset: u32,
    /// Fragment data
    pub data: Vec<u8>,
}

/// Parse the payload of a FRAGMENT packet.
pub fn parse_fragment(payload: &[u8]) -> Result<FragmentPayload, ProtocolError> {
    if payload.len() < FRAGMENT_OVERHEAD {
        return Err(ProtocolError::parse(ParseKind::Truncated, payload));
    }
    Ok(FragmentPayload {
        base_seq: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
        total_size: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        offset: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
        data: payload[FRAGMENT_OVERHEAD..].to_vec(),
    })
}

/// Parse a JOIN payload: `client_id(4) nonce(1) version(1)`.
pub fn parse_join(payload: &[u8]) -> Result<(u32, u8, u8), ProtocolError> {
    if payload.len() < 6 {
        return Err(ProtocolError::parse(ParseKind::Truncated, payload));
    }
    let client_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((client_id, payload[4], payload[5]))
}

/// Parse an AUTH payload: `nonce(1) cookie(32)`.
pub fn parse_auth(payload: &[u8]) -> Result<(u8, [u8; 32]), ProtocolError> {
    if payload.len() < 33 {
        return Err(ProtocolError::parse(ParseKind::Truncated, payload));
    }
    let mut cookie = [0u8; 32];
    cookie.copy_from_slice(&payload[1..33]);
    Ok((payload[0], cookie))
}

/// Parse a CHALLENGE payload: `timestamp(8) cookie(32)`.
pub fn parse_challenge(payload: &[u8]) -> Result<(u64, [u8; 32]), ProtocolError> {
    if payload.len() < 40 {
        return Err(ProtocolError::parse(ParseKind::Truncated, payload));
    }
    let ts = u64::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], payload[6],
        payload[7],
    ]);
    let mut cookie = [0u8; 32];
    cookie.copy_from_slice(&payload[8..40]);
    Ok((ts, cookie))
}

/// Parse an AUTH_OK payload: `client_id(4) session_key(8)`.
pub fn parse_auth_ok(payload: &[u8]) -> Result<(u32, [u8; 8]), ProtocolError> {
    if payload.len() < 12 {
        return Err(ProtocolError::parse(ParseKind::Truncated, payload));
    }
    let client_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let mut key = [0u8; 8];
    key.copy_from_slice(&payload[4..12]);
    Ok((client_id, key))
}

/// Parse an INPUT payload into `(type, value)` pairs.
///
/// A trailing odd byte is a malformed packet.
pub fn parse_input(payload: &[u8]) -> Result<Vec<(u8, u8)>, ProtocolError> {
    if payload.len() % 2 != 0 {
        return Err(ProtocolError::parse(ParseKind::BadLength, payload));
    }
    Ok(payload.chunks_exact(2).map(|p| (p[0], p[1])).collect())
}

/// Parse a SNAPSHOT payload: `snapshot_seq(4) state(N)`.
pub fn parse_snapshot(payload: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::parse(ParseKind::Truncated, payload));
    }
    let seq = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((seq, &payload[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> Stamp {
        Stamp {
            seq: 9,
            ack_base: 4,
            ack_bits: 0b1010_0001,
            client_id: 77,
        }
    }

    #[test]
    fn header_roundtrip() {
        let pkt = build_ping(stamp());
        assert_eq!(pkt.len(), HEADER_LEN);
        let hdr = PacketHeader::decode(&pkt).unwrap();
        assert_eq!(hdr.cmd, Command::Ping);
        assert_eq!(hdr.flags, flags::CONN);
        assert_eq!(hdr.seq, 9);
        assert_eq!(hdr.ack_base, 4);
        assert_eq!(hdr.ack_bits, 0b1010_0001);
        assert_eq!(hdr.channel, Channel::UnreliableUnordered);
        assert_eq!(hdr.size as usize, HEADER_LEN);
        assert_eq!(hdr.client_id, 77);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut pkt = build_ping(stamp());
        pkt[0] = 0xFF;
        assert!(PacketHeader::decode(&pkt).unwrap_err().is_silent_drop());

        let mut pkt = build_ping(stamp());
        pkt[2] = 9;
        assert!(PacketHeader::decode(&pkt).unwrap_err().is_silent_drop());
    }

    #[test]
    fn rejects_short_and_inconsistent_size() {
        assert!(PacketHeader::decode(&[0x42, 0x54, 1]).is_err());

        let mut pkt = build_ping(stamp());
        pkt[14..16].copy_from_slice(&(MAX_PACKET_SIZE as u16).to_be_bytes());
        assert!(matches!(
            PacketHeader::decode(&pkt),
            Err(ProtocolError::Parse {
                kind: ParseKind::BadLength,
                ..
            })
        ));
    }

    #[test]
    fn challenge_roundtrip() {
        let cookie = [0x5A; 32];
        let pkt = build_challenge(stamp(), 1_700_000_000, &cookie);
        let hdr = PacketHeader::decode(&pkt).unwrap();
        assert_eq!(hdr.cmd, Command::Challenge);
        assert_eq!(hdr.channel, Channel::ReliableOrdered);
        let (ts, got) = parse_challenge(&pkt[HEADER_LEN..]).unwrap();
        assert_eq!(ts, 1_700_000_000);
        assert_eq!(got, cookie);
    }

    #[test]
    fn auth_ok_roundtrip() {
        let key = [1, 2, 3, 4, 5, 6, 7, 8];
        let pkt = build_auth_ok(stamp(), &key);
        let (cid, got) = parse_auth_ok(&pkt[HEADER_LEN..]).unwrap();
        assert_eq!(cid, 77);
        assert_eq!(got, key);
    }

    #[test]
    fn join_and_auth_roundtrip() {
        let pkt = build_join(stamp(), 0xAB);
        let (cid, nonce, ver) = parse_join(&pkt[HEADER_LEN..]).unwrap();
        assert_eq!((cid, nonce, ver), (77, 0xAB, VERSION));

        let cookie = [7u8; 32];
        let pkt = build_auth(stamp(), 0xAB, &cookie);
        let (nonce, got) = parse_auth(&pkt[HEADER_LEN..]).unwrap();
        assert_eq!(nonce, 0xAB);
        assert_eq!(got, cookie);
    }

    #[test]
    fn input_roundtrip_and_odd_length() {
        let pkt = build_input(stamp(), &[(1, 200), (3, 4)]);
        let pairs = parse_input(&pkt[HEADER_LEN..]).unwrap();
        assert_eq!(pairs, vec![(1, 200), (3, 4)]);

        assert!(parse_input(&[1]).is_err());
    }

    #[test]
    fn snapshot_fits_single_packet_at_limit() {
        // 4-byte snapshot_seq + 1175 bytes of state is exactly the payload cap.
        let state = vec![0xCD; MAX_PAYLOAD_SIZE - 4];
        let packets = build_snapshot(stamp(), 3, &state);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), MAX_PACKET_SIZE);
        let hdr = PacketHeader::decode(&packets[0]).unwrap();
        assert_eq!(hdr.cmd, Command::Snapshot);
        let (sseq, data) = parse_snapshot(&packets[0][HEADER_LEN..]).unwrap();
        assert_eq!(sseq, 3);
        assert_eq!(data, &state[..]);
    }

    #[test]
    fn snapshot_one_byte_over_limit_fragments() {
        let state = vec![0xCD; MAX_PAYLOAD_SIZE - 3];
        let packets = build_snapshot(stamp(), 3, &state);
        assert!(packets.len() > 1);
        for pkt in &packets {
            let hdr = PacketHeader::decode(pkt).unwrap();
            assert_eq!(hdr.cmd, Command::Fragment);
            assert_eq!(hdr.flags, flags::RELIABLE | flags::FRAGMENT);
        }
    }

    #[test]
    fn snapshot_fragment_count_and_sequences() {
        let state = vec![0u8; 3000];
        let packets = build_snapshot(stamp(), 1, &state);
        // 3004-byte message in chunks of MAX_FRAGMENT_DATA
        let expected = (3004 + MAX_FRAGMENT_DATA - 1) / MAX_FRAGMENT_DATA;
        assert_eq!(packets.len(), expected);
        assert_eq!(expected, 3);
        assert_eq!(snapshot_packet_count(3000), expected);
        assert_eq!(snapshot_packet_count(MAX_PAYLOAD_SIZE - 4), 1);

        let mut total = 0usize;
        for (i, pkt) in packets.iter().enumerate() {
            let hdr = PacketHeader::decode(pkt).unwrap();
            assert_eq!(hdr.seq, 9 + i as u32);
            let frag = parse_fragment(&pkt[HEADER_LEN..]).unwrap();
            assert_eq!(frag.base_seq, 9);
            assert_eq!(frag.total_size, 3004);
            total += frag.data.len();
        }
        assert_eq!(total, 3004);
    }

    #[test]
    fn fragment_rejects_oversized_data() {
        let data = vec![0u8; MAX_FRAGMENT_DATA + 1];
        assert!(matches!(
            build_fragment(stamp(), 1, 10, 0, &data),
            Err(ProtocolError::FragmentTooLarge)
        ));
    }

    #[test]
    fn fragment_payload_roundtrip() {
        let pkt = build_fragment(stamp(), 40, 100, 24, &[9, 8, 7]).unwrap();
        let frag = parse_fragment(&pkt[HEADER_LEN..]).unwrap();
        assert_eq!(frag.base_seq, 40);
        assert_eq!(frag.total_size, 100);
        assert_eq!(frag.offset, 24);
        assert_eq!(frag.data, vec![9, 8, 7]);
    }
}
