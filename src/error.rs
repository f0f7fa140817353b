//! Error types for the starlane protocols.

use thiserror::Error;

/// Classification of a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseKind {
    /// Buffer ends before the field being read
    Truncated,
    /// Leading magic bytes do not match the protocol
    BadMagic,
    /// Unsupported protocol version
    BadVersion,
    /// Command byte outside the known set
    UnknownCommand,
    /// Length or size field inconsistent with the buffer
    BadLength,
    /// Channel bits outside the four defined channels
    BadChannel,
}

impl std::fmt::Display for ParseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseKind::Truncated => "truncated packet",
            ParseKind::BadMagic => "invalid magic number",
            ParseKind::BadVersion => "unsupported version",
            ParseKind::UnknownCommand => "unknown command",
            ParseKind::BadLength => "malformed length",
            ParseKind::BadChannel => "invalid channel",
        };
        f.write_str(s)
    }
}

/// Protocol-level errors that can occur during packet processing.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Packet failed to parse; carries the offending bytes for diagnostics
    #[error("{kind} - bytes: {}", hex_prefix(.offending))]
    Parse {
        /// What went wrong
        kind: ParseKind,
        /// Up to the first 32 bytes of the offending input
        offending: Vec<u8>,
    },
    /// Fragment payload exceeds the per-packet fragment limit
    #[error("fragment data too large")]
    FragmentTooLarge,
    /// Control command received from a handle that is not a registered game server
    #[error("command from unregistered game server")]
    UnknownGameServer,
    /// GAME_END for a game owned by a different game server
    #[error("game not owned by sender")]
    NotOwner,
    /// Stream accumulator grew past its bound
    #[error("receive buffer limit exceeded")]
    BufferOverflow,
}

impl ProtocolError {
    /// Build a parse error, keeping at most the first 32 offending bytes.
    pub fn parse(kind: ParseKind, offending: &[u8]) -> Self {
        let cap = offending.len().min(32);
        ProtocolError::Parse {
            kind,
            offending: offending[..cap].to_vec(),
        }
    }

    /// True for failures that a datagram receiver drops without touching
    /// peer state (wrong magic or wrong version).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            ProtocolError::Parse {
                kind: ParseKind::BadMagic | ParseKind::BadVersion,
                ..
            }
        )
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Reason a peer or connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Authentication failed or the challenge expired
    AuthFail,
    /// Too many malformed packets
    TooManyParseErrors,
    /// Peer asked to close (CLOSE flag or socket shutdown)
    PeerClosed,
    /// Stream accumulator exceeded its bound
    BufferOverflow,
    /// Peer went idle past the timeout
    Timeout,
}
