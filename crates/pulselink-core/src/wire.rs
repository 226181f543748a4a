//! Peer update wire format
//!
//! Every datagram is an 8-byte magic, a protocol version byte and a bincode
//! payload. Anything that does not decode to a well-formed [`PeerMessage`]
//! is rejected here so the merge engine only ever sees sane values.

use crate::ghost::SessionTimeline;
use crate::merge::Stamp;
use crate::start_stop::SessionStartStop;
use crate::types::{GhostTime, HostTime, PeerId, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Datagram prefix
pub const MAGIC: &[u8; 8] = b"_plink_v";

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound for an encoded message; larger datagrams are rejected unread
pub const MAX_DATAGRAM_SIZE: usize = 512;

const HEADER_LEN: usize = MAGIC.len() + 1;

/// Messages exchanged between peers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Periodic session state broadcast
    State {
        peer: PeerId,
        session: SessionId,
        /// Members the sender counts in its session, itself included
        members: u32,
        timeline: SessionTimeline,
        stamp: Stamp,
        /// Absent when the sender has start/stop sync disabled
        start_stop: Option<SessionStartStop>,
    },
    /// Clock measurement request
    Ping {
        from: PeerId,
        to: PeerId,
        host_send: HostTime,
    },
    /// Clock measurement reply carrying the responder's ghost time
    Pong {
        from: PeerId,
        to: PeerId,
        host_send: HostTime,
        ghost_now: GhostTime,
        session: SessionId,
    },
    /// The sender is leaving
    Bye { peer: PeerId },
}

impl PeerMessage {
    /// Sender of the message
    pub fn sender(&self) -> PeerId {
        match *self {
            PeerMessage::State { peer, .. } => peer,
            PeerMessage::Ping { from, .. } => from,
            PeerMessage::Pong { from, .. } => from,
            PeerMessage::Bye { peer } => peer,
        }
    }

    fn validate(&self) -> WireResult<()> {
        if self.sender().0 == 0 {
            return Err(WireError::Invalid("zero peer id"));
        }
        if let PeerMessage::State {
            members,
            timeline,
            stamp,
            start_stop,
            ..
        } = self
        {
            if *members == 0 {
                return Err(WireError::Invalid("empty session"));
            }
            if stamp.seq > Stamp::MAX_SEQ {
                return Err(WireError::Invalid("stamp sequence out of range"));
            }
            if !timeline.is_valid() {
                return Err(WireError::Invalid("timeline out of range"));
            }
            if matches!(start_stop, Some(ss) if ss.author.0 == 0) {
                return Err(WireError::Invalid("zero start/stop author"));
            }
        }
        Ok(())
    }
}

/// Errors decoding or encoding a datagram
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Datagram too short ({0} bytes)")]
    Truncated(usize),

    #[error("Datagram too large ({0} bytes)")]
    Oversized(usize),

    #[error("Bad magic")]
    BadMagic,

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Payload decode failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Invalid message: {0}")]
    Invalid(&'static str),
}

pub type WireResult<T> = Result<T, WireError>;

/// Encode a message into a datagram
pub fn encode(message: &PeerMessage) -> WireResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(MAGIC);
    buf.push(PROTOCOL_VERSION);
    bincode::serialize_into(&mut buf, message)?;
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(WireError::Oversized(buf.len()));
    }
    Ok(buf)
}

/// Decode and validate a datagram
pub fn decode(datagram: &[u8]) -> WireResult<PeerMessage> {
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(WireError::Oversized(datagram.len()));
    }
    if datagram.len() < HEADER_LEN {
        return Err(WireError::Truncated(datagram.len()));
    }
    if &datagram[..MAGIC.len()] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = datagram[MAGIC.len()];
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let message: PeerMessage = bincode::deserialize(&datagram[HEADER_LEN..])?;
    message.validate()?;
    Ok(message)
}
