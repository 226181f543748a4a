//! Peer Update Channel boundary
//!
//! The engine only needs to push datagrams to every peer and pull whatever
//! arrives. Delivery is best effort: datagrams may be lost, duplicated or
//! reordered, and the periodic re-broadcast takes care of the rest.

mod loopback;

pub use loopback::{LoopbackHub, LoopbackTransport};

use crate::types::PeerId;
use std::time::Duration;
use thiserror::Error;

/// Something that arrived from the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A raw datagram from some peer
    Datagram(Vec<u8>),
    /// The transport knows a peer is gone
    PeerLost(PeerId),
}

/// Errors raised by a transport implementation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Broadcast datagram channel shared by the controller and receive threads
pub trait PeerTransport: Send + Sync {
    /// Send one datagram to every reachable peer
    fn send(&self, datagram: &[u8]) -> TransportResult<()>;

    /// Wait up to `timeout` for the next inbound event
    ///
    /// Returns `Ok(None)` on timeout. Implementations must not block past
    /// `timeout`, so the receive thread can notice shutdown.
    fn recv(&self, timeout: Duration) -> TransportResult<Option<TransportEvent>>;
}
