//! Pulselink Core - peer-to-peer tempo, beat grid and start/stop sync
//!
//! Peers on a network form sessions that share one tempo, one beat grid and
//! one playing/stopped state. There is no leader: every peer can change the
//! session and the change reaches everyone else.
//!
//! The entry point is [`Link`]. It owns the controller thread that talks to
//! peers through a [`PeerTransport`]; `pulselink-net` provides the UDP
//! multicast transport, [`LoopbackHub`] an in-process one.

pub mod clock;
pub mod config;
mod controller;
pub mod error;
pub mod events;
mod exchange;
pub mod gc;
pub mod ghost;
mod link;
pub mod merge;
pub mod resolver;
pub mod session_state;
pub mod start_stop;
pub mod timeline;
pub mod transport;
pub mod types;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LinkConfig, UserSettings};
pub use error::{LinkError, LinkResult};
pub use events::SessionEvent;
pub use exchange::RealtimeHandle;
pub use link::Link;
pub use session_state::SessionState;
pub use transport::{LoopbackHub, LoopbackTransport, PeerTransport, TransportError, TransportEvent, TransportResult};
pub use types::{GhostTime, HostTime, PeerId, SessionId};
