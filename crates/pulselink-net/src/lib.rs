//! Pulselink Net - UDP multicast transport
//!
//! ```ignore
//! use pulselink_core::LinkConfig;
//!
//! let link = pulselink_net::udp_link(120.0, LinkConfig::default())?;
//! ```

mod error;
mod udp;

pub use error::{NetError, NetResult};
pub use udp::UdpMulticastTransport;

use pulselink_core::{Link, LinkConfig};
use std::sync::Arc;

/// Create a `Link` that talks to peers over the multicast group in `config`
pub fn udp_link(bpm: f64, config: LinkConfig) -> NetResult<Link> {
    let transport = UdpMulticastTransport::bind(&config.network)?;
    Ok(Link::with_transport(bpm, config, Arc::new(transport))?)
}
