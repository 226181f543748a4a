//! Errors raised while setting up the multicast transport

use pulselink_core::LinkError;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("{0} is not an IPv4 multicast address")]
    NotMulticast(Ipv4Addr),

    #[error("Socket error: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to join multicast group {group}: {source}")]
    Join {
        group: Ipv4Addr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Link(#[from] LinkError),
}

pub type NetResult<T> = Result<T, NetError>;
