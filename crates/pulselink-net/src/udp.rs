//! IPv4 multicast transport
//!
//! Every peer binds the same port with address reuse and joins one multicast
//! group, so a datagram sent to the group reaches every peer on the subnet,
//! including other processes on this host when loopback is enabled.

use crate::error::{NetError, NetResult};
use pulselink_core::config::NetworkConfig;
use pulselink_core::transport::{PeerTransport, TransportError, TransportEvent, TransportResult};
use pulselink_core::wire::MAX_DATAGRAM_SIZE;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// Shortest read timeout the receive side will set
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// UDP socket joined to the session multicast group
pub struct UdpMulticastTransport {
    socket: UdpSocket,
    group: SocketAddrV4,
    interface: Ipv4Addr,
}

impl UdpMulticastTransport {
    /// Bind and join the group described by `config`
    pub fn bind(config: &NetworkConfig) -> NetResult<Self> {
        let group = config.multicast_group;
        if !group.is_multicast() {
            return Err(NetError::NotMulticast(group));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(NetError::Socket)?;
        socket.set_reuse_address(true).map_err(NetError::Socket)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true).map_err(NetError::Socket)?;

        let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket
            .bind(&SockAddr::from(local))
            .map_err(|source| NetError::Bind { addr: local, source })?;

        socket
            .join_multicast_v4(&group, &config.interface)
            .map_err(|source| NetError::Join { group, source })?;
        socket.set_multicast_loop_v4(config.multicast_loop).map_err(NetError::Socket)?;
        socket.set_multicast_ttl_v4(config.multicast_ttl).map_err(NetError::Socket)?;
        if !config.interface.is_unspecified() {
            socket.set_multicast_if_v4(&config.interface).map_err(NetError::Socket)?;
        }

        let socket: UdpSocket = socket.into();
        let bound = socket.local_addr().map_err(NetError::Socket)?;
        log::info!(
            "Joined multicast group {}:{} on {} (ttl {}, loop {})",
            group,
            bound.port(),
            config.interface,
            config.multicast_ttl,
            config.multicast_loop
        );

        Ok(Self {
            socket,
            group: SocketAddrV4::new(group, bound.port()),
            interface: config.interface,
        })
    }

    /// Group address datagrams are sent to
    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub fn local_port(&self) -> u16 {
        self.group.port()
    }
}

impl PeerTransport for UdpMulticastTransport {
    fn send(&self, datagram: &[u8]) -> TransportResult<()> {
        self.socket.send_to(datagram, self.group)?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> TransportResult<Option<TransportEvent>> {
        self.socket.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;

        // One spare byte so oversized datagrams are visible to the decoder
        let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => Ok(Some(TransportEvent::Datagram(buf[..len].to_vec()))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotConnected => Err(TransportError::Closed),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl Drop for UdpMulticastTransport {
    fn drop(&mut self) {
        if let Err(e) = self.socket.leave_multicast_v4(self.group.ip(), &self.interface) {
            log::debug!("Failed to leave multicast group {}: {}", self.group.ip(), e);
        }
    }
}
