//! In-process transport for tests and local simulations
//!
//! A [`LoopbackHub`] fans every datagram out to all other endpoints created
//! from it, like a multicast group on a perfect network. Endpoints can be
//! detached to simulate a peer dropping off.

use super::{PeerTransport, TransportError, TransportEvent, TransportResult};
use crate::types::PeerId;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Members = Arc<Mutex<Vec<(usize, Sender<TransportEvent>)>>>;

/// Shared medium connecting loopback endpoints
#[derive(Clone, Default)]
pub struct LoopbackHub {
    members: Members,
    next_index: Arc<AtomicUsize>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new endpoint attached to this hub
    pub fn endpoint(&self) -> LoopbackTransport {
        let (tx, rx) = crossbeam::channel::unbounded();
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut members) = self.members.lock() {
            members.push((index, tx.clone()));
        }
        LoopbackTransport {
            index,
            members: self.members.clone(),
            own_tx: tx,
            rx,
        }
    }

    /// Number of attached endpoints
    pub fn len(&self) -> usize {
        self.members.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One endpoint of a [`LoopbackHub`]
pub struct LoopbackTransport {
    index: usize,
    members: Members,
    own_tx: Sender<TransportEvent>,
    rx: Receiver<TransportEvent>,
}

impl LoopbackTransport {
    /// Stop sending and receiving through the hub
    pub fn detach(&self) {
        if let Ok(mut members) = self.members.lock() {
            members.retain(|(index, _)| *index != self.index);
        }
    }

    /// Inject a loss notification as if the network layer had reported it
    pub fn report_lost(&self, peer: PeerId) {
        let _ = self.own_tx.send(TransportEvent::PeerLost(peer));
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.detach();
    }
}

impl PeerTransport for LoopbackTransport {
    fn send(&self, datagram: &[u8]) -> TransportResult<()> {
        let members = self.members.lock().map_err(|_| TransportError::Closed)?;
        if !members.iter().any(|(index, _)| *index == self.index) {
            return Ok(());
        }
        for (index, tx) in members.iter() {
            if *index != self.index {
                let _ = tx.send(TransportEvent::Datagram(datagram.to_vec()));
            }
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> TransportResult<Option<TransportEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[test]
    fn test_datagrams_reach_every_other_endpoint() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint();
        let b = hub.endpoint();
        let c = hub.endpoint();
        assert_eq!(hub.len(), 3);

        a.send(b"hello").unwrap();
        assert_eq!(b.recv(WAIT).unwrap(), Some(TransportEvent::Datagram(b"hello".to_vec())));
        assert_eq!(c.recv(WAIT).unwrap(), Some(TransportEvent::Datagram(b"hello".to_vec())));
        // No echo to the sender
        assert_eq!(a.recv(WAIT).unwrap(), None);
    }

    #[test]
    fn test_detached_endpoint_is_isolated() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint();
        let b = hub.endpoint();
        b.detach();
        a.send(b"x").unwrap();
        b.send(b"y").unwrap();
        assert_eq!(b.recv(WAIT).unwrap(), None);
        assert_eq!(a.recv(WAIT).unwrap(), None);
        drop(a);
        assert!(hub.is_empty());
    }

    #[test]
    fn test_report_lost() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint();
        a.report_lost(PeerId(9));
        assert_eq!(a.recv(WAIT).unwrap(), Some(TransportEvent::PeerLost(PeerId(9))));
    }
}
