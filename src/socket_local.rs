/*! In-process transport.

Delivers control and sample datagrams between modules of one process over
bounded channels, for the simulator and for tests. A [`LocalSegment`] plays
the role of the shared L2 domain: it owns the per-node control channels, the
per-group sample fan-out and the loopback address allocator, so independent
segments (and so independent tests) never see each other's traffic.
*/

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{AddressAllocator, Error, Transport};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);
const SAMPLE_TIMEOUT: Duration = Duration::from_millis(10);
const CONTROL_DEPTH: usize = 64;
const SAMPLE_DEPTH: usize = 256;

type ControlTx = SyncSender<Vec<u8>>;
type SampleTx = SyncSender<(Ipv4Addr, Vec<u8>)>;

#[derive(Default)]
struct SegmentInner {
    control: Vec<(Ipv4Addr, ControlTx)>,
    groups: HashMap<Ipv4Addr, Vec<(Ipv4Addr, SampleTx)>>,
}

impl SegmentInner {
    fn fan_out_control(&mut self, buf: &[u8]) {
        let datagram = buf.to_vec();
        self.control.retain(|(_, tx)| match tx.try_send(datagram.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn fan_out_sample(&mut self, group: Ipv4Addr, buf: &[u8]) {
        if let Some(members) = self.groups.get_mut(&group) {
            let datagram = buf.to_vec();
            members.retain(|(_, tx)| match tx.try_send((group, datagram.clone())) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
        }
    }
}

/// One simulated network segment. Hand every participating module a
/// transport from the same segment.
pub struct LocalSegment {
    inner: Arc<Mutex<SegmentInner>>,
    allocator: Mutex<AddressAllocator>,
}

impl LocalSegment {
    pub fn new() -> Self {
        LocalSegment {
            inner: Arc::new(Mutex::new(SegmentInner::default())),
            allocator: Mutex::new(AddressAllocator::new()),
        }
    }

    /// Register a new node and hand out its transport.
    pub fn transport(&self) -> Result<LocalTransport, Error> {
        let addr = self.allocator.lock().unwrap().allocate()?;
        let (control_tx, control_rx) = sync_channel(CONTROL_DEPTH);
        let (sample_tx, sample_rx) = sync_channel(SAMPLE_DEPTH);
        self.inner.lock().unwrap().control.push((addr, control_tx));
        debug!("local node registered at {}", addr);
        Ok(LocalTransport {
            inner: self.inner.clone(),
            addr,
            control_rx: Mutex::new(control_rx),
            sample_tx,
            sample_rx: Mutex::new(sample_rx),
        })
    }
}

impl Default for LocalSegment {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LocalTransport {
    inner: Arc<Mutex<SegmentInner>>,
    addr: Ipv4Addr,
    control_rx: Mutex<Receiver<Vec<u8>>>,
    sample_tx: SampleTx,
    sample_rx: Mutex<Receiver<(Ipv4Addr, Vec<u8>)>>,
}

fn copy_into(buf: &mut [u8], datagram: &[u8]) -> Result<usize, Error> {
    if datagram.len() > buf.len() {
        return Err(Error::Network);
    }
    buf[..datagram.len()].copy_from_slice(datagram);
    Ok(datagram.len())
}

impl Transport for LocalTransport {
    fn local_addr(&self) -> Ipv4Addr {
        self.addr
    }

    fn recv_control(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let rx = self.control_rx.lock().unwrap();
        match rx.recv_timeout(CONTROL_TIMEOUT) {
            Ok(datagram) => copy_into(buf, &datagram),
            Err(RecvTimeoutError::Timeout) => Err(Error::NoData),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Network),
        }
    }

    fn send_control(&self, buf: &[u8]) -> Result<(), Error> {
        // Loopback semantics: the sender's own node receives it too.
        self.inner.lock().unwrap().fan_out_control(buf);
        Ok(())
    }

    fn send_control_to(&self, addr: Ipv4Addr, buf: &[u8]) -> Result<(), Error> {
        let inner = self.inner.lock().unwrap();
        for (node, tx) in &inner.control {
            if *node == addr {
                let _ = tx.try_send(buf.to_vec());
                return Ok(());
            }
        }
        Err(Error::Network)
    }

    fn recv_sample(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr), Error> {
        let rx = self.sample_rx.lock().unwrap();
        match rx.recv_timeout(SAMPLE_TIMEOUT) {
            Ok((group, datagram)) => Ok((copy_into(buf, &datagram)?, group)),
            Err(RecvTimeoutError::Timeout) => Err(Error::NoData),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Network),
        }
    }

    fn send_sample(&self, group: Ipv4Addr, buf: &[u8]) -> Result<(), Error> {
        self.inner.lock().unwrap().fan_out_sample(group, buf);
        Ok(())
    }

    fn join_group(&self, group: Ipv4Addr) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .entry(group)
            .or_default()
            .push((self.addr, self.sample_tx.clone()));
        Ok(())
    }

    fn leave_group(&self, group: Ipv4Addr) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(members) = inner.groups.get_mut(&group) {
            members.retain(|(node, _)| *node != self.addr);
            if members.is_empty() {
                inner.groups.remove(&group);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_fan_out_reaches_everyone_including_the_sender() {
        let segment = LocalSegment::new();
        let a = segment.transport().unwrap();
        let b = segment.transport().unwrap();
        a.send_control(b"hello").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(a.recv_control(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(b.recv_control(&mut buf), Ok(5));
    }

    #[test]
    fn targeted_control_reaches_only_its_node() {
        let segment = LocalSegment::new();
        let a = segment.transport().unwrap();
        let b = segment.transport().unwrap();
        a.send_control_to(b.local_addr(), b"direct").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(b.recv_control(&mut buf), Ok(6));
        assert_eq!(a.recv_control(&mut buf), Err(Error::NoData));
        let unknown = Ipv4Addr::new(127, 0, 0, 250);
        assert_eq!(a.send_control_to(unknown, b"x"), Err(Error::Network));
    }

    #[test]
    fn samples_reach_joined_nodes_until_they_leave() {
        let segment = LocalSegment::new();
        let tx = segment.transport().unwrap();
        let rx = segment.transport().unwrap();
        let group = Ipv4Addr::new(239, 100, 0, 100);
        let mut buf = [0u8; 64];

        tx.send_sample(group, b"block").unwrap();
        assert_eq!(rx.recv_sample(&mut buf), Err(Error::NoData));

        rx.join_group(group).unwrap();
        tx.send_sample(group, b"block").unwrap();
        assert_eq!(rx.recv_sample(&mut buf), Ok((5, group)));

        rx.leave_group(group).unwrap();
        tx.send_sample(group, b"block").unwrap();
        assert_eq!(rx.recv_sample(&mut buf), Err(Error::NoData));
    }

    #[test]
    fn segments_are_isolated() {
        let one = LocalSegment::new();
        let two = LocalSegment::new();
        let a = one.transport().unwrap();
        let b = two.transport().unwrap();
        a.send_control(b"ping").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(b.recv_control(&mut buf), Err(Error::NoData));
        // Address spaces restart per segment.
        assert_eq!(a.local_addr(), b.local_addr());
    }
}
