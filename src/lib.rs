/*! Connection and streaming core for a distributed modular synthesizer.

Modules (oscillators, LFOs, audio sinks, ...) share an IP network. Each one
exposes named, typed jacks; pressing a jack button on two different modules
negotiates a patch cable over a well-known control multicast group, after
which the source streams sample blocks to its own multicast group and the
sink joins that group to consume them.

The crate provides the wire codec ([`protocol`]), the per-jack state
machines ([`jack`]), the sample stream plane ([`stream`]), the module façade
([`module`]), two transport backends ([`socket_native`], [`socket_local`])
and the patch save/recall coordinator ([`controller`]).
*/

#[macro_use]
extern crate log;

pub mod controller;
pub mod jack;
pub mod module;
pub mod protocol;
pub mod socket_local;
pub mod socket_native;
pub mod stream;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

pub use controller::{Controller, ControllerHandle, PatchEntry};
pub use jack::{ConnectionRecord, InputState, OutputState};
pub use module::{Capabilities, Module, ModuleHandle, ModuleState, PressKind};
pub use protocol::{Message, MessageKind};
pub use socket_local::{LocalSegment, LocalTransport};
pub use socket_native::NativeTransport;

/// UDP port shared by every module for protocol messages.
pub const CONTROL_PORT: u16 = 5004;
/// UDP port shared by every module for sample datagrams.
pub const SAMPLE_PORT: u16 = 5005;
/// Multicast group for protocol messages on a real network.
pub const CONTROL_GROUP: Ipv4Addr = Ipv4Addr::new(239, 50, 0, 1);

pub const SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_BLOCK_SIZE: u16 = 96;

/// Multicast group a module streams on, derived from its unicast address so
/// that peers can attribute sample datagrams from the sender address alone.
pub fn derive_output_group(unicast: Ipv4Addr) -> Ipv4Addr {
    let [_, _, c, d] = unicast.octets();
    Ipv4Addr::new(239, 100, c, d)
}

/// Signal class carried by a jack. Two jacks are compatible iff their types
/// are equal.
#[derive(PartialEq, Eq, Serialize, Deserialize, Copy, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    Unknown,
    Cv,
    Audio,
    Gate,
    Trigger,
    Clock,
    Midi,
    OscMsg,
}

impl IoType {
    /// Out-of-range bytes decode to `Unknown` so that a message stays
    /// deliverable to jacks that do not care about the type.
    pub fn from_byte(b: u8) -> IoType {
        match b {
            1 => IoType::Cv,
            2 => IoType::Audio,
            3 => IoType::Gate,
            4 => IoType::Trigger,
            5 => IoType::Clock,
            6 => IoType::Midi,
            7 => IoType::OscMsg,
            _ => IoType::Unknown,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            IoType::Unknown => 0,
            IoType::Cv => 1,
            IoType::Audio => 2,
            IoType::Gate => 3,
            IoType::Trigger => 4,
            IoType::Clock => 5,
            IoType::Midi => 6,
            IoType::OscMsg => 7,
        }
    }
}

/// What a jack's LED shows. A pure function of the jack's state, plus a
/// short reveal override driven by `SHOW_CONNECTED`.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum LedState {
    Off,
    Solid,
    BlinkSlow,
    BlinkRapid,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Socket setup or send/recv failure.
    Network,
    /// Nothing arrived within the receive timeout.
    NoData,
    /// Undecodable datagram, payload, or address.
    Parse,
    /// The named jack does not exist on this module.
    InvalidJackId,
    /// A jack or control with that id already exists.
    DuplicateId,
    /// A fixed-capacity resource (loopback addresses, patch slots) ran out.
    StorageFull,
    /// The module or controller worker is gone.
    Closed,
}

/// Backend datagram plumbing for one module node.
///
/// Implementations own the control endpoint (bound to [`CONTROL_PORT`],
/// joined to the control group or set up for broadcast on a loopback-only
/// simulator) and the sample endpoint (bound to [`SAMPLE_PORT`] with dynamic
/// group membership). All methods take `&self`: the control worker, the
/// sample worker and the per-output senders share one instance.
pub trait Transport: Send + Sync + 'static {
    /// Unicast address this node is known by.
    fn local_addr(&self) -> Ipv4Addr;
    /// Receive one control datagram; `Error::NoData` after ~100 ms.
    fn recv_control(&self, buf: &mut [u8]) -> Result<usize, Error>;
    /// Send a control datagram to the control group (or broadcast).
    fn send_control(&self, buf: &[u8]) -> Result<(), Error>;
    /// Send a control datagram to one module, for targeted restore.
    fn send_control_to(&self, addr: Ipv4Addr, buf: &[u8]) -> Result<(), Error>;
    /// Receive one sample datagram and the group it belongs to;
    /// `Error::NoData` after ~10 ms.
    fn recv_sample(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr), Error>;
    /// Send a sample datagram to a stream group.
    fn send_sample(&self, group: Ipv4Addr, buf: &[u8]) -> Result<(), Error>;
    /// Join a stream group on the sample endpoint.
    fn join_group(&self, group: Ipv4Addr) -> Result<(), Error>;
    /// Leave a stream group on the sample endpoint.
    fn leave_group(&self, group: Ipv4Addr) -> Result<(), Error>;
}

/// DSP-side source of outbound blocks, one per module. Must return a block
/// already encoded for the jack's type (see [`stream`] for the encodings).
pub trait BlockProducer: Send + Sync + 'static {
    fn produce_block(&self, io_id: &str) -> Vec<u8>;
}

/// DSP-side sink for inbound blocks. Receives a zero-filled block in place
/// of a wrong-size packet so its timing is undisturbed.
pub trait BlockConsumer: Send + Sync + 'static {
    fn consume_block(&self, io_id: &str, block: &[u8]);
}

/// Producer of silence, for modules whose outputs have no DSP attached yet.
pub struct SilenceProducer;

impl BlockProducer for SilenceProducer {
    fn produce_block(&self, _io_id: &str) -> Vec<u8> {
        vec![0; DEFAULT_BLOCK_SIZE as usize * 3]
    }
}

/// Consumer that throws blocks away, for source-only modules.
pub struct DiscardConsumer;

impl BlockConsumer for DiscardConsumer {
    fn consume_block(&self, _io_id: &str, _block: &[u8]) {}
}

/// Stream-plane counters, shared with the module handle.
#[derive(Default, Debug)]
pub struct Stats {
    /// Packets dropped because an input's bounded buffer was full.
    pub queue_full: AtomicU32,
    /// Packets dropped because their length did not match the declared
    /// block encoding.
    pub wrong_size: AtomicU32,
    /// Sample sends that failed at the socket.
    pub send_errors: AtomicU32,
}

impl Stats {
    pub(crate) fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn take(counter: &AtomicU32) -> u32 {
        counter.swap(0, Ordering::Relaxed)
    }

    pub fn queue_full(&self) -> u32 {
        self.queue_full.load(Ordering::Relaxed)
    }

    pub fn wrong_size(&self) -> u32 {
        self.wrong_size.load(Ordering::Relaxed)
    }
}

/// Hands out loopback addresses for simulator nodes, `127.0.0.100` up to
/// `127.0.0.199`. One allocator per simulated network segment.
pub struct AddressAllocator {
    next_octet: u8,
}

impl AddressAllocator {
    pub fn new() -> Self {
        AddressAllocator { next_octet: 100 }
    }

    pub fn allocate(&mut self) -> Result<Ipv4Addr, Error> {
        if self.next_octet == 200 {
            return Err(Error::StorageFull);
        }
        let addr = Ipv4Addr::new(127, 0, 0, self.next_octet);
        self.next_octet += 1;
        Ok(addr)
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_derivation_uses_low_octets() {
        let unicast = Ipv4Addr::new(10, 0, 42, 69);
        assert_eq!(derive_output_group(unicast), Ipv4Addr::new(239, 100, 42, 69));
        let loopback = Ipv4Addr::new(127, 0, 0, 100);
        assert_eq!(derive_output_group(loopback), Ipv4Addr::new(239, 100, 0, 100));
    }

    #[test]
    fn io_type_bytes_round_trip() {
        for b in 0..8u8 {
            assert_eq!(IoType::from_byte(b).as_byte(), b);
        }
        assert_eq!(IoType::from_byte(200), IoType::Unknown);
    }

    #[test]
    fn allocator_is_bounded() {
        let mut alloc = AddressAllocator::new();
        assert_eq!(alloc.allocate(), Ok(Ipv4Addr::new(127, 0, 0, 100)));
        assert_eq!(alloc.allocate(), Ok(Ipv4Addr::new(127, 0, 0, 101)));
        for _ in 2..100 {
            alloc.allocate().unwrap();
        }
        assert_eq!(alloc.allocate(), Err(Error::StorageFull));
    }
}
