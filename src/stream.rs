/*! Sample stream plane.

Every output jack streams fixed-size blocks to its group on the streaming
port; every connected input holds a ref-counted membership on the shared
sample socket and receives its blocks through a bounded queue. Encodings:

- `AUDIO`: 24-bit signed big-endian, three bytes per sample.
- `CV`: one IEEE-754 f32, little-endian, per push — a running value, not a
  block.
- Everything else is transport-transparent opaque bytes.

A packet whose length does not match the declared encoding is dropped (and
counted) and replaced by a zero-filled block so the consumer's timing is
undisturbed.
*/

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::jack::ConnectionRecord;
use crate::{BlockConsumer, BlockProducer, Error, IoType, Stats, Transport, SAMPLE_RATE};

/// Bounded blocks buffered per connected input.
const QUEUE_BLOCKS: usize = 32;
/// How often the receive worker reports nonzero drop counters.
const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(10);

pub fn encode_audio_block(samples: &[i32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * 3);
    for s in samples {
        let clamped = (*s).clamp(-(1 << 23), (1 << 23) - 1);
        let bytes = clamped.to_be_bytes();
        buf.extend_from_slice(&bytes[1..4]);
    }
    buf
}

pub fn decode_audio_block(buf: &[u8]) -> Vec<i32> {
    buf.chunks_exact(3)
        .map(|chunk| {
            let raw = i32::from_be_bytes([0, chunk[0], chunk[1], chunk[2]]);
            if raw >= 1 << 23 {
                raw - (1 << 24)
            } else {
                raw
            }
        })
        .collect()
}

pub fn encode_cv(value: f32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn decode_cv(buf: &[u8]) -> Result<f32, Error> {
    let bytes: [u8; 4] = buf.try_into().map_err(|_| Error::Parse)?;
    Ok(f32::from_le_bytes(bytes))
}

/// Exact datagram length a jack's encoding declares, or `None` for
/// transparent types.
fn expected_packet_len(io_type: IoType, offset: u16, block_size: u16) -> Option<usize> {
    match io_type {
        IoType::Audio => Some((offset as usize + block_size as usize) * 3),
        IoType::Cv => Some(4),
        _ => None,
    }
}

/// The zero-filled stand-in delivered when a packet is dropped.
fn zero_block(io_type: IoType, block_size: u16) -> Vec<u8> {
    match io_type {
        IoType::Cv => vec![0; 4],
        _ => vec![0; block_size as usize * 3],
    }
}

struct RouteEntry {
    io_id: String,
    io_type: IoType,
    offset: u16,
    block_size: u16,
    queue: SyncSender<Vec<u8>>,
}

#[derive(Default)]
struct RouterInner {
    routes: HashMap<Ipv4Addr, Vec<RouteEntry>>,
    memberships: HashMap<Ipv4Addr, usize>,
}

impl RouterInner {
    fn route(&mut self, group: Ipv4Addr, payload: &[u8], stats: &Stats) {
        let entries = match self.routes.get_mut(&group) {
            Some(entries) => entries,
            None => return,
        };
        entries.retain(|entry| {
            let block = match expected_packet_len(entry.io_type, entry.offset, entry.block_size) {
                Some(expected) if payload.len() != expected => {
                    debug!(
                        "dropping {}-byte packet for {} (expected {})",
                        payload.len(),
                        entry.io_id,
                        expected
                    );
                    Stats::bump(&stats.wrong_size);
                    zero_block(entry.io_type, entry.block_size)
                }
                Some(_) if entry.io_type == IoType::Audio => {
                    let start = entry.offset as usize * 3;
                    payload[start..start + entry.block_size as usize * 3].to_vec()
                }
                _ => payload.to_vec(),
            };
            match entry.queue.try_send(block) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    Stats::bump(&stats.queue_full);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

/// Owns stream routing, group membership ref-counts and the worker threads
/// of the sample plane. One per module.
pub(crate) struct StreamPlane<T: Transport> {
    transport: Arc<T>,
    inner: Arc<Mutex<RouterInner>>,
    consumer: Arc<dyn BlockConsumer>,
    stats: Arc<Stats>,
    running: Arc<AtomicBool>,
}

impl<T: Transport> StreamPlane<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        consumer: Arc<dyn BlockConsumer>,
        stats: Arc<Stats>,
        running: Arc<AtomicBool>,
    ) -> Self {
        StreamPlane {
            transport,
            inner: Arc::new(Mutex::new(RouterInner::default())),
            consumer,
            stats,
            running,
        }
    }

    /// Join the record's group (first member only) and start delivering its
    /// stream to `consume_block`.
    pub(crate) fn start_receiver(
        &self,
        io_id: &str,
        io_type: IoType,
        record: &ConnectionRecord,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let members = inner.memberships.entry(record.group).or_insert(0);
        if *members == 0 {
            self.transport.join_group(record.group)?;
        }
        *members += 1;

        let (tx, rx) = sync_channel::<Vec<u8>>(QUEUE_BLOCKS);
        inner.routes.entry(record.group).or_default().push(RouteEntry {
            io_id: io_id.to_owned(),
            io_type,
            offset: record.offset,
            block_size: record.block_size,
            queue: tx,
        });
        drop(inner);

        let consumer = self.consumer.clone();
        let io = io_id.to_owned();
        thread::spawn(move || {
            // Lives until the route entry (and with it the sender) is gone.
            while let Ok(block) = rx.recv() {
                consumer.consume_block(&io, &block);
            }
        });
        debug!("receiver started for {} on {}", io_id, record.group);
        Ok(())
    }

    /// Remove routing for this input and drop the group membership once the
    /// last member leaves.
    pub(crate) fn stop_receiver(&self, io_id: &str, record: &ConnectionRecord) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entries) = inner.routes.get_mut(&record.group) {
            entries.retain(|entry| entry.io_id != io_id);
            if entries.is_empty() {
                inner.routes.remove(&record.group);
            }
        }
        if let Some(members) = inner.memberships.get_mut(&record.group) {
            *members -= 1;
            if *members == 0 {
                inner.memberships.remove(&record.group);
                self.transport.leave_group(record.group)?;
            }
        }
        debug!("receiver stopped for {} on {}", io_id, record.group);
        Ok(())
    }

    /// The shared receive worker: demultiplex by group, push into the
    /// owning inputs' bounded queues.
    pub(crate) fn spawn_receive_worker(&self) {
        let transport = self.transport.clone();
        let inner = self.inner.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let mut last_report = Instant::now();
            while running.load(Ordering::Relaxed) {
                match transport.recv_sample(&mut buf) {
                    Ok((size, group)) => {
                        inner.lock().unwrap().route(group, &buf[..size], &stats);
                    }
                    Err(Error::NoData) => {}
                    Err(e) => debug!("sample recv error: {:?}", e),
                }
                if last_report.elapsed() >= DROP_REPORT_INTERVAL {
                    last_report = Instant::now();
                    let full = Stats::take(&stats.queue_full);
                    let wrong = Stats::take(&stats.wrong_size);
                    if full != 0 || wrong != 0 {
                        info!("sample drops: {} queue-full, {} wrong-size", full, wrong);
                    }
                }
            }
        });
    }

    /// One sender per output jack, pushing a producer block every block
    /// period. Never blocks on consumer absence: multicast has no receivers
    /// to wait for.
    pub(crate) fn spawn_sender(
        &self,
        io_id: &str,
        io_type: IoType,
        group: Ipv4Addr,
        offset: u16,
        block_size: u16,
        producer: Arc<dyn BlockProducer>,
    ) {
        let transport = self.transport.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let io = io_id.to_owned();
        let period =
            Duration::from_micros(block_size.max(1) as u64 * 1_000_000 / SAMPLE_RATE as u64);
        thread::spawn(move || {
            debug!("sender started for {} on {}", io, group);
            while running.load(Ordering::Relaxed) {
                let block = producer.produce_block(&io);
                match expected_packet_len(io_type, offset, block_size) {
                    Some(expected) if block.len() != expected => {
                        debug!(
                            "producer gave {} bytes for {} (expected {}), skipping",
                            block.len(),
                            io,
                            expected
                        );
                    }
                    _ => {
                        if transport.send_sample(group, &block).is_err() {
                            Stats::bump(&stats.send_errors);
                        }
                    }
                }
                thread::sleep(period);
            }
        });
    }

    /// Tear down all routing and memberships; delivery workers exit as
    /// their queues disconnect.
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.clear();
        for (group, _) in inner.memberships.drain() {
            let _ = self.transport.leave_group(group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::Receiver;

    #[test]
    fn audio_codec_is_24_bit_big_endian() {
        let buf = encode_audio_block(&[0, 1, -1, 8_388_607, -8_388_608]);
        assert_eq!(buf.len(), 15);
        assert_eq!(&buf[0..3], &[0x00, 0x00, 0x00]);
        assert_eq!(&buf[3..6], &[0x00, 0x00, 0x01]);
        assert_eq!(&buf[6..9], &[0xff, 0xff, 0xff]);
        assert_eq!(&buf[9..12], &[0x7f, 0xff, 0xff]);
        assert_eq!(&buf[12..15], &[0x80, 0x00, 0x00]);
        assert_eq!(decode_audio_block(&buf), vec![0, 1, -1, 8_388_607, -8_388_608]);
    }

    #[test]
    fn audio_codec_clamps_out_of_range_samples() {
        let buf = encode_audio_block(&[i32::MAX, i32::MIN]);
        assert_eq!(decode_audio_block(&buf), vec![8_388_607, -8_388_608]);
    }

    #[test]
    fn cv_codec_is_f32_little_endian() {
        assert_eq!(encode_cv(1.0), [0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(decode_cv(&encode_cv(-2.5)), Ok(-2.5));
        assert_eq!(decode_cv(&[0, 1]), Err(Error::Parse));
    }

    #[test]
    fn packet_lengths_follow_declared_encoding() {
        assert_eq!(expected_packet_len(IoType::Audio, 0, 96), Some(288));
        assert_eq!(expected_packet_len(IoType::Audio, 96, 96), Some(576));
        assert_eq!(expected_packet_len(IoType::Cv, 0, 96), Some(4));
        assert_eq!(expected_packet_len(IoType::Gate, 0, 96), None);
    }

    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 100, 0, 100);

    fn entry(io_id: &str, io_type: IoType, offset: u16, capacity: usize) -> (RouteEntry, Receiver<Vec<u8>>) {
        let (tx, rx) = sync_channel(capacity);
        (
            RouteEntry {
                io_id: io_id.to_owned(),
                io_type,
                offset,
                block_size: 96,
                queue: tx,
            },
            rx,
        )
    }

    #[test]
    fn wrong_size_packet_becomes_zero_block() {
        let mut inner = RouterInner::default();
        let stats = Stats::default();
        let (e, rx) = entry("left", IoType::Audio, 0, 4);
        inner.routes.entry(GROUP).or_default().push(e);

        inner.route(GROUP, &[1, 2, 3], &stats);
        let block = rx.try_recv().unwrap();
        assert_eq!(block.len(), 288);
        assert!(block.iter().all(|b| *b == 0));
        assert_eq!(stats.wrong_size(), 1);

        let good = vec![7u8; 288];
        inner.route(GROUP, &good, &stats);
        assert_eq!(rx.try_recv().unwrap(), good);
    }

    #[test]
    fn packed_streams_extract_their_offset() {
        let mut inner = RouterInner::default();
        let stats = Stats::default();
        let (e, rx) = entry("right", IoType::Audio, 96, 4);
        inner.routes.entry(GROUP).or_default().push(e);

        let mut payload = vec![0u8; 288];
        payload.extend_from_slice(&[9u8; 288]);
        inner.route(GROUP, &payload, &stats);
        assert_eq!(rx.try_recv().unwrap(), vec![9u8; 288]);
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let mut inner = RouterInner::default();
        let stats = Stats::default();
        let (e, rx) = entry("left", IoType::Audio, 0, 1);
        inner.routes.entry(GROUP).or_default().push(e);

        let first = vec![1u8; 288];
        let second = vec![2u8; 288];
        inner.route(GROUP, &first, &stats);
        inner.route(GROUP, &second, &stats);
        assert_eq!(stats.queue_full(), 1);
        assert_eq!(rx.try_recv().unwrap(), first);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnected_consumers_are_dropped_from_routing() {
        let mut inner = RouterInner::default();
        let stats = Stats::default();
        let (e, rx) = entry("left", IoType::Gate, 0, 4);
        inner.routes.entry(GROUP).or_default().push(e);
        drop(rx);
        inner.route(GROUP, &[1, 2, 3], &stats);
        assert!(inner.routes.get(&GROUP).unwrap().is_empty());
    }

    struct FakeTransport {
        joined: Mutex<Vec<Ipv4Addr>>,
        left: Mutex<Vec<Ipv4Addr>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport {
                joined: Mutex::new(vec![]),
                left: Mutex::new(vec![]),
            }
        }
    }

    impl Transport for FakeTransport {
        fn local_addr(&self) -> Ipv4Addr {
            Ipv4Addr::new(127, 0, 0, 100)
        }
        fn recv_control(&self, _buf: &mut [u8]) -> Result<usize, Error> {
            Err(Error::NoData)
        }
        fn send_control(&self, _buf: &[u8]) -> Result<(), Error> {
            Ok(())
        }
        fn send_control_to(&self, _addr: Ipv4Addr, _buf: &[u8]) -> Result<(), Error> {
            Ok(())
        }
        fn recv_sample(&self, _buf: &mut [u8]) -> Result<(usize, Ipv4Addr), Error> {
            Err(Error::NoData)
        }
        fn send_sample(&self, _group: Ipv4Addr, _buf: &[u8]) -> Result<(), Error> {
            Ok(())
        }
        fn join_group(&self, group: Ipv4Addr) -> Result<(), Error> {
            self.joined.lock().unwrap().push(group);
            Ok(())
        }
        fn leave_group(&self, group: Ipv4Addr) -> Result<(), Error> {
            self.left.lock().unwrap().push(group);
            Ok(())
        }
    }

    fn record(group: Ipv4Addr) -> ConnectionRecord {
        ConnectionRecord {
            src_mod: "osc_0".into(),
            src_io: "audio".into(),
            group,
            offset: 0,
            block_size: 96,
        }
    }

    #[test]
    fn membership_is_ref_counted() {
        let transport = Arc::new(FakeTransport::new());
        let plane = StreamPlane::new(
            transport.clone(),
            Arc::new(crate::DiscardConsumer),
            Arc::new(Stats::default()),
            Arc::new(AtomicBool::new(true)),
        );
        let rec = record(GROUP);
        plane.start_receiver("left", IoType::Audio, &rec).unwrap();
        plane.start_receiver("right", IoType::Audio, &rec).unwrap();
        assert_eq!(transport.joined.lock().unwrap().len(), 1);

        plane.stop_receiver("left", &rec).unwrap();
        assert!(transport.left.lock().unwrap().is_empty());
        plane.stop_receiver("right", &rec).unwrap();
        assert_eq!(transport.left.lock().unwrap().as_slice(), &[GROUP]);
    }
}
