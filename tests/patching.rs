//! End-to-end patching scenarios: whole modules talking over one in-process
//! segment, driven only through their public handles.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use patchfield::jack::ConnectionRecord;
use patchfield::module::ModuleState;
use patchfield::{
    BlockConsumer, Controller, DiscardConsumer, IoType, LedState, LocalSegment, Module,
    ModuleHandle, PressKind, SilenceProducer, Transport,
};

/// Long enough for every worker to run a few receive cycles.
const SETTLE: Duration = Duration::from_millis(300);

fn settle() {
    thread::sleep(SETTLE);
}

struct RecordingConsumer {
    blocks: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingConsumer {
    fn new() -> Arc<Self> {
        Arc::new(RecordingConsumer {
            blocks: Mutex::new(vec![]),
        })
    }

    fn take(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut *self.blocks.lock().unwrap())
    }
}

impl BlockConsumer for RecordingConsumer {
    fn consume_block(&self, io_id: &str, block: &[u8]) {
        self.blocks.lock().unwrap().push((io_id.to_owned(), block.to_vec()));
    }
}

fn osc(segment: &LocalSegment, id: &str) -> ModuleHandle {
    let mut module = Module::new(segment.transport().unwrap(), id, "osc");
    module.add_output("audio", IoType::Audio).unwrap();
    module.add_control("freq", 20.0, 20_000.0, 440.0).unwrap();
    module.start(Arc::new(SilenceProducer), Arc::new(DiscardConsumer))
}

fn lfo(segment: &LocalSegment, id: &str) -> ModuleHandle {
    let mut module = Module::new(segment.transport().unwrap(), id, "lfo");
    module.add_output("cv", IoType::Cv).unwrap();
    module.start(Arc::new(SilenceProducer), Arc::new(DiscardConsumer))
}

fn sink(segment: &LocalSegment, id: &str, consumer: Arc<dyn BlockConsumer>) -> ModuleHandle {
    let mut module = Module::new(segment.transport().unwrap(), id, "audio_out");
    module.add_input("left", IoType::Audio).unwrap();
    module.add_input("right", IoType::Audio).unwrap();
    module.start(Arc::new(SilenceProducer), consumer)
}

fn mono_sink(segment: &LocalSegment, id: &str) -> ModuleHandle {
    let mut module = Module::new(segment.transport().unwrap(), id, "audio_out");
    module.add_input("left", IoType::Audio).unwrap();
    module.start(Arc::new(SilenceProducer), Arc::new(DiscardConsumer))
}

fn led_of(handle: &ModuleHandle, io_id: &str) -> LedState {
    handle
        .led_snapshot()
        .unwrap()
        .into_iter()
        .find(|(id, _)| id == io_id)
        .map(|(_, led)| led)
        .unwrap()
}

fn record_of(handle: &ModuleHandle, io_id: &str) -> Option<ConnectionRecord> {
    handle
        .get_state()
        .unwrap()
        .connections
        .get(io_id)
        .cloned()
        .flatten()
}

/// Scenario 1: source press then sink press creates the patch, and samples
/// flow to the sink's consumer.
#[test]
fn happy_path_patches_and_streams() {
    let segment = LocalSegment::new();
    let osc_0 = osc(&segment, "osc_0");
    let consumer = RecordingConsumer::new();
    let sink_0 = sink(&segment, "sink_0", consumer.clone());
    settle();

    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    assert_eq!(led_of(&osc_0, "audio"), LedState::BlinkSlow);
    assert_eq!(led_of(&sink_0, "left"), LedState::Solid);

    sink_0.press("left", PressKind::Short).unwrap();
    settle();

    let record = record_of(&sink_0, "left").expect("left should be connected");
    assert_eq!(record.src_mod, "osc_0");
    assert_eq!(record.src_io, "audio");
    assert_eq!(record.group, Ipv4Addr::new(239, 100, 0, 100));
    assert_eq!(record.offset, 0);
    assert_eq!(record.block_size, 96);
    assert_eq!(record_of(&sink_0, "right"), None);

    assert_eq!(led_of(&osc_0, "audio"), LedState::Solid);
    assert_eq!(led_of(&sink_0, "left"), LedState::BlinkRapid);

    // The joined group is live: the source's silence blocks arrive.
    consumer.take();
    settle();
    let blocks = consumer.take();
    assert!(blocks.iter().any(|(io, block)| io == "left" && block.len() == 288));

    osc_0.shutdown();
    sink_0.shutdown();
}

/// Scenario 2: a type-mismatched offer leaves the input dark and free.
#[test]
fn type_mismatch_goes_dark() {
    let segment = LocalSegment::new();
    let lfo_0 = lfo(&segment, "lfo_0");
    let sink_0 = sink(&segment, "sink_0", Arc::new(DiscardConsumer));
    settle();

    lfo_0.press("cv", PressKind::Short).unwrap();
    settle();

    assert_eq!(led_of(&sink_0, "left"), LedState::Off);
    assert_eq!(record_of(&sink_0, "left"), None);

    lfo_0.shutdown();
    sink_0.shutdown();
}

/// Scenario 3: concurrent initiators resolve to exactly one pending output,
/// and the sink commits to that one.
#[test]
fn concurrent_initiates_resolve_to_one_winner() {
    let segment = LocalSegment::new();
    let osc_0 = osc(&segment, "osc_0");
    let osc_1 = osc(&segment, "osc_1");
    let sink_0 = sink(&segment, "sink_0", Arc::new(DiscardConsumer));
    settle();

    osc_0.press("audio", PressKind::Short).unwrap();
    osc_1.press("audio", PressKind::Short).unwrap();
    settle();

    let led_0 = led_of(&osc_0, "audio");
    let led_1 = led_of(&osc_1, "audio");
    let winner = match (led_0, led_1) {
        (LedState::BlinkSlow, LedState::Off) => "osc_0",
        (LedState::Off, LedState::BlinkSlow) => "osc_1",
        other => panic!("expected exactly one pending initiator, got {:?}", other),
    };

    sink_0.press("left", PressKind::Short).unwrap();
    settle();
    let record = record_of(&sink_0, "left").expect("left should be connected");
    assert_eq!(record.src_mod, winner);

    osc_0.shutdown();
    osc_1.shutdown();
    sink_0.shutdown();
}

/// Scenario 4: pressing a connected input reveals its source for three
/// seconds, then the source LED reverts.
#[test]
fn reveal_flashes_the_source_and_reverts() {
    let segment = LocalSegment::new();
    let osc_0 = osc(&segment, "osc_0");
    let sink_0 = sink(&segment, "sink_0", Arc::new(DiscardConsumer));
    settle();
    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    sink_0.press("left", PressKind::Short).unwrap();
    settle();
    assert_eq!(led_of(&osc_0, "audio"), LedState::Solid);

    sink_0.press("left", PressKind::Short).unwrap();
    settle();
    assert_eq!(led_of(&osc_0, "audio"), LedState::BlinkRapid);
    // Still connected on the sink side.
    assert!(record_of(&sink_0, "left").is_some());

    thread::sleep(Duration::from_millis(3200));
    assert_eq!(led_of(&osc_0, "audio"), LedState::Solid);

    osc_0.shutdown();
    sink_0.shutdown();
}

/// Scenario 5: long press disconnects locally and the patch can be rebuilt
/// to an identical state.
#[test]
fn disconnect_and_repatch_is_idempotent() {
    let segment = LocalSegment::new();
    let osc_0 = osc(&segment, "osc_0");
    let consumer = RecordingConsumer::new();
    let sink_0 = sink(&segment, "sink_0", consumer.clone());
    settle();
    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    sink_0.press("left", PressKind::Short).unwrap();
    settle();
    let patched = sink_0.get_state().unwrap();

    sink_0.press("left", PressKind::Long).unwrap();
    settle();
    assert_eq!(record_of(&sink_0, "left"), None);
    assert_eq!(led_of(&sink_0, "left"), LedState::Off);

    // Membership is gone: nothing more arrives for the dropped group.
    consumer.take();
    settle();
    assert!(consumer.take().is_empty());

    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    sink_0.press("left", PressKind::Short).unwrap();
    settle();
    assert_eq!(sink_0.get_state().unwrap(), patched);

    osc_0.shutdown();
    sink_0.shutdown();
}

/// Scenario 6: controller-driven save then restore is a fixed point for
/// state and LEDs.
#[test]
fn save_restore_round_trips_through_the_controller() {
    let segment = LocalSegment::new();
    let osc_0 = osc(&segment, "osc_0");
    let sink_0 = mono_sink(&segment, "sink_0");
    let mcu = Controller::start(segment.transport().unwrap());
    settle();
    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    sink_0.press("left", PressKind::Short).unwrap();
    settle();

    mcu.inquire_capabilities().unwrap();
    mcu.inquire_state().unwrap();
    settle();
    assert_eq!(mcu.save_patch(0).unwrap(), 2);

    let state_before = sink_0.get_state().unwrap();
    let leds_before = (
        osc_0.led_snapshot().unwrap(),
        sink_0.led_snapshot().unwrap(),
    );

    // Tear the patch down, then replay the slot.
    sink_0.press("left", PressKind::Long).unwrap();
    settle();
    assert_eq!(record_of(&sink_0, "left"), None);

    mcu.restore_patch(0).unwrap();
    settle();

    assert_eq!(sink_0.get_state().unwrap(), state_before);
    let leds_after = (
        osc_0.led_snapshot().unwrap(),
        sink_0.led_snapshot().unwrap(),
    );
    assert_eq!(leds_after, leds_before);

    mcu.shutdown();
    osc_0.shutdown();
    sink_0.shutdown();
}

/// Restore applied to the very state it reports must not change anything,
/// with or without a connection.
#[test]
fn restore_of_own_state_is_identity() {
    let segment = LocalSegment::new();
    let osc_0 = osc(&segment, "osc_0");
    let sink_0 = sink(&segment, "sink_0", Arc::new(DiscardConsumer));
    settle();

    let empty = sink_0.get_state().unwrap();
    sink_0.restore_state(empty.clone()).unwrap();
    settle();
    assert_eq!(sink_0.get_state().unwrap(), empty);

    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    sink_0.press("left", PressKind::Short).unwrap();
    settle();
    let patched = sink_0.get_state().unwrap();
    sink_0.restore_state(patched.clone()).unwrap();
    settle();
    assert_eq!(sink_0.get_state().unwrap(), patched);
    assert_eq!(led_of(&sink_0, "left"), LedState::BlinkRapid);

    osc_0.shutdown();
    sink_0.shutdown();
}

/// A bare CANCEL reverts every transient state on every module; connected
/// inputs stay connected.
#[test]
fn global_cancel_reverts_everything() {
    let segment = LocalSegment::new();
    let osc_0 = osc(&segment, "osc_0");
    let lfo_0 = lfo(&segment, "lfo_0");
    let sink_0 = sink(&segment, "sink_0", Arc::new(DiscardConsumer));
    settle();

    // Establish one durable connection first.
    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    sink_0.press("left", PressKind::Short).unwrap();
    settle();
    // The LFO's output was parked by the oscillator's INITIATE and only a
    // CANCEL frees it; a long press on it is one.
    lfo_0.press("cv", PressKind::Long).unwrap();
    settle();
    assert_eq!(led_of(&lfo_0, "cv"), LedState::Solid);

    // Now scatter transient states everywhere: the LFO's offer parks the
    // oscillator's output and darkens the unconnected audio input.
    lfo_0.press("cv", PressKind::Short).unwrap();
    settle();
    assert_eq!(led_of(&osc_0, "audio"), LedState::Off);
    assert_eq!(led_of(&sink_0, "right"), LedState::Off);

    // Pressing the pending output again cancels globally.
    lfo_0.press("cv", PressKind::Short).unwrap();
    settle();

    assert_eq!(led_of(&lfo_0, "cv"), LedState::Solid);
    assert_eq!(led_of(&osc_0, "audio"), LedState::Solid);
    assert_eq!(led_of(&sink_0, "right"), LedState::Off);
    assert_eq!(led_of(&sink_0, "left"), LedState::BlinkRapid);
    assert!(record_of(&sink_0, "left").is_some());

    osc_0.shutdown();
    lfo_0.shutdown();
    sink_0.shutdown();
}

/// A packet of the wrong length is replaced by one zero-filled block and
/// changes no connection state.
#[test]
fn wrong_size_packet_delivers_zeros_without_state_change() {
    let segment = LocalSegment::new();
    let consumer = RecordingConsumer::new();
    let sink_0 = sink(&segment, "sink_0", consumer.clone());
    let injector = segment.transport().unwrap();
    settle();

    let group = Ipv4Addr::new(239, 100, 0, 142);
    let mut connections: BTreeMap<String, Option<ConnectionRecord>> = BTreeMap::new();
    connections.insert(
        "left".into(),
        Some(ConnectionRecord {
            src_mod: "osc_9".into(),
            src_io: "audio".into(),
            group,
            offset: 0,
            block_size: 96,
        }),
    );
    connections.insert("right".into(), None);
    sink_0
        .restore_state(ModuleState {
            controls: BTreeMap::new(),
            connections,
        })
        .unwrap();
    settle();
    consumer.take();

    injector.send_sample(group, &[1, 2, 3]).unwrap();
    settle();
    let blocks = consumer.take();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].0, "left");
    assert_eq!(blocks[0].1, vec![0u8; 288]);
    assert!(sink_0.stats().wrong_size() >= 1);

    let good = vec![9u8; 288];
    injector.send_sample(group, &good).unwrap();
    settle();
    let blocks = consumer.take();
    assert_eq!(blocks, vec![("left".to_owned(), good)]);

    assert!(record_of(&sink_0, "left").is_some());
    assert_eq!(led_of(&sink_0, "left"), LedState::BlinkRapid);

    sink_0.shutdown();
}

/// Fan-out: two inputs may commit to the same source; disconnecting one
/// leaves the other fed.
#[test]
fn fan_out_to_both_inputs_of_one_sink() {
    let segment = LocalSegment::new();
    let osc_0 = osc(&segment, "osc_0");
    let consumer = RecordingConsumer::new();
    let sink_0 = sink(&segment, "sink_0", consumer.clone());
    settle();

    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    sink_0.press("left", PressKind::Short).unwrap();
    settle();
    // The source idles after the first commit; offer again for the second.
    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    sink_0.press("right", PressKind::Short).unwrap();
    settle();

    let left = record_of(&sink_0, "left").unwrap();
    let right = record_of(&sink_0, "right").unwrap();
    assert_eq!(left.src_mod, "osc_0");
    assert_eq!(right.src_mod, "osc_0");
    assert_eq!(left.group, right.group);

    // The second offer left both inputs acknowledging their own source;
    // cancel the stray offer so they settle back to connected.
    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    osc_0.press("audio", PressKind::Short).unwrap();
    settle();
    assert_eq!(led_of(&sink_0, "left"), LedState::BlinkRapid);

    sink_0.press("left", PressKind::Long).unwrap();
    settle();
    assert_eq!(record_of(&sink_0, "left"), None);
    consumer.take();
    settle();
    let blocks = consumer.take();
    assert!(blocks.iter().any(|(io, _)| io == "right"));
    assert!(blocks.iter().all(|(io, _)| io != "left"));

    osc_0.shutdown();
    sink_0.shutdown();
}
