//! Headless walkthrough of the connection protocol on one in-process
//! segment: patch an oscillator into an audio sink, reveal the connection,
//! then save and replay the patch through the controller.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use simple_logger::SimpleLogger;

use patchfield::stream::encode_audio_block;
use patchfield::{
    BlockConsumer, BlockProducer, Controller, IoType, LocalSegment, Module, ModuleHandle,
    PressKind, SAMPLE_RATE,
};

struct SineProducer {
    phase: Mutex<f32>,
}

impl BlockProducer for SineProducer {
    fn produce_block(&self, _io_id: &str) -> Vec<u8> {
        let mut phase = self.phase.lock().unwrap();
        let mut samples = [0i32; 96];
        for sample in &mut samples {
            *sample = (phase.sin() * 0.5 * 8_388_607.0) as i32;
            *phase += 2.0 * PI * 440.0 / SAMPLE_RATE as f32;
            if *phase > 2.0 * PI {
                *phase -= 2.0 * PI;
            }
        }
        encode_audio_block(&samples)
    }
}

struct CountingConsumer {
    blocks: AtomicU32,
}

impl BlockConsumer for CountingConsumer {
    fn consume_block(&self, io_id: &str, block: &[u8]) {
        let seen = self.blocks.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % 250 == 0 {
            log::info!("{}: {} blocks received ({} bytes each)", io_id, seen, block.len());
        }
    }
}

fn drain_leds(name: &str, handle: &ModuleHandle) {
    while let Some((io_id, led)) = handle.try_recv_led() {
        log::info!("{} led {} -> {:?}", name, io_id, led);
    }
}

fn pause() {
    thread::sleep(Duration::from_millis(400));
}

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .without_timestamps()
        .init()
        .unwrap();

    let segment = LocalSegment::new();

    let mut osc = Module::new(segment.transport().unwrap(), "osc_0", "osc");
    osc.add_output("audio", IoType::Audio).unwrap();
    osc.add_control("freq", 20.0, 20_000.0, 440.0).unwrap();
    let osc = osc.start(
        Arc::new(SineProducer {
            phase: Mutex::new(0.0),
        }),
        Arc::new(patchfield::DiscardConsumer),
    );

    let mut sink = Module::new(segment.transport().unwrap(), "audio_out_0", "audio_out");
    sink.add_input("left", IoType::Audio).unwrap();
    sink.add_input("right", IoType::Audio).unwrap();
    let sink = sink.start(
        Arc::new(patchfield::SilenceProducer),
        Arc::new(CountingConsumer {
            blocks: AtomicU32::new(0),
        }),
    );

    let mcu = Controller::start(segment.transport().unwrap());
    pause();

    log::info!("--- patching osc_0:audio into audio_out_0:left ---");
    osc.press("audio", PressKind::Short).unwrap();
    pause();
    sink.press("left", PressKind::Short).unwrap();
    pause();
    drain_leds("osc_0", &osc);
    drain_leds("audio_out_0", &sink);

    log::info!("--- revealing the source of left ---");
    sink.press("left", PressKind::Short).unwrap();
    thread::sleep(Duration::from_millis(3400));
    drain_leds("osc_0", &osc);

    log::info!("--- saving the patch, tearing it down, replaying it ---");
    mcu.inquire_capabilities().unwrap();
    mcu.inquire_state().unwrap();
    pause();
    let saved = mcu.save_patch(0).unwrap();
    log::info!("saved {} modules to slot 0", saved);

    sink.press("left", PressKind::Long).unwrap();
    pause();
    mcu.restore_patch(0).unwrap();
    pause();

    let state = sink.get_state().unwrap();
    log::info!(
        "final audio_out_0 state: {}",
        serde_json::to_string_pretty(&state).unwrap()
    );

    thread::sleep(Duration::from_secs(1));
    mcu.shutdown();
    osc.shutdown();
    sink.shutdown();
}
