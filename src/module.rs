/*! Module façade: the jack registry, the control worker and the public
handle.

A `Module` is configured (jacks, controls), then [`Module::start`] moves it
onto its control worker and hands back a [`ModuleHandle`]. Every mutation of
jack state happens on that worker: received control messages are dispatched
serially to every local jack, and button presses arrive as commands on the
worker's queue, so no machine is ever observed from two threads.
*/

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::controller::CONTROLLER_ID;
use crate::jack::{Action, ConnectionRecord, InputJack, OutputJack};
use crate::protocol::{Message, MessageKind, RestorePayload};
use crate::stream::StreamPlane;
use crate::{
    derive_output_group, BlockConsumer, BlockProducer, Error, IoType, LedState, Stats, Transport,
    DEFAULT_BLOCK_SIZE,
};

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum PressKind {
    Short,
    Long,
}

/// Everything a module persists: knob values and the committed connection
/// record (or null) for every input.
#[derive(Serialize, Deserialize, PartialEq, Default, Clone, Debug)]
pub struct ModuleState {
    pub controls: BTreeMap<String, f64>,
    pub connections: BTreeMap<String, Option<ConnectionRecord>>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct JackInfo {
    pub io_id: String,
    #[serde(rename = "type")]
    pub io_type: IoType,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ControlInfo {
    pub id: String,
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

/// What the control panel needs to know about a module.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Capabilities {
    pub module_id: String,
    pub module_type: String,
    pub unicast: Ipv4Addr,
    pub group: Ipv4Addr,
    pub inputs: Vec<JackInfo>,
    pub outputs: Vec<JackInfo>,
    pub controls: Vec<ControlInfo>,
}

struct Control {
    min: f64,
    max: f64,
    default: f64,
    value: f64,
}

enum Command {
    Press { io_id: String, kind: PressKind },
    GetState { reply: SyncSender<ModuleState> },
    GetCapabilities { reply: SyncSender<Capabilities> },
    RestoreState { state: ModuleState },
    LedSnapshot { reply: SyncSender<Vec<(String, LedState)>> },
    Shutdown,
}

pub struct Module<T: Transport> {
    id: String,
    module_type: String,
    transport: Arc<T>,
    unicast: Ipv4Addr,
    group: Ipv4Addr,
    inputs: Vec<InputJack>,
    input_ids: HashMap<String, usize>,
    outputs: Vec<OutputJack>,
    output_ids: HashMap<String, usize>,
    controls: BTreeMap<String, Control>,
}

impl<T: Transport> Module<T> {
    pub fn new(transport: T, id: &str, module_type: &str) -> Self {
        let unicast = transport.local_addr();
        Module {
            id: id.to_owned(),
            module_type: module_type.to_owned(),
            transport: Arc::new(transport),
            unicast,
            group: derive_output_group(unicast),
            inputs: vec![],
            input_ids: HashMap::new(),
            outputs: vec![],
            output_ids: HashMap::new(),
            controls: BTreeMap::new(),
        }
    }

    pub fn add_input(&mut self, io_id: &str, io_type: IoType) -> Result<(), Error> {
        self.check_unique(io_id)?;
        self.input_ids.insert(io_id.to_owned(), self.inputs.len());
        self.inputs.push(InputJack::new(io_id, io_type));
        Ok(())
    }

    /// Output on the module's derived group with the default block layout.
    pub fn add_output(&mut self, io_id: &str, io_type: IoType) -> Result<(), Error> {
        self.add_output_with(io_id, io_type, 0, DEFAULT_BLOCK_SIZE)
    }

    /// Output with an explicit sample offset, for packed multi-channel
    /// packets.
    pub fn add_output_with(
        &mut self,
        io_id: &str,
        io_type: IoType,
        offset: u16,
        block_size: u16,
    ) -> Result<(), Error> {
        self.check_unique(io_id)?;
        self.output_ids.insert(io_id.to_owned(), self.outputs.len());
        self.outputs
            .push(OutputJack::new(io_id, io_type, self.group, offset, block_size));
        Ok(())
    }

    pub fn add_control(&mut self, id: &str, min: f64, max: f64, default: f64) -> Result<(), Error> {
        if self.controls.contains_key(id) {
            return Err(Error::DuplicateId);
        }
        self.controls.insert(
            id.to_owned(),
            Control {
                min,
                max,
                default,
                value: default,
            },
        );
        Ok(())
    }

    fn check_unique(&self, io_id: &str) -> Result<(), Error> {
        if self.input_ids.contains_key(io_id) || self.output_ids.contains_key(io_id) {
            return Err(Error::DuplicateId);
        }
        Ok(())
    }

    /// Spawn the workers and hand the module over to them.
    pub fn start(
        self,
        producer: Arc<dyn BlockProducer>,
        consumer: Arc<dyn BlockConsumer>,
    ) -> ModuleHandle {
        let stats = Arc::new(Stats::default());
        let running = Arc::new(AtomicBool::new(true));
        let stream = StreamPlane::new(
            self.transport.clone(),
            consumer,
            stats.clone(),
            running.clone(),
        );
        stream.spawn_receive_worker();
        for jack in &self.outputs {
            stream.spawn_sender(
                &jack.io_id,
                jack.io_type,
                jack.group,
                jack.offset,
                jack.block_size,
                producer.clone(),
            );
        }

        let (cmd_tx, cmd_rx) = sync_channel(64);
        let (led_tx, led_rx) = sync_channel(256);
        let module_id = self.id.clone();
        let worker_running = running.clone();
        thread::spawn(move || self.run(stream, cmd_rx, led_tx, worker_running));

        ModuleHandle {
            module_id,
            cmds: cmd_tx,
            leds: Mutex::new(led_rx),
            stats,
            running,
        }
    }

    fn run(
        mut self,
        stream: StreamPlane<T>,
        cmds: Receiver<Command>,
        leds: SyncSender<(String, LedState)>,
        running: Arc<AtomicBool>,
    ) {
        let epoch = Instant::now();
        let mut last_leds: HashMap<String, LedState> = HashMap::new();
        let mut buf = [0u8; 4096];
        info!(
            "[{}] up at {} streaming on {}",
            self.id, self.unicast, self.group
        );
        self.push_led_diffs(0, &mut last_leds, &leds);

        while running.load(Ordering::Relaxed) {
            let now = epoch.elapsed().as_millis() as i64;
            while let Ok(cmd) = cmds.try_recv() {
                match cmd {
                    Command::Press { io_id, kind } => self.press(&io_id, kind, &stream),
                    Command::GetState { reply } => {
                        let _ = reply.send(self.state());
                    }
                    Command::GetCapabilities { reply } => {
                        let _ = reply.send(self.capabilities());
                    }
                    Command::RestoreState { state } => self.restore(state, &stream),
                    Command::LedSnapshot { reply } => {
                        let _ = reply.send(self.led_snapshot(now));
                    }
                    Command::Shutdown => running.store(false, Ordering::Relaxed),
                }
            }
            match self.transport.recv_control(&mut buf) {
                Ok(size) => match Message::decode(&buf[..size]) {
                    Ok(msg) => self.dispatch(msg, now, &stream),
                    Err(_) => trace!("[{}] dropped undecodable datagram", self.id),
                },
                Err(Error::NoData) => {}
                Err(e) => debug!("[{}] control recv error: {:?}", self.id, e),
            }
            let now = epoch.elapsed().as_millis() as i64;
            self.push_led_diffs(now, &mut last_leds, &leds);
        }
        stream.shutdown();
        info!("[{}] down", self.id);
    }

    fn press(&mut self, io_id: &str, kind: PressKind, stream: &StreamPlane<T>) {
        let actions = if let Some(&i) = self.output_ids.get(io_id) {
            match kind {
                PressKind::Short => self.outputs[i].short_press(&self.id),
                PressKind::Long => self.outputs[i].long_press(&self.id),
            }
        } else if let Some(&i) = self.input_ids.get(io_id) {
            match kind {
                PressKind::Short => self.inputs[i].short_press(&self.id),
                PressKind::Long => self.inputs[i].long_press(&self.id),
            }
        } else {
            debug!("[{}] press on unknown jack {:?}", self.id, io_id);
            return;
        };
        self.perform(actions, stream);
    }

    /// Offer a received message to the façade and then to every jack, in
    /// turn. A jack that cannot act ignores it.
    fn dispatch(&mut self, msg: Message, now: i64, stream: &StreamPlane<T>) {
        trace!("[{}] <= {:?} from {}:{}", self.id, msg.kind, msg.module_id, msg.io_id);
        match msg.kind {
            MessageKind::StateInquiry => self.send_state_response(),
            MessageKind::CapabilitiesInquiry if msg.module_id == CONTROLLER_ID => {
                self.send_capabilities_response()
            }
            MessageKind::PatchRestore => match msg.payload_as::<RestorePayload>() {
                Ok(payload) if payload.target_mod == self.id => {
                    self.restore(payload.state, stream)
                }
                Ok(_) => {}
                Err(_) => debug!("[{}] undecodable restore payload", self.id),
            },
            _ => {}
        }

        let mut actions = vec![];
        for jack in &mut self.outputs {
            actions.extend(jack.handle(&msg, &self.id, now));
        }
        for jack in &mut self.inputs {
            actions.extend(jack.handle(&msg, &self.id));
        }
        self.perform(actions, stream);
    }

    fn perform(&mut self, actions: Vec<Action>, stream: &StreamPlane<T>) {
        for action in actions {
            match action {
                Action::Send(msg) => self.send(msg),
                Action::StartReceiver { io_id, record } => {
                    let io_type = match self.input_ids.get(&io_id) {
                        Some(&i) => self.inputs[i].io_type,
                        None => continue,
                    };
                    if let Err(e) = stream.start_receiver(&io_id, io_type, &record) {
                        info!("[{}] join failed for {}: {:?}", self.id, io_id, e);
                    }
                }
                Action::StopReceiver { io_id, record } => {
                    if let Err(e) = stream.stop_receiver(&io_id, &record) {
                        debug!("[{}] leave failed for {}: {:?}", self.id, io_id, e);
                    }
                }
            }
        }
    }

    fn send(&self, msg: Message) {
        trace!("[{}] => {:?} {}", self.id, msg.kind, msg.io_id);
        if let Err(e) = self.transport.send_control(&msg.encode()) {
            debug!("[{}] control send error: {:?}", self.id, e);
        }
    }

    fn send_state_response(&self) {
        match Message::with_payload(
            MessageKind::StateResponse,
            &self.id,
            IoType::Unknown,
            "",
            &self.state(),
        ) {
            Ok(msg) => self.send(msg),
            Err(e) => debug!("[{}] state encode error: {:?}", self.id, e),
        }
    }

    fn send_capabilities_response(&self) {
        match Message::with_payload(
            MessageKind::CapabilitiesResponse,
            &self.id,
            IoType::Unknown,
            "",
            &self.capabilities(),
        ) {
            Ok(msg) => self.send(msg),
            Err(e) => debug!("[{}] capabilities encode error: {:?}", self.id, e),
        }
    }

    fn state(&self) -> ModuleState {
        ModuleState {
            controls: self
                .controls
                .iter()
                .map(|(id, control)| (id.clone(), control.value))
                .collect(),
            connections: self
                .inputs
                .iter()
                .map(|jack| (jack.io_id.clone(), jack.record.clone()))
                .collect(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            module_id: self.id.clone(),
            module_type: self.module_type.clone(),
            unicast: self.unicast,
            group: self.group,
            inputs: self
                .inputs
                .iter()
                .map(|jack| JackInfo {
                    io_id: jack.io_id.clone(),
                    io_type: jack.io_type,
                })
                .collect(),
            outputs: self
                .outputs
                .iter()
                .map(|jack| JackInfo {
                    io_id: jack.io_id.clone(),
                    io_type: jack.io_type,
                })
                .collect(),
            controls: self
                .controls
                .iter()
                .map(|(id, control)| ControlInfo {
                    id: id.clone(),
                    min: control.min,
                    max: control.max,
                    default: control.default,
                })
                .collect(),
        }
    }

    /// Apply a saved state to the live module. Wipes precede
    /// re-installation so the result does not depend on what was patched
    /// before.
    fn restore(&mut self, state: ModuleState, stream: &StreamPlane<T>) {
        info!("[{}] restoring state", self.id);
        for (id, value) in &state.controls {
            match self.controls.get_mut(id) {
                Some(control) => control.value = value.clamp(control.min, control.max),
                None => debug!("[{}] restore skips unknown control {:?}", self.id, id),
            }
        }
        for jack in &mut self.inputs {
            if let Some(record) = jack.wipe() {
                if let Err(e) = stream.stop_receiver(&jack.io_id, &record) {
                    debug!("[{}] leave failed for {}: {:?}", self.id, jack.io_id, e);
                }
            }
        }
        for (io_id, record) in &state.connections {
            let record = match record {
                Some(record) => record,
                None => continue,
            };
            let i = match self.input_ids.get(io_id) {
                Some(&i) => i,
                None => {
                    debug!("[{}] restore skips unknown input {:?}", self.id, io_id);
                    continue;
                }
            };
            match stream.start_receiver(io_id, self.inputs[i].io_type, record) {
                Ok(()) => self.inputs[i].install(record.clone()),
                Err(e) => info!("[{}] restore join failed for {}: {:?}", self.id, io_id, e),
            }
        }
        for jack in &mut self.outputs {
            jack.reset();
        }
    }

    fn led_snapshot(&self, now: i64) -> Vec<(String, LedState)> {
        let mut snapshot = Vec::with_capacity(self.outputs.len() + self.inputs.len());
        for jack in &self.outputs {
            snapshot.push((jack.io_id.clone(), jack.led(now)));
        }
        for jack in &self.inputs {
            snapshot.push((jack.io_id.clone(), jack.led(now)));
        }
        snapshot
    }

    fn push_led_diffs(
        &self,
        now: i64,
        last: &mut HashMap<String, LedState>,
        leds: &SyncSender<(String, LedState)>,
    ) {
        for (io_id, led) in self.led_snapshot(now) {
            if last.get(&io_id) != Some(&led) {
                last.insert(io_id.clone(), led);
                if leds.try_send((io_id, led)).is_err() {
                    trace!("[{}] led queue saturated", self.id);
                }
            }
        }
    }
}

/// Cloneless front door to a running module. Button presses are
/// non-blocking; state operations round-trip through the control worker.
pub struct ModuleHandle {
    module_id: String,
    cmds: SyncSender<Command>,
    leds: Mutex<Receiver<(String, LedState)>>,
    stats: Arc<Stats>,
    running: Arc<AtomicBool>,
}

impl ModuleHandle {
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn press(&self, io_id: &str, kind: PressKind) -> Result<(), Error> {
        self.cmds
            .try_send(Command::Press {
                io_id: io_id.to_owned(),
                kind,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => Error::StorageFull,
                TrySendError::Disconnected(_) => Error::Closed,
            })
    }

    pub fn get_state(&self) -> Result<ModuleState, Error> {
        let (tx, rx) = sync_channel(1);
        self.cmds
            .send(Command::GetState { reply: tx })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }

    pub fn get_capabilities(&self) -> Result<Capabilities, Error> {
        let (tx, rx) = sync_channel(1);
        self.cmds
            .send(Command::GetCapabilities { reply: tx })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }

    pub fn restore_state(&self, state: ModuleState) -> Result<(), Error> {
        self.cmds
            .send(Command::RestoreState { state })
            .map_err(|_| Error::Closed)
    }

    /// Authoritative LED per jack, outputs first.
    pub fn led_snapshot(&self) -> Result<Vec<(String, LedState)>, Error> {
        let (tx, rx) = sync_channel(1);
        self.cmds
            .send(Command::LedSnapshot { reply: tx })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }

    /// Drain one LED change, if any. The UI collaborator polls this at its
    /// own refresh rate.
    pub fn try_recv_led(&self) -> Option<(String, LedState)> {
        self.leds.lock().unwrap().try_recv().ok()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.cmds.try_send(Command::Shutdown);
        self.running.store(false, Ordering::Relaxed);
    }
}
