/*! Patch save/recall coordinator.

Exactly one node runs the controller, under the reserved module id `"mcu"`.
It asks every module for its state or capabilities over the control group,
collects the responses, snapshots them into one of eight patch slots and
replays a slot with targeted `PATCH_RESTORE` messages. It never touches
transport semantics: a module applies a restore entirely through its own
state machinery.
*/

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::module::{Capabilities, ModuleState};
use crate::protocol::{Message, MessageKind, RestorePayload};
use crate::{Error, IoType, Transport};

/// Module id the controller sends under; modules answer capability
/// inquiries only from it.
pub const CONTROLLER_ID: &str = "mcu";

const PATCH_SLOTS: usize = 8;

/// One module's share of a saved patch.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PatchEntry {
    pub module_id: String,
    pub module_type: String,
    pub unicast: Option<Ipv4Addr>,
    pub state: ModuleState,
}

enum Command {
    InquireState,
    InquireCapabilities,
    SavePatch {
        slot: usize,
        reply: SyncSender<Result<usize, Error>>,
    },
    RestorePatch {
        slot: usize,
        reply: SyncSender<Result<usize, Error>>,
    },
    ModuleStates {
        reply: SyncSender<HashMap<String, ModuleState>>,
    },
    ModuleCapabilities {
        reply: SyncSender<HashMap<String, Capabilities>>,
    },
    Shutdown,
}

pub struct Controller<T: Transport> {
    transport: Arc<T>,
    states: HashMap<String, ModuleState>,
    capabilities: HashMap<String, Capabilities>,
    slots: Vec<Vec<PatchEntry>>,
}

impl<T: Transport> Controller<T> {
    pub fn start(transport: T) -> ControllerHandle {
        let controller = Controller {
            transport: Arc::new(transport),
            states: HashMap::new(),
            capabilities: HashMap::new(),
            slots: (0..PATCH_SLOTS).map(|_| vec![]).collect(),
        };
        let running = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = sync_channel(64);
        let worker_running = running.clone();
        thread::spawn(move || controller.run(cmd_rx, worker_running));
        ControllerHandle {
            cmds: cmd_tx,
            running,
        }
    }

    fn run(mut self, cmds: Receiver<Command>, running: Arc<AtomicBool>) {
        let mut buf = [0u8; 4096];
        info!("[{}] controller up", CONTROLLER_ID);
        while running.load(Ordering::Relaxed) {
            while let Ok(cmd) = cmds.try_recv() {
                match cmd {
                    Command::InquireState => {
                        self.send(Message::new(MessageKind::StateInquiry, CONTROLLER_ID, IoType::Unknown, ""))
                    }
                    Command::InquireCapabilities => self.send(Message::new(
                        MessageKind::CapabilitiesInquiry,
                        CONTROLLER_ID,
                        IoType::Unknown,
                        "",
                    )),
                    Command::SavePatch { slot, reply } => {
                        let _ = reply.send(self.save_patch(slot));
                    }
                    Command::RestorePatch { slot, reply } => {
                        let _ = reply.send(self.restore_patch(slot));
                    }
                    Command::ModuleStates { reply } => {
                        let _ = reply.send(self.states.clone());
                    }
                    Command::ModuleCapabilities { reply } => {
                        let _ = reply.send(self.capabilities.clone());
                    }
                    Command::Shutdown => running.store(false, Ordering::Relaxed),
                }
            }
            match self.transport.recv_control(&mut buf) {
                Ok(size) => {
                    if let Ok(msg) = Message::decode(&buf[..size]) {
                        self.collect(msg);
                    }
                }
                Err(Error::NoData) => {}
                Err(e) => debug!("[{}] control recv error: {:?}", CONTROLLER_ID, e),
            }
        }
        info!("[{}] controller down", CONTROLLER_ID);
    }

    fn collect(&mut self, msg: Message) {
        match msg.kind {
            MessageKind::StateResponse => match msg.payload_as::<ModuleState>() {
                Ok(state) => {
                    trace!("[{}] state from {}", CONTROLLER_ID, msg.module_id);
                    self.states.insert(msg.module_id, state);
                }
                Err(_) => debug!("[{}] bad state payload from {}", CONTROLLER_ID, msg.module_id),
            },
            MessageKind::CapabilitiesResponse => match msg.payload_as::<Capabilities>() {
                Ok(caps) => {
                    trace!("[{}] capabilities from {}", CONTROLLER_ID, msg.module_id);
                    self.capabilities.insert(msg.module_id, caps);
                }
                Err(_) => debug!(
                    "[{}] bad capabilities payload from {}",
                    CONTROLLER_ID, msg.module_id
                ),
            },
            _ => {}
        }
    }

    fn save_patch(&mut self, slot: usize) -> Result<usize, Error> {
        if slot >= PATCH_SLOTS {
            return Err(Error::StorageFull);
        }
        let entries: Vec<PatchEntry> = self
            .states
            .iter()
            .map(|(module_id, state)| PatchEntry {
                module_id: module_id.clone(),
                module_type: self
                    .capabilities
                    .get(module_id)
                    .map(|caps| caps.module_type.clone())
                    .unwrap_or_default(),
                unicast: self.capabilities.get(module_id).map(|caps| caps.unicast),
                state: state.clone(),
            })
            .collect();
        let count = entries.len();
        info!("[{}] saved {} modules to slot {}", CONTROLLER_ID, count, slot);
        self.slots[slot] = entries;
        Ok(count)
    }

    fn restore_patch(&mut self, slot: usize) -> Result<usize, Error> {
        if slot >= PATCH_SLOTS {
            return Err(Error::StorageFull);
        }
        let entries = self.slots[slot].clone();
        for entry in &entries {
            let payload = RestorePayload {
                target_mod: entry.module_id.clone(),
                state: entry.state.clone(),
            };
            let msg = match Message::with_payload(
                MessageKind::PatchRestore,
                CONTROLLER_ID,
                IoType::Unknown,
                "",
                &payload,
            ) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("[{}] restore encode error: {:?}", CONTROLLER_ID, e);
                    continue;
                }
            };
            // Unicast when the module's address is known, otherwise let the
            // target filter the multicast by target_mod.
            let result = match entry.unicast {
                Some(addr) => self.transport.send_control_to(addr, &msg.encode()),
                None => self.transport.send_control(&msg.encode()),
            };
            if let Err(e) = result {
                debug!(
                    "[{}] restore send to {} failed: {:?}",
                    CONTROLLER_ID, entry.module_id, e
                );
            }
        }
        info!(
            "[{}] restored {} modules from slot {}",
            CONTROLLER_ID,
            entries.len(),
            slot
        );
        Ok(entries.len())
    }

    fn send(&self, msg: Message) {
        if let Err(e) = self.transport.send_control(&msg.encode()) {
            debug!("[{}] control send error: {:?}", CONTROLLER_ID, e);
        }
    }
}

/// Front door to the running controller worker.
pub struct ControllerHandle {
    cmds: SyncSender<Command>,
    running: Arc<AtomicBool>,
}

impl ControllerHandle {
    /// Ask every module on the segment for its state.
    pub fn inquire_state(&self) -> Result<(), Error> {
        self.cmds.send(Command::InquireState).map_err(|_| Error::Closed)
    }

    /// Ask every module on the segment to describe itself.
    pub fn inquire_capabilities(&self) -> Result<(), Error> {
        self.cmds
            .send(Command::InquireCapabilities)
            .map_err(|_| Error::Closed)
    }

    /// Snapshot the collected states into a slot; returns the module count.
    pub fn save_patch(&self, slot: usize) -> Result<usize, Error> {
        let (tx, rx) = sync_channel(1);
        self.cmds
            .send(Command::SavePatch { slot, reply: tx })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Replay a slot with one `PATCH_RESTORE` per saved module.
    pub fn restore_patch(&self, slot: usize) -> Result<usize, Error> {
        let (tx, rx) = sync_channel(1);
        self.cmds
            .send(Command::RestorePatch { slot, reply: tx })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    pub fn module_states(&self) -> Result<HashMap<String, ModuleState>, Error> {
        let (tx, rx) = sync_channel(1);
        self.cmds
            .send(Command::ModuleStates { reply: tx })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }

    pub fn module_capabilities(&self) -> Result<HashMap<String, Capabilities>, Error> {
        let (tx, rx) = sync_channel(1);
        self.cmds
            .send(Command::ModuleCapabilities { reply: tx })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.cmds.try_send(Command::Shutdown);
        self.running.store(false, Ordering::Relaxed);
    }
}
