/*! Per-jack connection state machines.

Each input and output jack runs an independent machine. Handlers mutate the
jack and return a short list of [`Action`]s for the module façade to carry
out, so the machines themselves never touch a socket and every transition is
testable in isolation. All handlers for one module run on its control worker,
which is what makes serial dispatch safe without locks.
*/

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::protocol::{
    CompatiblePayload, InitiatePayload, Message, MessageKind, ShowConnectedPayload,
};
use crate::{IoType, LedState};

/// How long a `SHOW_CONNECTED` reveal overrides the source jack's LED.
const REVEAL_MS: i64 = 3000;

/// Durable fact that an input consumes a specific output's stream. Created
/// on commit, never mutated, destroyed on disconnect or restore.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ConnectionRecord {
    pub src_mod: String,
    pub src_io: String,
    pub group: Ipv4Addr,
    pub offset: u16,
    pub block_size: u16,
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum OutputState {
    Idle,
    /// We sent an `INITIATE` and are waiting for a sink to commit.
    SelfPending,
    /// Some other output's `INITIATE` is in flight.
    OtherPending,
    /// A sink announced a matching type via `COMPATIBLE`.
    Compatible,
    NotCompatible,
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum InputState {
    Disconnected,
    /// We sent a `COMPATIBLE` announcement and are waiting for an offer.
    SelfCompatible,
    /// A type-matched `INITIATE` is on offer; a short press commits it.
    Pending,
    /// The offer on the wire is the very stream we already consume.
    PendingSame,
    Connected,
    /// A non-matching `INITIATE` is in flight while we stay connected.
    OtherPending,
    /// A non-matching `INITIATE` is in flight while we are free.
    OtherCompatible,
}

/// Side effects a transition asks the façade to perform, in order.
#[derive(PartialEq, Clone, Debug)]
pub(crate) enum Action {
    /// Multicast a control message.
    Send(Message),
    /// Join the record's group and route its stream to this input.
    StartReceiver { io_id: String, record: ConnectionRecord },
    /// Drop membership and routing for this input.
    StopReceiver { io_id: String, record: ConnectionRecord },
}

pub(crate) struct OutputJack {
    pub(crate) io_id: String,
    pub(crate) io_type: IoType,
    pub(crate) group: Ipv4Addr,
    pub(crate) offset: u16,
    pub(crate) block_size: u16,
    pub(crate) state: OutputState,
    reveal_until: Option<i64>,
}

impl OutputJack {
    pub(crate) fn new(
        io_id: &str,
        io_type: IoType,
        group: Ipv4Addr,
        offset: u16,
        block_size: u16,
    ) -> Self {
        OutputJack {
            io_id: io_id.to_owned(),
            io_type,
            group,
            offset,
            block_size,
            state: OutputState::Idle,
            reveal_until: None,
        }
    }

    pub(crate) fn led(&self, time: i64) -> LedState {
        if matches!(self.reveal_until, Some(until) if time < until) {
            return LedState::BlinkRapid;
        }
        match self.state {
            OutputState::Idle | OutputState::Compatible => LedState::Solid,
            OutputState::SelfPending => LedState::BlinkSlow,
            OutputState::OtherPending | OutputState::NotCompatible => LedState::Off,
        }
    }

    pub(crate) fn short_press(&mut self, module_id: &str) -> Vec<Action> {
        match self.state {
            OutputState::Idle | OutputState::Compatible => {
                let payload = InitiatePayload {
                    group: self.group,
                    io_type: self.io_type,
                    offset: self.offset,
                    block_size: self.block_size,
                };
                match Message::with_payload(
                    MessageKind::Initiate,
                    module_id,
                    self.io_type,
                    &self.io_id,
                    &payload,
                ) {
                    Ok(msg) => {
                        self.state = OutputState::SelfPending;
                        info!("[{}] INITIATE from {}", module_id, self.io_id);
                        vec![Action::Send(msg)]
                    }
                    Err(e) => {
                        info!("[{}] INITIATE encode failed: {:?}", module_id, e);
                        vec![]
                    }
                }
            }
            OutputState::SelfPending => {
                self.state = OutputState::Idle;
                info!("[{}] canceled pending {}", module_id, self.io_id);
                vec![Action::Send(Message::new(
                    MessageKind::Cancel,
                    module_id,
                    self.io_type,
                    &self.io_id,
                ))]
            }
            _ => vec![],
        }
    }

    pub(crate) fn long_press(&mut self, module_id: &str) -> Vec<Action> {
        if self.state == OutputState::Idle {
            return vec![];
        }
        self.state = OutputState::Idle;
        vec![Action::Send(Message::new(
            MessageKind::Cancel,
            module_id,
            self.io_type,
            &self.io_id,
        ))]
    }

    pub(crate) fn handle(&mut self, msg: &Message, module_id: &str, time: i64) -> Vec<Action> {
        match msg.kind {
            MessageKind::Initiate => self.on_initiate(msg, module_id),
            MessageKind::Cancel => self.on_cancel(),
            MessageKind::Compatible => self.on_compatible(msg, module_id),
            MessageKind::Connect => self.on_connect(msg, module_id),
            MessageKind::ShowConnected => self.on_show_connected(msg, module_id, time),
            _ => vec![],
        }
    }

    fn on_initiate(&mut self, msg: &Message, module_id: &str) -> Vec<Action> {
        if msg.module_id == module_id && msg.io_id == self.io_id {
            return vec![];
        }
        if self.state == OutputState::SelfPending {
            // Concurrent initiators: the byte-wise lower module id wins.
            if msg.module_id.as_bytes() < module_id.as_bytes() {
                info!("[{}] {} yields race to {}", module_id, self.io_id, msg.module_id);
                self.state = OutputState::OtherPending;
            }
        } else {
            self.state = OutputState::OtherPending;
        }
        vec![]
    }

    fn on_cancel(&mut self) -> Vec<Action> {
        if self.state != OutputState::Idle {
            self.state = OutputState::Idle;
        }
        vec![]
    }

    fn on_compatible(&mut self, msg: &Message, module_id: &str) -> Vec<Action> {
        if msg.module_id == module_id {
            return vec![];
        }
        if let Ok(payload) = msg.payload_as::<CompatiblePayload>() {
            self.state = if payload.io_type == self.io_type {
                OutputState::Compatible
            } else {
                OutputState::NotCompatible
            };
        }
        vec![]
    }

    fn on_connect(&mut self, msg: &Message, module_id: &str) -> Vec<Action> {
        // CONNECT addresses the source jack it commits to.
        if msg.module_id == module_id
            && msg.io_id == self.io_id
            && self.state == OutputState::SelfPending
        {
            info!("[{}] {} connected", module_id, self.io_id);
            self.state = OutputState::Idle;
        }
        vec![]
    }

    fn on_show_connected(&mut self, msg: &Message, module_id: &str, time: i64) -> Vec<Action> {
        if let Ok(payload) = msg.payload_as::<ShowConnectedPayload>() {
            if payload.target_mod == module_id && payload.target_io == self.io_id {
                self.reveal_until = Some(time + REVEAL_MS);
            }
        }
        vec![]
    }

    pub(crate) fn reset(&mut self) {
        self.state = OutputState::Idle;
        self.reveal_until = None;
    }
}

pub(crate) struct InputJack {
    pub(crate) io_id: String,
    pub(crate) io_type: IoType,
    pub(crate) state: InputState,
    pub(crate) record: Option<ConnectionRecord>,
    pending: Option<ConnectionRecord>,
}

impl InputJack {
    pub(crate) fn new(io_id: &str, io_type: IoType) -> Self {
        InputJack {
            io_id: io_id.to_owned(),
            io_type,
            state: InputState::Disconnected,
            record: None,
            pending: None,
        }
    }

    pub(crate) fn led(&self, _time: i64) -> LedState {
        match self.state {
            InputState::Pending => LedState::Solid,
            InputState::SelfCompatible | InputState::PendingSame => LedState::BlinkSlow,
            InputState::Connected => LedState::BlinkRapid,
            InputState::Disconnected | InputState::OtherPending | InputState::OtherCompatible => {
                LedState::Off
            }
        }
    }

    pub(crate) fn short_press(&mut self, module_id: &str) -> Vec<Action> {
        match self.state {
            InputState::Disconnected => {
                let payload = CompatiblePayload { io_type: self.io_type };
                match Message::with_payload(
                    MessageKind::Compatible,
                    module_id,
                    self.io_type,
                    &self.io_id,
                    &payload,
                ) {
                    Ok(msg) => {
                        self.state = InputState::SelfCompatible;
                        info!("[{}] COMPATIBLE from {}", module_id, self.io_id);
                        vec![Action::Send(msg)]
                    }
                    Err(e) => {
                        info!("[{}] COMPATIBLE encode failed: {:?}", module_id, e);
                        vec![]
                    }
                }
            }
            InputState::Pending => self.commit(module_id),
            InputState::Connected => match &self.record {
                Some(record) => {
                    let payload = ShowConnectedPayload {
                        target_mod: record.src_mod.clone(),
                        target_io: record.src_io.clone(),
                    };
                    match Message::with_payload(
                        MessageKind::ShowConnected,
                        module_id,
                        self.io_type,
                        &self.io_id,
                        &payload,
                    ) {
                        Ok(msg) => vec![Action::Send(msg)],
                        Err(e) => {
                            info!("[{}] SHOW_CONNECTED encode failed: {:?}", module_id, e);
                            vec![]
                        }
                    }
                }
                None => vec![],
            },
            InputState::SelfCompatible => {
                self.state = InputState::Disconnected;
                vec![Action::Send(Message::new(
                    MessageKind::Cancel,
                    module_id,
                    self.io_type,
                    &self.io_id,
                ))]
            }
            _ => vec![],
        }
    }

    pub(crate) fn long_press(&mut self, module_id: &str) -> Vec<Action> {
        match self.state {
            InputState::Connected => {
                self.state = InputState::Disconnected;
                match self.record.take() {
                    Some(record) => {
                        info!("[{}] disconnected {}", module_id, self.io_id);
                        vec![Action::StopReceiver {
                            io_id: self.io_id.clone(),
                            record,
                        }]
                    }
                    None => vec![],
                }
            }
            InputState::SelfCompatible => {
                self.state = InputState::Disconnected;
                vec![Action::Send(Message::new(
                    MessageKind::Cancel,
                    module_id,
                    self.io_type,
                    &self.io_id,
                ))]
            }
            _ => vec![],
        }
    }

    /// Atomic commit of the pending offer: record, group membership and
    /// routing, then the `CONNECT` addressed at the source jack.
    fn commit(&mut self, module_id: &str) -> Vec<Action> {
        let record = match self.pending.take() {
            Some(pending) => pending,
            None => {
                debug!("[{}] {} pending without initiator", module_id, self.io_id);
                return vec![];
            }
        };
        self.record = Some(record.clone());
        self.state = InputState::Connected;
        info!(
            "[{}] {} committed to {}:{}",
            module_id, self.io_id, record.src_mod, record.src_io
        );
        let connect = Message::new(
            MessageKind::Connect,
            &record.src_mod,
            self.io_type,
            &record.src_io,
        );
        vec![
            Action::StartReceiver {
                io_id: self.io_id.clone(),
                record,
            },
            Action::Send(connect),
        ]
    }

    pub(crate) fn handle(&mut self, msg: &Message, module_id: &str) -> Vec<Action> {
        match msg.kind {
            MessageKind::Initiate => self.on_initiate(msg, module_id),
            MessageKind::Cancel => self.on_cancel(),
            _ => vec![],
        }
    }

    fn on_initiate(&mut self, msg: &Message, module_id: &str) -> Vec<Action> {
        if msg.module_id == module_id {
            return vec![];
        }
        let payload = match msg.payload_as::<InitiatePayload>() {
            Ok(payload) => payload,
            Err(_) => return vec![],
        };
        let type_match = payload.io_type == self.io_type;
        let exact_match = self
            .record
            .as_ref()
            .map_or(false, |r| r.group == payload.group && r.offset == payload.offset);
        match (type_match, self.record.is_some()) {
            (false, false) => {
                self.state = InputState::OtherCompatible;
                self.pending = None;
            }
            (false, true) => self.state = InputState::OtherPending,
            (true, true) if exact_match => self.state = InputState::PendingSame,
            (true, true) => {
                // Already fed by a different source of this type: keep it.
            }
            (true, false) => {
                let offered = ConnectionRecord {
                    src_mod: msg.module_id.clone(),
                    src_io: msg.io_id.clone(),
                    group: payload.group,
                    offset: payload.offset,
                    block_size: payload.block_size,
                };
                // On a race between initiators, keep the byte-wise lower
                // module id, mirroring the output-side tie-breaker.
                let keep_current = matches!(
                    (&self.state, &self.pending),
                    (InputState::Pending, Some(current))
                        if current.src_mod.as_bytes() <= offered.src_mod.as_bytes()
                );
                if !keep_current {
                    self.pending = Some(offered);
                }
                self.state = InputState::Pending;
            }
        }
        vec![]
    }

    fn on_cancel(&mut self) -> Vec<Action> {
        self.pending = None;
        match self.state {
            InputState::Pending | InputState::SelfCompatible | InputState::OtherCompatible => {
                self.state = InputState::Disconnected;
            }
            InputState::PendingSame | InputState::OtherPending => {
                self.state = InputState::Connected;
            }
            InputState::Connected | InputState::Disconnected => {}
        }
        vec![]
    }

    /// Forced reconnect during a patch restore; membership and routing are
    /// handled by the caller.
    pub(crate) fn install(&mut self, record: ConnectionRecord) {
        self.record = Some(record);
        self.pending = None;
        self.state = InputState::Connected;
    }

    /// Forced teardown during a patch restore.
    pub(crate) fn wipe(&mut self) -> Option<ConnectionRecord> {
        self.pending = None;
        self.state = InputState::Disconnected;
        self.record.take()
    }
}
