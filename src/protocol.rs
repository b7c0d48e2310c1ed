/*! Wire codec for control-plane messages.

Every message is a fixed 8-byte header followed by three variable-length
fields:

```text
kind:u8 | mod_len:u16 | io_type:u8 | io_len:u16 | payload_len:u16
| module_id (UTF-8) | io_id (UTF-8) | payload (UTF-8 JSON)
```

Integer fields are network byte order. Trailing bytes past the declared
lengths are ignored, so the format can grow without breaking old receivers.
Anything undecodable is reported as [`Error::Parse`] and dropped silently by
the dispatcher.
*/

use std::net::Ipv4Addr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::module::ModuleState;
use crate::{Error, IoType};

impl From<serde_json::Error> for Error {
    fn from(_: serde_json::Error) -> Self {
        Error::Parse
    }
}

#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone, Debug)]
#[repr(C)]
struct Header {
    kind: u8,
    mod_len: U16<NetworkEndian>,
    io_type: u8,
    io_len: U16<NetworkEndian>,
    payload_len: U16<NetworkEndian>,
}

const HEADER_LEN: usize = 8;

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum MessageKind {
    /// An output announces a connection attempt.
    Initiate,
    /// Global revert of every pending-like state.
    Cancel,
    /// An input announces "I am looking for a source of this type".
    Compatible,
    /// An input tells its chosen source the handshake is complete.
    Connect,
    /// An input asks its connected source to flash its LED.
    ShowConnected,
    StateInquiry,
    StateResponse,
    CapabilitiesInquiry,
    CapabilitiesResponse,
    PatchRestore,
}

impl MessageKind {
    fn from_byte(b: u8) -> Option<MessageKind> {
        match b {
            1 => Some(MessageKind::Initiate),
            2 => Some(MessageKind::Cancel),
            3 => Some(MessageKind::Compatible),
            4 => Some(MessageKind::Connect),
            5 => Some(MessageKind::ShowConnected),
            10 => Some(MessageKind::StateInquiry),
            11 => Some(MessageKind::StateResponse),
            12 => Some(MessageKind::CapabilitiesInquiry),
            13 => Some(MessageKind::CapabilitiesResponse),
            20 => Some(MessageKind::PatchRestore),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            MessageKind::Initiate => 1,
            MessageKind::Cancel => 2,
            MessageKind::Compatible => 3,
            MessageKind::Connect => 4,
            MessageKind::ShowConnected => 5,
            MessageKind::StateInquiry => 10,
            MessageKind::StateResponse => 11,
            MessageKind::CapabilitiesInquiry => 12,
            MessageKind::CapabilitiesResponse => 13,
            MessageKind::PatchRestore => 20,
        }
    }
}

/// One decoded control message. `module_id`/`io_id` usually name the sender,
/// except for `Connect` where they address the source jack being committed
/// to.
#[derive(PartialEq, Clone, Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub module_id: String,
    pub io_type: IoType,
    pub io_id: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, module_id: &str, io_type: IoType, io_id: &str) -> Message {
        Message {
            kind,
            module_id: module_id.to_owned(),
            io_type,
            io_id: io_id.to_owned(),
            payload: b"{}".to_vec(),
        }
    }

    pub fn with_payload<P: Serialize>(
        kind: MessageKind,
        module_id: &str,
        io_type: IoType,
        io_id: &str,
        payload: &P,
    ) -> Result<Message, Error> {
        let mut msg = Message::new(kind, module_id, io_type, io_id);
        msg.payload = serde_json::to_vec(payload)?;
        Ok(msg)
    }

    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, Error> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = Header {
            kind: self.kind.as_byte(),
            mod_len: U16::new(self.module_id.len() as u16),
            io_type: self.io_type.as_byte(),
            io_len: U16::new(self.io_id.len() as u16),
            payload_len: U16::new(self.payload.len() as u16),
        };
        let mut buf =
            Vec::with_capacity(HEADER_LEN + self.module_id.len() + self.io_id.len() + self.payload.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(self.module_id.as_bytes());
        buf.extend_from_slice(self.io_id.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Message, Error> {
        let header = Header::read_from_prefix(buf).ok_or(Error::Parse)?;
        let kind = MessageKind::from_byte(header.kind).ok_or(Error::Parse)?;
        let mod_len = header.mod_len.get() as usize;
        let io_len = header.io_len.get() as usize;
        let payload_len = header.payload_len.get() as usize;
        if buf.len() < HEADER_LEN + mod_len + io_len + payload_len {
            return Err(Error::Parse);
        }
        let mod_end = HEADER_LEN + mod_len;
        let io_end = mod_end + io_len;
        let module_id = core::str::from_utf8(&buf[HEADER_LEN..mod_end])
            .map_err(|_| Error::Parse)?
            .to_owned();
        let io_id = core::str::from_utf8(&buf[mod_end..io_end])
            .map_err(|_| Error::Parse)?
            .to_owned();
        Ok(Message {
            kind,
            module_id,
            io_type: IoType::from_byte(header.io_type),
            io_id,
            payload: buf[io_end..io_end + payload_len].to_vec(),
        })
    }
}

/// `INITIATE` body: everything a sink needs to later join the stream.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct InitiatePayload {
    pub group: Ipv4Addr,
    #[serde(rename = "type")]
    pub io_type: IoType,
    pub offset: u16,
    pub block_size: u16,
}

/// `COMPATIBLE` body.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct CompatiblePayload {
    #[serde(rename = "type")]
    pub io_type: IoType,
}

/// `SHOW_CONNECTED` body, addressing the source jack whose LED should flash.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ShowConnectedPayload {
    pub target_mod: String,
    pub target_io: String,
}

/// `PATCH_RESTORE` body, targeted at one module.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RestorePayload {
    pub target_mod: String,
    pub state: ModuleState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initiate() -> Message {
        Message::with_payload(
            MessageKind::Initiate,
            "osc_0",
            IoType::Audio,
            "audio",
            &InitiatePayload {
                group: Ipv4Addr::new(239, 100, 0, 100),
                io_type: IoType::Audio,
                offset: 0,
                block_size: 96,
            },
        )
        .unwrap()
    }

    #[test]
    fn header_layout_is_fixed_and_network_order() {
        let buf = initiate().encode();
        assert_eq!(buf[0], 1); // INITIATE
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 5); // "osc_0"
        assert_eq!(buf[3], IoType::Audio.as_byte());
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 5); // "audio"
        let payload_len = u16::from_be_bytes([buf[6], buf[7]]) as usize;
        assert_eq!(buf.len(), 8 + 5 + 5 + payload_len);
        assert_eq!(&buf[8..13], b"osc_0");
        assert_eq!(&buf[13..18], b"audio");
    }

    #[test]
    fn round_trips_every_kind() {
        for kind in [
            MessageKind::Initiate,
            MessageKind::Cancel,
            MessageKind::Compatible,
            MessageKind::Connect,
            MessageKind::ShowConnected,
            MessageKind::StateInquiry,
            MessageKind::StateResponse,
            MessageKind::CapabilitiesInquiry,
            MessageKind::CapabilitiesResponse,
            MessageKind::PatchRestore,
        ] {
            let msg = Message::new(kind, "sink_0", IoType::Cv, "left");
            assert_eq!(Message::decode(&msg.encode()), Ok(msg));
        }
    }

    #[test]
    fn short_and_truncated_buffers_fail() {
        assert_eq!(Message::decode(&[]), Err(Error::Parse));
        assert_eq!(Message::decode(&[1, 0, 0, 2, 0, 0, 0]), Err(Error::Parse));
        let mut buf = initiate().encode();
        buf.truncate(buf.len() - 1);
        assert_eq!(Message::decode(&buf), Err(Error::Parse));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let msg = initiate();
        let mut buf = msg.encode();
        buf.extend_from_slice(b"future extension");
        assert_eq!(Message::decode(&buf), Ok(msg));
    }

    #[test]
    fn unknown_kind_and_bad_utf8_fail() {
        let mut buf = initiate().encode();
        buf[0] = 99;
        assert_eq!(Message::decode(&buf), Err(Error::Parse));
        let mut buf = initiate().encode();
        buf[8] = 0xff; // first byte of module_id
        assert_eq!(Message::decode(&buf), Err(Error::Parse));
    }

    #[test]
    fn out_of_range_io_type_decodes_to_unknown() {
        let mut buf = initiate().encode();
        buf[3] = 250;
        let msg = Message::decode(&buf).unwrap();
        assert_eq!(msg.io_type, IoType::Unknown);
    }

    #[test]
    fn initiate_payload_shape() {
        let msg = initiate();
        let json: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(json["group"], "239.100.0.100");
        assert_eq!(json["type"], "audio");
        assert_eq!(json["offset"], 0);
        assert_eq!(json["block_size"], 96);
        let parsed: InitiatePayload = msg.payload_as().unwrap();
        assert_eq!(parsed.group, Ipv4Addr::new(239, 100, 0, 100));
    }
}
