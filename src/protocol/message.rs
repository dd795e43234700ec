//! Message bodies the proxy understands.
//!
//! Full parsing of messages is _not_ implemented. Only the fields
//! needed for address rewriting and acknowledgment are decoded. The
//! remainder of each body is kept as a `Vec<u8>` so that re-encoding
//! is lossless. Message numbers without a variant here decode to
//! [`Message::Other`].

use crate::protocol::{Decoder, Encoder, UnknownMessage};
use grid_proxy_macros::{Decode, Encode, FromVariants};
use std::net::Ipv4Addr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Encode, Decode, FromVariants, strum::AsRefStr, strum::EnumDiscriminants)]
#[strum_discriminants(
    name(MessageKind),
    derive(Hash, strum::AsRefStr, strum::EnumString, strum::Display, strum::EnumIter)
)]
pub enum Message {
    #[encoding(id = 0x01)]
    StartPingCheck(StartPingCheck),
    #[encoding(id = 0x02)]
    CompletePingCheck(CompletePingCheck),
    #[encoding(id = 0x04)]
    AgentUpdate(AgentUpdate),
    #[encoding(id = 0xFF07)]
    CrossedRegion(CrossedRegion),
    #[encoding(id = 0xFFFF0003)]
    UseCircuitCode(UseCircuitCode),
    #[encoding(id = 0xFFFF0045)]
    TeleportFinish(TeleportFinish),
    #[encoding(id = 0xFFFF0050)]
    ChatFromViewer(ChatFromViewer),
    #[encoding(id = 0xFFFF008B)]
    ChatFromSimulator(ChatFromSimulator),
    #[encoding(id = 0xFFFF0094)]
    RegionHandshake(RegionHandshake),
    #[encoding(id = 0xFFFF0097)]
    EnableSimulator(EnableSimulator),
    #[encoding(id = 0xFFFF0098)]
    DisableSimulator(DisableSimulator),
    #[encoding(id = 0xFFFF00F9)]
    CompleteAgentMovement(CompleteAgentMovement),
    #[encoding(id = 0xFFFF00FC)]
    LogoutRequest(LogoutRequest),
    #[encoding(id = 0xFFFFFFFB)]
    PacketAck(PacketAck),
    #[encoding(id = 0xFFFFFFFC)]
    OpenCircuit(OpenCircuit),
    #[encoding(id = 0xFFFFFFFD)]
    CloseCircuit(CloseCircuit),
    #[encoding(other)]
    Other(RawMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        MessageKind::from(self)
    }
}

/// A message we do not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: u32,
    pub body: Vec<u8>,
}

impl UnknownMessage for RawMessage {
    fn message_id(&self) -> u32 {
        self.id
    }

    fn encode_body(&self, encoder: &mut Encoder) {
        encoder.write_slice(&self.body);
    }

    fn decode_body(id: u32, decoder: &mut Decoder) -> crate::protocol::decoder::Result<Self> {
        let body = decoder.consume_slice(decoder.buffer().len())?.to_vec();
        Ok(Self { id, body })
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StartPingCheck {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct CompletePingCheck {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct AgentUpdate {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

/// Sent to the client when it moves into a neighbouring region.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct CrossedRegion {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub sim_ip: Ipv4Addr,
    #[encoding(big_endian)]
    pub sim_port: u16,
    pub region_handle: u64,
    #[encoding(length_prefix = "u16")]
    pub seed_capability: Vec<u8>,
    /// Position and look-at vectors.
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct UseCircuitCode {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

/// Sent to the client when a teleport lands it in a new region.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct TeleportFinish {
    pub agent_id: Uuid,
    pub location_id: u32,
    pub sim_ip: Ipv4Addr,
    #[encoding(big_endian)]
    pub sim_port: u16,
    pub region_handle: u64,
    #[encoding(length_prefix = "u16")]
    pub seed_capability: Vec<u8>,
    /// Sim access and teleport flags.
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ChatFromViewer {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ChatFromSimulator {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct RegionHandshake {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

/// Tells the client a neighbouring simulator is reachable.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct EnableSimulator {
    pub handle: u64,
    pub ip: Ipv4Addr,
    #[encoding(big_endian)]
    pub port: u16,
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct DisableSimulator {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct CompleteAgentMovement {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct LogoutRequest {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

/// Standalone acknowledgment of a batch of sequence numbers.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PacketAck {
    #[encoding(length_prefix = "u8")]
    pub packets: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct OpenCircuit {
    pub ip: Ipv4Addr,
    #[encoding(big_endian)]
    pub port: u16,
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct CloseCircuit {
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Decode, Encode};
    use std::str::FromStr;

    fn encode(message: &Message) -> Vec<u8> {
        let mut buffer = Vec::new();
        message.encode(&mut Encoder::new(&mut buffer));
        buffer
    }

    #[test]
    fn message_numbers_use_frequency_encoding() {
        let high = Message::from(StartPingCheck {
            ignored_data: vec![9],
        });
        assert_eq!(encode(&high), [0x01, 9]);

        let medium = Message::from(CrossedRegion {
            agent_id: Uuid::nil(),
            session_id: Uuid::nil(),
            sim_ip: Ipv4Addr::new(10, 0, 0, 5),
            sim_port: 9000,
            region_handle: 1,
            seed_capability: Vec::new(),
            ignored_data: Vec::new(),
        });
        assert_eq!(&encode(&medium)[..2], [0xFF, 0x07]);

        let fixed = Message::from(PacketAck {
            packets: vec![0x0102_0304],
        });
        assert_eq!(
            encode(&fixed),
            [0xFF, 0xFF, 0xFF, 0xFB, 1, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn ports_are_big_endian() {
        let message = Message::from(OpenCircuit {
            ip: Ipv4Addr::new(1, 2, 3, 4),
            port: 0x1234,
            ignored_data: Vec::new(),
        });
        assert_eq!(encode(&message)[4..], [1, 2, 3, 4, 0x12, 0x34]);
    }

    #[test]
    fn unknown_numbers_are_kept_raw() {
        let bytes = [0xFF, 0xFF, 0x01, 0x2C, 1, 2, 3];
        let message = Message::decode(&mut Decoder::new(&bytes)).unwrap();
        assert_eq!(
            message,
            Message::Other(RawMessage {
                id: 0xFFFF_012C,
                body: vec![1, 2, 3],
            })
        );
        assert_eq!(message.message_id(), 0xFFFF_012C);
        assert_eq!(encode(&message), bytes);
    }

    #[test]
    fn teleport_finish_fields() {
        let mut bytes = vec![0xFF, 0xFF, 0x00, 0x45];
        bytes.extend([0u8; 16]);
        bytes.extend(7u32.to_le_bytes());
        bytes.extend([10, 0, 0, 5]);
        bytes.extend(9000u16.to_be_bytes());
        bytes.extend(42u64.to_le_bytes());
        bytes.extend(4u16.to_le_bytes());
        bytes.extend(b"abc\0");
        bytes.extend([13, 0, 0, 0, 0]);

        let message = Message::decode(&mut Decoder::new(&bytes)).unwrap();
        let Message::TeleportFinish(finish) = &message else {
            panic!("decoded {message:?}");
        };
        assert_eq!(finish.sim_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(finish.sim_port, 9000);
        assert_eq!(finish.region_handle, 42);
        assert_eq!(finish.seed_capability, b"abc\0");
        assert_eq!(finish.ignored_data, [13, 0, 0, 0, 0]);
        assert_eq!(encode(&message), bytes);
    }

    #[test]
    fn kinds_parse_from_names() {
        assert_eq!(
            MessageKind::from_str("ChatFromViewer").unwrap(),
            MessageKind::ChatFromViewer
        );
        assert!(MessageKind::from_str("NoSuchMessage").is_err());
    }
}
