//! Wire format of the simulator protocol.
//!
//! A datagram is a short fixed header (flags, sequence number and an
//! optional extra header), a frequency-encoded message number, the
//! message body and optionally a trailing list of appended acks.
//! Everything between the header and the appended acks may be
//! zero-run coded.

mod decoder;
mod encoder;
pub mod header;
pub mod message;
pub mod packet;
pub mod zerocode;

pub use decoder::{Decode, DecodeError, Decoder};
pub use encoder::{Encode, Encoder};
pub use header::{Header, PacketFlags};
pub use message::{Message, MessageKind, RawMessage};
pub use packet::Packet;

/// Largest datagram we expect to receive.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Implemented by the payload of the catch-all message variant,
/// which keeps messages we do not decode as raw bytes.
pub trait UnknownMessage: Sized {
    fn message_id(&self) -> u32;

    fn encode_body(&self, encoder: &mut Encoder);

    fn decode_body(id: u32, decoder: &mut Decoder) -> decoder::Result<Self>;
}
