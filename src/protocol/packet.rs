use crate::protocol::{
    header::FIXED_HEADER_LEN,
    message::PacketAck,
    zerocode, Decode, DecodeError, Decoder, Encode, Encoder, Header, Message, MessageKind,
    PacketFlags,
};
use std::borrow::Cow;

/// A decoded datagram: header plus typed message.
///
/// Packets are plain values. Rewriting code builds a new `Packet`
/// rather than patching a received buffer, and copies the sequence
/// number and ack list across with [`Packet::carry_header_from`].
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub message: Message,
}

impl Packet {
    /// Creates an unreliable, unsequenced packet. The sequence
    /// number is assigned when the packet is injected.
    pub fn new(message: impl Into<Message>) -> Self {
        Self {
            header: Header::default(),
            message: message.into(),
        }
    }

    /// Marks the packet as reliable.
    pub fn reliable(mut self) -> Self {
        self.header.flags.insert(PacketFlags::RELIABLE);
        self
    }

    /// Marks the packet body as zero-run coded on the wire.
    pub fn zerocoded(mut self) -> Self {
        self.header.flags.insert(PacketFlags::ZEROCODED);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn is_reliable(&self) -> bool {
        self.header.is_reliable()
    }

    /// A standalone ack of `ids`.
    pub fn ack(ids: Vec<u32>) -> Self {
        Self::new(PacketAck { packets: ids })
    }

    /// Builds a standalone ack carrying this packet's appended acks
    /// and sequence number, so the acks survive when the packet
    /// itself is dropped.
    pub fn separate_acks(&self) -> Packet {
        let mut ack = Packet::ack(self.header.acks.clone());
        ack.header.sequence = self.header.sequence;
        ack
    }

    /// Copies the sequence number and appended ack list from the
    /// packet this one replaces.
    pub fn carry_header_from(&mut self, original: &Packet) {
        self.header.sequence = original.header.sequence;
        if original.header.has_acks() || self.header.has_acks() {
            self.header.set_acks(original.header.acks.clone());
        }
    }

    /// Decodes a datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        let length = datagram.len();
        if length < FIXED_HEADER_LEN + 1 {
            return Err(DecodeError::TruncatedHeader(length));
        }

        let flags = PacketFlags::from_bits_retain(datagram[0]);
        let mut decoder = Decoder::new(&datagram[1..FIXED_HEADER_LEN]);
        let sequence = decoder.read_u32_be()?;
        let extra_len = usize::from(decoder.read_u8()?);
        let body_start = FIXED_HEADER_LEN + extra_len;
        if body_start >= length {
            return Err(DecodeError::TruncatedHeader(length));
        }
        let extra = datagram[FIXED_HEADER_LEN..body_start].to_vec();

        let mut body_end = length;
        let mut acks = Vec::new();
        if flags.contains(PacketFlags::APPENDED_ACKS) {
            let count = usize::from(datagram[length - 1]);
            let acks_len = count * 4 + 1;
            if body_start + acks_len >= length {
                return Err(DecodeError::InvalidAckCount { count, length });
            }
            body_end = length - acks_len;
            let mut decoder = Decoder::new(&datagram[body_end..length - 1]);
            for _ in 0..count {
                acks.push(decoder.read_u32_be()?);
            }
        }

        let body = &datagram[body_start..body_end];
        let body = if flags.contains(PacketFlags::ZEROCODED) {
            Cow::Owned(zerocode::decode(body)?)
        } else {
            Cow::Borrowed(body)
        };
        let message = Message::decode(&mut Decoder::new(&body))?;

        Ok(Self {
            header: Header {
                flags,
                sequence,
                extra,
                acks,
            },
            message,
        })
    }

    /// Encodes the packet to a datagram, zero-run coding the body
    /// if the packet is flagged `ZEROCODED`.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.message.encode(&mut Encoder::new(&mut body));

        // The count byte caps appended acks at 255.
        let count = u8::try_from(self.header.acks.len()).unwrap_or(u8::MAX);
        if usize::from(count) < self.header.acks.len() {
            tracing::warn!(
                "Dropping {} appended acks past the first {count}",
                self.header.acks.len() - usize::from(count)
            );
        }
        let acks = &self.header.acks[..usize::from(count)];
        let mut flags = self.header.flags;
        flags.set(PacketFlags::APPENDED_ACKS, !acks.is_empty());

        let mut buffer = Vec::with_capacity(
            FIXED_HEADER_LEN + self.header.extra.len() + body.len() + acks.len() * 4 + 1,
        );
        let mut encoder = Encoder::new(&mut buffer);
        encoder.write_u8(flags.bits());
        encoder.write_u32_be(self.header.sequence);
        encoder.write_u8(self.header.extra.len().try_into().unwrap_or(u8::MAX));
        encoder.write_slice(&self.header.extra[..self.header.extra.len().min(usize::from(u8::MAX))]);

        if flags.contains(PacketFlags::ZEROCODED) {
            zerocode::encode(&body, &mut buffer);
        } else {
            buffer.extend_from_slice(&body);
        }

        if !acks.is_empty() {
            let mut encoder = Encoder::new(&mut buffer);
            for &ack in acks {
                encoder.write_u32_be(ack);
            }
            encoder.write_u8(count);
        }
        buffer
    }
}
