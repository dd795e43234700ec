use bitflags::bitflags;

bitflags! {
    /// Flags in the first byte of every datagram.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        const ZEROCODED = 0x80;
        const RELIABLE = 0x40;
        const RESENT = 0x20;
        const APPENDED_ACKS = 0x10;
    }
}

/// Length of the fixed part of the header: flags, sequence
/// number and extra header length.
pub const FIXED_HEADER_LEN: usize = 6;

/// Per-datagram header.
///
/// `acks` holds the appended ack list, which on the wire trails the
/// message body. `APPENDED_ACKS` is kept consistent with it by
/// [`Header::set_acks`] and is recomputed on encode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub flags: PacketFlags,
    pub sequence: u32,
    /// Opaque extra header bytes, forwarded as-is.
    pub extra: Vec<u8>,
    pub acks: Vec<u32>,
}

impl Header {
    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn has_acks(&self) -> bool {
        !self.acks.is_empty()
    }

    pub fn set_acks(&mut self, acks: Vec<u32>) {
        self.flags.set(PacketFlags::APPENDED_ACKS, !acks.is_empty());
        self.acks = acks;
    }
}
