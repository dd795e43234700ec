use std::net::Ipv4Addr;
use uuid::Uuid;

/// A raw encoder for a message body.
#[derive(Debug)]
pub struct Encoder<'a> {
    buffer: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    /// Creates an encoder that will append to the provided
    /// byte buffer.
    ///
    /// Any existing contents of `buffer` are left untouched.
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self { buffer }
    }

    /// Writes an unsigned byte to the stream.
    pub fn write_u8(&mut self, x: u8) {
        self.buffer.push(x);
    }

    /// Writes a signed byte to the stream.
    pub fn write_i8(&mut self, x: i8) {
        self.write_u8(bytemuck::cast(x));
    }

    /// Writes a little-endian unsigned short to the stream.
    pub fn write_u16(&mut self, x: u16) {
        self.buffer.extend(x.to_le_bytes());
    }

    /// Writes a big-endian unsigned short to the stream.
    pub fn write_u16_be(&mut self, x: u16) {
        self.buffer.extend(x.to_be_bytes());
    }

    /// Writes a little-endian unsigned int to the stream.
    pub fn write_u32(&mut self, x: u32) {
        self.buffer.extend(x.to_le_bytes());
    }

    /// Writes a big-endian unsigned int to the stream.
    pub fn write_u32_be(&mut self, x: u32) {
        self.buffer.extend(x.to_be_bytes());
    }

    /// Writes a little-endian signed int to the stream.
    pub fn write_i32(&mut self, x: i32) {
        self.buffer.extend(x.to_le_bytes());
    }

    /// Writes a little-endian unsigned long to the stream.
    pub fn write_u64(&mut self, x: u64) {
        self.buffer.extend(x.to_le_bytes());
    }

    /// Writes a little-endian float to the stream.
    pub fn write_f32(&mut self, x: f32) {
        self.buffer.extend(x.to_le_bytes());
    }

    /// Writes a series of bytes to the stream. Does not write
    /// any sort of length prefix.
    pub fn write_slice(&mut self, slice: &[u8]) {
        self.buffer.extend_from_slice(slice);
    }

    /// Writes a frequency-encoded message number: the shortest
    /// big-endian form of `id` (1, 2 or 4 bytes).
    pub fn write_message_id(&mut self, id: u32) {
        let bytes = id.to_be_bytes();
        let skip = if id <= 0xFF {
            3
        } else if id <= 0xFFFF {
            2
        } else {
            0
        };
        self.write_slice(&bytes[skip..]);
    }
}

/// A type that can be written to an [`Encoder`].
pub trait Encode {
    fn encode(&self, encoder: &mut Encoder);
}

impl Encode for u8 {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(*self);
    }
}

impl Encode for i8 {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i8(*self);
    }
}

impl Encode for u16 {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u16(*self);
    }
}

impl Encode for u32 {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u32(*self);
    }
}

impl Encode for i32 {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i32(*self);
    }
}

impl Encode for u64 {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u64(*self);
    }
}

impl Encode for f32 {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_f32(*self);
    }
}

impl Encode for Uuid {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_slice(self.as_bytes());
    }
}

impl Encode for Ipv4Addr {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_slice(&self.octets());
    }
}
