use std::net::Ipv4Addr;
use uuid::Uuid;

/// An error while decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("need at least {0} more bytes")]
    EndOfStream(usize),
    #[error("datagram of {0} bytes is shorter than a packet header")]
    TruncatedHeader(usize),
    #[error("appended ack count {count} does not fit in a {length}-byte datagram")]
    InvalidAckCount { count: usize, length: usize },
    #[error("zero run is missing its count byte")]
    TruncatedZeroRun,
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

/// A raw decoder for a message body.
///
/// Body fields are little-endian; the few network-order fields
/// (ports, header sequence numbers) have dedicated `_be` readers.
#[derive(Debug)]
pub struct Decoder<'a> {
    buffer: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder from the buffer it will read from.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// Gets the remaining buffer.
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    /// Returns if there is no data left in the buffer.
    pub fn is_finished(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consumes `n` bytes from the buffer, returning them as a slice.
    pub fn consume_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if n <= self.buffer.len() {
            let (data, buffer) = self.buffer.split_at(n);
            self.buffer = buffer;
            Ok(data)
        } else {
            Err(DecodeError::EndOfStream(n - self.buffer.len()))
        }
    }

    /// Consumes `N` bytes into an array.
    pub fn consume<const N: usize>(&mut self) -> Result<[u8; N]> {
        let data = self.consume_slice(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(data);
        Ok(array)
    }

    /// Reads an unsigned byte from the stream.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.consume::<1>().map(|[x]| x)
    }

    /// Reads a signed byte from the stream.
    pub fn read_i8(&mut self) -> Result<i8> {
        self.consume().map(i8::from_le_bytes)
    }

    /// Reads a little-endian unsigned short from the stream.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.consume().map(u16::from_le_bytes)
    }

    /// Reads a big-endian unsigned short from the stream.
    pub fn read_u16_be(&mut self) -> Result<u16> {
        self.consume().map(u16::from_be_bytes)
    }

    /// Reads a little-endian unsigned int from the stream.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.consume().map(u32::from_le_bytes)
    }

    /// Reads a big-endian unsigned int from the stream.
    pub fn read_u32_be(&mut self) -> Result<u32> {
        self.consume().map(u32::from_be_bytes)
    }

    /// Reads a little-endian signed int from the stream.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.consume().map(i32::from_le_bytes)
    }

    /// Reads a little-endian unsigned long from the stream.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.consume().map(u64::from_le_bytes)
    }

    /// Reads a little-endian float from the stream.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.consume().map(f32::from_le_bytes)
    }

    /// Reads a frequency-encoded message number.
    ///
    /// High-frequency numbers take one byte, medium-frequency
    /// numbers are escaped with `0xFF`, and low/fixed numbers with
    /// `0xFF 0xFF` followed by a big-endian short. The result is the
    /// big-endian interpretation of the bytes read, so that
    /// [`Encoder::write_message_id`](super::Encoder::write_message_id)
    /// can reproduce them exactly.
    pub fn read_message_id(&mut self) -> Result<u32> {
        let first = self.read_u8()?;
        if first != 0xFF {
            return Ok(u32::from(first));
        }
        let second = self.read_u8()?;
        if second != 0xFF {
            return Ok(0xFF00 | u32::from(second));
        }
        Ok(0xFFFF_0000 | u32::from(self.read_u16_be()?))
    }
}

/// A type that can be read from a [`Decoder`].
pub trait Decode: Sized {
    fn decode(decoder: &mut Decoder) -> Result<Self>;
}

impl Decode for u8 {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_u8()
    }
}

impl Decode for i8 {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_i8()
    }
}

impl Decode for u16 {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_u16()
    }
}

impl Decode for u32 {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_u32()
    }
}

impl Decode for i32 {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_i32()
    }
}

impl Decode for u64 {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_u64()
    }
}

impl Decode for f32 {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_f32()
    }
}

impl Decode for Uuid {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.consume::<16>().map(Uuid::from_bytes)
    }
}

impl Decode for Ipv4Addr {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.consume::<4>().map(Ipv4Addr::from)
    }
}
