//! Binary frame message encoding/decoding
//!
//! Standard layout, big-endian:
//!
//! | Timestamp µs (8B) | Y stride (4B) | U stride (4B) | V stride (4B) | EOS (1B) | Payload length (4B) | Pixel data |
//!
//! Legacy layout drops the V stride and the EOS byte (20-byte header).

use byteorder::{BigEndian, ByteOrder};

use super::{PlaneStrides, WireFormat};
use crate::cache::{BufferPool, FrameBuffer};
use crate::error::{DecodeError, Result};

pub const STANDARD_HEADER_SIZE: usize = 25;
pub const LEGACY_HEADER_SIZE: usize = 20;

/// Offset of the end-of-stream byte in the standard header.
pub const EOS_FLAG_OFFSET: usize = 20;

/// Frame header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub timestamp_us: i64,
    pub strides: PlaneStrides,
    pub end_of_stream: bool,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Write the header into the first `format.header_size()` bytes of `buf`.
    pub fn write(&self, format: WireFormat, buf: &mut [u8]) {
        BigEndian::write_i64(&mut buf[0..8], self.timestamp_us);
        BigEndian::write_u32(&mut buf[8..12], self.strides.y);
        BigEndian::write_u32(&mut buf[12..16], self.strides.u);

        match format {
            WireFormat::Standard => {
                BigEndian::write_u32(&mut buf[16..20], self.strides.v);
                buf[EOS_FLAG_OFFSET] = u8::from(self.end_of_stream);
                BigEndian::write_u32(&mut buf[21..25], self.payload_len);
            }
            WireFormat::Legacy => {
                BigEndian::write_u32(&mut buf[16..20], self.payload_len);
            }
        }
    }

    /// Parse a header from the start of `buf`.
    pub fn parse(buf: &[u8], format: WireFormat) -> Result<Self> {
        let size = format.header_size();
        if buf.len() < size {
            return Err(DecodeError::InvalidFrame(format!(
                "header needs {} bytes, got {}",
                size,
                buf.len()
            )));
        }

        let timestamp_us = BigEndian::read_i64(&buf[0..8]);
        let y = BigEndian::read_u32(&buf[8..12]);
        let u = BigEndian::read_u32(&buf[12..16]);

        let header = match format {
            WireFormat::Standard => {
                let eos = buf[EOS_FLAG_OFFSET];
                if eos > 1 {
                    return Err(DecodeError::InvalidFrame(format!(
                        "end-of-stream flag must be 0 or 1, got {}",
                        eos
                    )));
                }
                Self {
                    timestamp_us,
                    strides: PlaneStrides::planar(y, u, BigEndian::read_u32(&buf[16..20])),
                    end_of_stream: eos == 1,
                    payload_len: BigEndian::read_u32(&buf[21..25]),
                }
            }
            WireFormat::Legacy => Self {
                timestamp_us,
                strides: PlaneStrides::semi_planar(y, u),
                end_of_stream: false,
                payload_len: BigEndian::read_u32(&buf[16..20]),
            },
        };

        if header.payload_len > i32::MAX as u32 {
            return Err(DecodeError::InvalidFrame(format!(
                "payload length {} overflows int32",
                header.payload_len
            )));
        }

        Ok(header)
    }

    /// Header plus payload size.
    pub fn frame_size(&self, format: WireFormat) -> usize {
        format.header_size() + self.payload_len as usize
    }
}

/// Pack one decoded image into a pooled buffer.
///
/// `planes` are copied verbatim in the order given (Y, U, V or Y, UV) and are
/// never written to.
pub fn encode_frame(
    pool: &BufferPool,
    planes: &[&[u8]],
    timestamp_us: i64,
    strides: PlaneStrides,
    end_of_stream: bool,
    format: WireFormat,
) -> Result<FrameBuffer> {
    let payload_len: usize = planes.iter().map(|p| p.len()).sum();
    if payload_len > i32::MAX as usize {
        return Err(DecodeError::InvalidFrame(format!(
            "payload of {} bytes does not fit the wire format",
            payload_len
        )));
    }

    let header = FrameHeader {
        timestamp_us,
        strides,
        end_of_stream,
        payload_len: payload_len as u32,
    };

    let header_size = format.header_size();
    let total = header_size + payload_len;
    let mut buffer = pool.acquire(total);

    let out = buffer.fill(total);
    header.write(format, &mut out[..header_size]);

    let mut cursor = header_size;
    for plane in planes {
        out[cursor..cursor + plane.len()].copy_from_slice(plane);
        cursor += plane.len();
    }

    Ok(buffer)
}

/// Set the end-of-stream byte of an already encoded frame.
///
/// Returns false for the legacy format, which has no such field.
pub fn mark_end_of_stream(buffer: &mut FrameBuffer, format: WireFormat) -> bool {
    match format {
        WireFormat::Standard if buffer.len() > EOS_FLAG_OFFSET => {
            buffer.patch(EOS_FLAG_OFFSET, 1);
            true
        }
        _ => false,
    }
}

/// Parse one frame, returning its header and payload slice.
pub fn parse_frame(data: &[u8], format: WireFormat) -> Result<(FrameHeader, &[u8])> {
    let header = FrameHeader::parse(data, format)?;
    let start = format.header_size();
    let end = header.frame_size(format);

    if data.len() < end {
        return Err(DecodeError::InvalidFrame(format!(
            "payload truncated: expected {} bytes, got {}",
            header.payload_len,
            data.len() - start
        )));
    }

    Ok((header, &data[start..end]))
}

/// Iterator over back-to-back frames in one byte stream.
pub struct FrameIter<'a> {
    data: &'a [u8],
    format: WireFormat,
    failed: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(data: &'a [u8], format: WireFormat) -> Self {
        Self {
            data,
            format,
            failed: false,
        }
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<(FrameHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }

        match parse_frame(self.data, self.format) {
            Ok((header, payload)) => {
                self.data = &self.data[header.frame_size(self.format)..];
                Some(Ok((header, payload)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
