//! Tether wire protocol implementation.
//!
//! Every message on the link is one length-prefixed frame.
//!
//! ## Frame Format
//!
//! ```text
//! ┌────────────┬────────────┬────────────────┬─────────────────────┐
//! │   Length   │   Opcode   │ Correlation ID │       Payload       │
//! │  4 bytes   │  2 bytes   │    4 bytes     │  (variable length)  │
//! └────────────┴────────────┴────────────────┴─────────────────────┘
//! ```
//!
//! - All integers are little-endian
//! - Length counts every byte after the length field itself
//! - A response carries the correlation id of the request it answers
//!
//! Nothing in this module performs I/O on its own; the async helpers only
//! drive a reader or writer handed in by the caller.

pub mod payload;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size of the length prefix.
pub const LENGTH_SIZE: usize = 4;

/// Bytes covered by the length field before the payload (opcode + correlation id).
pub const HEADER_SIZE: usize = 6;

/// Payload limit used when nothing else is configured (1 MiB + 64 KiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024 + 64 * 1024;

/// Operation tags.
///
/// Requests are sent by the client, responses by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Exchange identities
    Handshake = 0x01,
    /// List a directory
    ListDir = 0x02,
    /// Metadata for one path
    GetFileInfo = 0x03,
    /// Read a byte range
    ReadFile = 0x04,
    /// Write a byte range
    WriteFile = 0x05,
    /// Create a directory
    CreateDir = 0x06,
    /// Delete a path
    Delete = 0x07,
    /// Rename a path within its parent
    Rename = 0x08,
    /// Search by name
    Search = 0x09,
    /// List drives / roots
    GetDrives = 0x0A,
    /// Capacity of the volume holding a path
    GetStorageInfo = 0x0B,
    /// Orderly session end
    Disconnect = 0xFF,
    /// Success without data
    Ok = 0x80,
    /// Failure with code and message
    Error = 0x81,
    /// Success with data
    Data = 0x82,
    /// Raw file bytes
    FileChunk = 0x83,
}

impl Opcode {
    /// Parse an opcode from its wire value.
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::ListDir),
            0x03 => Some(Self::GetFileInfo),
            0x04 => Some(Self::ReadFile),
            0x05 => Some(Self::WriteFile),
            0x06 => Some(Self::CreateDir),
            0x07 => Some(Self::Delete),
            0x08 => Some(Self::Rename),
            0x09 => Some(Self::Search),
            0x0A => Some(Self::GetDrives),
            0x0B => Some(Self::GetStorageInfo),
            0xFF => Some(Self::Disconnect),
            0x80 => Some(Self::Ok),
            0x81 => Some(Self::Error),
            0x82 => Some(Self::Data),
            0x83 => Some(Self::FileChunk),
            _ => None,
        }
    }

    /// Whether this opcode is sent by the host in answer to a request.
    pub const fn is_response(self) -> bool {
        matches!(self, Self::Ok | Self::Error | Self::Data | Self::FileChunk)
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Operation tag
    pub opcode: Opcode,
    /// Pairs a response with its request
    pub correlation_id: u32,
    /// Operation-specific bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(opcode: Opcode, correlation_id: u32, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            correlation_id,
            payload,
        }
    }
}

/// Encodes and decodes frames under a payload size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec that refuses payloads above `max_payload_size`.
    pub const fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// The configured payload limit.
    pub const fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Encode a frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::FrameTooLarge` if the payload exceeds the limit.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        self.check_size(frame.payload.len())?;

        #[allow(clippy::cast_possible_truncation)]
        let length = (HEADER_SIZE + frame.payload.len()) as u32;

        let mut buf = Vec::with_capacity(LENGTH_SIZE + HEADER_SIZE + frame.payload.len());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&(frame.opcode as u16).to_le_bytes());
        buf.extend_from_slice(&frame.correlation_id.to_le_bytes());
        buf.extend_from_slice(&frame.payload);
        Ok(buf)
    }

    /// Decode exactly one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns `Error::Truncated` if `buf` ends before the frame does,
    /// `Error::Malformed` for an inconsistent header and
    /// `Error::FrameTooLarge` for an oversized payload.
    pub fn decode(&self, buf: &[u8]) -> Result<(Frame, usize)> {
        if buf.len() < LENGTH_SIZE {
            return Err(Error::Truncated);
        }
        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let payload_len = self.payload_len(length)?;

        let total = LENGTH_SIZE + length;
        if buf.len() < total {
            return Err(Error::Truncated);
        }

        let (opcode, correlation_id) = parse_header(&buf[LENGTH_SIZE..LENGTH_SIZE + HEADER_SIZE])?;
        let start = LENGTH_SIZE + HEADER_SIZE;
        let payload = buf[start..start + payload_len].to_vec();

        Ok((Frame::new(opcode, correlation_id, payload), total))
    }

    /// Read one frame from a stream.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns `Error::Truncated` if the stream closes mid-frame, otherwise the
    /// same errors as [`FrameCodec::decode`] or an I/O error.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_buf = [0u8; LENGTH_SIZE];
        let mut filled = 0;
        while filled < LENGTH_SIZE {
            let n = reader.read(&mut length_buf[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(Error::Truncated)
                };
            }
            filled += n;
        }

        let length = u32::from_le_bytes(length_buf) as usize;
        let payload_len = self.payload_len(length)?;

        let mut header = [0u8; HEADER_SIZE];
        read_exact_or_truncated(reader, &mut header).await?;
        let (opcode, correlation_id) = parse_header(&header)?;

        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            read_exact_or_truncated(reader, &mut payload).await?;
        }

        Ok(Some(Frame::new(opcode, correlation_id, payload)))
    }

    /// Write one frame to a stream and flush it.
    ///
    /// The frame is encoded into a single buffer first so a size violation
    /// never leaves a partial frame on the wire.
    ///
    /// # Errors
    ///
    /// Returns `Error::FrameTooLarge` or an I/O error.
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode(frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn payload_len(&self, length: usize) -> Result<usize> {
        if length < HEADER_SIZE {
            return Err(Error::Malformed(format!(
                "length {length} shorter than {HEADER_SIZE}-byte header"
            )));
        }
        let payload_len = length - HEADER_SIZE;
        self.check_size(payload_len)?;
        Ok(payload_len)
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_payload_size {
            return Err(Error::FrameTooLarge {
                size,
                max: self.max_payload_size,
            });
        }
        Ok(())
    }
}

fn parse_header(header: &[u8]) -> Result<(Opcode, u32)> {
    let raw = u16::from_le_bytes([header[0], header[1]]);
    let opcode =
        Opcode::from_u16(raw).ok_or_else(|| Error::Malformed(format!("unknown opcode {raw:#06x}")))?;
    let correlation_id = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
    Ok((opcode, correlation_id))
}

async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Truncated),
        Err(e) => Err(Error::Io(e)),
    }
}
