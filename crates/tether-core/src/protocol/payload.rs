//! Binary payload encodings for each operation.
//!
//! Integers are little-endian. Strings are a `u32` byte length followed by
//! UTF-8 bytes. Both directions are provided so a host (or a test double)
//! can share the same definitions.

use chrono::{DateTime, Utc};

use crate::error::{Error, RemoteErrorCode, Result};
use crate::files::{FileItem, StorageInfo};

const FLAG_DIRECTORY: u8 = 0x01;

/// Appends little-endian fields to a payload buffer.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Append one byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Append a `u32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a `u64`.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append an `i64`.
    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a length-prefixed string.
    #[allow(clippy::cast_possible_truncation)]
    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Append raw bytes with no prefix; must be the last field.
    pub fn put_tail(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Finish and return the payload.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Reads little-endian fields from a payload.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Start reading `buf` from the beginning.
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Malformed(format!("payload ends inside {what}")))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read one byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    /// Read a `u32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a `u64`.
    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8, "u64")?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Read an `i64`.
    pub fn get_i64(&mut self) -> Result<i64> {
        let b = self.take(8, "i64")?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }

    /// Read a length-prefixed string.
    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len, "string")?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Malformed(format!("string is not UTF-8: {e}")))
    }

    /// Everything not read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Whether every byte has been consumed.
    pub const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Payload holding a single path.
pub fn encode_path(path: &str) -> Vec<u8> {
    PayloadWriter::new().put_str(path).finish()
}

/// Decode a single-path payload.
///
/// # Errors
///
/// Returns `Error::Malformed` if the payload is short or not UTF-8.
pub fn decode_path(data: &[u8]) -> Result<String> {
    PayloadReader::new(data).get_str()
}

/// Rename request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRequest {
    /// Existing path
    pub path: String,
    /// New name within the same parent
    pub new_name: String,
}

impl RenameRequest {
    /// Encode to payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_str(&self.path)
            .put_str(&self.new_name)
            .finish()
    }

    /// Decode from payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Malformed` on a short or invalid payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            path: r.get_str()?,
            new_name: r.get_str()?,
        })
    }
}

/// Search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Case-insensitive name fragment
    pub query: String,
    /// Directory to search under (empty means host default)
    pub base_path: String,
}

impl SearchRequest {
    /// Encode to payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_str(&self.query)
            .put_str(&self.base_path)
            .finish()
    }

    /// Decode from payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Malformed` on a short or invalid payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            query: r.get_str()?,
            base_path: r.get_str()?,
        })
    }
}

/// Read a byte range of a remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// Remote file
    pub path: String,
    /// First byte to read
    pub offset: u64,
    /// Bytes wanted
    pub length: u64,
}

impl ReadRequest {
    /// Encode to payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::with_capacity(self.path.len() + 20)
            .put_str(&self.path)
            .put_u64(self.offset)
            .put_u64(self.length)
            .finish()
    }

    /// Decode from payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Malformed` on a short or invalid payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            path: r.get_str()?,
            offset: r.get_u64()?,
            length: r.get_u64()?,
        })
    }
}

/// One chunk written to a remote file.
///
/// Offset zero creates or truncates the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunk {
    /// Remote file
    pub path: String,
    /// Where `data` goes
    pub offset: u64,
    /// Final size of the file
    pub total_size: u64,
    /// Last chunk of the file
    pub is_final: bool,
    /// Chunk bytes
    pub data: Vec<u8>,
}

impl WriteChunk {
    /// Encode to payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::with_capacity(self.path.len() + 25 + self.data.len())
            .put_str(&self.path)
            .put_u64(self.offset)
            .put_u64(self.total_size)
            .put_u8(u8::from(self.is_final))
            .put_tail(&self.data)
            .finish()
    }

    /// Decode from payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Malformed` on a short or invalid payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            path: r.get_str()?,
            offset: r.get_u64()?,
            total_size: r.get_u64()?,
            is_final: r.get_u8()? != 0,
            data: r.rest().to_vec(),
        })
    }
}

/// Host error frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Error code as sent
    pub code: u32,
    /// Human readable message
    pub message: String,
}

impl ErrorPayload {
    /// Encode to payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_u32(self.code)
            .put_str(&self.message)
            .finish()
    }

    /// Decode from payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Malformed` on a short or invalid payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            code: r.get_u32()?,
            message: r.get_str()?,
        })
    }

    /// Convert into the crate error.
    pub fn into_error(self) -> Error {
        Error::Remote {
            code: RemoteErrorCode::from_u32(self.code),
            message: self.message,
        }
    }
}

fn write_file_item(w: &mut PayloadWriter, item: &FileItem) {
    w.put_str(&item.name)
        .put_str(&item.path)
        .put_u8(if item.is_directory { FLAG_DIRECTORY } else { 0 })
        .put_u64(item.size_bytes)
        .put_i64(item.modified_at.timestamp_millis())
        .put_u32(item.permission_bits);
}

fn read_file_item(r: &mut PayloadReader<'_>) -> Result<FileItem> {
    let name = r.get_str()?;
    let path = r.get_str()?;
    let flags = r.get_u8()?;
    let size_bytes = r.get_u64()?;
    let modified_ms = r.get_i64()?;
    let permission_bits = r.get_u32()?;

    let modified_at: DateTime<Utc> = DateTime::from_timestamp_millis(modified_ms)
        .ok_or_else(|| Error::Malformed(format!("timestamp {modified_ms} out of range")))?;

    Ok(FileItem {
        path,
        name,
        size_bytes,
        is_directory: flags & FLAG_DIRECTORY != 0,
        modified_at,
        permission_bits,
    })
}

/// Encode one file item.
pub fn encode_file_item(item: &FileItem) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    write_file_item(&mut w, item);
    w.finish()
}

/// Decode one file item.
///
/// # Errors
///
/// Returns `Error::Malformed` on a short or invalid payload.
pub fn decode_file_item(data: &[u8]) -> Result<FileItem> {
    read_file_item(&mut PayloadReader::new(data))
}

/// Encode a list of file items.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_file_list(items: &[FileItem]) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_u32(items.len() as u32);
    for item in items {
        write_file_item(&mut w, item);
    }
    w.finish()
}

/// Decode a list of file items.
///
/// # Errors
///
/// Returns `Error::Malformed` on a short or invalid payload.
pub fn decode_file_list(data: &[u8]) -> Result<Vec<FileItem>> {
    let mut r = PayloadReader::new(data);
    let count = r.get_u32()? as usize;
    // Each item is at least 29 bytes; cap the preallocation by what is present.
    let mut items = Vec::with_capacity(count.min(data.len() / 29));
    for _ in 0..count {
        items.push(read_file_item(&mut r)?);
    }
    Ok(items)
}

/// Encode storage info.
pub fn encode_storage_info(info: &StorageInfo) -> Vec<u8> {
    PayloadWriter::new()
        .put_u64(info.total_bytes)
        .put_u64(info.free_bytes)
        .put_str(&info.drive_label)
        .put_str(&info.volume_name)
        .finish()
}

/// Decode storage info.
///
/// A host reporting more free than total space is clamped.
///
/// # Errors
///
/// Returns `Error::Malformed` on a short or invalid payload.
pub fn decode_storage_info(data: &[u8]) -> Result<StorageInfo> {
    let mut r = PayloadReader::new(data);
    let total_bytes = r.get_u64()?;
    let mut free_bytes = r.get_u64()?;
    let drive_label = r.get_str()?;
    let volume_name = r.get_str()?;

    if free_bytes > total_bytes {
        tracing::warn!(
            total_bytes,
            free_bytes,
            drive = %drive_label,
            "Host reported more free than total space, clamping"
        );
        free_bytes = total_bytes;
    }

    Ok(StorageInfo {
        drive_label,
        volume_name,
        total_bytes,
        free_bytes,
    })
}

/// Encode a list of drive roots.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_drive_list(drives: &[String]) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_u32(drives.len() as u32);
    for drive in drives {
        w.put_str(drive);
    }
    w.finish()
}

/// Decode a list of drive roots.
///
/// # Errors
///
/// Returns `Error::Malformed` on a short or invalid payload.
pub fn decode_drive_list(data: &[u8]) -> Result<Vec<String>> {
    let mut r = PayloadReader::new(data);
    let count = r.get_u32()? as usize;
    let mut drives = Vec::with_capacity(count.min(data.len() / 4));
    for _ in 0..count {
        drives.push(r.get_str()?);
    }
    Ok(drives)
}
