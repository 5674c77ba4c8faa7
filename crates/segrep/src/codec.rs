//! Stream primitives shared by the checkpoint wire format and the remote
//! metadata blob format.
//!
//! Integers use little-endian base-128 varints (7 payload bits per byte, high
//! bit set on every byte but the last). Strings and byte arrays are
//! varint-length-prefixed. Maps are a varint entry count followed by the
//! entries sorted by key, so equal maps always encode to equal bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::error::{SegrepError, SegrepResult};

/// Longest valid encoding of a u64 varint.
const MAX_VLONG_BYTES: usize = 10;

/// Magic number leading every framed metadata blob.
pub const ENVELOPE_MAGIC: u32 = 0x3fd7_6c17;

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct StreamOutput {
    buf: BytesMut,
}

impl StreamOutput {
    /// Create an empty output buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Write a u32 as a varint.
    pub fn write_vint(&mut self, value: u32) {
        self.write_vlong(value as u64);
    }

    /// Write a u64 as a varint.
    pub fn write_vlong(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    /// Write a fixed-width big-endian u32.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Write a length-prefixed byte array.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_vlong(value.len() as u64);
        self.buf.put_slice(value);
    }

    /// Write raw bytes without a length prefix.
    pub fn write_raw(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Write a string map in key order.
    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>) {
        self.write_vlong(map.len() as u64);
        for (key, value) in map {
            self.write_string(key);
            self.write_string(value);
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freeze into immutable bytes.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over an immutable input buffer. Every read is bounds-checked and
/// reports truncation as [`SegrepError::CorruptManifest`].
#[derive(Debug, Clone)]
pub struct StreamInput {
    buf: Bytes,
}

impl StreamInput {
    /// Wrap a buffer.
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    fn need(&self, n: usize, what: &str) -> SegrepResult<()> {
        if self.buf.remaining() < n {
            return Err(SegrepError::corrupt(format!(
                "truncated input reading {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Read a u64 varint.
    pub fn read_vlong(&mut self) -> SegrepResult<u64> {
        let mut value: u64 = 0;
        for i in 0..MAX_VLONG_BYTES {
            self.need(1, "varint")?;
            let byte = self.buf.get_u8();
            // the last byte carries only bit 63
            if i == MAX_VLONG_BYTES - 1 && byte > 1 {
                return Err(SegrepError::corrupt("vlong overflow"));
            }
            value |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(SegrepError::corrupt("varint longer than 10 bytes"))
    }

    /// Read a u32 varint.
    pub fn read_vint(&mut self) -> SegrepResult<u32> {
        let value = self.read_vlong()?;
        u32::try_from(value).map_err(|_| SegrepError::corrupt(format!("vint overflow: {}", value)))
    }

    /// Read a fixed-width big-endian u32.
    pub fn read_u32(&mut self) -> SegrepResult<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    /// Read a length-prefixed byte array.
    pub fn read_bytes(&mut self) -> SegrepResult<Bytes> {
        let len = self.read_vlong()? as usize;
        self.need(len, "byte array")?;
        Ok(self.buf.split_to(len))
    }

    /// Read exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> SegrepResult<Bytes> {
        self.need(len, "raw bytes")?;
        Ok(self.buf.split_to(len))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> SegrepResult<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|e| SegrepError::corrupt(format!("invalid utf-8: {}", e)))
    }

    /// Read a string map.
    pub fn read_string_map(&mut self) -> SegrepResult<BTreeMap<String, String>> {
        let count = self.read_vlong()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

/// Frame `content` as `magic | codec | version | content | crc32`.
pub fn write_envelope(codec: &str, version: u32, content: &[u8]) -> Bytes {
    let mut out = StreamOutput::new();
    out.write_u32(ENVELOPE_MAGIC);
    out.write_string(codec);
    out.write_u32(version);
    out.write_raw(content);
    let bytes = out.freeze();
    let crc = crc32fast::hash(&bytes);

    let mut framed = BytesMut::with_capacity(bytes.len() + 4);
    framed.put_slice(&bytes);
    framed.put_u32(crc);
    framed.freeze()
}

/// Verify the envelope around a framed blob and return `(version, content)`.
pub fn read_envelope(codec: &str, framed: &[u8]) -> SegrepResult<(u32, Bytes)> {
    if framed.len() < 8 {
        return Err(SegrepError::corrupt(format!(
            "blob too short for envelope: {} bytes",
            framed.len()
        )));
    }
    let (body, footer) = framed.split_at(framed.len() - 4);
    let expected = u32::from_be_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(SegrepError::corrupt(format!(
            "checksum mismatch: expected {:#x}, actual {:#x}",
            expected, actual
        )));
    }

    let mut input = StreamInput::new(Bytes::copy_from_slice(body));
    let magic = input.read_u32()?;
    if magic != ENVELOPE_MAGIC {
        return Err(SegrepError::corrupt(format!("bad magic {:#x}", magic)));
    }
    let found_codec = input.read_string()?;
    if found_codec != codec {
        return Err(SegrepError::corrupt(format!(
            "codec mismatch: expected [{}], found [{}]",
            codec, found_codec
        )));
    }
    let version = input.read_u32()?;
    let remaining = input.remaining();
    let content = input.read_raw(remaining)?;
    Ok((version, content))
}
