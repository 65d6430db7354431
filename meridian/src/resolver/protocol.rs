//! Gossip wire format.
//!
//! # Wire Format
//!
//! Every datagram is one frame with an 8-byte header:
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬──────────────┬──────────────┐
//! │ Type(1) │ Flags(1)│ Len(2)  │ Entries(2)   │ Reserved(2)  │
//! └─────────┴─────────┴─────────┴──────────────┴──────────────┘
//! ```
//!
//! followed by `Entries` neighbor entries:
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬───────────────────┬─────────┬──────────┬──────────┐
//! │ Flags(1)│ Kind(1) │ Port(2) │ Timestamp ms (8)  │ NameLen │ Addr(4/16)│ Name(n) │
//! └─────────┴─────────┴─────────┴───────────────────┴─────────┴──────────┴──────────┘
//! ```
//!
//! `Kind` is 4 or 6. Bit 0 of the entry flags marks the sender's own entry.
//! All integers are little-endian. `Len` covers the header.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::net::Endpoint;

pub const GOSSIP_FRAME_TYPE: u8 = 0x20;
pub const HEADER_SIZE: usize = 8;
/// Largest frame ever sent; fits a UDP payload on a 1500-byte MTU path.
pub const MAX_FRAME_SIZE: usize = 1408;
pub const ENTRY_FLAG_SELF: u8 = 0x01;
/// Name length travels in one byte.
pub const MAX_NAME_LENGTH: usize = 255;

const ENTRY_FIXED_SIZE: usize = 13;
const ADDRESS_KIND_V4: u8 = 4;
const ADDRESS_KIND_V6: u8 = 6;

/// One neighbor as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipEntry {
    pub name: String,
    pub address: Endpoint,
    /// Origin timestamp: when the named node last vouched for itself.
    pub timestamp_ms: i64,
    pub is_self: bool,
}

impl GossipEntry {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let address = match self.address.ip() {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        };
        ENTRY_FIXED_SIZE + address + self.name.len()
    }
}

/// Errors during gossip encode/decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("frame length {declared} does not match datagram length {actual}")]
    InvalidLength { declared: usize, actual: usize },
    #[error("unknown address kind {0}")]
    InvalidAddressKind(u8),
    #[error("neighbor name is empty, too long or not UTF-8")]
    InvalidName,
}

struct FrameWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_header(&mut self) {
        self.put_u8(GOSSIP_FRAME_TYPE);
        self.put_u8(0);
        self.put_u16(0); // length, patched in finish
        self.put_u16(0); // entry count, patched in finish
        self.put_u16(0);
    }

    fn write_entry(&mut self, entry: &GossipEntry) {
        self.put_u8(if entry.is_self { ENTRY_FLAG_SELF } else { 0 });
        match entry.address.ip() {
            IpAddr::V4(_) => self.put_u8(ADDRESS_KIND_V4),
            IpAddr::V6(_) => self.put_u8(ADDRESS_KIND_V6),
        }
        self.put_u16(entry.address.port());
        self.put_i64(entry.timestamp_ms);
        self.put_u8(entry.name.len() as u8);
        match entry.address.ip() {
            IpAddr::V4(ip) => self.put_bytes(&ip.octets()),
            IpAddr::V6(ip) => self.put_bytes(&ip.octets()),
        }
        self.put_bytes(entry.name.as_bytes());
    }

    fn finish(self, entries: u16) {
        let len = (self.buf.len() as u16).to_le_bytes();
        self.buf[2..4].copy_from_slice(&len);
        self.buf[4..6].copy_from_slice(&entries.to_le_bytes());
    }
}

struct FrameReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> FrameReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let have = self.buf.len() - self.cursor;
        if have < n {
            return Err(ProtocolError::BufferTooSmall { need: n, have });
        }
        let bytes = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take_array::<1>()?[0])
    }

    fn take_u16(&mut self) -> Result<u16, ProtocolError> {
        self.take_array().map(u16::from_le_bytes)
    }

    fn take_i64(&mut self) -> Result<i64, ProtocolError> {
        self.take_array().map(i64::from_le_bytes)
    }

    fn take_entry(&mut self) -> Result<GossipEntry, ProtocolError> {
        let flags = self.take_u8()?;
        let kind = self.take_u8()?;
        let port = self.take_u16()?;
        let timestamp_ms = self.take_i64()?;
        let name_len = self.take_u8()? as usize;
        let ip = match kind {
            ADDRESS_KIND_V4 => IpAddr::V4(Ipv4Addr::from(self.take_array::<4>()?)),
            ADDRESS_KIND_V6 => IpAddr::V6(Ipv6Addr::from(self.take_array::<16>()?)),
            other => return Err(ProtocolError::InvalidAddressKind(other)),
        };
        if name_len == 0 {
            return Err(ProtocolError::InvalidName);
        }
        let name = std::str::from_utf8(self.take(name_len)?)
            .map_err(|_| ProtocolError::InvalidName)?
            .to_owned();

        Ok(GossipEntry {
            name,
            address: Endpoint::new(ip, port),
            timestamp_ms,
            is_self: flags & ENTRY_FLAG_SELF != 0,
        })
    }
}

/// Encodes as many entries as fit into one frame of at most
/// [`MAX_FRAME_SIZE`] bytes, starting from the front of `entries`.
///
/// Returns how many entries were written. Entries whose name cannot travel
/// on the wire (empty or over [`MAX_NAME_LENGTH`] bytes) are skipped and
/// counted as consumed.
pub fn encode_frame(entries: &[GossipEntry], buf: &mut Vec<u8>) -> usize {
    let mut writer = FrameWriter::new(buf);
    writer.write_header();

    let mut consumed = 0;
    let mut written: u16 = 0;
    for entry in entries {
        if entry.name.is_empty() || entry.name.len() > MAX_NAME_LENGTH {
            consumed += 1;
            continue;
        }
        if writer.buf.len() + entry.encoded_len() > MAX_FRAME_SIZE {
            break;
        }
        writer.write_entry(entry);
        written += 1;
        consumed += 1;
    }
    writer.finish(written);
    consumed
}

/// Encodes `entries` into as many frames as needed.
#[must_use]
pub fn encode_frames(entries: &[GossipEntry]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut rest = entries;
    while !rest.is_empty() {
        let mut buf = Vec::with_capacity(MAX_FRAME_SIZE);
        let consumed = encode_frame(rest, &mut buf);
        if buf.len() > HEADER_SIZE {
            frames.push(buf);
        }
        rest = &rest[consumed..];
    }
    frames
}

/// Decodes one datagram.
///
/// # Errors
///
/// Any structural problem: short buffer, wrong frame type, length field not
/// matching the datagram, unknown address kind, or a bad name.
pub fn decode_frame(datagram: &[u8]) -> Result<Vec<GossipEntry>, ProtocolError> {
    let mut reader = FrameReader::new(datagram);
    let frame_type = reader.take_u8()?;
    if frame_type != GOSSIP_FRAME_TYPE {
        return Err(ProtocolError::UnknownFrameType(frame_type));
    }
    let _flags = reader.take_u8()?;
    let declared = reader.take_u16()? as usize;
    if declared != datagram.len() {
        return Err(ProtocolError::InvalidLength {
            declared,
            actual: datagram.len(),
        });
    }
    let count = reader.take_u16()?;
    let _reserved = reader.take_u16()?;

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(reader.take_entry()?);
    }
    if reader.cursor != datagram.len() {
        return Err(ProtocolError::InvalidLength {
            declared,
            actual: reader.cursor,
        });
    }
    Ok(entries)
}
