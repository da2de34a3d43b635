//! String-pool packing of a [`WhackMessage`] into its wire form.
//!
//! The wire form is a fixed-size header immediately followed by the string
//! pool:
//!
//! ```text
//! ┌──────────────────────────────────────┬──────────────────────────┐
//! │ header (fixed layout, native endian) │ pool (≤ POOL_CAPACITY)   │
//! │ magic, ops, typed fields, StrRefs    │ string bytes, no framing │
//! └──────────────────────────────────────┴──────────────────────────┘
//! ```
//!
//! Every string field becomes a [`StrRef`] (pool offset + length) in the
//! header. Fields are visited in one fixed order, so packing the same message
//! twice yields identical bytes. Optional numbers carry a presence byte so
//! the header length never depends on the values.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::{Result, WhackError};
use crate::message::{Cidr, WhackMessage};

/// Fixed capacity of the string pool in bytes.
pub const POOL_CAPACITY: usize = 4096;

/// Size of one encoded [`StrRef`] in the header.
pub const STR_REF_SIZE: usize = 8;

/// Size of one encoded address (family byte + 16 address bytes).
const ADDR_SIZE: usize = 17;

/// A pool-relative string position as stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrRef {
    pub offset: u32,
    pub len: u32,
}

impl StrRef {
    /// Marker for a field that holds no string.
    pub const ABSENT: StrRef = StrRef {
        offset: u32::MAX,
        len: 0,
    };

    pub fn is_absent(&self) -> bool {
        *self == Self::ABSENT
    }

    /// Encode into the header representation.
    pub fn encode(&self) -> [u8; STR_REF_SIZE] {
        let mut buf = [0u8; STR_REF_SIZE];
        buf[..4].copy_from_slice(&self.offset.to_ne_bytes());
        buf[4..].copy_from_slice(&self.len.to_ne_bytes());
        buf
    }

    /// Decode from the header representation.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let offset = u32::from_ne_bytes(buf.get(..4)?.try_into().ok()?);
        let len = u32::from_ne_bytes(buf.get(4..STR_REF_SIZE)?.try_into().ok()?);
        Some(Self { offset, len })
    }
}

/// Bounded scratch region that receives the strings.
#[derive(Debug)]
pub struct StringPool {
    buf: Vec<u8>,
    capacity: usize,
}

impl StringPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append `bytes`, failing without side effects if they do not fit.
    pub fn push(&mut self, field: &str, bytes: &[u8]) -> Result<StrRef> {
        if bytes.len() > self.remaining() {
            return Err(WhackError::PackingOverflow {
                field: field.to_string(),
                needed: bytes.len(),
                remaining: self.remaining(),
                capacity: self.capacity,
            });
        }
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        Ok(StrRef {
            offset,
            len: bytes.len() as u32,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Header writer used by [`WhackMessage::write_to`].
pub struct Packer {
    header: Vec<u8>,
    pool: StringPool,
    scope: &'static str,
    fields: Vec<(String, StrRef)>,
}

impl Packer {
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            header: Vec::with_capacity(1024),
            pool: StringPool::new(pool_capacity),
            scope: "",
            fields: Vec::new(),
        }
    }

    /// Prefix recorded field names with `scope` (e.g. `"left."`).
    pub(crate) fn enter(&mut self, scope: &'static str) {
        self.scope = scope;
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.header.push(v);
    }

    pub(crate) fn u16(&mut self, v: u16) {
        self.header.extend_from_slice(&v.to_ne_bytes());
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.header.extend_from_slice(&v.to_ne_bytes());
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.header.extend_from_slice(&v.to_ne_bytes());
    }

    pub(crate) fn bool(&mut self, v: bool) {
        self.u8(u8::from(v));
    }

    /// 0 unset, 1 no, 2 yes.
    pub(crate) fn tristate(&mut self, v: Option<bool>) {
        self.u8(match v {
            None => 0,
            Some(false) => 1,
            Some(true) => 2,
        });
    }

    /// Enum wire code, 0 when unset.
    pub(crate) fn code(&mut self, v: Option<u8>) {
        self.u8(v.unwrap_or(0));
    }

    pub(crate) fn opt_u32(&mut self, v: Option<u32>) {
        self.bool(v.is_some());
        self.u32(v.unwrap_or(0));
    }

    pub(crate) fn opt_u64(&mut self, v: Option<u64>) {
        self.bool(v.is_some());
        self.u64(v.unwrap_or(0));
    }

    /// Milliseconds, saturating.
    pub(crate) fn duration(&mut self, v: Duration) {
        self.u64(u64::try_from(v.as_millis()).unwrap_or(u64::MAX));
    }

    pub(crate) fn opt_duration(&mut self, v: Option<Duration>) {
        self.bool(v.is_some());
        self.duration(v.unwrap_or_default());
    }

    /// Family byte (0 = unset) followed by 16 address bytes.
    pub(crate) fn addr(&mut self, v: Option<IpAddr>) {
        let mut buf = [0u8; ADDR_SIZE];
        match v {
            None => {}
            Some(IpAddr::V4(a)) => {
                buf[0] = 4;
                buf[1..5].copy_from_slice(&a.octets());
            }
            Some(IpAddr::V6(a)) => {
                buf[0] = 6;
                buf[1..].copy_from_slice(&a.octets());
            }
        }
        self.header.extend_from_slice(&buf);
    }

    pub(crate) fn cidr(&mut self, v: Option<Cidr>) {
        self.addr(v.map(|c| c.addr));
        self.u8(v.map_or(0, |c| c.prefix));
    }

    pub(crate) fn str(&mut self, field: &'static str, v: Option<&str>) -> Result<()> {
        self.bytes(field, v.map(str::as_bytes))
    }

    pub(crate) fn bytes(&mut self, field: &'static str, v: Option<&[u8]>) -> Result<()> {
        let name = format!("{}{field}", self.scope);
        let r = match v {
            Some(bytes) => self.pool.push(&name, bytes)?,
            None => StrRef::ABSENT,
        };
        self.header.extend_from_slice(&r.encode());
        self.fields.push((name, r));
        Ok(())
    }

    fn finish(self) -> PackedMessage {
        let header_len = self.header.len();
        let mut bytes = self.header;
        bytes.extend_from_slice(self.pool.as_bytes());
        PackedMessage {
            bytes,
            header_len,
            fields: self.fields,
        }
    }
}

/// Serialized message ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedMessage {
    bytes: Vec<u8>,
    header_len: usize,
    fields: Vec<(String, StrRef)>,
}

impl PackedMessage {
    /// Header followed by the consumed part of the pool.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total length: header size plus consumed pool bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// The consumed part of the string pool.
    pub fn pool(&self) -> &[u8] {
        &self.bytes[self.header_len..]
    }

    /// String fields in packing order with their pool references.
    pub fn fields(&self) -> &[(String, StrRef)] {
        &self.fields
    }

    /// Reference recorded for `field` (`"name"`, `"left.id"`, ...).
    pub fn field(&self, field: &str) -> Option<StrRef> {
        self.fields
            .iter()
            .find_map(|(name, r)| (name == field).then_some(*r))
    }

    /// Bytes a reference points at, `None` if absent or out of the pool.
    pub fn resolve(&self, r: StrRef) -> Option<&[u8]> {
        if r.is_absent() {
            return None;
        }
        let start = r.offset as usize;
        let end = start.checked_add(r.len as usize)?;
        self.pool().get(start..end)
    }

    /// Resolve `field` as UTF-8.
    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.field(field)
            .and_then(|r| self.resolve(r))
            .and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// Pack `msg` with the default pool capacity.
pub fn pack(msg: &WhackMessage) -> Result<PackedMessage> {
    pack_with_capacity(msg, POOL_CAPACITY)
}

/// Pack `msg` into a pool of `capacity` bytes.
pub fn pack_with_capacity(msg: &WhackMessage, capacity: usize) -> Result<PackedMessage> {
    let mut packer = Packer::new(capacity);
    msg.write_to(&mut packer)?;
    Ok(packer.finish())
}
