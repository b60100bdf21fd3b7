// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Positional wire buffer carried by every transaction
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests + proptest (round-trip, truncation)
//!
//! WIRE LAYOUT:
//!   - Little-endian, every field padded to a 4-byte boundary
//!   - 8/16-bit integers and `bool` are widened to 32 bits
//!   - Byte and string sequences: `u32` length, data, zero padding
//!     (UTF-8 length counts bytes, UTF-16 length counts code units)
//!   - Object references: `[kind:u32][reserved:u32][value:u64]`, with the
//!     referenced object kept in an out-of-band table keyed by offset
//!
//! INVARIANTS:
//!   - Reads never pass the write offset; an underflow poisons the parcel and
//!     every later typed read fails with `ParcelUnderflow`
//!   - Length prefixes are checked against the remaining bytes before any
//!     allocation
//!   - Writes fail only with `OutOfMemory` (capacity cap or allocator refusal)
//!
//! VERSION SKEW:
//!   The format is positional and untagged. A proxy and a stub that agree on
//!   the descriptor but not on field order will misread each other silently;
//!   the runtime cannot detect it. Evolving interfaces must change their
//!   descriptor string.

use core::fmt;

use crate::error::{Result, RpcError};
use crate::object::RemoteObject;
use crate::parcelable::Parcelable;

const ALIGN: usize = 4;
const FLAT_OBJECT_SIZE: usize = 16;

const KIND_NULL: u32 = 0;
const KIND_LOCAL: u32 = 1;
const KIND_HANDLE: u32 = 2;

/// Default byte cap for parcels built without an explicit capacity.
pub const DEFAULT_MAX_CAPACITY: usize = 200 * 1024;

/// Entry of the out-of-band object table.
struct FlatObject {
    offset: usize,
    object: RemoteObject,
}

/// Typed, positional byte buffer used for one request or one reply.
pub struct Parcel {
    data: Vec<u8>,
    read_pos: usize,
    max_capacity: usize,
    objects: Vec<FlatObject>,
    poisoned: bool,
}

impl Default for Parcel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parcel")
            .field("size", &self.data.len())
            .field("read_pos", &self.read_pos)
            .field("objects", &self.objects.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl Parcel {
    /// Creates an empty parcel capped at [`DEFAULT_MAX_CAPACITY`].
    pub fn new() -> Self {
        Self::with_max_capacity(DEFAULT_MAX_CAPACITY)
    }

    /// Creates an empty parcel that refuses to grow beyond `max_capacity` bytes.
    pub fn with_max_capacity(max_capacity: usize) -> Self {
        Self { data: Vec::new(), read_pos: 0, max_capacity, objects: Vec::new(), poisoned: false }
    }

    /// Wraps raw bytes received from a transport. The parcel carries no
    /// object table, so embedded object references cannot be read back.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let max_capacity = data.len().max(DEFAULT_MAX_CAPACITY);
        Self { data, read_pos: 0, max_capacity, objects: Vec::new(), poisoned: false }
    }

    /// Number of bytes written so far (the write offset).
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently allocated for the buffer.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Byte cap beyond which writes fail with `OutOfMemory`.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Moves the parcel under a new byte cap, as when it enters another
    /// process. Fails with `OutOfMemory` if it already holds more.
    pub(crate) fn limit_capacity(&mut self, max_capacity: usize) -> Result<()> {
        if self.data.len() > max_capacity {
            return Err(RpcError::OutOfMemory);
        }
        self.max_capacity = max_capacity;
        Ok(())
    }

    /// Bytes left between the read cursor and the write offset.
    pub fn data_available(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Current read cursor.
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Moves the read cursor back to `pos` and clears a previous underflow.
    pub fn rewind(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(RpcError::ParcelUnderflow);
        }
        self.read_pos = pos;
        self.poisoned = false;
        Ok(())
    }

    /// Returns `true` once a read has underflowed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of object references carried by the parcel.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Writes any [`Parcelable`] value.
    pub fn write<T: Parcelable>(&mut self, value: &T) -> Result<()> {
        value.write_to(self)
    }

    /// Reads any [`Parcelable`] value.
    pub fn read<T: Parcelable>(&mut self) -> Result<T> {
        T::read_from(self)
    }

    fn reserve(&mut self, additional: usize) -> Result<()> {
        let needed = self.data.len().checked_add(additional).ok_or(RpcError::OutOfMemory)?;
        if needed > self.max_capacity {
            return Err(RpcError::OutOfMemory);
        }
        self.data.try_reserve(additional).map_err(|_| RpcError::OutOfMemory)
    }

    fn put_padded(&mut self, bytes: &[u8]) -> Result<()> {
        let padded = padded_len(bytes.len());
        self.reserve(padded)?;
        self.data.extend_from_slice(bytes);
        self.data.resize(self.data.len() + (padded - bytes.len()), 0);
        Ok(())
    }

    /// Marks the parcel unusable for further typed reads.
    pub(crate) fn poison(&mut self) -> RpcError {
        self.poisoned = true;
        RpcError::ParcelUnderflow
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.poisoned {
            return Err(RpcError::ParcelUnderflow);
        }
        let padded = padded_len(len);
        if padded > self.data_available() {
            return Err(self.poison());
        }
        let start = self.read_pos;
        self.read_pos += padded;
        Ok(&self.data[start..start + len])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Writes a `bool` as a 32-bit word.
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u32(u32::from(value))
    }

    /// Writes an `i8` widened to 32 bits.
    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_i32(i32::from(value))
    }

    /// Writes a `u8` widened to 32 bits.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_u32(u32::from(value))
    }

    /// Writes an `i16` widened to 32 bits.
    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_i32(i32::from(value))
    }

    /// Writes a `u16` widened to 32 bits.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_u32(u32::from(value))
    }

    /// Writes an `i32`.
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.put_padded(&value.to_le_bytes())
    }

    /// Writes a `u32`.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.put_padded(&value.to_le_bytes())
    }

    /// Writes an `i64`.
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.put_padded(&value.to_le_bytes())
    }

    /// Writes a `u64`.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.put_padded(&value.to_le_bytes())
    }

    /// Writes an `f32`.
    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.put_padded(&value.to_le_bytes())
    }

    /// Writes an `f64`.
    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.put_padded(&value.to_le_bytes())
    }

    /// Writes a length-prefixed byte sequence.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| RpcError::OutOfMemory)?;
        self.reserve(ALIGN + padded_len(bytes.len()))?;
        self.write_u32(len)?;
        self.put_padded(bytes)
    }

    /// Writes a UTF-8 string (byte-count prefix).
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Writes a UTF-16 string (code-unit-count prefix).
    pub fn write_string16(&mut self, value: &str) -> Result<()> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let len = u32::try_from(units.len()).map_err(|_| RpcError::OutOfMemory)?;
        let mut bytes = Vec::with_capacity(units.len() * 2);
        for unit in &units {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        self.reserve(ALIGN + padded_len(bytes.len()))?;
        self.write_u32(len)?;
        self.put_padded(&bytes)
    }

    /// Reads a `bool`; any non-zero word is `true`.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u32()? != 0)
    }

    /// Reads an `i8` stored as a 32-bit word.
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_i32()? as i8)
    }

    /// Reads a `u8` stored as a 32-bit word.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_u32()? as u8)
    }

    /// Reads an `i16` stored as a 32-bit word.
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_i32()? as i16)
    }

    /// Reads a `u16` stored as a 32-bit word.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_u32()? as u16)
    }

    /// Reads an `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Reads a `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Reads an `i64`.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Reads a `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Reads an `f32`.
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Reads an `f64`.
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Reads a length-prefixed byte sequence.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| RpcError::ProtocolError("invalid utf-8 string".into()))
    }

    /// Reads a UTF-16 string.
    pub fn read_string16(&mut self) -> Result<String> {
        let units = self.read_u32()? as usize;
        let byte_len = units.checked_mul(2).ok_or(RpcError::ParcelUnderflow)?;
        let raw = self.take(byte_len)?;
        let decoded: Vec<u16> =
            raw.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).collect();
        String::from_utf16(&decoded)
            .map_err(|_| RpcError::ProtocolError("invalid utf-16 string".into()))
    }

    /// Writes a reference to a remote object.
    pub fn write_remote_object(&mut self, object: &RemoteObject) -> Result<()> {
        self.reserve(FLAT_OBJECT_SIZE)?;
        let offset = self.data.len();
        let (kind, value) = flat_fields(object);
        self.write_u32(kind)?;
        self.write_u32(0)?;
        self.write_u64(value)?;
        self.objects.push(FlatObject { offset, object: object.clone() });
        Ok(())
    }

    /// Writes an optional object reference; `None` is encoded as a null record.
    pub fn write_nullable_remote_object(&mut self, object: Option<&RemoteObject>) -> Result<()> {
        match object {
            Some(object) => self.write_remote_object(object),
            None => {
                self.reserve(FLAT_OBJECT_SIZE)?;
                self.write_u32(KIND_NULL)?;
                self.write_u32(0)?;
                self.write_u64(0)
            }
        }
    }

    /// Reads a non-null object reference.
    pub fn read_remote_object(&mut self) -> Result<RemoteObject> {
        self.read_nullable_remote_object()?
            .ok_or_else(|| RpcError::ProtocolError("unexpected null object".into()))
    }

    /// Reads an optional object reference.
    pub fn read_nullable_remote_object(&mut self) -> Result<Option<RemoteObject>> {
        let offset = self.read_pos;
        let kind = self.read_u32()?;
        let _reserved = self.read_u32()?;
        let _value = self.read_u64()?;
        if kind == KIND_NULL {
            return Ok(None);
        }
        if kind != KIND_LOCAL && kind != KIND_HANDLE {
            return Err(RpcError::ProtocolError(format!("unknown object kind {kind}")));
        }
        self.objects
            .iter()
            .find(|entry| entry.offset == offset)
            .map(|entry| Some(entry.object.clone()))
            .ok_or_else(|| RpcError::ProtocolError("object reference missing from table".into()))
    }

    /// Replaces every carried object with `translate(object)` and rewrites its
    /// flat record. Transports call this when moving a parcel between
    /// processes so references are expressed in the receiver's terms.
    pub fn translate_objects<F>(&mut self, mut translate: F) -> Result<()>
    where
        F: FnMut(&RemoteObject) -> Result<RemoteObject>,
    {
        for index in 0..self.objects.len() {
            let translated = translate(&self.objects[index].object)?;
            let offset = self.objects[index].offset;
            let (kind, value) = flat_fields(&translated);
            self.data[offset..offset + 4].copy_from_slice(&kind.to_le_bytes());
            self.data[offset + 8..offset + 16].copy_from_slice(&value.to_le_bytes());
            self.objects[index].object = translated;
        }
        Ok(())
    }

    /// Drops every carried object reference (e.g. when a parcel is discarded
    /// by a transport that failed to deliver it).
    pub fn clear_objects(&mut self) {
        self.objects.clear();
    }

    /// Writes a nested section prefixed with its byte length.
    pub fn write_scoped<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut Parcel) -> Result<()>,
    {
        let len_at = self.data.len();
        self.write_u32(0)?;
        let start = self.data.len();
        body(self)?;
        let len = u32::try_from(self.data.len() - start).map_err(|_| RpcError::OutOfMemory)?;
        self.data[len_at..len_at + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    /// Reads a nested section written by [`Parcel::write_scoped`] into its own
    /// parcel. The outer cursor moves past the section even if the caller
    /// reads only part of it, so newer writers may append trailing fields.
    pub fn read_scoped(&mut self) -> Result<Parcel> {
        let len = self.read_u32()? as usize;
        let start = self.read_pos;
        self.take(len)?;
        let end = start + len;
        let data = self.data[start..end].to_vec();
        let objects = self
            .objects
            .iter()
            .filter(|entry| entry.offset >= start && entry.offset + FLAT_OBJECT_SIZE <= end)
            .map(|entry| FlatObject { offset: entry.offset - start, object: entry.object.clone() })
            .collect();
        Ok(Parcel {
            data,
            read_pos: 0,
            max_capacity: self.max_capacity,
            objects,
            poisoned: false,
        })
    }
}

fn padded_len(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

fn flat_fields(object: &RemoteObject) -> (u32, u64) {
    match object {
        RemoteObject::Local(local) => (KIND_LOCAL, local.handle().value()),
        RemoteObject::Remote(remote) => (KIND_HANDLE, u64::from(remote.handle().value())),
    }
}
