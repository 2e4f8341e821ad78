//! Wire codec
//!
//! Little-endian serialization of primitives and values, shared by every
//! message the runtime exchanges. Integers are little-endian, floats are
//! IEEE-754 32-bit little-endian, strings are a 16-bit length followed by
//! the raw bytes with no terminator. A value is a 16-bit type tag followed
//! by its payload; tables encode a 32-bit pair count then each key and
//! value in turn.
//!
//! Decoding a truncated or malformed buffer is an error, never a panic:
//! the caller discards the message and moves on.

use crate::heap::{Heap, ObjRef};
use crate::strings::StringInterner;
use crate::value::{Table, TableKey, TypeTag, Value};

/// Message types, ordered by decreasing transmission priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    Broadcast = 0,
    SwarmList = 1,
    VStigPut = 2,
    VStigQuery = 3,
    SwarmJoin = 4,
    SwarmLeave = 5,
}

/// Number of message types (= number of outbound priority queues).
pub const MESSAGE_TYPE_COUNT: usize = 6;

impl MessageType {
    pub fn from_u8(b: u8) -> Option<MessageType> {
        match b {
            0 => Some(MessageType::Broadcast),
            1 => Some(MessageType::SwarmList),
            2 => Some(MessageType::VStigPut),
            3 => Some(MessageType::VStigQuery),
            4 => Some(MessageType::SwarmJoin),
            5 => Some(MessageType::SwarmLeave),
            _ => None,
        }
    }
}

/// Decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before the field did.
    Truncated,
    /// A value carried an unknown type tag.
    BadTypeTag(u16),
    /// A string field was not valid UTF-8.
    BadUtf8,
    /// Attempt to serialize a type that never goes on the wire.
    Unserializable(TypeTag),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "truncated buffer"),
            CodecError::BadTypeTag(t) => write!(f, "unknown value type tag {}", t),
            CodecError::BadUtf8 => write!(f, "string field is not valid UTF-8"),
            CodecError::Unserializable(t) => {
                write!(f, "{} values cannot be serialized", t.desc())
            }
        }
    }
}

impl std::error::Error for CodecError {}

pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u16(buf, s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

/// Cursor over a received buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::BadUtf8)
    }
}

/// Serialize the value behind `r`. Closures and userdata never travel.
pub fn serialize_value(buf: &mut Vec<u8>, r: ObjRef, heap: &Heap) -> Result<(), CodecError> {
    let value = heap.get(r);
    write_u16(buf, value.type_tag() as u16);
    match value {
        Value::Nil => Ok(()),
        Value::Int(i) => {
            write_i32(buf, *i);
            Ok(())
        }
        Value::Float(f) => {
            write_f32(buf, *f);
            Ok(())
        }
        Value::String(s) => {
            write_str(buf, &s.text);
            Ok(())
        }
        Value::Table(t) => {
            write_u32(buf, t.len() as u32);
            // Collect the pairs first so a nested table does not hold the
            // borrow across the recursive call.
            let pairs: Vec<(TableKey, ObjRef)> =
                t.iter().map(|(k, v)| (k.clone(), *v)).collect();
            for (k, v) in pairs {
                serialize_table_key(buf, &k);
                serialize_value(buf, v, heap)?;
            }
            Ok(())
        }
        Value::Closure(_) | Value::UserData(_) => {
            Err(CodecError::Unserializable(value.type_tag()))
        }
    }
}

fn serialize_table_key(buf: &mut Vec<u8>, k: &TableKey) {
    match k {
        TableKey::Int(i) => {
            write_u16(buf, TypeTag::Int as u16);
            write_i32(buf, *i);
        }
        TableKey::Float(f) => {
            write_u16(buf, TypeTag::Float as u16);
            write_f32(buf, f.to_f32());
        }
        TableKey::String(s) => {
            write_u16(buf, TypeTag::String as u16);
            write_str(buf, &s.text);
        }
    }
}

/// Deserialize one value, allocating on `heap`. Received strings are
/// interned as transient.
pub fn deserialize_value(
    rd: &mut ByteReader<'_>,
    heap: &mut Heap,
    strings: &mut StringInterner,
) -> Result<ObjRef, CodecError> {
    let tag = rd.read_u16()?;
    let tag = TypeTag::from_u16(tag).ok_or(CodecError::BadTypeTag(tag))?;
    match tag {
        TypeTag::Nil => Ok(heap.new_obj(Value::Nil)),
        TypeTag::Int => {
            let v = rd.read_i32()?;
            Ok(heap.new_obj(Value::Int(v)))
        }
        TypeTag::Float => {
            let v = rd.read_f32()?;
            Ok(heap.new_obj(Value::Float(v)))
        }
        TypeTag::String => {
            let s = rd.read_str()?;
            let istr = strings.register(&s, false);
            Ok(heap.new_obj(Value::String(istr)))
        }
        TypeTag::Table => {
            let size = rd.read_u32()?;
            let mut t = Table::new();
            for _ in 0..size {
                let k = deserialize_value(rd, heap, strings)?;
                let v = deserialize_value(rd, heap, strings)?;
                let key = TableKey::from_value(heap.get(k))
                    .ok_or(CodecError::BadTypeTag(TypeTag::Table as u16))?;
                t.insert(key, v);
            }
            Ok(heap.new_obj(Value::Table(t)))
        }
        TypeTag::Closure | TypeTag::UserData => Err(CodecError::BadTypeTag(tag as u16)),
    }
}
