//! Minimal protobuf-style codec for the Trezor message payloads.
//!
//! Only what the device messages need: varints, tag/wire-type pairs,
//! repeated uint32 fields, and length-delimited blobs. The decoder
//! walks every field and skips the ones a caller does not ask about;
//! it is not a general protobuf implementation.

use keyward_core::{KeywardError, Result};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LENGTH_DELIMITED: u8 = 2;
const WIRE_FIXED32: u8 = 5;

pub fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

fn encode_tag(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    encode_varint(buf, u64::from(field) << 3 | u64::from(wire_type));
}

/// Encode one element of a repeated uint32 field (unpacked form).
pub fn encode_uint32_field(buf: &mut Vec<u8>, field: u32, value: u32) {
    encode_tag(buf, field, WIRE_VARINT);
    encode_varint(buf, u64::from(value));
}

pub fn encode_bool_field(buf: &mut Vec<u8>, field: u32, value: bool) {
    encode_tag(buf, field, WIRE_VARINT);
    buf.push(u8::from(value));
}

pub fn encode_bytes_field(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    encode_tag(buf, field, WIRE_LENGTH_DELIMITED);
    encode_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn encode_string_field(buf: &mut Vec<u8>, field: u32, value: &str) {
    encode_bytes_field(buf, field, value.as_bytes());
}

/// One decoded field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field<'a> {
    pub number: u32,
    pub value: FieldValue<'a>,
}

/// Iterator over the fields of an encoded message.
pub struct FieldIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self.data.get(self.pos).ok_or_else(|| {
                KeywardError::DeviceError("Truncated varint in message".into())
            })?;
            self.pos += 1;
            if shift >= 64 {
                return Err(KeywardError::DeviceError("Varint overflow".into()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|e| *e <= self.data.len())
            .ok_or_else(|| KeywardError::DeviceError("Truncated field in message".into()))?;
        self.pos = end;
        Ok(())
    }

    fn next_field(&mut self) -> Result<Option<Field<'a>>> {
        loop {
            if self.pos >= self.data.len() {
                return Ok(None);
            }
            let tag = self.read_varint()?;
            let number = (tag >> 3) as u32;
            let wire_type = (tag & 0x07) as u8;
            let value = match wire_type {
                WIRE_VARINT => FieldValue::Varint(self.read_varint()?),
                WIRE_LENGTH_DELIMITED => {
                    let len = self.read_varint()? as usize;
                    let end = self.pos.checked_add(len).filter(|e| *e <= self.data.len());
                    let end = end.ok_or_else(|| {
                        KeywardError::DeviceError("Truncated field in message".into())
                    })?;
                    let bytes = &self.data[self.pos..end];
                    self.pos = end;
                    FieldValue::Bytes(bytes)
                }
                WIRE_FIXED64 => {
                    self.skip(8)?;
                    continue;
                }
                WIRE_FIXED32 => {
                    self.skip(4)?;
                    continue;
                }
                _ => {
                    return Err(KeywardError::DeviceError(format!(
                        "Unsupported wire type {}",
                        wire_type
                    )))
                }
            };
            return Ok(Some(Field { number, value }));
        }
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = Result<Field<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_field().transpose()
    }
}

/// First length-delimited field with the given number.
pub fn find_bytes<'a>(data: &'a [u8], field: u32) -> Result<Option<&'a [u8]>> {
    for item in FieldIter::new(data) {
        let item = item?;
        if item.number == field {
            if let FieldValue::Bytes(bytes) = item.value {
                return Ok(Some(bytes));
            }
        }
    }
    Ok(None)
}

/// First varint field with the given number.
pub fn find_varint(data: &[u8], field: u32) -> Result<Option<u64>> {
    for item in FieldIter::new(data) {
        let item = item?;
        if item.number == field {
            if let FieldValue::Varint(value) = item.value {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}
