//! Typed payload codec (C1).
//!
//! A POD ("plain old data") value is a tagged, length-prefixed record.
//! Every record starts with an 8-byte header (`tag: u32`, `size: u32`)
//! followed by `size` bytes of payload, padded so the whole record is a
//! multiple of 8 bytes. Scalars are little-endian. Compound tags (Array,
//! Choice, Struct, Object) hold a sequence of child records back-to-back
//! inside their payload.
//!
//! The builder and parser are pure: they never allocate or perform I/O,
//! operating instead on a caller-supplied byte slice. A builder that runs
//! out of room returns [`PodError::BufferExhausted`] naming the size the
//! caller should grow to and retry with, rather than growing itself.

use crate::error::PodError;
use bytes::Bytes;

const HEADER_LEN: usize = 8;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Wire tag for a POD record. Stable across releases - this is the ABI.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    None = 0,
    Bool = 1,
    Id = 2,
    Int = 3,
    Long = 4,
    Float = 5,
    Double = 6,
    String = 7,
    Bytes = 8,
    Pointer = 9,
    Fd = 10,
    Rectangle = 11,
    Fraction = 12,
    Bitmap = 13,
    Array = 14,
    Choice = 15,
    Struct = 16,
    Object = 17,
}

impl Tag {
    fn from_u32(v: u32) -> Result<Self, PodError> {
        Ok(match v {
            0 => Tag::None,
            1 => Tag::Bool,
            2 => Tag::Id,
            3 => Tag::Int,
            4 => Tag::Long,
            5 => Tag::Float,
            6 => Tag::Double,
            7 => Tag::String,
            8 => Tag::Bytes,
            9 => Tag::Pointer,
            10 => Tag::Fd,
            11 => Tag::Rectangle,
            12 => Tag::Fraction,
            13 => Tag::Bitmap,
            14 => Tag::Array,
            15 => Tag::Choice,
            16 => Tag::Struct,
            17 => Tag::Object,
            _ => return Err(PodError::MalformedPod("unknown pod tag")),
        })
    }

    fn name(self) -> &'static str {
        match self {
            Tag::None => "None",
            Tag::Bool => "Bool",
            Tag::Id => "Id",
            Tag::Int => "Int",
            Tag::Long => "Long",
            Tag::Float => "Float",
            Tag::Double => "Double",
            Tag::String => "String",
            Tag::Bytes => "Bytes",
            Tag::Pointer => "Pointer",
            Tag::Fd => "Fd",
            Tag::Rectangle => "Rectangle",
            Tag::Fraction => "Fraction",
            Tag::Bitmap => "Bitmap",
            Tag::Array => "Array",
            Tag::Choice => "Choice",
            Tag::Struct => "Struct",
            Tag::Object => "Object",
        }
    }
}

/// Choice discriminant (§3 Typed value).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceKind {
    None = 0,
    Range = 1,
    Step = 2,
    Enum = 3,
    Flags = 4,
}

impl ChoiceKind {
    fn from_u32(v: u32) -> Result<Self, PodError> {
        Ok(match v {
            0 => ChoiceKind::None,
            1 => ChoiceKind::Range,
            2 => ChoiceKind::Step,
            3 => ChoiceKind::Enum,
            4 => ChoiceKind::Flags,
            _ => return Err(PodError::MalformedPod("unknown choice kind")),
        })
    }
}

/// A 2D integer size, used for video formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    pub width: u32,
    pub height: u32,
}

/// A rational number, used for frame rates and pixel aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub num: u32,
    pub denom: u32,
}

/// One `(key_id, flags, value)` property inside an Object.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub key_id: u32,
    /// Bit 0 set means "unset" - present during enumeration but not chosen.
    pub flags: u32,
    pub value: Value,
}

impl Property {
    pub const UNSET: u32 = 1 << 0;

    pub fn new(key_id: u32, value: Value) -> Self {
        Self { key_id, flags: 0, value }
    }

    pub fn unset(key_id: u32) -> Self {
        Self { key_id, flags: Self::UNSET, value: Value::None }
    }

    pub fn is_unset(&self) -> bool {
        self.flags & Self::UNSET != 0
    }
}

/// A fully decoded / to-be-encoded POD value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Id(u32),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Bytes),
    Pointer(u64),
    /// Index into the enclosing message's attached fd array.
    Fd(u32),
    Rectangle(Rectangle),
    Fraction(Fraction),
    Bitmap(Bytes),
    Array(Vec<Value>),
    Choice { kind: ChoiceKind, alternatives: Vec<Value> },
    Struct(Vec<Value>),
    Object { object_type: u32, object_id: u32, properties: Vec<Property> },
}

/// Appends POD records into a caller-supplied, fixed-capacity byte slice.
pub struct PodBuilder<'a> {
    buf: &'a mut [u8],
    pos: usize,
    /// Offsets of open frames' size fields, for length backfill on pop.
    frames: Vec<usize>,
}

impl<'a> PodBuilder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0, frames: Vec::new() }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn write_header(&mut self, tag: Tag, size: u32) -> Result<usize, PodError> {
        self.ensure_room(HEADER_LEN)?;
        let start = self.pos;
        self.buf[start..start + 4].copy_from_slice(&(tag as u32).to_le_bytes());
        self.buf[start + 4..start + 8].copy_from_slice(&size.to_le_bytes());
        self.pos += HEADER_LEN;
        Ok(start)
    }

    fn ensure_room(&self, n: usize) -> Result<(), PodError> {
        if self.pos + n > self.buf.len() {
            return Err(PodError::BufferExhausted { required: self.pos + n });
        }
        Ok(())
    }

    fn write_payload(&mut self, bytes: &[u8]) -> Result<(), PodError> {
        let padded = align8(bytes.len());
        self.ensure_room(padded)?;
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        for b in &mut self.buf[self.pos + bytes.len()..self.pos + padded] {
            *b = 0;
        }
        self.pos += padded;
        Ok(())
    }

    fn put_scalar(&mut self, tag: Tag, bytes: &[u8]) -> Result<(), PodError> {
        self.write_header(tag, bytes.len() as u32)?;
        self.write_payload(bytes)
    }

    pub fn put_none(&mut self) -> Result<(), PodError> {
        self.write_header(Tag::None, 0)?;
        Ok(())
    }

    pub fn put_bool(&mut self, v: bool) -> Result<(), PodError> {
        self.put_scalar(Tag::Bool, &(v as u32).to_le_bytes())
    }

    pub fn put_id(&mut self, v: u32) -> Result<(), PodError> {
        self.put_scalar(Tag::Id, &v.to_le_bytes())
    }

    pub fn put_int(&mut self, v: i32) -> Result<(), PodError> {
        self.put_scalar(Tag::Int, &v.to_le_bytes())
    }

    pub fn put_long(&mut self, v: i64) -> Result<(), PodError> {
        self.put_scalar(Tag::Long, &v.to_le_bytes())
    }

    pub fn put_float(&mut self, v: f32) -> Result<(), PodError> {
        self.put_scalar(Tag::Float, &v.to_le_bytes())
    }

    pub fn put_double(&mut self, v: f64) -> Result<(), PodError> {
        self.put_scalar(Tag::Double, &v.to_le_bytes())
    }

    pub fn put_string(&mut self, v: &str) -> Result<(), PodError> {
        // zero-terminated, length-prefixed within the header size
        let mut bytes = v.as_bytes().to_vec();
        bytes.push(0);
        self.put_scalar(Tag::String, &bytes)
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> Result<(), PodError> {
        self.put_scalar(Tag::Bytes, v)
    }

    pub fn put_bitmap(&mut self, v: &[u8]) -> Result<(), PodError> {
        self.put_scalar(Tag::Bitmap, v)
    }

    pub fn put_pointer(&mut self, v: u64) -> Result<(), PodError> {
        self.put_scalar(Tag::Pointer, &v.to_le_bytes())
    }

    pub fn put_fd(&mut self, index: u32) -> Result<(), PodError> {
        self.put_scalar(Tag::Fd, &index.to_le_bytes())
    }

    pub fn put_rectangle(&mut self, r: Rectangle) -> Result<(), PodError> {
        let mut bytes = [0u8; 8];
        bytes[0..4].copy_from_slice(&r.width.to_le_bytes());
        bytes[4..8].copy_from_slice(&r.height.to_le_bytes());
        self.put_scalar(Tag::Rectangle, &bytes)
    }

    pub fn put_fraction(&mut self, f: Fraction) -> Result<(), PodError> {
        let mut bytes = [0u8; 8];
        bytes[0..4].copy_from_slice(&f.num.to_le_bytes());
        bytes[4..8].copy_from_slice(&f.denom.to_le_bytes());
        self.put_scalar(Tag::Fraction, &bytes)
    }

    /// Open a compound frame (Array/Choice/Struct/Object), writing a
    /// placeholder size that [`Self::pop_frame`] backfills once the
    /// frame's children have been written.
    pub fn push_frame(&mut self, tag: Tag) -> Result<usize, PodError> {
        let start = self.write_header(tag, 0)?;
        self.frames.push(start);
        Ok(start)
    }

    pub fn pop_frame(&mut self) -> Result<(), PodError> {
        let start = self.frames.pop().ok_or(PodError::FrameUnderflow)?;
        let size = (self.pos - start - HEADER_LEN) as u32;
        self.buf[start + 4..start + 8].copy_from_slice(&size.to_le_bytes());
        // pad the frame payload to 8 bytes, consistent with scalar records
        let padded_end = start + HEADER_LEN + align8(size as usize);
        if padded_end > self.pos {
            self.ensure_room(padded_end - self.pos)?;
            for b in &mut self.buf[self.pos..padded_end] {
                *b = 0;
            }
            self.pos = padded_end;
        }
        Ok(())
    }

    /// Encode a full [`Value`] tree, opening/closing compound frames as needed.
    pub fn put_value(&mut self, value: &Value) -> Result<(), PodError> {
        match value {
            Value::None => self.put_none(),
            Value::Bool(b) => self.put_bool(*b),
            Value::Id(v) => self.put_id(*v),
            Value::Int(v) => self.put_int(*v),
            Value::Long(v) => self.put_long(*v),
            Value::Float(v) => self.put_float(*v),
            Value::Double(v) => self.put_double(*v),
            Value::String(s) => self.put_string(s),
            Value::Bytes(b) => self.put_bytes(b),
            Value::Pointer(p) => self.put_pointer(*p),
            Value::Fd(i) => self.put_fd(*i),
            Value::Rectangle(r) => self.put_rectangle(*r),
            Value::Fraction(f) => self.put_fraction(*f),
            Value::Bitmap(b) => self.put_bitmap(b),
            Value::Array(items) => {
                self.push_frame(Tag::Array)?;
                for item in items {
                    self.put_value(item)?;
                }
                self.pop_frame()
            }
            Value::Choice { kind, alternatives } => {
                self.push_frame(Tag::Choice)?;
                self.put_id(*kind as u32)?;
                for alt in alternatives {
                    self.put_value(alt)?;
                }
                self.pop_frame()
            }
            Value::Struct(items) => {
                self.push_frame(Tag::Struct)?;
                for item in items {
                    self.put_value(item)?;
                }
                self.pop_frame()
            }
            Value::Object { object_type, object_id, properties } => {
                self.push_frame(Tag::Object)?;
                self.put_id(*object_type)?;
                self.put_id(*object_id)?;
                self.put_int(properties.len() as i32)?;
                for prop in properties {
                    self.put_id(prop.key_id)?;
                    self.put_id(prop.flags)?;
                    self.put_value(&prop.value)?;
                }
                self.pop_frame()
            }
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}

/// Reads POD records from a byte slice, advancing a cursor. Refuses
/// type-mismatched reads and validates `Fd` indices against the number
/// of file descriptors attached to the enclosing message.
pub struct PodParser<'a> {
    buf: &'a [u8],
    pos: usize,
    fd_count: usize,
}

impl<'a> PodParser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, fd_count: 0 }
    }

    /// A parser that also validates `Fd` values against `fd_count`
    /// attached descriptors.
    pub fn with_fds(buf: &'a [u8], fd_count: usize) -> Self {
        Self { buf, pos: 0, fd_count }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_header(&mut self) -> Result<(Tag, usize), PodError> {
        if self.pos + HEADER_LEN > self.buf.len() {
            return Err(PodError::MalformedPod("truncated header"));
        }
        let tag_raw = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        let size = u32::from_le_bytes(self.buf[self.pos + 4..self.pos + 8].try_into().unwrap()) as usize;
        let tag = Tag::from_u32(tag_raw)?;
        let padded_end = self.pos + HEADER_LEN + align8(size);
        if padded_end > self.buf.len() {
            return Err(PodError::MalformedPod("record exceeds buffer"));
        }
        self.pos += HEADER_LEN;
        Ok((tag, size))
    }

    fn expect(&mut self, expected: Tag) -> Result<usize, PodError> {
        let save = self.pos;
        let (tag, size) = self.read_header()?;
        if tag as u32 != expected as u32 {
            self.pos = save;
            return Err(PodError::UnexpectedType { expected: expected.name(), actual: tag as u32 });
        }
        Ok(size)
    }

    fn finish_scalar(&mut self, size: usize) {
        self.pos += align8(size);
    }

    pub fn read_none(&mut self) -> Result<(), PodError> {
        self.expect(Tag::None)?;
        Ok(())
    }

    pub fn read_bool(&mut self) -> Result<bool, PodError> {
        let size = self.expect(Tag::Bool)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap()) != 0;
        self.finish_scalar(size);
        Ok(v)
    }

    pub fn read_id(&mut self) -> Result<u32, PodError> {
        let size = self.expect(Tag::Id)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.finish_scalar(size);
        Ok(v)
    }

    pub fn read_int(&mut self) -> Result<i32, PodError> {
        let size = self.expect(Tag::Int)?;
        let v = i32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.finish_scalar(size);
        Ok(v)
    }

    pub fn read_long(&mut self) -> Result<i64, PodError> {
        let size = self.expect(Tag::Long)?;
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.finish_scalar(size);
        Ok(v)
    }

    pub fn read_float(&mut self) -> Result<f32, PodError> {
        let size = self.expect(Tag::Float)?;
        let v = f32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.finish_scalar(size);
        Ok(v)
    }

    pub fn read_double(&mut self) -> Result<f64, PodError> {
        let size = self.expect(Tag::Double)?;
        let v = f64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.finish_scalar(size);
        Ok(v)
    }

    pub fn read_string(&mut self) -> Result<String, PodError> {
        let size = self.expect(Tag::String)?;
        let bytes = &self.buf[self.pos..self.pos + size];
        let trimmed = bytes.split(|&b| b == 0).next().unwrap_or(&[]);
        let s = std::str::from_utf8(trimmed)
            .map_err(|_| PodError::MalformedPod("invalid utf-8 in string"))?
            .to_string();
        self.finish_scalar(size);
        Ok(s)
    }

    pub fn read_bytes(&mut self) -> Result<Bytes, PodError> {
        let size = self.expect(Tag::Bytes)?;
        let v = Bytes::copy_from_slice(&self.buf[self.pos..self.pos + size]);
        self.finish_scalar(size);
        Ok(v)
    }

    pub fn read_bitmap(&mut self) -> Result<Bytes, PodError> {
        let size = self.expect(Tag::Bitmap)?;
        let v = Bytes::copy_from_slice(&self.buf[self.pos..self.pos + size]);
        self.finish_scalar(size);
        Ok(v)
    }

    pub fn read_pointer(&mut self) -> Result<u64, PodError> {
        let size = self.expect(Tag::Pointer)?;
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.finish_scalar(size);
        Ok(v)
    }

    pub fn read_fd(&mut self) -> Result<u32, PodError> {
        let size = self.expect(Tag::Fd)?;
        let index = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.finish_scalar(size);
        if self.fd_count > 0 && index as usize >= self.fd_count {
            return Err(PodError::FdIndexOutOfRange { index, count: self.fd_count });
        }
        Ok(index)
    }

    pub fn read_rectangle(&mut self) -> Result<Rectangle, PodError> {
        let size = self.expect(Tag::Rectangle)?;
        let width = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        let height = u32::from_le_bytes(self.buf[self.pos + 4..self.pos + 8].try_into().unwrap());
        self.finish_scalar(size);
        Ok(Rectangle { width, height })
    }

    pub fn read_fraction(&mut self) -> Result<Fraction, PodError> {
        let size = self.expect(Tag::Fraction)?;
        let num = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        let denom = u32::from_le_bytes(self.buf[self.pos + 4..self.pos + 8].try_into().unwrap());
        self.finish_scalar(size);
        Ok(Fraction { num, denom })
    }

    /// Enter a compound frame, returning a bounded sub-parser over its payload.
    fn enter_frame(&mut self, expected: Tag) -> Result<PodParser<'a>, PodError> {
        let size = self.expect(expected)?;
        let sub = PodParser { buf: &self.buf[self.pos..self.pos + size], pos: 0, fd_count: self.fd_count };
        self.pos += align8(size);
        Ok(sub)
    }

    /// Decode a full [`Value`] tree rooted at the cursor.
    pub fn read_value(&mut self) -> Result<Value, PodError> {
        let save = self.pos;
        let (tag, _size) = self.read_header()?;
        self.pos = save;
        match tag {
            Tag::None => {
                self.read_none()?;
                Ok(Value::None)
            }
            Tag::Bool => Ok(Value::Bool(self.read_bool()?)),
            Tag::Id => Ok(Value::Id(self.read_id()?)),
            Tag::Int => Ok(Value::Int(self.read_int()?)),
            Tag::Long => Ok(Value::Long(self.read_long()?)),
            Tag::Float => Ok(Value::Float(self.read_float()?)),
            Tag::Double => Ok(Value::Double(self.read_double()?)),
            Tag::String => Ok(Value::String(self.read_string()?)),
            Tag::Bytes => Ok(Value::Bytes(self.read_bytes()?)),
            Tag::Pointer => Ok(Value::Pointer(self.read_pointer()?)),
            Tag::Fd => Ok(Value::Fd(self.read_fd()?)),
            Tag::Rectangle => Ok(Value::Rectangle(self.read_rectangle()?)),
            Tag::Fraction => Ok(Value::Fraction(self.read_fraction()?)),
            Tag::Bitmap => Ok(Value::Bitmap(self.read_bitmap()?)),
            Tag::Array => {
                let mut sub = self.enter_frame(Tag::Array)?;
                let mut items = Vec::new();
                while !sub.at_end() {
                    items.push(sub.read_value()?);
                }
                Ok(Value::Array(items))
            }
            Tag::Choice => {
                let mut sub = self.enter_frame(Tag::Choice)?;
                let kind = ChoiceKind::from_u32(sub.read_id()?)?;
                let mut alternatives = Vec::new();
                while !sub.at_end() {
                    alternatives.push(sub.read_value()?);
                }
                Ok(Value::Choice { kind, alternatives })
            }
            Tag::Struct => {
                let mut sub = self.enter_frame(Tag::Struct)?;
                let mut items = Vec::new();
                while !sub.at_end() {
                    items.push(sub.read_value()?);
                }
                Ok(Value::Struct(items))
            }
            Tag::Object => {
                let mut sub = self.enter_frame(Tag::Object)?;
                let object_type = sub.read_id()?;
                let object_id = sub.read_id()?;
                let count = sub.read_int()? as usize;
                let mut properties = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_id = sub.read_id()?;
                    let flags = sub.read_id()?;
                    let value = sub.read_value()?;
                    properties.push(Property { key_id, flags, value });
                }
                Ok(Value::Object { object_type, object_id, properties })
            }
        }
    }
}

/// Encode a [`Value`] into a freshly sized buffer, growing once if the
/// initial guess was too small (mirroring the build/retry pattern the
/// pure builder is designed for).
pub fn encode(value: &Value) -> Vec<u8> {
    let mut cap = 256;
    loop {
        let mut buf = vec![0u8; cap];
        let mut builder = PodBuilder::new(&mut buf);
        match builder.put_value(value) {
            Ok(()) => {
                let len = builder.position();
                buf.truncate(len);
                return buf;
            }
            Err(PodError::BufferExhausted { required }) => {
                cap = required.max(cap * 2);
            }
            Err(_) => unreachable!("put_value only fails with BufferExhausted on a fresh buffer"),
        }
    }
}

/// Decode a single [`Value`] from a byte slice.
pub fn decode(buf: &[u8]) -> Result<Value, PodError> {
    PodParser::new(buf).read_value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        for v in [
            Value::None,
            Value::Bool(true),
            Value::Id(42),
            Value::Int(-7),
            Value::Long(i64::MIN),
            Value::Float(1.5),
            Value::Double(2.25),
            Value::String("hello".to_string()),
            Value::Bytes(Bytes::from_static(b"\x01\x02\x03")),
            Value::Pointer(0xdead_beef),
            Value::Fd(3),
            Value::Rectangle(Rectangle { width: 320, height: 240 }),
            Value::Fraction(Fraction { num: 30, denom: 1 }),
        ] {
            let encoded = encode(&v);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(v, decoded);
        }
    }

    #[test]
    fn pod_roundtrip_object_with_nested_compounds() {
        // mirrors the boundary scenario: Object containing an Array of Int,
        // a Choice.Range Int, a String, and a nested Struct(Rectangle, Fraction)
        let value = Value::Object {
            object_type: 1,
            object_id: 0,
            properties: vec![
                Property::new(10, Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])),
                Property::new(
                    11,
                    Value::Choice {
                        kind: ChoiceKind::Range,
                        alternatives: vec![Value::Int(0), Value::Int(100)],
                    },
                ),
                Property::new(12, Value::String("test".to_string())),
                Property::new(
                    13,
                    Value::Struct(vec![
                        Value::Rectangle(Rectangle { width: 320, height: 240 }),
                        Value::Fraction(Fraction { num: 30, denom: 1 }),
                    ]),
                ),
            ],
        };

        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(value, decoded);

        // byte-identical on a second pass
        let reencoded = encode(&decoded);
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn buffer_exhausted_reports_required_size() {
        let mut tiny = [0u8; 4];
        let mut builder = PodBuilder::new(&mut tiny);
        let err = builder.put_int(5).unwrap_err();
        assert!(matches!(err, PodError::BufferExhausted { required } if required >= 8));
    }

    #[test]
    fn type_mismatch_on_wrong_read() {
        let encoded = encode(&Value::Int(1));
        let mut parser = PodParser::new(&encoded);
        let err = parser.read_string().unwrap_err();
        assert!(matches!(err, PodError::UnexpectedType { .. }));
    }

    #[test]
    fn fd_index_out_of_range() {
        let encoded = encode(&Value::Fd(5));
        let mut parser = PodParser::with_fds(&encoded, 2);
        let err = parser.read_fd().unwrap_err();
        assert_eq!(err, PodError::FdIndexOutOfRange { index: 5, count: 2 });
    }

    #[test]
    fn fd_index_in_range_ok() {
        let encoded = encode(&Value::Fd(1));
        let mut parser = PodParser::with_fds(&encoded, 2);
        assert_eq!(parser.read_fd().unwrap(), 1);
    }

    #[test]
    fn records_are_eight_byte_aligned() {
        let encoded = encode(&Value::String("x".to_string()));
        assert_eq!(encoded.len() % 8, 0);
    }
}
