//! Declarative fixed-size binary layouts.
//!
//! Every fixed block of a vendor record is described as a [[Layout]]: an ordered list of typed
//! fields with an endianness. A single generic codec turns the bytes into [[Fields]] and back,
//! so byte offsets live in one table per block instead of being spread through parsing code.
use super::*;
use bytes::{Buf, BufMut, Bytes};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
    /// A fixed-length raw byte string, e.g. a name or a magic tag.
    Bytes(usize),
    /// Bytes that are present on the wire but never interpreted.
    Pad(usize),
}

impl FieldType {
    pub const fn width(self) -> usize {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 | FieldType::I16 => 2,
            FieldType::U32 | FieldType::I32 | FieldType::F32 => 4,
            FieldType::F64 => 8,
            FieldType::Bytes(n) | FieldType::Pad(n) => n,
        }
    }

    const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::U8
                | FieldType::I8
                | FieldType::U16
                | FieldType::I16
                | FieldType::U32
                | FieldType::I32
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    /// Multiplier applied by [[Fields::float]].
    pub scale: f64,
}

impl FieldSpec {
    pub const fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            scale: 1.0,
        }
    }

    pub const fn scaled(name: &'static str, ty: FieldType, scale: f64) -> Self {
        Self { name, ty, scale }
    }

    pub const fn pad(width: usize) -> Self {
        Self::new("", FieldType::Pad(width))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bytes(Bytes),
    Skipped,
}

#[derive(Debug, PartialEq)]
pub struct Layout {
    pub name: &'static str,
    pub endian: Endian,
    pub fields: &'static [FieldSpec],
}

impl Layout {
    pub const fn new(name: &'static str, endian: Endian, fields: &'static [FieldSpec]) -> Self {
        Self {
            name,
            endian,
            fields,
        }
    }

    /// Total number of bytes covered by this layout.
    pub const fn size(&self) -> usize {
        let mut total = 0;
        let mut i = 0;
        while i < self.fields.len() {
            total += self.fields[i].ty.width();
            i += 1;
        }
        total
    }

    /// Byte offset of the named field from the start of the block.
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        let mut offset = 0;
        for field in self.fields {
            if field.name == name {
                return Some(offset);
            }
            offset += field.ty.width();
        }
        None
    }

    pub fn decode(&'static self, bytes: &[u8]) -> Result<Fields> {
        self.decode_at(bytes, 0)
    }

    /// Decode the block that starts at `offset` within `bytes`.
    pub fn decode_at(&'static self, bytes: &[u8], offset: usize) -> Result<Fields> {
        let needed = self.size();
        let available = bytes.len().saturating_sub(offset);
        ensure!(
            needed <= available,
            TruncatedInputSnafu {
                needed: needed as u64,
                remaining: available as u64,
                position: offset as u64,
            }
        );
        let mut buf = &bytes[offset..offset + needed];
        let values = self
            .fields
            .iter()
            .map(|field| read_value(&mut buf, field.ty, self.endian))
            .collect();
        Ok(Fields {
            layout: self,
            values,
        })
    }

    /// Encode named values into a block of exactly [[Layout::size]] bytes.
    ///
    /// Fields that are not mentioned are written as zeros. A [[Value::Float]] given for an integer
    /// field is divided by the field's scale and rounded, which makes this the inverse of
    /// [[Fields::float]].
    pub fn encode(&self, values: &[(&str, Value)]) -> Result<Vec<u8>> {
        for (name, _) in values {
            ensure!(
                self.offset_of(name).is_some(),
                UnknownFieldSnafu {
                    layout: self.name,
                    field: name.to_string(),
                }
            );
        }
        let mut out = Vec::with_capacity(self.size());
        for field in self.fields {
            let value = values
                .iter()
                .find(|(name, _)| !field.name.is_empty() && *name == field.name)
                .map(|(_, value)| value);
            write_value(&mut out, field, value, self.endian);
        }
        Ok(out)
    }
}

fn read_value(buf: &mut &[u8], ty: FieldType, endian: Endian) -> Value {
    use Endian::*;
    match (ty, endian) {
        (FieldType::U8, _) => Value::Int(buf.get_u8() as i64),
        (FieldType::I8, _) => Value::Int(buf.get_i8() as i64),
        (FieldType::U16, Big) => Value::Int(buf.get_u16() as i64),
        (FieldType::U16, Little) => Value::Int(buf.get_u16_le() as i64),
        (FieldType::I16, Big) => Value::Int(buf.get_i16() as i64),
        (FieldType::I16, Little) => Value::Int(buf.get_i16_le() as i64),
        (FieldType::U32, Big) => Value::Int(buf.get_u32() as i64),
        (FieldType::U32, Little) => Value::Int(buf.get_u32_le() as i64),
        (FieldType::I32, Big) => Value::Int(buf.get_i32() as i64),
        (FieldType::I32, Little) => Value::Int(buf.get_i32_le() as i64),
        (FieldType::F32, Big) => Value::Float(buf.get_f32() as f64),
        (FieldType::F32, Little) => Value::Float(buf.get_f32_le() as f64),
        (FieldType::F64, Big) => Value::Float(buf.get_f64()),
        (FieldType::F64, Little) => Value::Float(buf.get_f64_le()),
        (FieldType::Bytes(n), _) => Value::Bytes(buf.copy_to_bytes(n)),
        (FieldType::Pad(n), _) => {
            buf.advance(n);
            Value::Skipped
        }
    }
}

fn write_value(out: &mut Vec<u8>, field: &FieldSpec, value: Option<&Value>, endian: Endian) {
    use Endian::*;
    let as_int = |value: Option<&Value>| -> i64 {
        match value {
            Some(Value::Int(v)) => *v,
            Some(Value::Float(v)) => (v / field.scale).round() as i64,
            _ => 0,
        }
    };
    let as_float = |value: Option<&Value>| -> f64 {
        match value {
            Some(Value::Int(v)) => *v as f64,
            Some(Value::Float(v)) => v / field.scale,
            _ => 0.0,
        }
    };
    match (field.ty, endian) {
        (FieldType::U8, _) => out.put_u8(as_int(value) as u8),
        (FieldType::I8, _) => out.put_i8(as_int(value) as i8),
        (FieldType::U16, Big) => out.put_u16(as_int(value) as u16),
        (FieldType::U16, Little) => out.put_u16_le(as_int(value) as u16),
        (FieldType::I16, Big) => out.put_i16(as_int(value) as i16),
        (FieldType::I16, Little) => out.put_i16_le(as_int(value) as i16),
        (FieldType::U32, Big) => out.put_u32(as_int(value) as u32),
        (FieldType::U32, Little) => out.put_u32_le(as_int(value) as u32),
        (FieldType::I32, Big) => out.put_i32(as_int(value) as i32),
        (FieldType::I32, Little) => out.put_i32_le(as_int(value) as i32),
        (FieldType::F32, Big) => out.put_f32(as_float(value) as f32),
        (FieldType::F32, Little) => out.put_f32_le(as_float(value) as f32),
        (FieldType::F64, Big) => out.put_f64(as_float(value)),
        (FieldType::F64, Little) => out.put_f64_le(as_float(value)),
        (FieldType::Bytes(n), _) => {
            let mut bytes = match value {
                Some(Value::Bytes(b)) => b.to_vec(),
                _ => Vec::new(),
            };
            bytes.resize(n, 0);
            out.put_slice(&bytes);
        }
        (FieldType::Pad(n), _) => out.put_bytes(0, n),
    }
}

/// The decoded values of one [[Layout]] block.
#[derive(Clone, Debug)]
pub struct Fields {
    layout: &'static Layout,
    values: Vec<Value>,
}

impl Fields {
    fn lookup(&self, name: &str) -> Result<(&FieldSpec, &Value)> {
        self.layout
            .fields
            .iter()
            .zip(self.values.iter())
            .find(|(field, _)| !name.is_empty() && field.name == name)
            .context(UnknownFieldSnafu {
                layout: self.layout.name,
                field: name.to_string(),
            })
    }

    /// The raw integer value, ignoring any scale.
    pub fn int(&self, name: &str) -> Result<i64> {
        match self.lookup(name)? {
            (_, Value::Int(v)) => Ok(*v),
            (field, _) => whatever!(
                "Field {} of {} is a {:?}, not an integer",
                name,
                self.layout.name,
                field.ty
            ),
        }
    }

    /// The value with the field's scale applied.
    pub fn float(&self, name: &str) -> Result<f64> {
        match self.lookup(name)? {
            (field, Value::Int(v)) if field.ty.is_integer() => Ok(*v as f64 * field.scale),
            (field, Value::Float(v)) => Ok(v * field.scale),
            (field, _) => whatever!(
                "Field {} of {} is a {:?}, not a number",
                name,
                self.layout.name,
                field.ty
            ),
        }
    }

    pub fn bytes(&self, name: &str) -> Result<&Bytes> {
        match self.lookup(name)? {
            (_, Value::Bytes(b)) => Ok(b),
            (field, _) => whatever!(
                "Field {} of {} is a {:?}, not a byte string",
                name,
                self.layout.name,
                field.ty
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    static SAMPLE: Layout = Layout::new(
        "sample",
        Endian::Big,
        &[
            FieldSpec::new("id", FieldType::U16),
            FieldSpec::pad(2),
            FieldSpec::scaled("latitude", FieldType::I32, 1.0e-7),
            FieldSpec::new("name", FieldType::Bytes(4)),
            FieldSpec::new("speed", FieldType::F32),
        ],
    );

    #[test]
    fn size_and_offsets() {
        assert_eq!(SAMPLE.size(), 16);
        assert_eq!(SAMPLE.offset_of("latitude"), Some(4));
        assert_eq!(SAMPLE.offset_of("speed"), Some(12));
        assert_eq!(SAMPLE.offset_of("heading"), None);
    }

    #[test]
    fn decodes_big_endian_with_scale() {
        let bytes = [
            0x01, 0x02, 0xff, 0xff, 0x0b, 0xeb, 0xc2, 0x00, b'G', b'S', b'F', 0, 0x40, 0x20, 0x00,
            0x00,
        ];
        let fields = SAMPLE.decode(&bytes).unwrap();
        assert_eq!(fields.int("id").unwrap(), 0x0102);
        assert_relative_eq!(fields.float("latitude").unwrap(), 20.0, epsilon = 1e-9);
        assert_eq!(fields.bytes("name").unwrap().as_ref(), b"GSF\0");
        assert_relative_eq!(fields.float("speed").unwrap(), 2.5);
        assert!(fields.int("heading").is_err());
        assert!(fields.int("name").is_err());
    }

    #[test]
    fn encode_is_inverse_of_scaled_decode() {
        let bytes = SAMPLE
            .encode(&[
                ("latitude", Value::Float(-33.8688197)),
                ("id", Value::Int(7)),
            ])
            .unwrap();
        assert_eq!(bytes.len(), SAMPLE.size());
        let fields = SAMPLE.decode(&bytes).unwrap();
        assert_eq!(fields.int("id").unwrap(), 7);
        assert_relative_eq!(
            fields.float("latitude").unwrap(),
            -33.8688197,
            epsilon = 1e-7
        );
        assert!(SAMPLE.encode(&[("bogus", Value::Int(1))]).is_err());
    }

    #[test]
    fn short_input_is_truncated() {
        let err = SAMPLE.decode_at(&[0u8; 20], 8).unwrap_err();
        assert!(matches!(
            err,
            FormatError::TruncatedInput {
                needed: 16,
                remaining: 12,
                ..
            }
        ));
    }
}
