//! Layout strings (`<dtype>_<n>`) and the fixed-width little-endian record
//! codec used by both the in-process and framed pipes. See spec §4.A.

use crate::error::{JouleError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dtype {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl Dtype {
    pub fn width(self) -> usize {
        match self {
            Dtype::Int8 | Dtype::Uint8 => 1,
            Dtype::Int16 | Dtype::Uint16 => 2,
            Dtype::Int32 | Dtype::Uint32 | Dtype::Float32 => 4,
            Dtype::Int64 | Dtype::Uint64 | Dtype::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::Int8 => "int8",
            Dtype::Int16 => "int16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Uint8 => "uint8",
            Dtype::Uint16 => "uint16",
            Dtype::Uint32 => "uint32",
            Dtype::Uint64 => "uint64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "int8" => Dtype::Int8,
            "int16" => Dtype::Int16,
            "int32" => Dtype::Int32,
            "int64" => Dtype::Int64,
            "uint8" => Dtype::Uint8,
            "uint16" => Dtype::Uint16,
            "uint32" => Dtype::Uint32,
            "uint64" => Dtype::Uint64,
            "float32" => Dtype::Float32,
            "float64" => Dtype::Float64,
            _ => return None,
        })
    }
}

/// A decoded scalar, tagged by dtype. Used where native ordering matters
/// (decimator min/max) or where a single value must round-trip exactly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Elem {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Elem {
    pub fn decode(dtype: Dtype, bytes: &[u8]) -> Self {
        match dtype {
            Dtype::Int8 => Elem::I8(bytes[0] as i8),
            Dtype::Int16 => Elem::I16(LittleEndian::read_i16(bytes)),
            Dtype::Int32 => Elem::I32(LittleEndian::read_i32(bytes)),
            Dtype::Int64 => Elem::I64(LittleEndian::read_i64(bytes)),
            Dtype::Uint8 => Elem::U8(bytes[0]),
            Dtype::Uint16 => Elem::U16(LittleEndian::read_u16(bytes)),
            Dtype::Uint32 => Elem::U32(LittleEndian::read_u32(bytes)),
            Dtype::Uint64 => Elem::U64(LittleEndian::read_u64(bytes)),
            Dtype::Float32 => Elem::F32(LittleEndian::read_f32(bytes)),
            Dtype::Float64 => Elem::F64(LittleEndian::read_f64(bytes)),
        }
    }

    pub fn encode(self, out: &mut Vec<u8>) {
        match self {
            Elem::I8(v) => out.push(v as u8),
            Elem::I16(v) => {
                let mut b = [0u8; 2];
                LittleEndian::write_i16(&mut b, v);
                out.extend_from_slice(&b);
            }
            Elem::I32(v) => {
                let mut b = [0u8; 4];
                LittleEndian::write_i32(&mut b, v);
                out.extend_from_slice(&b);
            }
            Elem::I64(v) => {
                let mut b = [0u8; 8];
                LittleEndian::write_i64(&mut b, v);
                out.extend_from_slice(&b);
            }
            Elem::U8(v) => out.push(v),
            Elem::U16(v) => {
                let mut b = [0u8; 2];
                LittleEndian::write_u16(&mut b, v);
                out.extend_from_slice(&b);
            }
            Elem::U32(v) => {
                let mut b = [0u8; 4];
                LittleEndian::write_u32(&mut b, v);
                out.extend_from_slice(&b);
            }
            Elem::U64(v) => {
                let mut b = [0u8; 8];
                LittleEndian::write_u64(&mut b, v);
                out.extend_from_slice(&b);
            }
            Elem::F32(v) => {
                let mut b = [0u8; 4];
                LittleEndian::write_f32(&mut b, v);
                out.extend_from_slice(&b);
            }
            Elem::F64(v) => {
                let mut b = [0u8; 8];
                LittleEndian::write_f64(&mut b, v);
                out.extend_from_slice(&b);
            }
        }
    }

    /// Double-precision view, used for mean accumulation.
    pub fn as_f64(self) -> f64 {
        match self {
            Elem::I8(v) => v as f64,
            Elem::I16(v) => v as f64,
            Elem::I32(v) => v as f64,
            Elem::I64(v) => v as f64,
            Elem::U8(v) => v as f64,
            Elem::U16(v) => v as f64,
            Elem::U32(v) => v as f64,
            Elem::U64(v) => v as f64,
            Elem::F32(v) => v as f64,
            Elem::F64(v) => v,
        }
    }

    /// Native ordering, per dtype (spec: "min/max use the native dtype
    /// ordering").
    pub fn native_cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (*self, *other) {
            (Elem::I8(a), Elem::I8(b)) => a.cmp(&b),
            (Elem::I16(a), Elem::I16(b)) => a.cmp(&b),
            (Elem::I32(a), Elem::I32(b)) => a.cmp(&b),
            (Elem::I64(a), Elem::I64(b)) => a.cmp(&b),
            (Elem::U8(a), Elem::U8(b)) => a.cmp(&b),
            (Elem::U16(a), Elem::U16(b)) => a.cmp(&b),
            (Elem::U32(a), Elem::U32(b)) => a.cmp(&b),
            (Elem::U64(a), Elem::U64(b)) => a.cmp(&b),
            (Elem::F32(a), Elem::F32(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
            (Elem::F64(a), Elem::F64(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
            _ => panic!("mismatched Elem dtypes compared"),
        }
    }

    pub fn from_f64(dtype: Dtype, v: f64) -> Self {
        match dtype {
            Dtype::Int8 => Elem::I8(v as i8),
            Dtype::Int16 => Elem::I16(v as i16),
            Dtype::Int32 => Elem::I32(v as i32),
            Dtype::Int64 => Elem::I64(v as i64),
            Dtype::Uint8 => Elem::U8(v as u8),
            Dtype::Uint16 => Elem::U16(v as u16),
            Dtype::Uint32 => Elem::U32(v as u32),
            Dtype::Uint64 => Elem::U64(v as u64),
            Dtype::Float32 => Elem::F32(v as f32),
            Dtype::Float64 => Elem::F64(v),
        }
    }
}

/// `<dtype>_<n>`: the datatype and element count of a stream's samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Layout {
    pub dtype: Dtype,
    pub count: usize,
}

impl Layout {
    pub fn parse(s: &str) -> Result<Self> {
        let (dtype_str, count_str) = s
            .rsplit_once('_')
            .ok_or_else(|| JouleError::Configuration(format!("invalid layout [{s}]")))?;
        let dtype = Dtype::parse(dtype_str)
            .ok_or_else(|| JouleError::Configuration(format!("invalid layout [{s}]")))?;
        let count: usize = count_str
            .parse()
            .map_err(|_| JouleError::Configuration(format!("invalid layout [{s}]")))?;
        if count < 1 {
            return Err(JouleError::Configuration(format!(
                "invalid layout [{s}]: element count must be >= 1"
            )));
        }
        Ok(Layout { dtype, count })
    }

    /// Bytes per raw record: 8 (timestamp) + n * sizeof(dtype).
    pub fn raw_row_width(&self) -> usize {
        8 + self.count * self.dtype.width()
    }

    /// Bytes per decimated record: 8 + 3n * sizeof(dtype) (mean, min, max).
    pub fn decimated_row_width(&self) -> usize {
        8 + 3 * self.count * self.dtype.width()
    }

    /// The companion layout used for decimated samples of this stream.
    pub fn decimated(&self) -> Layout {
        Layout {
            dtype: self.dtype,
            count: self.count * 3,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.dtype.name(), self.count)
    }
}

/// Canonical in-band sentinel used to mark interval breaks in the framed
/// wire format: timestamp 0, payload bytes all 0xFF.
pub fn interval_token_row(layout: &Layout, decimated: bool) -> Vec<u8> {
    let width = if decimated {
        layout.decimated_row_width()
    } else {
        layout.raw_row_width()
    };
    let mut row = vec![0xFFu8; width];
    row[0..8].copy_from_slice(&0u64.to_le_bytes());
    row
}

/// Exact sentinel detection: timestamp 0 and every payload byte 0xFF.
pub fn is_interval_token(row: &[u8]) -> bool {
    if row.len() < 8 {
        return false;
    }
    let ts = LittleEndian::read_u64(&row[0..8]);
    ts == 0 && row[8..].iter().all(|&b| b == 0xFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_layout() {
        let l = Layout::parse("float32_3").unwrap();
        assert_eq!(l.dtype, Dtype::Float32);
        assert_eq!(l.count, 3);
        assert_eq!(l.raw_row_width(), 8 + 3 * 4);
        assert_eq!(l.decimated_row_width(), 8 + 9 * 4);
    }

    #[test]
    fn rejects_bad_layout() {
        assert!(Layout::parse("garbage").is_err());
        assert!(Layout::parse("int32_0").is_err());
        assert!(Layout::parse("int33_2").is_err());
    }

    #[test]
    fn sentinel_roundtrips() {
        let l = Layout::parse("int32_1").unwrap();
        let row = interval_token_row(&l, false);
        assert!(is_interval_token(&row));
        let mut normal = vec![0u8; l.raw_row_width()];
        normal[0..8].copy_from_slice(&42u64.to_le_bytes());
        assert!(!is_interval_token(&normal));
    }
}
