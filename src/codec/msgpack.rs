//! The subset of msgpack the earbuds RPC uses: nil, booleans, integers up to
//! 32 bits, strings and arrays.

use bytes::{BufMut, BytesMut};

/// A decoded msgpack value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `nil`
    Nil,
    /// `true` / `false`
    Bool(bool),
    /// Any integer format
    Int(i64),
    /// UTF-8 string
    Str(String),
    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Integer content
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// String content
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Boolean content
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Array content
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(values) => Some(values),
            _ => None,
        }
    }
}

/// Append the encoding of `value` to `out`
pub fn encode(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Nil => out.put_u8(0xC0),
        Value::Bool(false) => out.put_u8(0xC2),
        Value::Bool(true) => out.put_u8(0xC3),
        Value::Int(n) => encode_int(*n, out),
        Value::Str(s) => {
            let len = s.len();
            if len < 32 {
                out.put_u8(0xA0 | len as u8);
            } else if let Ok(len) = u8::try_from(len) {
                out.put_u8(0xD9);
                out.put_u8(len);
            } else {
                out.put_u8(0xDA);
                out.put_u16(u16::try_from(len).unwrap_or(u16::MAX));
            }
            let take = s.len().min(usize::from(u16::MAX));
            out.put_slice(&s.as_bytes()[..take]);
        }
        Value::Array(values) => {
            if values.len() < 16 {
                out.put_u8(0x90 | values.len() as u8);
            } else {
                out.put_u8(0xDC);
                out.put_u16(u16::try_from(values.len()).unwrap_or(u16::MAX));
            }
            for item in values.iter().take(usize::from(u16::MAX)) {
                encode(item, out);
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_int(n: i64, out: &mut BytesMut) {
    match n {
        0..=0x7F => out.put_u8(n as u8),
        -32..=-1 => out.put_u8(n as i8 as u8),
        0x80..=0xFF => {
            out.put_u8(0xCC);
            out.put_u8(n as u8);
        }
        0x100..=0xFFFF => {
            out.put_u8(0xCD);
            out.put_u16(n as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.put_u8(0xCE);
            out.put_u32(n as u32);
        }
        -128..=-33 => {
            out.put_u8(0xD0);
            out.put_i8(n as i8);
        }
        -32_768..=-129 => {
            out.put_u8(0xD1);
            out.put_i16(n as i16);
        }
        _ => {
            out.put_u8(0xD2);
            out.put_i32(i32::try_from(n).unwrap_or(if n < 0 { i32::MIN } else { i32::MAX }));
        }
    }
}

/// Decode one value from the front of `data`, returning it and the bytes used
#[must_use]
pub fn decode(data: &[u8]) -> Option<(Value, usize)> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = cursor.value(0)?;
    Some((value, cursor.pos))
}

const MAX_DEPTH: usize = 8;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Option<&[u8]> {
        let bytes = self.data.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(bytes)
    }

    fn byte(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn be16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn be32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self, len: usize) -> Option<Value> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok().map(Value::Str)
    }

    fn array(&mut self, len: usize, depth: usize) -> Option<Value> {
        if depth >= MAX_DEPTH {
            return None;
        }
        let mut values = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            values.push(self.value(depth + 1)?);
        }
        Some(Value::Array(values))
    }

    #[allow(clippy::cast_possible_wrap)]
    fn value(&mut self, depth: usize) -> Option<Value> {
        let marker = self.byte()?;
        match marker {
            0x00..=0x7F => Some(Value::Int(i64::from(marker))),
            0x90..=0x9F => self.array(usize::from(marker & 0x0F), depth),
            0xA0..=0xBF => self.string(usize::from(marker & 0x1F)),
            0xC0 => Some(Value::Nil),
            0xC2 => Some(Value::Bool(false)),
            0xC3 => Some(Value::Bool(true)),
            0xCC => self.byte().map(|n| Value::Int(i64::from(n))),
            0xCD => self.be16().map(|n| Value::Int(i64::from(n))),
            0xCE => self.be32().map(|n| Value::Int(i64::from(n))),
            0xD0 => self.byte().map(|n| Value::Int(i64::from(n as i8))),
            0xD1 => self.be16().map(|n| Value::Int(i64::from(n as i16))),
            0xD2 => self.be32().map(|n| Value::Int(i64::from(n as i32))),
            0xD9 => {
                let len = self.byte()?;
                self.string(usize::from(len))
            }
            0xDA => {
                let len = self.be16()?;
                self.string(usize::from(len))
            }
            0xDC => {
                let len = self.be16()?;
                self.array(usize::from(len), depth)
            }
            0xE0..=0xFF => Some(Value::Int(i64::from(marker as i8))),
            _ => None,
        }
    }
}
