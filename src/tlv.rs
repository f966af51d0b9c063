//! Matter TLV encoding and decoding.
//!
//! The writer emits elements with context tags one byte wide; the reader
//! comes in two shapes: [`decode`] builds a tree of [`TlvElement`] values
//! with path lookup, [`TlvReader`] walks a buffer element by element when
//! the caller knows the exact layout.

use byteorder::{LittleEndian, ReadBytesExt};
use core::fmt;
use std::io::{Cursor, Read};

const TYPE_INT_1: u8 = 0x00;
const TYPE_INT_2: u8 = 0x01;
const TYPE_INT_4: u8 = 0x02;
const TYPE_INT_8: u8 = 0x03;
const TYPE_UINT_1: u8 = 0x04;
const TYPE_UINT_2: u8 = 0x05;
const TYPE_UINT_4: u8 = 0x06;
const TYPE_UINT_8: u8 = 0x07;
const TYPE_BOOL_FALSE: u8 = 0x08;
const TYPE_BOOL_TRUE: u8 = 0x09;
const TYPE_UTF8_L1: u8 = 0x0c;
const TYPE_OCTETS_L1: u8 = 0x10;
const TYPE_OCTETS_L2: u8 = 0x11;
const TYPE_NULL: u8 = 0x14;
const TYPE_STRUCT: u8 = 0x15;
const TYPE_ARRAY: u8 = 0x16;
const TYPE_LIST: u8 = 0x17;
const TYPE_END: u8 = 0x18;

/// Context-specific tag form, one tag byte follows the control octet.
const CTRL_CTX: u8 = 1 << 5;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TlvError {
    #[error("unexpected tag {got} (expected {expected})")]
    UnexpectedTag { expected: u8, got: u8 },
    #[error("unexpected element type, control octet 0x{0:02x}")]
    UnexpectedType(u8),
    #[error("short read")]
    ShortRead,
}

impl From<std::io::Error> for TlvError {
    fn from(_: std::io::Error) -> Self {
        TlvError::ShortRead
    }
}

/// Incremental TLV writer. All writers are infallible; callers pick the
/// element width explicitly, there is no automatic narrowing.
#[derive(Default)]
pub struct TlvWriter {
    data: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(256),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn begin_struct(&mut self) {
        self.data.push(TYPE_STRUCT);
    }
    pub fn begin_struct_tagged(&mut self, tag: u8) {
        self.data.push(CTRL_CTX | TYPE_STRUCT);
        self.data.push(tag);
    }
    pub fn begin_array(&mut self, tag: u8) {
        self.data.push(CTRL_CTX | TYPE_ARRAY);
        self.data.push(tag);
    }
    pub fn begin_list(&mut self, tag: u8) {
        self.data.push(CTRL_CTX | TYPE_LIST);
        self.data.push(tag);
    }
    pub fn begin_list_anon(&mut self) {
        self.data.push(TYPE_LIST);
    }
    pub fn end_container(&mut self) {
        self.data.push(TYPE_END);
    }

    pub fn uint8(&mut self, tag: u8, value: u8) {
        self.data.push(CTRL_CTX | TYPE_UINT_1);
        self.data.push(tag);
        self.data.push(value);
    }
    pub fn uint8_anon(&mut self, value: u8) {
        self.data.push(TYPE_UINT_1);
        self.data.push(value);
    }
    pub fn uint16(&mut self, tag: u8, value: u16) {
        self.data.push(CTRL_CTX | TYPE_UINT_2);
        self.data.push(tag);
        self.data.extend_from_slice(&value.to_le_bytes());
    }
    pub fn uint32(&mut self, tag: u8, value: u32) {
        self.data.push(CTRL_CTX | TYPE_UINT_4);
        self.data.push(tag);
        self.data.extend_from_slice(&value.to_le_bytes());
    }
    pub fn uint64(&mut self, tag: u8, value: u64) {
        self.data.push(CTRL_CTX | TYPE_UINT_8);
        self.data.push(tag);
        self.data.extend_from_slice(&value.to_le_bytes());
    }
    pub fn int8(&mut self, tag: u8, value: i8) {
        self.data.push(CTRL_CTX | TYPE_INT_1);
        self.data.push(tag);
        self.data.push(value as u8);
    }
    pub fn int16(&mut self, tag: u8, value: i16) {
        self.data.push(CTRL_CTX | TYPE_INT_2);
        self.data.push(tag);
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn boolean(&mut self, tag: u8, value: bool) {
        let tp = if value { TYPE_BOOL_TRUE } else { TYPE_BOOL_FALSE };
        self.data.push(CTRL_CTX | tp);
        self.data.push(tag);
    }

    pub fn octets(&mut self, tag: u8, value: &[u8]) {
        if value.len() > 0xff {
            self.data.push(CTRL_CTX | TYPE_OCTETS_L2);
            self.data.push(tag);
            self.data
                .extend_from_slice(&(value.len() as u16).to_le_bytes());
        } else {
            self.data.push(CTRL_CTX | TYPE_OCTETS_L1);
            self.data.push(tag);
            self.data.push(value.len() as u8);
        }
        self.data.extend_from_slice(value);
    }

    pub fn utf8(&mut self, tag: u8, value: &str) {
        let bytes = value.as_bytes();
        self.data.push(CTRL_CTX | TYPE_UTF8_L1);
        self.data.push(tag);
        self.data.push(bytes.len() as u8);
        self.data.extend_from_slice(bytes);
    }
}

/// Value of a decoded element. Unsigned readers widen to 64 bits;
/// callers narrow.
#[derive(Clone, PartialEq)]
pub enum TlvValue {
    Unsigned(u64),
    Signed(i64),
    Bool(bool),
    Utf8(String),
    Octets(Vec<u8>),
    Container(Vec<TlvElement>),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlvElement {
    pub tag: u8,
    pub value: TlvValue,
}

impl fmt::Debug for TlvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(v) => f.debug_tuple("Unsigned").field(v).finish(),
            Self::Signed(v) => f.debug_tuple("Signed").field(v).finish(),
            Self::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Self::Utf8(v) => f.debug_tuple("Utf8").field(v).finish(),
            Self::Octets(v) => f.debug_tuple("Octets").field(&hex::encode(v)).finish(),
            Self::Container(v) => f.debug_tuple("Container").field(v).finish(),
            Self::Null => f.debug_tuple("Null").finish(),
        }
    }
}

impl TlvElement {
    /// Descend through nested containers following context tags and
    /// return the value at the leaf.
    pub fn get(&self, path: &[u8]) -> Option<&TlvValue> {
        match path.split_first() {
            None => Some(&self.value),
            Some((head, rest)) => {
                if let TlvValue::Container(items) = &self.value {
                    items.iter().find(|i| i.tag == *head)?.get(rest)
                } else {
                    None
                }
            }
        }
    }

    pub fn unsigned_at(&self, path: &[u8]) -> Option<u64> {
        match self.get(path)? {
            TlvValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    pub fn bool_at(&self, path: &[u8]) -> Option<bool> {
        match self.get(path)? {
            TlvValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn octets_at(&self, path: &[u8]) -> Option<&[u8]> {
        match self.get(path)? {
            TlvValue::Octets(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn utf8_at(&self, path: &[u8]) -> Option<&str> {
        match self.get(path)? {
            TlvValue::Utf8(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

fn read_exact(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, TlvError> {
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(|_| TlvError::ShortRead)?;
    Ok(buf)
}

fn decode_into(cursor: &mut Cursor<&[u8]>, out: &mut Vec<TlvElement>) -> Result<(), TlvError> {
    while cursor.position() < cursor.get_ref().len() as u64 {
        let control = cursor.read_u8()?;
        let tp = control & 0x1f;
        let tag = match control >> 5 {
            0 => 0,
            1 => cursor.read_u8()?,
            _ => return Err(TlvError::UnexpectedType(control)),
        };
        let value = match tp {
            TYPE_INT_1 => TlvValue::Signed(cursor.read_i8()? as i64),
            TYPE_INT_2 => TlvValue::Signed(cursor.read_i16::<LittleEndian>()? as i64),
            TYPE_INT_4 => TlvValue::Signed(cursor.read_i32::<LittleEndian>()? as i64),
            TYPE_INT_8 => TlvValue::Signed(cursor.read_i64::<LittleEndian>()?),
            TYPE_UINT_1 => TlvValue::Unsigned(cursor.read_u8()? as u64),
            TYPE_UINT_2 => TlvValue::Unsigned(cursor.read_u16::<LittleEndian>()? as u64),
            TYPE_UINT_4 => TlvValue::Unsigned(cursor.read_u32::<LittleEndian>()? as u64),
            TYPE_UINT_8 => TlvValue::Unsigned(cursor.read_u64::<LittleEndian>()?),
            TYPE_BOOL_FALSE => TlvValue::Bool(false),
            TYPE_BOOL_TRUE => TlvValue::Bool(true),
            TYPE_UTF8_L1 => {
                let len = cursor.read_u8()? as usize;
                let raw = read_exact(cursor, len)?;
                match String::from_utf8(raw) {
                    Ok(s) => TlvValue::Utf8(s),
                    Err(_) => return Err(TlvError::UnexpectedType(control)),
                }
            }
            TYPE_OCTETS_L1 => {
                let len = cursor.read_u8()? as usize;
                TlvValue::Octets(read_exact(cursor, len)?)
            }
            TYPE_OCTETS_L2 => {
                let len = cursor.read_u16::<LittleEndian>()? as usize;
                TlvValue::Octets(read_exact(cursor, len)?)
            }
            TYPE_NULL => TlvValue::Null,
            TYPE_STRUCT | TYPE_ARRAY | TYPE_LIST => {
                let mut inner = Vec::new();
                decode_into(cursor, &mut inner)?;
                TlvValue::Container(inner)
            }
            TYPE_END => return Ok(()),
            _ => return Err(TlvError::UnexpectedType(control)),
        };
        out.push(TlvElement { tag, value });
    }
    Ok(())
}

/// Decode a raw buffer into an element tree. A buffer holding several
/// top-level elements comes back wrapped in an anonymous container.
pub fn decode(data: &[u8]) -> Result<TlvElement, TlvError> {
    let mut cursor = Cursor::new(data);
    let mut items = Vec::new();
    decode_into(&mut cursor, &mut items)?;
    if items.len() == 1 {
        Ok(items.remove(0))
    } else {
        Ok(TlvElement {
            tag: 0,
            value: TlvValue::Container(items),
        })
    }
}

/// Cursor-style reader for payloads with a fixed, known layout.
pub struct TlvReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    /// Consume one byte and require it to be the given control octet
    /// (container open/close markers).
    pub fn expect(&mut self, control: u8) -> Result<(), TlvError> {
        let got = self.cursor.read_u8()?;
        if got != control {
            return Err(TlvError::UnexpectedType(got));
        }
        Ok(())
    }

    fn read_header(&mut self, tag: u8) -> Result<u8, TlvError> {
        let control = self.cursor.read_u8()?;
        if control >> 5 != 1 {
            return Err(TlvError::UnexpectedType(control));
        }
        let got = self.cursor.read_u8()?;
        if got != tag {
            return Err(TlvError::UnexpectedTag { expected: tag, got });
        }
        Ok(control & 0x1f)
    }

    /// Read an unsigned element at the given context tag, dispatching on
    /// the width nibble. Always yields 64 bits.
    pub fn read_uint(&mut self, tag: u8) -> Result<u64, TlvError> {
        let tp = self.read_header(tag)?;
        match tp {
            TYPE_UINT_1 => Ok(self.cursor.read_u8()? as u64),
            TYPE_UINT_2 => Ok(self.cursor.read_u16::<LittleEndian>()? as u64),
            TYPE_UINT_4 => Ok(self.cursor.read_u32::<LittleEndian>()? as u64),
            TYPE_UINT_8 => Ok(self.cursor.read_u64::<LittleEndian>()?),
            _ => Err(TlvError::UnexpectedType(CTRL_CTX | tp)),
        }
    }

    /// Read an octet string at the given context tag.
    pub fn read_octets(&mut self, tag: u8) -> Result<Vec<u8>, TlvError> {
        let tp = self.read_header(tag)?;
        let len = match tp {
            TYPE_OCTETS_L1 => self.cursor.read_u8()? as usize,
            TYPE_OCTETS_L2 => self.cursor.read_u16::<LittleEndian>()? as usize,
            _ => return Err(TlvError::UnexpectedType(CTRL_CTX | tp)),
        };
        read_exact(&mut self.cursor, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings() {
        let mut w = TlvWriter::new();
        w.begin_struct();
        w.uint8(0, 6);
        w.uint8(1, 7);
        w.end_container();
        assert_eq!(hex::encode(w.data()), "1524000624010718");

        let mut w = TlvWriter::new();
        w.begin_struct();
        w.octets(1, &[1, 2, 3]);
        w.end_container();
        assert_eq!(hex::encode(w.data()), "1530010301020318");
    }

    #[test]
    fn unsigned_roundtrip_all_widths() {
        let mut w = TlvWriter::new();
        w.begin_struct();
        w.uint8(1, 0xab);
        w.uint16(2, 0xabcd);
        w.uint32(3, 0xdead_beef);
        w.uint64(4, 0x0102_0304_0506_0708);
        w.end_container();
        let root = decode(w.data()).unwrap();
        assert_eq!(root.unsigned_at(&[1]), Some(0xab));
        assert_eq!(root.unsigned_at(&[2]), Some(0xabcd));
        assert_eq!(root.unsigned_at(&[3]), Some(0xdead_beef));
        assert_eq!(root.unsigned_at(&[4]), Some(0x0102_0304_0506_0708));
    }

    #[test]
    fn signed_roundtrip() {
        let mut w = TlvWriter::new();
        w.begin_struct();
        w.int8(1, -5);
        w.int16(2, -1000);
        w.end_container();
        let root = decode(w.data()).unwrap();
        assert_eq!(root.get(&[1]), Some(&TlvValue::Signed(-5)));
        assert_eq!(root.get(&[2]), Some(&TlvValue::Signed(-1000)));
    }

    #[test]
    fn anonymous_list_form() {
        let mut w = TlvWriter::new();
        w.begin_list_anon();
        w.uint8(2, 7);
        w.end_container();
        assert_eq!(w.data()[0], 0x17);
        let root = decode(w.data()).unwrap();
        assert_eq!(root.unsigned_at(&[2]), Some(7));

        let mut r = TlvReader::new(w.data());
        r.expect(0x17).unwrap();
        assert_eq!(r.read_uint(2).unwrap(), 7);
        r.expect(0x18).unwrap();
    }

    #[test]
    fn booleans_and_strings() {
        let mut w = TlvWriter::new();
        w.begin_struct();
        w.boolean(1, true);
        w.boolean(2, false);
        w.utf8(3, "hello");
        w.end_container();
        let root = decode(w.data()).unwrap();
        assert_eq!(root.bool_at(&[1]), Some(true));
        assert_eq!(root.bool_at(&[2]), Some(false));
        assert_eq!(root.utf8_at(&[3]), Some("hello"));
    }

    #[test]
    fn long_octet_string_uses_two_byte_length() {
        let blob = vec![0x5a; 300];
        let mut w = TlvWriter::new();
        w.octets(7, &blob);
        assert_eq!(w.data()[0], 0x31);
        let root = decode(w.data()).unwrap();
        assert_eq!(root.octets_at(&[]), Some(blob.as_slice()));
    }

    #[test]
    fn nested_path_lookup() {
        let mut w = TlvWriter::new();
        w.begin_struct();
        w.begin_struct_tagged(1);
        w.begin_struct_tagged(0);
        w.uint16(2, 512);
        w.end_container();
        w.end_container();
        w.octets(5, &[9, 9]);
        w.end_container();
        let root = decode(w.data()).unwrap();
        assert_eq!(root.unsigned_at(&[1, 0, 2]), Some(512));
        assert_eq!(root.octets_at(&[5]), Some(&[9u8, 9][..]));
        assert_eq!(root.get(&[1, 0, 9]), None);
        assert_eq!(root.unsigned_at(&[5]), None);
    }

    #[test]
    fn reader_fixed_layout() {
        let mut w = TlvWriter::new();
        w.begin_struct();
        w.octets(1, &[0xaa, 0xbb]);
        w.uint32(2, 77);
        w.end_container();
        let mut r = TlvReader::new(w.data());
        r.expect(0x15).unwrap();
        assert_eq!(r.read_octets(1).unwrap(), vec![0xaa, 0xbb]);
        assert_eq!(r.read_uint(2).unwrap(), 77);
        r.expect(0x18).unwrap();
    }

    #[test]
    fn reader_rejects_wrong_tag_and_type() {
        let mut w = TlvWriter::new();
        w.uint8(3, 1);
        let mut r = TlvReader::new(w.data());
        assert_eq!(
            r.read_uint(4),
            Err(TlvError::UnexpectedTag { expected: 4, got: 3 })
        );

        let mut w = TlvWriter::new();
        w.octets(3, &[1]);
        let mut r = TlvReader::new(w.data());
        assert!(matches!(r.read_uint(3), Err(TlvError::UnexpectedType(_))));
    }

    #[test]
    fn truncated_input_is_short_read() {
        let mut w = TlvWriter::new();
        w.octets(1, &[1, 2, 3, 4]);
        let data = &w.data()[..w.data().len() - 2];
        assert_eq!(decode(data), Err(TlvError::ShortRead));
    }

    #[test]
    fn anonymous_elements_inside_array() {
        let mut w = TlvWriter::new();
        w.begin_array(3);
        w.uint8_anon(1);
        w.uint8_anon(2);
        w.end_container();
        let root = decode(w.data()).unwrap();
        match root.get(&[]) {
            Some(TlvValue::Container(items)) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].value, TlvValue::Unsigned(1));
            }
            other => panic!("expected container, got {:?}", other),
        }
    }
}
