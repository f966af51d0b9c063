//! Minimal DER encoder, just enough to mint Matter-compatible X.509
//! certificates and RFC 5915 private keys.

use std::io::Result;

/// Position of an open constructed element whose length byte is patched
/// when the element closes.
#[derive(Debug, Clone)]
struct OpenSeq {
    pos: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Encoder {
    buffer: Vec<u8>,
    open: Vec<OpenSeq>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a constructed element with the given tag octet (0x30 for
    /// SEQUENCE, 0x31 for SET, 0xa0/0xa1/0xa3 for context tags).
    pub fn begin(&mut self, tag: u8) -> Result<()> {
        self.buffer.push(tag);
        self.open.push(OpenSeq {
            pos: self.buffer.len(),
        });
        self.buffer.push(0); // length, patched on end()
        Ok(())
    }

    /// Close the innermost open element and patch its length, growing the
    /// length field to the long form when needed.
    pub fn end(&mut self) {
        let Some(open) = self.open.pop() else { return };
        let len = self.buffer.len() - open.pos - 1;
        if len < 0x80 {
            self.buffer[open.pos] = len as u8;
        } else if len <= 0xff {
            self.buffer[open.pos] = 0x81;
            self.buffer.insert(open.pos + 1, len as u8);
        } else {
            self.buffer[open.pos] = 0x82;
            self.buffer.insert(open.pos + 1, (len >> 8) as u8);
            self.buffer.insert(open.pos + 2, len as u8);
        }
    }

    fn primitive(&mut self, tag: u8, content: &[u8]) {
        self.buffer.push(tag);
        let len = content.len();
        if len < 0x80 {
            self.buffer.push(len as u8);
        } else if len <= 0xff {
            self.buffer.push(0x81);
            self.buffer.push(len as u8);
        } else {
            self.buffer.push(0x82);
            self.buffer.push((len >> 8) as u8);
            self.buffer.push(len as u8);
        }
        self.buffer.extend_from_slice(content);
    }

    /// INTEGER, minimal two's-complement encoding of a non-negative value.
    pub fn int(&mut self, value: u32) -> Result<()> {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 3 && bytes[start] == 0 {
            start += 1;
        }
        // prepend 0x00 when the high bit would read as a sign
        if bytes[start] & 0x80 != 0 {
            let mut content = vec![0u8];
            content.extend_from_slice(&bytes[start..]);
            self.primitive(0x02, &content);
        } else {
            self.primitive(0x02, &bytes[start..]);
        }
        Ok(())
    }

    pub fn boolean(&mut self, value: bool) -> Result<()> {
        self.primitive(0x01, &[if value { 0xff } else { 0x00 }]);
        Ok(())
    }

    pub fn octet_string(&mut self, content: &[u8]) -> Result<()> {
        self.primitive(0x04, content);
        Ok(())
    }

    pub fn tagged_octet_string(&mut self, tag: u8, content: &[u8]) -> Result<()> {
        self.primitive(tag, content);
        Ok(())
    }

    pub fn utf8_string(&mut self, content: &str) -> Result<()> {
        self.primitive(0x0c, content.as_bytes());
        Ok(())
    }

    pub fn tagged_string(&mut self, tag: u8, content: &str) -> Result<()> {
        self.primitive(tag, content.as_bytes());
        Ok(())
    }

    pub fn oid(&mut self, dotted: &str) -> Result<()> {
        match const_oid::ObjectIdentifier::new(dotted) {
            Ok(oid) => {
                self.primitive(0x06, oid.as_bytes());
                Ok(())
            }
            Err(e) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad oid {dotted}: {e:?}"),
            )),
        }
    }

    /// Close any elements still open and return the DER bytes.
    pub fn finish(mut self) -> Vec<u8> {
        while !self.open.is_empty() {
            self.end();
        }
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_forms() {
        let mut e = Encoder::new();
        e.int(127).unwrap();
        assert_eq!(e.finish(), vec![0x02, 0x01, 0x7f]);

        let mut e = Encoder::new();
        e.int(128).unwrap();
        assert_eq!(e.finish(), vec![0x02, 0x02, 0x00, 0x80]);

        let mut e = Encoder::new();
        e.int(256).unwrap();
        assert_eq!(e.finish(), vec![0x02, 0x02, 0x01, 0x00]);

        let mut e = Encoder::new();
        e.boolean(true).unwrap();
        assert_eq!(e.finish(), vec![0x01, 0x01, 0xff]);
    }

    #[test]
    fn nested_sequence_lengths() {
        let mut e = Encoder::new();
        e.begin(0x30).unwrap();
        e.begin(0x30).unwrap();
        e.octet_string(&[0xaa; 4]).unwrap();
        e.end();
        e.end();
        let out = e.finish();
        assert_eq!(out[0], 0x30);
        assert_eq!(out[1] as usize, out.len() - 2);
        assert_eq!(out[2], 0x30);
        assert_eq!(out[3] as usize, out.len() - 4);
    }

    #[test]
    fn long_form_length() {
        let mut e = Encoder::new();
        e.begin(0x30).unwrap();
        e.octet_string(&[0u8; 200]).unwrap();
        e.end();
        let out = e.finish();
        assert_eq!(out[1], 0x81);
        assert_eq!(out[2] as usize, out.len() - 3);
    }
}
