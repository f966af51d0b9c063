//! Onboarding payload decoding: the `MT:` QR text payload and the
//! 11-digit manual pairing code.

use anyhow::{Context, Result};

const BASE38_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ-.";

/// Fields packed into the QR bitstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrContent {
    pub version: u8,
    pub vendor: u16,
    pub product: u16,
    pub custom_flow: u8,
    pub discovery_capabilities: u8,
    pub discriminator: u16,
    pub passcode: u32,
}

/// LSB-first reader over a little-endian byte stream.
struct BitReader {
    bytes: Vec<u8>,
    position: usize,
}

impl BitReader {
    fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, position: 0 }
    }

    fn take(&mut self, bits: usize) -> Result<u64> {
        let mut out = 0u64;
        for i in 0..bits {
            let byte = self
                .bytes
                .get(self.position / 8)
                .context("qr payload too short")?;
            let bit = (byte >> (self.position % 8)) & 1;
            out |= (bit as u64) << i;
            self.position += 1;
        }
        Ok(out)
    }
}

fn base38_value(c: u8) -> Result<u32> {
    BASE38_ALPHABET
        .iter()
        .position(|&a| a == c)
        .map(|p| p as u32)
        .with_context(|| format!("character {:?} not in base-38 alphabet", c as char))
}

/// Decode base-38 groups of five characters (the final group may be
/// short); every group yields three little-endian bytes.
fn base38_decode(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() / 5 * 3 + 3);
    for group in text.as_bytes().chunks(5) {
        let mut value = 0u32;
        let mut scale = 1u32;
        for &c in group {
            value += base38_value(c)? * scale;
            scale *= 38;
        }
        out.extend_from_slice(&value.to_le_bytes()[..3]);
    }
    Ok(out)
}

/// Decode a QR text payload of the form `MT:<base38>`.
pub fn decode_qr_text(text: &str) -> Result<QrContent> {
    let packed = text
        .strip_prefix("MT:")
        .context("payload does not start with MT:")?;
    let mut bits = BitReader::new(base38_decode(packed)?);
    Ok(QrContent {
        version: bits.take(3)? as u8,
        vendor: bits.take(16)? as u16,
        product: bits.take(16)? as u16,
        custom_flow: bits.take(2)? as u8,
        discovery_capabilities: bits.take(8)? as u8,
        discriminator: bits.take(12)? as u16,
        passcode: bits.take(27)? as u32,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingInfo {
    pub discriminator: u16,
    pub passcode: u32,
}

/// Decode the 11-digit manual pairing code (dashes ignored).
pub fn decode_manual_pairing_code(code: &str) -> Result<PairingInfo> {
    let digits = code.replace('-', "");
    if digits.len() < 10 {
        anyhow::bail!("pairing code too short");
    }
    let first = digits[0..1].parse::<u32>()?;
    let second = digits[1..6].parse::<u32>()?;
    let third = digits[6..10].parse::<u32>()?;
    let passcode = (second & 0x3fff) | (third << 14);
    let discriminator = (((first & 3) << 10) | ((second >> 6) & 0x300)) as u16;
    Ok(PairingInfo {
        discriminator,
        passcode,
    })
}
