//! Thin wrappers over the RustCrypto primitives used across the crate.

use aes::cipher::crypto_common;
use anyhow::Result;
use hmac::Mac;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::Error;

/// AES-128-CCM with a 16-byte tag and a 13-byte nonce, the only AEAD the
/// message layer uses.
pub type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;
pub type AeadKey = crypto_common::Key<Aes128Ccm>;

pub fn aead_key(raw: &[u8]) -> AeadKey {
    *AeadKey::from_slice(raw)
}

pub fn aes128_ccm_seal(
    key: &AeadKey,
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> std::result::Result<Vec<u8>, Error> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    ccm::aead::Aead::encrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload {
            msg: plaintext,
            aad,
        },
    )
    .map_err(|_| Error::AeadFailure)
}

pub fn aes128_ccm_open(
    key: &AeadKey,
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> std::result::Result<Vec<u8>, Error> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    ccm::aead::Aead::decrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload {
            msg: ciphertext,
            aad,
        },
    )
    .map_err(|_| Error::AeadFailure)
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

pub fn sha1(data: &[u8]) -> Vec<u8> {
    Sha1::digest(data).to_vec()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = hmac::Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("bad hmac key: {e:?}"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], size: usize) -> Result<Vec<u8>> {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; size];
    hk.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("hkdf expand: {e:?}"))?;
    Ok(okm)
}

/// Encode a P-256 private key as RFC 5915 ECPrivateKey DER, the layout
/// the PEM store writes.
pub fn secret_key_to_rfc5915(key: &p256::SecretKey) -> Result<Vec<u8>> {
    let mut enc = crate::util::asn1::Encoder::new();
    enc.begin(0x30)?;
    enc.int(1)?;
    enc.octet_string(key.to_bytes().as_slice())?;
    enc.begin(0xa0)?;
    enc.oid("1.2.840.10045.3.1.7")?;
    enc.end();
    enc.begin(0xa1)?;
    let mut point = vec![0u8];
    point.extend_from_slice(&key.public_key().to_sec1_bytes());
    enc.tagged_octet_string(0x03, &point)?;
    enc.end();
    enc.end();
    Ok(enc.finish())
}

pub fn read_pem_payload(fname: &str) -> Result<Vec<u8>> {
    let contents = std::fs::read_to_string(fname)?;
    Ok(pem::parse(contents)?.contents().to_vec())
}

pub fn read_secret_key_pem(fname: &str) -> Result<p256::SecretKey> {
    let contents = std::fs::read_to_string(fname)?;
    Ok(p256::SecretKey::from_sec1_pem(&contents)?)
}

pub fn write_pem(tag: &str, data: &[u8], fname: &str) -> Result<()> {
    let block = pem::Pem::new(tag, data);
    std::fs::write(fname, pem::encode(&block))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ccm_seal_open_and_fail_closed() {
        let key = aead_key(&[7u8; 16]);
        let nonce = [1u8; 13];
        let aad = b"header";
        let sealed = aes128_ccm_seal(&key, &nonce, aad, b"payload").unwrap();
        assert_eq!(sealed.len(), 7 + 16);

        let opened = aes128_ccm_open(&key, &nonce, aad, &sealed).unwrap();
        assert_eq!(opened, b"payload");

        // flipped aad must fail closed
        assert!(matches!(
            aes128_ccm_open(&key, &nonce, b"headex", &sealed),
            Err(Error::AeadFailure)
        ));
        // flipped ciphertext bit too
        let mut bad = sealed.clone();
        bad[0] ^= 1;
        assert!(aes128_ccm_open(&key, &nonce, aad, &bad).is_err());
    }

    #[test]
    fn rfc5915_layout() {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let der = secret_key_to_rfc5915(&key).unwrap();
        assert_eq!(der[0], 0x30);
        let restored = p256::SecretKey::from_sec1_der(&der).unwrap();
        assert_eq!(restored.to_bytes(), key.to_bytes());
    }
}
