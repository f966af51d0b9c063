//! Minting of Matter-compatible X.509 certificates.
//!
//! Issues CA and node operational certificates whose subject carries the
//! Matter DN attributes (node id, CA id, fabric id) that the compact
//! certificate form transports.

use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::util::asn1;
use crate::util::cryptoutil;

const OID_MATTER_NODE_ID: &str = "1.3.6.1.4.1.37244.1.1";
const OID_MATTER_CA_ID: &str = "1.3.6.1.4.1.37244.1.4";
const OID_MATTER_FABRIC_ID: &str = "1.3.6.1.4.1.37244.1.5";

const OID_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_PRIME256V1: &str = "1.2.840.10045.3.1.7";

pub(crate) const OID_CE_SUBJECT_KEY_ID: &str = "2.5.29.14";
pub(crate) const OID_CE_KEY_USAGE: &str = "2.5.29.15";
pub(crate) const OID_CE_BASIC_CONSTRAINTS: &str = "2.5.29.19";
pub(crate) const OID_CE_AUTHORITY_KEY_ID: &str = "2.5.29.35";
pub(crate) const OID_CE_EXT_KEY_USAGE: &str = "2.5.29.37";

const VALIDITY: Duration = Duration::from_secs(60 * 60 * 24 * 100);

/// Matter DN values are hex strings, zero-padded to 16 digits.
fn matter_dn_value(id: u64) -> String {
    format!("{:0>16X}", id)
}

fn utc_time(st: SystemTime) -> Result<String> {
    let der_time = x509_cert::der::asn1::UtcTime::from_system_time(st)?;
    let mut raw = Vec::new();
    x509_cert::der::EncodeValue::encode_value(&der_time, &mut raw)?;
    Ok(std::str::from_utf8(&raw)?.to_owned())
}

fn rdn(enc: &mut asn1::Encoder, oid: &str, id: u64) -> Result<()> {
    enc.begin(0x31)?; // RelativeDistinguishedName SET
    enc.begin(0x30)?; // AttributeTypeAndValue
    enc.oid(oid)?;
    enc.utf8_string(&matter_dn_value(id))?;
    enc.end();
    enc.end();
    Ok(())
}

fn extension(enc: &mut asn1::Encoder, oid: &str, critical: bool, value: &[u8]) -> Result<()> {
    enc.begin(0x30)?;
    enc.oid(oid)?;
    if critical {
        enc.boolean(true)?;
    }
    enc.octet_string(value)?;
    enc.end();
    Ok(())
}

/// Encode and sign an X.509 certificate for `subject_public_key`. With
/// `ca` set the certificate is self-issued with CA constraints; otherwise
/// it is a node operational certificate under `ca_id`.
pub fn encode_x509(
    subject_public_key: &[u8],
    node_id: u64,
    fabric_id: u64,
    ca_id: u64,
    ca_private: &p256::SecretKey,
    ca: bool,
) -> Result<Vec<u8>> {
    let mut enc = asn1::Encoder::new();
    enc.begin(0x30)?; // Certificate
    enc.begin(0x30)?; // TBSCertificate

    enc.begin(0xa0)?; // [0] version v3
    enc.int(2)?;
    enc.end();
    enc.int(10001)?; // serial

    enc.begin(0x30)?;
    enc.oid(OID_ECDSA_WITH_SHA256)?;
    enc.end();

    enc.begin(0x30)?; // issuer
    rdn(&mut enc, OID_MATTER_CA_ID, ca_id)?;
    enc.end();

    let not_before = SystemTime::now();
    let not_after = not_before
        .checked_add(VALIDITY)
        .context("validity overflow")?;
    enc.begin(0x30)?;
    enc.tagged_string(0x17, &utc_time(not_before)?)?;
    enc.tagged_string(0x17, &utc_time(not_after)?)?;
    enc.end();

    enc.begin(0x30)?; // subject
    if ca {
        rdn(&mut enc, OID_MATTER_CA_ID, node_id)?;
    } else {
        rdn(&mut enc, OID_MATTER_NODE_ID, node_id)?;
        rdn(&mut enc, OID_MATTER_FABRIC_ID, fabric_id)?;
    }
    enc.end();

    enc.begin(0x30)?; // SubjectPublicKeyInfo
    enc.begin(0x30)?;
    enc.oid(OID_EC_PUBLIC_KEY)?;
    enc.oid(OID_PRIME256V1)?;
    enc.end();
    let mut spk = vec![0u8]; // no unused bits
    spk.extend_from_slice(subject_public_key);
    enc.tagged_octet_string(0x03, &spk)?;
    enc.end();

    let subject_key_id = {
        let mut e = asn1::Encoder::new();
        e.octet_string(&cryptoutil::sha1(subject_public_key))?;
        e.finish()
    };
    let authority_key_id = {
        let mut e = asn1::Encoder::new();
        e.begin(0x30)?;
        let ca_pub = ca_private.public_key().to_sec1_bytes();
        e.tagged_octet_string(0x80, &cryptoutil::sha1(&ca_pub))?;
        e.finish()
    };

    enc.begin(0xa3)?; // [3] extensions
    enc.begin(0x30)?;
    if ca {
        extension(
            &mut enc,
            OID_CE_BASIC_CONSTRAINTS,
            true,
            &[0x30, 0x03, 0x01, 0x01, 0xff],
        )?;
        extension(&mut enc, OID_CE_KEY_USAGE, true, &[0x03, 0x02, 0x01, 0x06])?;
    } else {
        extension(&mut enc, OID_CE_BASIC_CONSTRAINTS, true, &[0x30, 0x00])?;
        extension(&mut enc, OID_CE_KEY_USAGE, true, &[0x03, 0x02, 0x07, 0x80])?;
        let eku = {
            let mut e = asn1::Encoder::new();
            e.begin(0x30)?;
            e.oid("1.3.6.1.5.5.7.3.2")?; // client auth
            e.oid("1.3.6.1.5.5.7.3.1")?; // server auth
            e.finish()
        };
        extension(&mut enc, OID_CE_EXT_KEY_USAGE, true, &eku)?;
    }
    extension(&mut enc, OID_CE_SUBJECT_KEY_ID, false, &subject_key_id)?;
    extension(&mut enc, OID_CE_AUTHORITY_KEY_ID, false, &authority_key_id)?;
    enc.end();
    enc.end();

    enc.end(); // TBSCertificate

    // sign over the TBS bytes; the outer header is the 4-byte long form
    let tbs_view = enc.clone();
    let tbs_bytes = tbs_view.finish();
    let signer = ecdsa::SigningKey::from(ca_private);
    let signature = signer.sign_recoverable(&tbs_bytes[4..])?.0;

    enc.begin(0x30)?;
    enc.oid(OID_ECDSA_WITH_SHA256)?;
    enc.end();
    let mut sig_bits = vec![0u8];
    sig_bits.extend_from_slice(signature.to_der().as_bytes());
    enc.tagged_octet_string(0x03, &sig_bits)?;

    Ok(enc.finish())
}
