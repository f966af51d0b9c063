//! Conversion of X.509 certificates into the Matter-compact TLV form
//! carried on the wire (AddTrustedRootCertificate, AddNOC, Sigma TBE).

use anyhow::{Context, Result};
use p256::NistP256;
use x509_cert::{certificate::CertificateInner, der::Decode};

use crate::tlv::TlvWriter;
use crate::util::cryptoutil;

/// Tag the compact form stores the subject public key under.
pub const TAG_PUBLIC_KEY: u8 = 9;

/// Matter epoch (2000-01-01) as a unix timestamp.
const MATTER_EPOCH: u64 = 946_684_800;

fn dn_value(any: &x509_cert::der::Any) -> Result<u64> {
    let text = any.decode_as::<String>()?;
    Ok(u64::from_str_radix(&text, 16)?)
}

/// Write the Matter DN attributes of an RDN sequence: node id (tag 17),
/// CA id (tag 20), fabric id (tag 21).
fn dn_attributes(dn: &x509_cert::name::RdnSequence, w: &mut TlvWriter) -> Result<()> {
    for rdn in &dn.0 {
        for atv in rdn.0.as_slice() {
            match atv.oid.to_string().as_str() {
                "1.3.6.1.4.1.37244.1.1" => w.uint64(17, dn_value(&atv.value)?),
                "1.3.6.1.4.1.37244.1.4" => w.uint64(20, dn_value(&atv.value)?),
                "1.3.6.1.4.1.37244.1.5" => w.uint64(21, dn_value(&atv.value)?),
                _ => {}
            }
        }
    }
    Ok(())
}

fn extension_value(tbs: &x509_cert::TbsCertificate, oid: &str) -> Result<Vec<u8>> {
    let extensions = tbs.extensions.as_ref().context("certificate has no extensions")?;
    extensions
        .iter()
        .find(|e| e.extn_id.to_string() == oid)
        .map(|e| e.extn_value.as_bytes().to_vec())
        .with_context(|| format!("extension {oid} not present"))
}

/// Convert a DER certificate to the compact form. `ca_public_key` is the
/// issuer's SEC1 public key, hashed into the authority key identifier.
pub fn compact_from_der(der: &[u8], ca_public_key: &[u8]) -> Result<Vec<u8>> {
    let cert = x509_cert::Certificate::from_der(der)?;
    compact_from_cert(&cert, ca_public_key)
}

fn compact_from_cert(cert: &CertificateInner, ca_public_key: &[u8]) -> Result<Vec<u8>> {
    let tbs = &cert.tbs_certificate;
    let mut w = TlvWriter::new();
    w.begin_struct();
    w.octets(1, tbs.serial_number.as_bytes());
    w.uint8(2, 1); // signature algorithm: ecdsa-with-sha256

    w.begin_list(3); // issuer
    dn_attributes(&tbs.issuer, &mut w)?;
    w.end_container();

    let not_before = tbs.validity.not_before.to_unix_duration().as_secs();
    let not_after = tbs.validity.not_after.to_unix_duration().as_secs();
    w.uint32(4, (not_before - MATTER_EPOCH) as u32);
    w.uint32(5, (not_after - MATTER_EPOCH) as u32);

    w.begin_list(6); // subject
    dn_attributes(&tbs.subject, &mut w)?;
    w.end_container();

    w.uint8(7, 1); // public key algorithm: ec
    w.uint8(8, 1); // curve: prime256v1

    let public_key = tbs
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .context("subject public key unavailable")?;
    w.octets(TAG_PUBLIC_KEY, public_key);

    w.begin_list(10); // extensions
    w.begin_struct_tagged(1); // basic constraints
    let is_ca = extension_value(tbs, crate::cert_x509::OID_CE_BASIC_CONSTRAINTS)
        .map(|v| v.last() == Some(&0xff))
        .unwrap_or(false);
    w.boolean(1, is_ca);
    w.end_container();

    let key_usage = extension_value(tbs, crate::cert_x509::OID_CE_KEY_USAGE)?;
    let key_usage = x509_cert::ext::pkix::KeyUsage::from_der(&key_usage)?;
    w.uint8(2, key_usage.0.bits() as u8);

    if let Ok(eku) = extension_value(tbs, crate::cert_x509::OID_CE_EXT_KEY_USAGE) {
        w.begin_array(3);
        for purpose in x509_cert::ext::pkix::ExtendedKeyUsage::from_der(&eku)?.0 {
            match purpose.to_string().as_str() {
                "1.3.6.1.5.5.7.3.1" => w.uint8_anon(1), // server auth
                "1.3.6.1.5.5.7.3.2" => w.uint8_anon(2), // client auth
                other => anyhow::bail!("unsupported extended key usage {other}"),
            }
        }
        w.end_container();
    }

    let subject_key_id = extension_value(tbs, crate::cert_x509::OID_CE_SUBJECT_KEY_ID)?;
    // strip the OCTET STRING header of the extension payload
    w.octets(4, &subject_key_id[2..]);
    w.octets(5, &cryptoutil::sha1(ca_public_key));
    w.end_container();

    let signature = cert
        .signature
        .as_bytes()
        .context("certificate signature unavailable")?;
    let signature = ecdsa::Signature::<NistP256>::from_der(signature)?;
    w.octets(11, signature.to_bytes().as_slice());

    w.end_container();
    Ok(w.into_vec())
}
