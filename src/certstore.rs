//! Certificate store boundary.
//!
//! The commissioning core treats credentials as an opaque collaborator:
//! anything that can hand out the CA certificate, per-node keys and
//! certificates, the fabric IPK and sign CSRs satisfies [`CertStore`].
//! [`FileCertStore`] is the default PEM-directory implementation.

use std::sync::Arc;

use anyhow::{Context, Result};
use x509_cert::der::Decode;

use crate::cert_x509;
use crate::util::cryptoutil;

/// Node id the certificate authority certifies itself under.
pub const CA_NODE_ID: u64 = 1;

pub trait CertStore: Send + Sync {
    /// CA certificate, DER.
    fn ca_cert(&self) -> Result<Vec<u8>>;
    /// CA public key, uncompressed SEC1.
    fn ca_public_key(&self) -> Result<Vec<u8>>;
    /// Certificate of a controller node, DER.
    fn node_cert(&self, id: u64) -> Result<Vec<u8>>;
    /// Private key of a controller node.
    fn node_key(&self, id: u64) -> Result<p256::SecretKey>;
    /// 16-byte identity-protection epoch key of the fabric.
    fn ipk_epoch_key(&self) -> Result<Vec<u8>>;
    fn fabric_id(&self) -> u64;
    /// Sign the public key of a CSR into a node operational certificate
    /// bound to `node_id`, returned as DER.
    fn sign_csr(&self, csr_der: &[u8], node_id: u64) -> Result<Vec<u8>>;
}

/// PEM-directory store: `ca-private.pem`, `ca-cert.pem`,
/// `<id>-private.pem`, `<id>-cert.pem` and a `fabric` metadata file.
pub struct FileCertStore {
    fabric_id: u64,
    path: String,
}

impl FileCertStore {
    pub fn new(fabric_id: u64, path: &str) -> Arc<Self> {
        Arc::new(Self {
            fabric_id,
            path: path.to_owned(),
        })
    }

    /// Open an existing store directory.
    pub fn load(path: &str) -> Result<Arc<Self>> {
        let fname = format!("{path}/fabric");
        let raw = std::fs::read_to_string(&fname).context(format!("can't read {fname}"))?;
        Ok(Arc::new(Self {
            fabric_id: raw.trim().parse::<u64>()?,
            path: path.to_owned(),
        }))
    }

    fn ca_key_fname(&self) -> String {
        format!("{}/ca-private.pem", self.path)
    }
    fn ca_cert_fname(&self) -> String {
        format!("{}/ca-cert.pem", self.path)
    }
    fn node_key_fname(&self, id: u64) -> String {
        format!("{}/{}-private.pem", self.path, id)
    }
    fn node_cert_fname(&self, id: u64) -> String {
        format!("{}/{}-cert.pem", self.path, id)
    }

    fn ca_key(&self) -> Result<p256::SecretKey> {
        cryptoutil::read_secret_key_pem(&self.ca_key_fname())
    }

    /// Create the directory, generate the CA key and self-issued CA
    /// certificate. Fails if the directory already exists.
    pub fn bootstrap(&self) -> Result<()> {
        std::fs::create_dir(&self.path)?;
        let ca_key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        cryptoutil::write_pem(
            "EC PRIVATE KEY",
            &cryptoutil::secret_key_to_rfc5915(&ca_key)?,
            &self.ca_key_fname(),
        )?;
        let ca_pub = ca_key.public_key().to_sec1_bytes();
        let ca_cert = cert_x509::encode_x509(
            &ca_pub,
            CA_NODE_ID,
            self.fabric_id,
            CA_NODE_ID,
            &ca_key,
            true,
        )?;
        cryptoutil::write_pem("CERTIFICATE", &ca_cert, &self.ca_cert_fname())?;
        std::fs::write(format!("{}/fabric", self.path), format!("{}", self.fabric_id))?;
        Ok(())
    }

    /// Generate key and certificate for a controller node.
    pub fn create_controller(&self, id: u64) -> Result<()> {
        let ca_key = self.ca_key()?;
        let node_key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        cryptoutil::write_pem(
            "EC PRIVATE KEY",
            &cryptoutil::secret_key_to_rfc5915(&node_key)?,
            &self.node_key_fname(id),
        )?;
        let node_pub = node_key.public_key().to_sec1_bytes();
        let cert = cert_x509::encode_x509(
            &node_pub,
            id,
            self.fabric_id,
            CA_NODE_ID,
            &ca_key,
            false,
        )?;
        cryptoutil::write_pem("CERTIFICATE", &cert, &self.node_cert_fname(id))?;
        Ok(())
    }
}

impl CertStore for FileCertStore {
    fn ca_cert(&self) -> Result<Vec<u8>> {
        cryptoutil::read_pem_payload(&self.ca_cert_fname())
    }

    fn ca_public_key(&self) -> Result<Vec<u8>> {
        Ok(self.ca_key()?.public_key().to_sec1_bytes().to_vec())
    }

    fn node_cert(&self, id: u64) -> Result<Vec<u8>> {
        cryptoutil::read_pem_payload(&self.node_cert_fname(id))
    }

    fn node_key(&self, id: u64) -> Result<p256::SecretKey> {
        cryptoutil::read_secret_key_pem(&self.node_key_fname(id))
    }

    fn ipk_epoch_key(&self) -> Result<Vec<u8>> {
        Ok(vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xa, 0xb, 0xc, 0xd, 0xe, 0xf])
    }

    fn fabric_id(&self) -> u64 {
        self.fabric_id
    }

    fn sign_csr(&self, csr_der: &[u8], node_id: u64) -> Result<Vec<u8>> {
        let csr = x509_cert::request::CertReq::from_der(csr_der)?;
        let public_key = csr
            .info
            .public_key
            .subject_public_key
            .as_bytes()
            .context("csr carries no public key")?;
        cert_x509::encode_x509(
            public_key,
            node_id,
            self.fabric_id,
            CA_NODE_ID,
            &self.ca_key()?,
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> String {
        let dir = std::env::temp_dir().join(format!(
            "matcom-{}-{}",
            tag,
            rand::random::<u32>()
        ));
        dir.to_str().unwrap().to_owned()
    }

    #[test]
    fn bootstrap_load_and_issue() {
        let path = scratch_dir("store");
        let store = FileCertStore::new(0x2000, &path);
        store.bootstrap().unwrap();
        store.create_controller(100).unwrap();

        let reloaded = FileCertStore::load(&path).unwrap();
        assert_eq!(reloaded.fabric_id(), 0x2000);
        assert!(!reloaded.ca_cert().unwrap().is_empty());
        assert!(!reloaded.node_cert(100).unwrap().is_empty());
        assert_eq!(reloaded.ipk_epoch_key().unwrap().len(), 16);

        // key and certificate agree on the public key
        let cert = x509_cert::Certificate::from_der(&reloaded.node_cert(100).unwrap()).unwrap();
        let from_cert = cert
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .as_bytes()
            .unwrap()
            .to_vec();
        let from_key = reloaded
            .node_key(100)
            .unwrap()
            .public_key()
            .to_sec1_bytes()
            .to_vec();
        assert_eq!(from_cert, from_key);

        std::fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn bootstrap_refuses_existing_directory() {
        let path = scratch_dir("exists");
        std::fs::create_dir(&path).unwrap();
        let store = FileCertStore::new(1, &path);
        assert!(store.bootstrap().is_err());
        std::fs::remove_dir_all(&path).unwrap();
    }
}
