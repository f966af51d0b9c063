//! Fabric identity: the trust domain a commissioned device joins.

use anyhow::Result;

use crate::util::cryptoutil;

pub struct Fabric {
    pub id: u64,
    /// 16-byte identity-protection epoch key shared across the fabric.
    pub ipk_epoch_key: Vec<u8>,
    ca_public_key: Vec<u8>,
}

impl Fabric {
    pub fn new(id: u64, ca_public_key: &[u8], ipk_epoch_key: &[u8]) -> Self {
        Self {
            id,
            ipk_epoch_key: ipk_epoch_key.to_vec(),
            ca_public_key: ca_public_key.to_vec(),
        }
    }

    pub fn ca_public_key(&self) -> &[u8] {
        &self.ca_public_key
    }

    /// Compressed fabric identifier, HKDF over the root public key with
    /// the fabric id as salt.
    pub fn compressed_id(&self) -> Result<Vec<u8>> {
        cryptoutil::hkdf_sha256(
            &self.id.to_be_bytes(),
            &self.ca_public_key[1..],
            b"CompressedFabric",
            8,
        )
    }

    /// Operational identity-protection key, the epoch key bound to this
    /// fabric's compressed id.
    pub fn operational_ipk(&self) -> Result<Vec<u8>> {
        cryptoutil::hkdf_sha256(
            &self.compressed_id()?,
            &self.ipk_epoch_key,
            b"GroupKey v1.0",
            16,
        )
    }
}
