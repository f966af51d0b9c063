//! Commissioning orchestrator: brings a factory-fresh device onto the
//! fabric.
//!
//! Sequence: PASE over the onboarding passcode, CSR request, trust-root
//! and NOC installation through the Operational Credentials cluster,
//! CASE with the freshly minted certificate, CommissioningComplete. Any
//! failure closes the channel (close-session status report) before the
//! error is returned.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::cert_matter;
use crate::certstore::CertStore;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::messages::{self, Message};
use crate::pase;
use crate::secure_channel::SecureChannel;
use crate::sigma;
use crate::tlv::{TlvReader, TlvWriter};

/// UDP port a commissionable device listens on.
pub const DEVICE_PORT: u16 = 5540;
pub const DEFAULT_LOCAL_PORT: u16 = 55555;

const CLUSTER_OPERATIONAL_CREDENTIALS: u32 = 0x3e;
const CMD_CSR_REQUEST: u32 = 0x04;
const CMD_ADD_NOC: u32 = 0x06;
const CMD_ADD_TRUSTED_ROOT: u32 = 0x0b;

const CLUSTER_GENERAL_COMMISSIONING: u32 = 0x30;
const CMD_COMMISSIONING_COMPLETE: u32 = 0x04;

const ADMIN_VENDOR_ID: u16 = 101;

/// Response path of a command's first data field.
const PATH_COMMAND_FIELD: [u8; 5] = [1, 0, 0, 1, 0];
/// Response path of a command status code.
const PATH_COMMAND_STATUS: [u8; 5] = [1, 0, 1, 1, 0];

fn operational_credentials_status(status: u64) -> &'static str {
    match status {
        0 => "Success",
        1 => "InvalidPublicKey",
        2 => "InvalidNodeOpId",
        3 => "InvalidNOC",
        4 => "MissingCsr",
        5 => "TableFull",
        6 => "InvalidAdminSubject",
        9 => "FabricConflict",
        10 => "LabelConflict",
        11 => "InvalidFabricIndex",
        _ => "UnknownStatus",
    }
}

pub struct Commissioner {
    store: Arc<dyn CertStore>,
    fabric: Fabric,
    local_port: u16,
}

fn local_any(device: SocketAddr, port: u16) -> SocketAddr {
    if device.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }
}

impl Commissioner {
    pub fn new(store: Arc<dyn CertStore>) -> Result<Self> {
        let fabric = Fabric::new(
            store.fabric_id(),
            &store.ca_public_key()?,
            &store.ipk_epoch_key()?,
        );
        Ok(Self {
            store,
            fabric,
            local_port: DEFAULT_LOCAL_PORT,
        })
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Commission the device at `device`: authenticate with the
    /// passcode, install the fabric trust root and a NOC bound to
    /// `device_id`, then re-authenticate with CASE. Returns the
    /// operational channel.
    pub async fn commission(
        &self,
        device: SocketAddr,
        passcode: u32,
        controller_id: u64,
        device_id: u64,
    ) -> Result<SecureChannel> {
        let mut channel =
            SecureChannel::start(local_any(device, self.local_port), device).await?;
        match self
            .run(&mut channel, passcode, controller_id, device_id)
            .await
        {
            Ok(()) => Ok(channel),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    /// CASE-only authentication towards an already commissioned device.
    pub async fn connect(
        &self,
        device: SocketAddr,
        controller_id: u64,
        device_id: u64,
    ) -> Result<SecureChannel> {
        let mut channel =
            SecureChannel::start(local_any(device, self.local_port), device).await?;
        match sigma::establish(
            &mut channel,
            &self.fabric,
            self.store.as_ref(),
            controller_id,
            device_id,
        )
        .await
        {
            Ok(()) => Ok(channel),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        channel: &mut SecureChannel,
        passcode: u32,
        controller_id: u64,
        device_id: u64,
    ) -> Result<()> {
        pase::establish(channel, passcode).await?;

        let csr_der = self.request_csr(channel).await?;
        self.add_trusted_root(channel).await?;
        self.add_noc(channel, &csr_der, controller_id, device_id)
            .await?;

        // the PASE session ends here; CASE builds the operational one
        channel.clear_keys();
        sigma::establish(
            channel,
            &self.fabric,
            self.store.as_ref(),
            controller_id,
            device_id,
        )
        .await?;

        self.commissioning_complete(channel).await?;
        log::info!("commissioning of node {device_id} complete");
        Ok(())
    }

    async fn invoke(
        &self,
        channel: &mut SecureChannel,
        endpoint: u16,
        cluster: u32,
        command: u32,
        fields: &[u8],
    ) -> Result<Message> {
        let exchange_id = OsRng.next_u32() as u16;
        let request =
            messages::im_invoke_request(endpoint, cluster, command, exchange_id, fields, false);
        channel.send(&request).await?;
        let response = channel.receive().await?;
        if let Some(status) = response.status {
            if !status.is_success() {
                return Err(Error::Status(status));
            }
        }
        Ok(response)
    }

    /// CSRRequest with a fresh nonce; the CSR sits inside the returned
    /// NOCSR-elements blob.
    async fn request_csr(&self, channel: &mut SecureChannel) -> Result<Vec<u8>> {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let mut fields = TlvWriter::new();
        fields.octets(0, &nonce);
        let response = self
            .invoke(
                channel,
                0,
                CLUSTER_OPERATIONAL_CREDENTIALS,
                CMD_CSR_REQUEST,
                fields.data(),
            )
            .await?;
        let tlv = response.tlv.ok_or(Error::MissingField("csr response body"))?;
        let elements = tlv
            .octets_at(&PATH_COMMAND_FIELD)
            .ok_or(Error::MissingField("nocsr elements"))?;
        let mut reader = TlvReader::new(elements);
        reader.expect(0x15)?;
        Ok(reader.read_octets(1)?)
    }

    async fn add_trusted_root(&self, channel: &mut SecureChannel) -> Result<()> {
        let root = cert_matter::compact_from_der(
            &self.store.ca_cert()?,
            self.fabric.ca_public_key(),
        )?;
        let mut fields = TlvWriter::new();
        fields.octets(0, &root);
        let response = self
            .invoke(
                channel,
                0,
                CLUSTER_OPERATIONAL_CREDENTIALS,
                CMD_ADD_TRUSTED_ROOT,
                fields.data(),
            )
            .await?;
        let tlv = response
            .tlv
            .ok_or(Error::MissingField("add trusted root response"))?;
        let status = tlv
            .unsigned_at(&PATH_COMMAND_STATUS)
            .ok_or(Error::MissingField("add trusted root status"))?;
        if status != 0 {
            return Err(
                anyhow::anyhow!("AddTrustedRootCertificate failed with status {status}").into(),
            );
        }
        Ok(())
    }

    /// Mint the NOC from the device CSR and install it together with the
    /// IPK and the admin subject.
    async fn add_noc(
        &self,
        channel: &mut SecureChannel,
        csr_der: &[u8],
        controller_id: u64,
        device_id: u64,
    ) -> Result<()> {
        let noc_x509 = self.store.sign_csr(csr_der, device_id)?;
        let noc = cert_matter::compact_from_der(&noc_x509, self.fabric.ca_public_key())?;
        let mut fields = TlvWriter::new();
        fields.octets(0, &noc);
        fields.octets(2, &self.fabric.ipk_epoch_key);
        fields.uint64(3, controller_id); // admin subject
        fields.uint16(4, ADMIN_VENDOR_ID);
        let response = self
            .invoke(
                channel,
                0,
                CLUSTER_OPERATIONAL_CREDENTIALS,
                CMD_ADD_NOC,
                fields.data(),
            )
            .await?;
        let tlv = response.tlv.ok_or(Error::MissingField("add noc response"))?;
        let status = tlv
            .unsigned_at(&PATH_COMMAND_FIELD)
            .ok_or(Error::MissingField("add noc status"))?;
        if status != 0 {
            return Err(anyhow::anyhow!(
                "AddNOC failed with status {status} ({})",
                operational_credentials_status(status)
            )
            .into());
        }
        Ok(())
    }

    async fn commissioning_complete(&self, channel: &mut SecureChannel) -> Result<()> {
        let response = self
            .invoke(
                channel,
                0,
                CLUSTER_GENERAL_COMMISSIONING,
                CMD_COMMISSIONING_COMPLETE,
                &[],
            )
            .await?;
        let tlv = response
            .tlv
            .ok_or(Error::MissingField("commissioning complete response"))?;
        let code = tlv
            .unsigned_at(&PATH_COMMAND_FIELD)
            .ok_or(Error::MissingField("commissioning complete result"))?;
        if code != 0 {
            return Err(anyhow::anyhow!("CommissioningComplete returned error code {code}").into());
        }
        Ok(())
    }
}
