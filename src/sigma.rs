//! Certificate-authenticated session establishment (CASE), the Sigma
//! three-flight handshake.
//!
//! The initiator proves possession of its node operational certificate,
//! verifies the responder's Sigma2 signature against the public key in
//! the responder NOC, and derives the operational session keys from the
//! running transcript.

use ecdsa::signature::Verifier;
use p256::ecdh::EphemeralSecret;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cert_matter;
use crate::certstore::CertStore;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::messages::{self, Message, ProtocolHeader};
use crate::secure_channel::SecureChannel;
use crate::tlv::{self, TlvWriter};
use crate::util::cryptoutil;

const S2K_INFO: &[u8] = b"Sigma2";
const S3K_INFO: &[u8] = b"Sigma3";
const SESSION_KEYS_INFO: &[u8] = b"SessionKeys";
const TBE2_NONCE: &[u8] = b"NCASE_Sigma2N";
const TBE3_NONCE: &[u8] = b"NCASE_Sigma3N";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitSigma2,
    AwaitStatus,
    Done,
}

pub enum CaseStep {
    Send(Vec<u8>),
    Established(OperationalSession),
}

pub struct OperationalSession {
    pub peer_session_id: u16,
    pub local_session_id: u16,
    pub i2r_key: Vec<u8>,
    pub r2i_key: Vec<u8>,
    pub attestation_challenge: Vec<u8>,
}

pub struct CaseInitiator {
    state: State,
    exchange_id: u16,
    local_session_id: u16,
    operational_ipk: Vec<u8>,
    controller_key: p256::SecretKey,
    /// Controller NOC in Matter-compact form.
    controller_noc: Vec<u8>,
    eph_secret: EphemeralSecret,
    eph_public: Vec<u8>,
    /// Transcript pieces, owned copies of the raw payload bytes.
    sigma1_payload: Vec<u8>,
    sigma2_payload: Vec<u8>,
    sigma3_payload: Vec<u8>,
    responder_session: u16,
    shared: Option<p256::ecdh::SharedSecret>,
}

fn guard_opcode(msg: &Message, expected: u8) -> Result<()> {
    if let Some(status) = msg.status {
        if !status.is_success() {
            return Err(Error::Status(status));
        }
    }
    if msg.protocol_header.protocol_id != ProtocolHeader::PROTOCOL_ID_SECURE_CHANNEL
        || msg.protocol_header.opcode != expected
    {
        return Err(Error::UnexpectedOpcode {
            expected,
            got: msg.protocol_header.opcode,
        });
    }
    Ok(())
}

/// Blinded destination identifier: HMAC over the Sigma1 random, the root
/// public key and the fabric/node ids, keyed by the operational IPK.
fn destination_id(
    operational_ipk: &[u8],
    initiator_random: &[u8],
    ca_public_key: &[u8],
    fabric_id: u64,
    device_id: u64,
) -> Result<Vec<u8>> {
    let mut message = Vec::with_capacity(32 + 65 + 16);
    message.extend_from_slice(initiator_random);
    message.extend_from_slice(ca_public_key);
    message.extend_from_slice(&fabric_id.to_le_bytes());
    message.extend_from_slice(&device_id.to_le_bytes());
    Ok(cryptoutil::hmac_sha256(operational_ipk, &message)?)
}

impl CaseInitiator {
    pub fn new(
        fabric: &Fabric,
        device_id: u64,
        controller_key: p256::SecretKey,
        controller_noc: Vec<u8>,
    ) -> Result<Self> {
        let mut initiator_random = [0u8; 32];
        OsRng.fill_bytes(&mut initiator_random);
        let local_session_id = OsRng.next_u32() as u16;
        let operational_ipk = fabric.operational_ipk()?;

        let eph_secret = EphemeralSecret::random(&mut OsRng);
        let eph_public = eph_secret.public_key().to_sec1_bytes().to_vec();

        let destination = destination_id(
            &operational_ipk,
            &initiator_random,
            fabric.ca_public_key(),
            fabric.id,
            device_id,
        )?;

        let mut w = TlvWriter::new();
        w.begin_struct();
        w.octets(1, &initiator_random);
        w.uint16(2, local_session_id);
        w.octets(3, &destination);
        w.octets(4, &eph_public);
        w.end_container();

        Ok(Self {
            state: State::AwaitSigma2,
            exchange_id: OsRng.next_u32() as u16,
            local_session_id,
            operational_ipk,
            controller_key,
            controller_noc,
            eph_secret,
            eph_public,
            sigma1_payload: w.into_vec(),
            sigma2_payload: Vec::new(),
            sigma3_payload: Vec::new(),
            responder_session: 0,
            shared: None,
        })
    }

    pub fn initial_message(&self) -> Vec<u8> {
        messages::secure_channel_message(
            ProtocolHeader::OPCODE_SIGMA1,
            self.exchange_id,
            &self.sigma1_payload,
            None,
        )
    }

    pub fn handle(&mut self, msg: &Message) -> Result<CaseStep> {
        match self.state {
            State::AwaitSigma2 => self.on_sigma2(msg),
            State::AwaitStatus => self.on_status(msg),
            State::Done => Err(Error::UnexpectedOpcode {
                expected: 0,
                got: msg.protocol_header.opcode,
            }),
        }
    }

    fn on_sigma2(&mut self, msg: &Message) -> Result<CaseStep> {
        guard_opcode(msg, ProtocolHeader::OPCODE_SIGMA2)?;
        let body = msg.tlv.as_ref().ok_or(Error::MissingField("sigma2 body"))?;
        let responder_random = body
            .octets_at(&[1])
            .ok_or(Error::MissingField("sigma2 responder random"))?;
        self.responder_session = body
            .unsigned_at(&[2])
            .ok_or(Error::MissingField("sigma2 responder session"))? as u16;
        let responder_public = body
            .octets_at(&[3])
            .ok_or(Error::MissingField("sigma2 responder ephemeral key"))?
            .to_vec();
        let encrypted2 = body
            .octets_at(&[4])
            .ok_or(Error::MissingField("sigma2 encrypted payload"))?;

        let public = p256::PublicKey::from_sec1_bytes(&responder_public)
            .map_err(|_| Error::PointNotOnCurve)?;
        let shared = self.eph_secret.diffie_hellman(&public);

        // S2K binds the IPK, the responder's values and the Sigma1 hash
        let mut salt = self.operational_ipk.clone();
        salt.extend_from_slice(responder_random);
        salt.extend_from_slice(&responder_public);
        salt.extend_from_slice(&cryptoutil::sha256(&self.sigma1_payload));
        let s2k = cryptoutil::hkdf_sha256(
            &salt,
            shared.raw_secret_bytes().as_slice(),
            S2K_INFO,
            16,
        )?;
        let tbe2 = cryptoutil::aes128_ccm_open(
            &cryptoutil::aead_key(&s2k),
            TBE2_NONCE,
            &[],
            encrypted2,
        )?;

        let tbe = tlv::decode(&tbe2)?;
        let responder_noc = tbe
            .octets_at(&[1])
            .ok_or(Error::MissingField("sigma2 responder noc"))?;
        let signature = tbe
            .octets_at(&[3])
            .ok_or(Error::MissingField("sigma2 signature"))?;
        self.verify_responder(responder_noc, &responder_public, signature)?;

        self.sigma2_payload = msg.payload.clone();
        let sigma3 = self.build_sigma3(&responder_public, &shared)?;
        self.shared = Some(shared);
        self.state = State::AwaitStatus;
        log::debug!("case: sigma2 verified, sending sigma3");
        Ok(CaseStep::Send(sigma3))
    }

    /// Check the Sigma2 signature against the public key carried in the
    /// responder's NOC. Chain validation to the trust root is the
    /// caller's concern, outside this handshake.
    fn verify_responder(
        &self,
        responder_noc: &[u8],
        responder_public: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let noc = tlv::decode(responder_noc)?;
        let noc_public = noc
            .octets_at(&[cert_matter::TAG_PUBLIC_KEY])
            .ok_or(Error::MissingField("responder noc public key"))?;

        let mut w = TlvWriter::new();
        w.begin_struct();
        w.octets(1, responder_noc);
        w.octets(3, responder_public);
        w.octets(4, &self.eph_public);
        w.end_container();

        let key = ecdsa::VerifyingKey::<p256::NistP256>::from_sec1_bytes(noc_public)
            .map_err(|_| Error::SignatureRejected)?;
        let signature = ecdsa::Signature::<p256::NistP256>::from_slice(signature)
            .map_err(|_| Error::SignatureRejected)?;
        key.verify(w.data(), &signature)
            .map_err(|_| Error::SignatureRejected)
    }

    fn build_sigma3(
        &mut self,
        responder_public: &[u8],
        shared: &p256::ecdh::SharedSecret,
    ) -> Result<Vec<u8>> {
        let mut tbs = TlvWriter::new();
        tbs.begin_struct();
        tbs.octets(1, &self.controller_noc);
        tbs.octets(3, &self.eph_public);
        tbs.octets(4, responder_public);
        tbs.end_container();
        let signer = ecdsa::SigningKey::from(self.controller_key.clone());
        let signature = signer
            .sign_recoverable(tbs.data())
            .map_err(anyhow::Error::from)?
            .0;

        let mut tbe = TlvWriter::new();
        tbe.begin_struct();
        tbe.octets(1, &self.controller_noc);
        tbe.octets(3, signature.to_bytes().as_slice());
        tbe.end_container();

        let mut transcript = self.sigma1_payload.clone();
        transcript.extend_from_slice(&self.sigma2_payload);
        let mut salt = self.operational_ipk.clone();
        salt.extend_from_slice(&cryptoutil::sha256(&transcript));
        let s3k = cryptoutil::hkdf_sha256(
            &salt,
            shared.raw_secret_bytes().as_slice(),
            S3K_INFO,
            16,
        )?;
        let encrypted3 = cryptoutil::aes128_ccm_seal(
            &cryptoutil::aead_key(&s3k),
            TBE3_NONCE,
            &[],
            tbe.data(),
        )?;

        let mut payload = TlvWriter::new();
        payload.begin_struct();
        payload.octets(1, &encrypted3);
        payload.end_container();
        self.sigma3_payload = payload.into_vec();
        Ok(messages::secure_channel_message(
            ProtocolHeader::OPCODE_SIGMA3,
            self.exchange_id,
            &self.sigma3_payload,
            None,
        ))
    }

    fn on_status(&mut self, msg: &Message) -> Result<CaseStep> {
        let status = match msg.status {
            Some(s) => s,
            None => {
                return Err(Error::UnexpectedOpcode {
                    expected: ProtocolHeader::OPCODE_STATUS,
                    got: msg.protocol_header.opcode,
                })
            }
        };
        if !status.is_success() {
            return Err(Error::Status(status));
        }
        let session = self.derive_session_keys()?;
        self.state = State::Done;
        Ok(CaseStep::Established(session))
    }

    /// I2R, R2I and the attestation challenge from the full transcript.
    fn derive_session_keys(&self) -> Result<OperationalSession> {
        let shared = self
            .shared
            .as_ref()
            .ok_or(Error::MissingField("ecdh shared secret"))?;
        let mut transcript = self.sigma1_payload.clone();
        transcript.extend_from_slice(&self.sigma2_payload);
        transcript.extend_from_slice(&self.sigma3_payload);
        let mut salt = self.operational_ipk.clone();
        salt.extend_from_slice(&cryptoutil::sha256(&transcript));
        let keypack = cryptoutil::hkdf_sha256(
            &salt,
            shared.raw_secret_bytes().as_slice(),
            SESSION_KEYS_INFO,
            16 * 3,
        )?;
        Ok(OperationalSession {
            peer_session_id: self.responder_session,
            local_session_id: self.local_session_id,
            i2r_key: keypack[..16].to_vec(),
            r2i_key: keypack[16..32].to_vec(),
            attestation_challenge: keypack[32..].to_vec(),
        })
    }
}

/// Run CASE on a plaintext channel. On success the operational keys,
/// session id and both node identifiers are installed on the channel.
pub async fn establish(
    channel: &mut SecureChannel,
    fabric: &Fabric,
    store: &dyn CertStore,
    controller_id: u64,
    device_id: u64,
) -> Result<()> {
    let controller_key = store.node_key(controller_id)?;
    let controller_x509 = store.node_cert(controller_id)?;
    let controller_noc =
        cert_matter::compact_from_der(&controller_x509, fabric.ca_public_key())?;
    let mut initiator = CaseInitiator::new(fabric, device_id, controller_key, controller_noc)?;
    log::debug!("case: sending sigma1");
    channel.send(&initiator.initial_message()).await?;
    loop {
        let msg = channel.receive().await?;
        match initiator.handle(&msg)? {
            CaseStep::Send(out) => channel.send(&out).await?,
            CaseStep::Established(session) => {
                channel.install_keys(
                    &session.i2r_key,
                    &session.r2i_key,
                    session.peer_session_id,
                    session.local_session_id,
                );
                channel.set_nodes(controller_id, device_id);
                log::debug!(
                    "case established, peer session {}",
                    session.peer_session_id
                );
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_x509;
    use crate::messages::{MessageHeader, StatusReport};

    const FABRIC_ID: u64 = 0x1000;
    const DEVICE_ID: u64 = 300;
    const CONTROLLER_ID: u64 = 100;

    struct TestIdentity {
        fabric: Fabric,
        controller_key: p256::SecretKey,
        controller_noc: Vec<u8>,
        device_key: p256::SecretKey,
        device_noc: Vec<u8>,
    }

    fn identity() -> TestIdentity {
        let ca_key = p256::SecretKey::random(&mut OsRng);
        let ca_pub = ca_key.public_key().to_sec1_bytes();
        let epoch: Vec<u8> = (0..16).collect();
        let fabric = Fabric::new(FABRIC_ID, &ca_pub, &epoch);

        let controller_key = p256::SecretKey::random(&mut OsRng);
        let controller_cert = cert_x509::encode_x509(
            &controller_key.public_key().to_sec1_bytes(),
            CONTROLLER_ID,
            FABRIC_ID,
            1,
            &ca_key,
            false,
        )
        .unwrap();
        let controller_noc = cert_matter::compact_from_der(&controller_cert, &ca_pub).unwrap();

        let device_key = p256::SecretKey::random(&mut OsRng);
        let device_cert = cert_x509::encode_x509(
            &device_key.public_key().to_sec1_bytes(),
            DEVICE_ID,
            FABRIC_ID,
            1,
            &ca_key,
            false,
        )
        .unwrap();
        let device_noc = cert_matter::compact_from_der(&device_cert, &ca_pub).unwrap();

        TestIdentity {
            fabric,
            controller_key,
            controller_noc,
            device_key,
            device_noc,
        }
    }

    fn inbound(opcode: u8, payload: &[u8]) -> Message {
        let header = MessageHeader {
            flags: 0,
            session_id: 0,
            security_flags: 0,
            message_counter: 1,
            source_node_id: None,
            destination_node_id: None,
        };
        let proto = messages::secure_channel_message(opcode, 9, payload, None);
        Message::from_parts(header, &proto).unwrap()
    }

    /// Responder-side Sigma2 for a given Sigma1 payload. Returns the
    /// message payload and the responder's ECDH shared secret.
    fn respond_sigma2(
        id: &TestIdentity,
        sigma1_payload: &[u8],
        responder_session: u16,
        sign_with: &p256::SecretKey,
    ) -> (Vec<u8>, p256::ecdh::SharedSecret) {
        let sigma1 = tlv::decode(sigma1_payload).unwrap();
        let initiator_public = sigma1.octets_at(&[4]).unwrap().to_vec();

        let eph = EphemeralSecret::random(&mut OsRng);
        let eph_public = eph.public_key().to_sec1_bytes().to_vec();
        let shared = eph.diffie_hellman(
            &p256::PublicKey::from_sec1_bytes(&initiator_public).unwrap(),
        );

        let mut responder_random = [0u8; 32];
        OsRng.fill_bytes(&mut responder_random);

        let mut tbs = TlvWriter::new();
        tbs.begin_struct();
        tbs.octets(1, &id.device_noc);
        tbs.octets(3, &eph_public);
        tbs.octets(4, &initiator_public);
        tbs.end_container();
        let signature = ecdsa::SigningKey::from(sign_with.clone())
            .sign_recoverable(tbs.data())
            .unwrap()
            .0;

        let mut tbe = TlvWriter::new();
        tbe.begin_struct();
        tbe.octets(1, &id.device_noc);
        tbe.octets(3, signature.to_bytes().as_slice());
        tbe.end_container();

        let ipk = id.fabric.operational_ipk().unwrap();
        let mut salt = ipk;
        salt.extend_from_slice(&responder_random);
        salt.extend_from_slice(&eph_public);
        salt.extend_from_slice(&cryptoutil::sha256(sigma1_payload));
        let s2k = cryptoutil::hkdf_sha256(
            &salt,
            shared.raw_secret_bytes().as_slice(),
            S2K_INFO,
            16,
        )
        .unwrap();
        let encrypted2 =
            cryptoutil::aes128_ccm_seal(&cryptoutil::aead_key(&s2k), TBE2_NONCE, &[], tbe.data())
                .unwrap();

        let mut w = TlvWriter::new();
        w.begin_struct();
        w.octets(1, &responder_random);
        w.uint16(2, responder_session);
        w.octets(3, &eph_public);
        w.octets(4, &encrypted2);
        w.end_container();
        (w.into_vec(), shared)
    }

    #[test]
    fn sigma1_payload_shape() {
        let id = identity();
        let initiator = CaseInitiator::new(
            &id.fabric,
            DEVICE_ID,
            id.controller_key.clone(),
            id.controller_noc.clone(),
        )
        .unwrap();
        let sigma1 = tlv::decode(&initiator.sigma1_payload).unwrap();
        assert_eq!(sigma1.octets_at(&[1]).map(<[u8]>::len), Some(32));
        assert_eq!(
            sigma1.unsigned_at(&[2]),
            Some(initiator.local_session_id as u64)
        );
        assert_eq!(sigma1.octets_at(&[3]).map(<[u8]>::len), Some(32));
        assert_eq!(sigma1.octets_at(&[4]).map(<[u8]>::len), Some(65));
    }

    #[test]
    fn full_handshake_agrees_on_keys() {
        let id = identity();
        let mut initiator = CaseInitiator::new(
            &id.fabric,
            DEVICE_ID,
            id.controller_key.clone(),
            id.controller_noc.clone(),
        )
        .unwrap();

        let (sigma2_payload, responder_shared) =
            respond_sigma2(&id, &initiator.sigma1_payload, 0x0042, &id.device_key);
        let step = initiator
            .handle(&inbound(ProtocolHeader::OPCODE_SIGMA2, &sigma2_payload))
            .unwrap();
        let sigma3_wire = match step {
            CaseStep::Send(m) => m,
            CaseStep::Established(_) => panic!("not yet established"),
        };

        // responder decrypts TBE3 and checks the controller signature
        let (_, consumed) = ProtocolHeader::decode(&sigma3_wire).unwrap();
        let sigma3_payload = &sigma3_wire[consumed..];
        let encrypted3 = tlv::decode(sigma3_payload)
            .unwrap()
            .octets_at(&[1])
            .unwrap()
            .to_vec();
        let mut transcript = initiator.sigma1_payload.clone();
        transcript.extend_from_slice(&sigma2_payload);
        let mut salt = id.fabric.operational_ipk().unwrap();
        salt.extend_from_slice(&cryptoutil::sha256(&transcript));
        let s3k = cryptoutil::hkdf_sha256(
            &salt,
            responder_shared.raw_secret_bytes().as_slice(),
            S3K_INFO,
            16,
        )
        .unwrap();
        let tbe3 = cryptoutil::aes128_ccm_open(
            &cryptoutil::aead_key(&s3k),
            TBE3_NONCE,
            &[],
            &encrypted3,
        )
        .unwrap();
        let tbe3 = tlv::decode(&tbe3).unwrap();
        assert_eq!(tbe3.octets_at(&[1]), Some(id.controller_noc.as_slice()));
        assert_eq!(tbe3.octets_at(&[3]).map(<[u8]>::len), Some(64));

        // status ok completes the handshake
        let ok = StatusReport {
            general_code: 0,
            protocol_id: 0,
            protocol_code: 0,
        };
        let step = initiator
            .handle(&inbound(ProtocolHeader::OPCODE_STATUS, &ok.encode()))
            .unwrap();
        let session = match step {
            CaseStep::Established(s) => s,
            CaseStep::Send(_) => panic!("expected established"),
        };
        assert_eq!(session.peer_session_id, 0x0042);

        // responder derives the same key pack
        let mut transcript = initiator.sigma1_payload.clone();
        transcript.extend_from_slice(&sigma2_payload);
        transcript.extend_from_slice(&initiator.sigma3_payload);
        let mut salt = id.fabric.operational_ipk().unwrap();
        salt.extend_from_slice(&cryptoutil::sha256(&transcript));
        let keypack = cryptoutil::hkdf_sha256(
            &salt,
            responder_shared.raw_secret_bytes().as_slice(),
            SESSION_KEYS_INFO,
            48,
        )
        .unwrap();
        assert_eq!(session.i2r_key, keypack[..16]);
        assert_eq!(session.r2i_key, keypack[16..32]);
        assert_eq!(session.attestation_challenge, keypack[32..]);
    }

    #[test]
    fn forged_sigma2_signature_rejected() {
        let id = identity();
        let mut initiator = CaseInitiator::new(
            &id.fabric,
            DEVICE_ID,
            id.controller_key.clone(),
            id.controller_noc.clone(),
        )
        .unwrap();
        // signed with a key that does not match the device NOC
        let rogue = p256::SecretKey::random(&mut OsRng);
        let (sigma2_payload, _) =
            respond_sigma2(&id, &initiator.sigma1_payload, 0x0042, &rogue);
        assert!(matches!(
            initiator.handle(&inbound(ProtocolHeader::OPCODE_SIGMA2, &sigma2_payload)),
            Err(Error::SignatureRejected)
        ));
    }

    #[test]
    fn status_report_instead_of_sigma2_aborts_verbatim() {
        let id = identity();
        let mut initiator = CaseInitiator::new(
            &id.fabric,
            DEVICE_ID,
            id.controller_key.clone(),
            id.controller_noc.clone(),
        )
        .unwrap();
        let report = StatusReport {
            general_code: 1,
            protocol_id: 0,
            protocol_code: 1,
        };
        match initiator.handle(&inbound(ProtocolHeader::OPCODE_STATUS, &report.encode())) {
            Err(Error::Status(s)) => {
                assert_eq!(s.general_code, 1);
                assert_eq!(s.protocol_code, 1);
            }
            other => panic!("expected status abort, got {:?}", other.err()),
        }
        // no keys were derived
        assert!(initiator.shared.is_none());
    }
}
