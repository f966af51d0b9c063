//! Passcode-authenticated session establishment (PASE).
//!
//! Explicit initiator state machine over the four SPAKE2+ flights; the
//! curve math lives in [`crate::spake2p`]. Any opcode the current state
//! does not admit fails the handshake.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::messages::{self, Message, ProtocolHeader};
use crate::secure_channel::SecureChannel;
use crate::spake2p::{Confirmation, Prover, Spake2P};
use crate::tlv::TlvWriter;

/// Context label for the SPAKE2+ transcript seed.
const PAKE_CONTEXT: &[u8] = b"CHIP PAKE V1 Commissioning";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitPbkdfResp,
    AwaitPake2,
    AwaitStatus,
    Done,
}

/// What the caller must do next after feeding one inbound message.
pub enum PaseStep {
    Send(Vec<u8>),
    Established(EstablishedSession),
}

/// Keys and session ids handed to the secure channel on success.
pub struct EstablishedSession {
    pub peer_session_id: u16,
    pub local_session_id: u16,
    pub i2r_key: Vec<u8>,
    pub r2i_key: Vec<u8>,
    pub session_secret: Vec<u8>,
}

pub struct PaseInitiator {
    state: State,
    exchange_id: u16,
    local_session_id: u16,
    passcode: u32,
    engine: Spake2P,
    prover: Option<Prover>,
    confirmation: Option<Confirmation>,
    /// TLV payload of our PBKDFParamRequest, kept for the transcript.
    request_payload: Vec<u8>,
    /// Raw PBKDFParamResponse payload as received.
    response_payload: Vec<u8>,
    responder_session: u16,
}

fn expect_opcode(msg: &Message, expected: u8) -> Result<()> {
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

impl PaseInitiator {
    pub fn new(passcode: u32) -> Result<Self> {
        let mut initiator_random = [0u8; 32];
        OsRng.fill_bytes(&mut initiator_random);
        let local_session_id = OsRng.next_u32() as u16;

        let mut w = TlvWriter::new();
        w.begin_struct();
        w.octets(1, &initiator_random);
        w.uint16(2, local_session_id);
        w.uint8(3, 0); // passcode id
        w.boolean(4, true); // pbkdf parameters wanted
        w.end_container();

        Ok(Self {
            state: State::AwaitPbkdfResp,
            exchange_id: OsRng.next_u32() as u16,
            local_session_id,
            passcode,
            engine: Spake2P::new()?,
            prover: None,
            confirmation: None,
            request_payload: w.into_vec(),
            response_payload: Vec::new(),
            responder_session: 0,
        })
    }

    /// The PBKDFParamRequest protocol message that opens the handshake.
    pub fn initial_message(&self) -> Vec<u8> {
        messages::secure_channel_message(
            ProtocolHeader::OPCODE_PBKDF_REQ,
            self.exchange_id,
            &self.request_payload,
            None,
        )
    }

    /// Feed one inbound message and advance the state machine.
    pub fn handle(&mut self, msg: &Message) -> Result<PaseStep> {
        match self.state {
            State::AwaitPbkdfResp => self.on_pbkdf_response(msg),
            State::AwaitPake2 => self.on_pake2(msg),
            State::AwaitStatus => self.on_status(msg),
            State::Done => Err(Error::UnexpectedOpcode {
                expected: 0,
                got: msg.protocol_header.opcode,
            }),
        }
    }

    fn on_pbkdf_response(&mut self, msg: &Message) -> Result<PaseStep> {
        expect_opcode(msg, ProtocolHeader::OPCODE_PBKDF_RESP)?;
        let tlv = msg.tlv.as_ref().ok_or(Error::MissingField("pbkdf response body"))?;
        let iterations = tlv
            .unsigned_at(&[4, 1])
            .ok_or(Error::MissingField("pbkdf iterations"))?;
        let salt = tlv
            .octets_at(&[4, 2])
            .ok_or(Error::MissingField("pbkdf salt"))?;
        self.responder_session = tlv
            .unsigned_at(&[3])
            .ok_or(Error::MissingField("responder session id"))? as u16;
        self.response_payload = msg.payload.clone();

        let prover = self
            .engine
            .start(&self.passcode.to_le_bytes(), salt, iterations as u32);
        let mut w = TlvWriter::new();
        w.begin_struct();
        w.octets(1, prover.commitment.as_bytes());
        w.end_container();
        let pake1 = messages::secure_channel_message(
            ProtocolHeader::OPCODE_PAKE1,
            self.exchange_id,
            w.data(),
            None,
        );
        self.prover = Some(prover);
        self.state = State::AwaitPake2;
        log::debug!("pase: pbkdf parameters received, sending pake1");
        Ok(PaseStep::Send(pake1))
    }

    fn on_pake2(&mut self, msg: &Message) -> Result<PaseStep> {
        expect_opcode(msg, ProtocolHeader::OPCODE_PAKE2)?;
        let tlv = msg.tlv.as_ref().ok_or(Error::MissingField("pake2 body"))?;
        let pb = tlv.octets_at(&[1]).ok_or(Error::MissingField("pake2 pB"))?;
        let cb = tlv.octets_at(&[2]).ok_or(Error::MissingField("pake2 cB"))?;
        let peer_commitment =
            p256::EncodedPoint::from_bytes(pb).map_err(|_| Error::PointNotOnCurve)?;

        let mut seed = PAKE_CONTEXT.to_vec();
        seed.extend_from_slice(&self.request_payload);
        seed.extend_from_slice(&self.response_payload);

        let prover = self.prover.as_ref().ok_or(Error::MissingField("prover state"))?;
        let confirmation = self.engine.confirm(prover, &peer_commitment, &seed)?;
        if confirmation.expected_cb != cb {
            return Err(Error::ConfirmMismatch);
        }

        let mut w = TlvWriter::new();
        w.begin_struct();
        w.octets(1, &confirmation.ca);
        w.end_container();
        let pake3 = messages::secure_channel_message(
            ProtocolHeader::OPCODE_PAKE3,
            self.exchange_id,
            w.data(),
            None,
        );
        self.confirmation = Some(confirmation);
        self.state = State::AwaitStatus;
        log::debug!("pase: peer confirmation verified, sending pake3");
        Ok(PaseStep::Send(pake3))
    }

    fn on_status(&mut self, msg: &Message) -> Result<PaseStep> {
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
        let confirmation = self
            .confirmation
            .take()
            .ok_or(Error::MissingField("confirmation state"))?;
        self.state = State::Done;
        Ok(PaseStep::Established(EstablishedSession {
            peer_session_id: self.responder_session,
            local_session_id: self.local_session_id,
            i2r_key: confirmation.i2r_key,
            r2i_key: confirmation.r2i_key,
            session_secret: confirmation.session_secret,
        }))
    }
}

/// Run PASE on a plaintext channel; on success the channel switches to
/// encrypted mode. Node identifiers stay zero until CASE.
pub async fn establish(channel: &mut SecureChannel, passcode: u32) -> Result<()> {
    let mut initiator = PaseInitiator::new(passcode)?;
    log::debug!("pase: sending pbkdf param request");
    channel.send(&initiator.initial_message()).await?;
    loop {
        let msg = channel.receive().await?;
        match initiator.handle(&msg)? {
            PaseStep::Send(out) => channel.send(&out).await?,
            PaseStep::Established(session) => {
                channel.install_keys(
                    &session.i2r_key,
                    &session.r2i_key,
                    session.peer_session_id,
                    session.local_session_id,
                );
                log::debug!("pase established, peer session {}", session.peer_session_id);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageHeader, StatusReport};

    fn inbound(opcode: u8, payload: &[u8]) -> Message {
        let header = MessageHeader {
            flags: 0,
            session_id: 0,
            security_flags: 0,
            message_counter: 1,
            source_node_id: None,
            destination_node_id: None,
        };
        let proto = messages::secure_channel_message(opcode, 5, payload, None);
        Message::from_parts(header, &proto).unwrap()
    }

    #[test]
    fn failure_status_aborts_with_verbatim_codes() {
        let mut initiator = PaseInitiator::new(20202021).unwrap();
        let body = StatusReport {
            general_code: 1,
            protocol_id: 0,
            protocol_code: 4,
        }
        .encode();
        let msg = inbound(ProtocolHeader::OPCODE_STATUS, &body);
        match initiator.handle(&msg) {
            Err(Error::Status(s)) => {
                assert_eq!(s.general_code, 1);
                assert_eq!(s.protocol_code, 4);
            }
            other => panic!("expected status error, got {:?}", other.err()),
        }
    }

    #[test]
    fn wrong_opcode_rejected_per_state() {
        let mut initiator = PaseInitiator::new(1234).unwrap();
        let msg = inbound(ProtocolHeader::OPCODE_PAKE2, &[0x15, 0x18]);
        assert!(matches!(
            initiator.handle(&msg),
            Err(Error::UnexpectedOpcode {
                expected: ProtocolHeader::OPCODE_PBKDF_RESP,
                ..
            })
        ));
    }

    #[test]
    fn pbkdf_response_missing_salt_rejected() {
        let mut initiator = PaseInitiator::new(1234).unwrap();
        let mut w = TlvWriter::new();
        w.begin_struct();
        w.uint16(3, 0x11); // responder session but no pbkdf params
        w.end_container();
        let msg = inbound(ProtocolHeader::OPCODE_PBKDF_RESP, w.data());
        assert!(matches!(
            initiator.handle(&msg),
            Err(Error::MissingField(_))
        ));
    }

    #[test]
    fn pbkdf_response_advances_to_pake2() {
        let mut initiator = PaseInitiator::new(20202021).unwrap();
        let mut w = TlvWriter::new();
        w.begin_struct();
        w.uint16(3, 0x0bad);
        w.begin_struct_tagged(4);
        w.uint32(1, 1000);
        w.octets(2, b"SPAKE2P Key Salt");
        w.end_container();
        w.end_container();
        let msg = inbound(ProtocolHeader::OPCODE_PBKDF_RESP, w.data());
        match initiator.handle(&msg).unwrap() {
            PaseStep::Send(pake1) => {
                let (header, consumed) = ProtocolHeader::decode(&pake1).unwrap();
                assert_eq!(header.opcode, ProtocolHeader::OPCODE_PAKE1);
                let tlv = crate::tlv::decode(&pake1[consumed..]).unwrap();
                // uncompressed P-256 point
                assert_eq!(tlv.octets_at(&[1]).map(<[u8]>::len), Some(65));
            }
            PaseStep::Established(_) => panic!("not established yet"),
        }
        assert_eq!(initiator.state, State::AwaitPake2);
    }
}
