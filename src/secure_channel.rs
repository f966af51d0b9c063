//! Stateful peer session: counter management, AES-CCM seal/open and
//! standalone-ack handling over a single-peer UDP transport.
//!
//! The channel is a single-owner object; every send mutates the counter,
//! so callers serialize use through `&mut self`. It starts in plaintext
//! mode and becomes encrypted when a key agreement installs keys.

use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::messages::{self, Message, MessageHeader};
use crate::transport::Transport;
use crate::util::cryptoutil::{self, AeadKey};

pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Symmetric keys are installed and cleared together; the channel is
/// never half-keyed.
#[derive(Debug)]
struct ChannelKeys {
    encrypt: AeadKey,
    decrypt: AeadKey,
}

#[derive(Debug)]
pub struct SecureChannel {
    transport: Transport,
    counter: u32,
    /// Peer-announced session id stamped on outbound envelopes.
    session_id: u16,
    /// Our session id; inbound encrypted envelopes must carry it.
    local_session_id: u16,
    local_node: [u8; 8],
    remote_node: [u8; 8],
    keys: Option<ChannelKeys>,
    receive_timeout: Duration,
}

/// AES-CCM nonce: `00 || counter (u32 LE) || node id (8 bytes)`.
fn make_nonce(counter: u32, node: &[u8; 8]) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[1..5].copy_from_slice(&counter.to_le_bytes());
    nonce[5..].copy_from_slice(node);
    nonce
}

impl SecureChannel {
    /// Bind a local UDP port towards the device and start in plaintext
    /// mode with a random initial counter.
    pub async fn start(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let transport = Transport::bind(local, remote).await?;
        Ok(Self::over(transport))
    }

    pub fn over(transport: Transport) -> Self {
        Self {
            transport,
            counter: OsRng.next_u32(),
            session_id: 0,
            local_session_id: 0,
            local_node: [0; 8],
            remote_node: [0; 8],
            keys: None,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }

    pub fn is_encrypted(&self) -> bool {
        self.keys.is_some()
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    pub fn local_node(&self) -> [u8; 8] {
        self.local_node
    }

    pub fn remote_node(&self) -> [u8; 8] {
        self.remote_node
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Install the keys derived by a key agreement and switch to
    /// encrypted mode. `session_id` is the peer's, `local_session_id`
    /// the one we announced in the handshake.
    pub fn install_keys(
        &mut self,
        encrypt: &[u8],
        decrypt: &[u8],
        session_id: u16,
        local_session_id: u16,
    ) {
        self.keys = Some(ChannelKeys {
            encrypt: cryptoutil::aead_key(encrypt),
            decrypt: cryptoutil::aead_key(decrypt),
        });
        self.session_id = session_id;
        self.local_session_id = local_session_id;
        log::debug!("channel keyed, peer session {}", session_id);
    }

    /// Drop keys and return to plaintext mode (between PASE teardown and
    /// the CASE handshake).
    pub fn clear_keys(&mut self) {
        self.keys = None;
        self.session_id = 0;
        self.local_session_id = 0;
    }

    /// Node identifiers assigned on CASE success.
    pub fn set_nodes(&mut self, local: u64, remote: u64) {
        self.local_node = local.to_le_bytes();
        self.remote_node = remote.to_le_bytes();
    }

    /// Frame and send one protocol message. The counter is incremented
    /// first; on a keyed channel the protocol bytes are sealed with the
    /// envelope as associated data.
    pub async fn send(&mut self, protocol_message: &[u8]) -> Result<()> {
        self.counter = self.counter.wrapping_add(1);
        let envelope = MessageHeader {
            flags: 0,
            session_id: self.session_id,
            security_flags: 0,
            message_counter: self.counter,
            source_node_id: Some(self.local_node),
            destination_node_id: None,
        };
        let mut datagram = envelope.encode();
        match &self.keys {
            Some(keys) => {
                let nonce = make_nonce(self.counter, &self.local_node);
                let sealed =
                    cryptoutil::aes128_ccm_seal(&keys.encrypt, &nonce, &datagram, protocol_message)?;
                datagram.extend_from_slice(&sealed);
            }
            None => datagram.extend_from_slice(protocol_message),
        }
        log::trace!("send counter {} ({} bytes)", self.counter, datagram.len());
        self.transport.send(&datagram).await
    }

    /// Receive the next substantive message. Standalone acks are
    /// swallowed and the read restarts; every surfaced message gets a
    /// best-effort standalone ack before this returns.
    pub async fn receive(&mut self) -> Result<Message> {
        loop {
            let datagram = self.transport.receive(self.receive_timeout).await?;
            let (header, consumed) = MessageHeader::decode(&datagram)?;
            let associated = &datagram[..consumed];
            let rest = &datagram[consumed..];
            let plaintext = match &self.keys {
                Some(keys) => {
                    if header.session_id != self.local_session_id {
                        return Err(Error::Framing("session id mismatch"));
                    }
                    let nonce = make_nonce(header.message_counter, &self.remote_node);
                    cryptoutil::aes128_ccm_open(&keys.decrypt, &nonce, associated, rest)?
                }
                None => rest.to_vec(),
            };
            let message = Message::from_parts(header, &plaintext)?;
            if message.is_standalone_ack() {
                log::trace!(
                    "standalone ack for counter {:?}",
                    message.protocol_header.ack_counter
                );
                continue;
            }
            let ack = messages::standalone_ack(
                message.protocol_header.exchange_id,
                message.message_header.message_counter,
            );
            if let Err(e) = self.send(&ack).await {
                log::debug!("ack send failed: {e}");
            }
            return Ok(message);
        }
    }

    /// Send the close-session status report and release the socket.
    pub async fn close(mut self) {
        let exchange_id = OsRng.next_u32() as u16;
        if let Err(e) = self.send(&messages::close_session(exchange_id)).await {
            log::debug!("close-session send failed: {e}");
        }
    }
}
