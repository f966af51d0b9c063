//! Crate-wide error type.
//!
//! Protocol-layer failures are typed so that callers can tell a transport
//! timeout from a cryptographic rejection or a peer status report. The
//! certificate store and ASN.1 layers keep [`anyhow`] and flow in through
//! the transparent variant.

use crate::messages::StatusReport;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Local UDP port could not be bound.
    #[error("udp bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// No datagram arrived within the receive deadline.
    #[error("receive deadline elapsed")]
    Timeout,

    /// Socket-level send/receive failure.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Truncated or inconsistent message/protocol header.
    #[error("malformed message: {0}")]
    Framing(&'static str),

    /// AES-CCM open failed; wrong key or tampered ciphertext.
    #[error("aead open failed (tag mismatch)")]
    AeadFailure,

    /// A received point does not satisfy the P-256 curve equation.
    #[error("point is not on the curve")]
    PointNotOnCurve,

    /// Peer answered with an opcode the handshake state does not admit.
    #[error("unexpected opcode 0x{got:02x} (expected 0x{expected:02x})")]
    UnexpectedOpcode { expected: u8, got: u8 },

    /// SPAKE2+ confirmation tag from the peer did not verify.
    #[error("peer confirmation tag mismatch")]
    ConfirmMismatch,

    /// Sigma2 signature did not verify against the peer certificate.
    #[error("peer signature rejected")]
    SignatureRejected,

    /// Non-success status report, surfaced verbatim.
    #[error("peer status report: {0}")]
    Status(StatusReport),

    #[error(transparent)]
    Tlv(#[from] crate::tlv::TlvError),

    /// A TLV path the protocol requires was absent from a payload.
    #[error("required field missing: {0}")]
    MissingField(&'static str),

    /// Certificate store / encoding collaborators.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
