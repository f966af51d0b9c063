//! Matter commissioning client core.
//!
//! This library brings a factory-fresh Matter device onto a fabric over
//! plain IP/UDP. It implements the secure-channel message layer (dual
//! header framing, AES-CCM session traffic, message counters and
//! standalone acks), the two key-agreement handshakes, PASE (SPAKE2+
//! over the onboarding passcode) and CASE (certificate-authenticated
//! Sigma exchange), the Matter TLV codec used throughout payloads, and
//! the commissioning orchestrator that sequences them.
//!
//! The main pieces:
//! - [`Commissioner`]: drives the whole flow: PASE, CSR, trust-root and
//!   NOC installation, CASE, CommissioningComplete.
//! - [`certstore::CertStore`]: boundary trait for credentials;
//!   [`certstore::FileCertStore`] persists them as PEM files.
//! - [`secure_channel::SecureChannel`]: one socket, one peer, one
//!   counter; plaintext until a handshake installs keys.
//! - [`tlv`]: encoder/decoder for the compact TLV payload format.
//! - [`onboarding`]: QR text payload and manual pairing code decoding.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use matcom::certstore::{self, FileCertStore};
//! # use matcom::Commissioner;
//! # #[tokio::main]
//! # async fn main() -> matcom::Result<()> {
//! let fabric_id = 0x1000;
//! let controller_id = 100;
//! let device_id = 300;
//!
//! let store = FileCertStore::new(fabric_id, "./pem");
//! store.bootstrap()?;
//! store.create_controller(controller_id)?;
//!
//! let store: Arc<dyn certstore::CertStore> = store;
//! let commissioner = Commissioner::new(store)?;
//! let device = "192.168.1.70:5540".parse().unwrap();
//! let channel = commissioner
//!     .commission(device, 20202021, controller_id, device_id)
//!     .await?;
//! channel.close().await;
//! # Ok(())
//! # }
//! ```
#![doc = include_str!("../readme.md")]

pub mod cert_matter;
pub mod cert_x509;
pub mod certstore;
pub mod commission;
pub mod error;
pub mod fabric;
pub mod messages;
pub mod onboarding;
pub mod pase;
pub mod secure_channel;
pub mod sigma;
pub mod spake2p;
pub mod tlv;
pub mod transport;
mod util;

pub use commission::Commissioner;
pub use error::{Error, Result};
