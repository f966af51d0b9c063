//! SPAKE2+ on NIST P-256 with the Matter-specific generator constants
//! and key schedule.
//!
//! The engine holds the curve math only; message sequencing lives in
//! [`crate::pase`]. Scalars drawn here always come from the OS RNG.

use p256::elliptic_curve::{
    scalar::FromUintUnchecked,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    Curve, Field,
};
use rand::rngs::OsRng;
use std::ops::Mul;

use crate::error::{Error, Result};
use crate::util::cryptoutil;

/// Matter-defined blinding generators.
const M_POINT: &str = "02886e2f97ace46e55ba9dd7242579f2993b64e16ef3dcab95afd497333d8fa12f";
const N_POINT: &str = "03d8bbd6c639c62937b04d997f38c3770719c629d7014d49a24b4f98baa1292b49";

pub struct Spake2P {
    m: p256::AffinePoint,
    n: p256::AffinePoint,
}

/// Prover state between the commitment and the confirmation step.
pub struct Prover {
    w0: p256::Scalar,
    w1: p256::Scalar,
    x: p256::Scalar,
    /// Commitment point X, uncompressed.
    pub commitment: p256::EncodedPoint,
}

/// Output of a completed confirmation step.
pub struct Confirmation {
    /// Our confirmation tag, sent in Pake3.
    pub ca: Vec<u8>,
    /// The tag the peer must have sent in Pake2.
    pub expected_cb: Vec<u8>,
    pub i2r_key: Vec<u8>,
    pub r2i_key: Vec<u8>,
    pub session_secret: Vec<u8>,
}

/// Reduce a 40-byte PBKDF block modulo the curve order.
fn scalar_from_40_bytes(bytes: &[u8]) -> p256::Scalar {
    let wide = crypto_bigint::U320::from_be_slice(bytes);
    let order = crypto_bigint::NonZero::from_uint(crypto_bigint::U320::from(
        &p256::NistP256::ORDER,
    ));
    let reduced = crypto_bigint::U256::from(&wide.rem(&order));
    p256::Scalar::from_uint_unchecked(reduced)
}

fn to_projective(point: &p256::EncodedPoint) -> Result<p256::ProjectivePoint> {
    p256::ProjectivePoint::from_encoded_point(point)
        .into_option()
        .ok_or(Error::PointNotOnCurve)
}

fn to_affine(point: &p256::EncodedPoint) -> Result<p256::AffinePoint> {
    p256::AffinePoint::from_encoded_point(point)
        .into_option()
        .ok_or(Error::PointNotOnCurve)
}

/// Derive the w0/w1 scalars from the passcode and the responder's PBKDF
/// parameters: 80 bytes of PBKDF2-HMAC-SHA256 output, split in half,
/// each half reduced modulo the order.
pub fn derive_w(passcode: &[u8], salt: &[u8], iterations: u32) -> (p256::Scalar, p256::Scalar) {
    let mut block = [0u8; 80];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(passcode, salt, iterations, &mut block);
    (
        scalar_from_40_bytes(&block[..40]),
        scalar_from_40_bytes(&block[40..]),
    )
}

/// Registration record `w0 || L` where `L = w1*G`, the value a verifier
/// stores instead of the passcode.
pub fn passcode_verifier(passcode: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let (w0, w1) = derive_w(passcode, salt, iterations);
    let l = p256::ProjectivePoint::GENERATOR.mul(w1);
    let mut out = Vec::with_capacity(32 + 65);
    out.extend_from_slice(w0.to_bytes().as_slice());
    out.extend_from_slice(l.to_encoded_point(false).as_bytes());
    out
}

fn lengthed(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
    buf.extend_from_slice(data);
}

impl Spake2P {
    pub fn new() -> Result<Self> {
        let m_bytes = hex::decode(M_POINT).map_err(|e| anyhow::anyhow!("generator constant: {e}"))?;
        let n_bytes = hex::decode(N_POINT).map_err(|e| anyhow::anyhow!("generator constant: {e}"))?;
        let m = p256::EncodedPoint::from_bytes(m_bytes).map_err(|_| Error::PointNotOnCurve)?;
        let n = p256::EncodedPoint::from_bytes(n_bytes).map_err(|_| Error::PointNotOnCurve)?;
        Ok(Self {
            m: to_affine(&m)?,
            n: to_affine(&n)?,
        })
    }

    /// Derive w0/w1 and produce the commitment `X = x*G + w0*M` with a
    /// fresh ephemeral scalar.
    pub fn start(&self, passcode: &[u8], salt: &[u8], iterations: u32) -> Prover {
        let (w0, w1) = derive_w(passcode, salt, iterations);
        let x = p256::Scalar::random(&mut OsRng);
        let commitment = (p256::ProjectivePoint::GENERATOR.mul(x) + self.m.mul(&w0))
            .to_encoded_point(false);
        Prover {
            w0,
            w1,
            x,
            commitment,
        }
    }

    /// Process the responder commitment `Y`, build the transcript and
    /// derive confirmation tags and session keys. `context_seed` is the
    /// protocol-defined label plus both PBKDF payloads.
    pub fn confirm(
        &self,
        prover: &Prover,
        peer_commitment: &p256::EncodedPoint,
        context_seed: &[u8],
    ) -> Result<Confirmation> {
        // Z = x*(Y - w0*N), V = w1*(Y - w0*N)
        let unblinded = to_projective(peer_commitment)? + self.n.mul(&prover.w0).neg();
        let z = unblinded.mul(prover.x);
        let v = unblinded.mul(prover.w1);

        let mut tt = Vec::with_capacity(1024);
        lengthed(&mut tt, &cryptoutil::sha256(context_seed));
        lengthed(&mut tt, &[]); // prover identity
        lengthed(&mut tt, &[]); // verifier identity
        lengthed(&mut tt, self.m.to_encoded_point(false).as_bytes());
        lengthed(&mut tt, self.n.to_encoded_point(false).as_bytes());
        lengthed(&mut tt, prover.commitment.as_bytes());
        lengthed(&mut tt, peer_commitment.as_bytes());
        lengthed(&mut tt, z.to_encoded_point(false).as_bytes());
        lengthed(&mut tt, v.to_encoded_point(false).as_bytes());
        lengthed(&mut tt, prover.w0.to_bytes().as_slice());

        let digest = cryptoutil::sha256(&tt);
        let (ka, ke) = digest.split_at(16);

        let confirm_keys = cryptoutil::hkdf_sha256(&[], ka, b"ConfirmationKeys", 32)?;
        let ca = cryptoutil::hmac_sha256(&confirm_keys[..16], peer_commitment.as_bytes())?;
        let expected_cb = cryptoutil::hmac_sha256(&confirm_keys[16..], prover.commitment.as_bytes())?;

        let session_keys = cryptoutil::hkdf_sha256(&[], ke, b"SessionKeys", 16 * 3)?;
        Ok(Confirmation {
            ca,
            expected_cb,
            i2r_key: session_keys[..16].to_vec(),
            r2i_key: session_keys[16..32].to_vec(),
            session_secret: session_keys[32..].to_vec(),
        })
    }
}
