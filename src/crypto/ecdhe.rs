//! NIST P-256 ECDH key agreement and ECDSA-SHA256 signing, used by the
//! ECDHE-NULL/PSK/ECDSA key exchangers (spec §4.F). The teacher
//! (`trailofbits-molasses`) agrees keys over Curve25519; the spec
//! mandates P-256 specifically, so `p256` (RustCrypto, sibling of the
//! teacher's `x25519-dalek`/`ed25519-dalek`) replaces it -- see
//! DESIGN.md.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{EncodedPoint, PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub struct EphemeralKeyPair {
    secret: SecretKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        EphemeralKeyPair {
            secret: SecretKey::random(&mut rand::thread_rng()),
        }
    }

    /// Uncompressed SEC1 point encoding, the "public value" exchanged on
    /// the wire (`KeyInfoNISTP256` for version >= 4, legacy single-byte
    /// curve-type + encoded point otherwise -- §4.F, §6).
    pub fn public_point(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Computes the shared secret with a peer's public point, then hashes
    /// it with SHA-256 to form the ECDH pre-master secret that feeds the
    /// TLS PRF (spec §4.F).
    pub fn agree(&self, peer_public_point: &[u8]) -> Result<[u8; 32]> {
        let point = EncodedPoint::from_bytes(peer_public_point).map_err(|_| Error::CryptoError)?;
        let peer_public = PublicKey::from_sec1_bytes(point.as_bytes()).map_err(|_| Error::CryptoError)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer_public.as_affine());
        let mut hasher = Sha256::new();
        hasher.update(shared.raw_secret_bytes().as_slice());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(out)
    }
}

/// Signs `message` (the 12-byte verifier, for the ECDSA key-exchange
/// variant) with an ECDSA-SHA256 identity private key.
pub fn ecdsa_sign(signing_key: &SigningKey, message: &[u8]) -> EcdsaSignature {
    signing_key.sign(message)
}

pub fn ecdsa_verify(verifying_key: &VerifyingKey, message: &[u8], signature: &EcdsaSignature) -> Result<()> {
    verifying_key
        .verify(message, signature)
        .map_err(|_| Error::InvalidCertificate)
}
