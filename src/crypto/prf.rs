//! Pseudorandom function used to expand a master secret into session
//! material (spec §4.F, §4.G). Grounded in
//! `original_source/common/inc/qcc/Crypto.h`'s `Crypto_PseudorandomFunction`,
//! which is the TLS RFC 5246 §5 `P_hash` construction keyed with
//! HMAC-SHA256 -- the only PRF primitive present in the retrieved source.
//!
//! Key-gen version 0 ("TLS PRF") and version 1 ("CCM PRF") are both built
//! on this one `p_hash` (§9 open question: no separate CCM-specific PRF
//! function exists in the source to mirror; the two key-gen schemes differ
//! in seed construction, not in the underlying hash iteration -- see
//! DESIGN.md).

use hmac::{Hmac, Mac, NewMac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// RFC 5246 §5 `P_hash(secret, seed)`, truncated/extended to `out_len` bytes.
fn p_hash(secret: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(out_len + 32);
    let mut a = seed.to_vec(); // A(0) = seed

    while result.len() < out_len {
        // A(i) = HMAC_hash(secret, A(i-1))
        let mut mac = HmacSha256::new_varkey(secret).expect("HMAC accepts any key length");
        mac.update(&a);
        a = mac.finalize().into_bytes().to_vec();

        // output += HMAC_hash(secret, A(i) || seed)
        let mut mac = HmacSha256::new_varkey(secret).expect("HMAC accepts any key length");
        mac.update(&a);
        mac.update(seed);
        result.extend_from_slice(&mac.finalize().into_bytes());
    }
    result.truncate(out_len);
    result
}

/// `PRF(secret, label, seed, out_len) = P_SHA256(secret, label || seed)`.
fn prf(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label);
    full_seed.extend_from_slice(seed);
    p_hash(secret, &full_seed, out_len)
}

/// Key-gen version 0: the master secret is expanded with the TLS PRF
/// verbatim, label bytes passed through unpadded.
pub fn tls_prf(secret: &[u8], label: &str, seed: &[u8], out_len: usize) -> Vec<u8> {
    prf(secret, label.as_bytes(), seed, out_len)
}

/// Key-gen version 1: same `P_hash` iteration, but the label is
/// NUL-terminated in the seed the way CCM-mode key schedules frame their
/// labels, to keep the two key-gen schemes from ever producing colliding
/// output for the same `(secret, seed)` pair.
pub fn ccm_prf(secret: &[u8], label: &str, seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut label_bytes = label.as_bytes().to_vec();
    label_bytes.push(0);
    prf(secret, &label_bytes, seed, out_len)
}

/// Derives the 48-byte ECDHE master secret from a shared ECDH secret
/// (spec §4.F): `TLS_PRF(shared_secret_hash, "master secret", "", 48)`.
pub fn derive_master_secret(shared_secret_hash: &[u8]) -> [u8; 48] {
    let bytes = tls_prf(shared_secret_hash, "master secret", b"", 48);
    let mut out = [0u8; 48];
    out.copy_from_slice(&bytes);
    out
}

/// `PRF(master_secret, "client finished"/"server finished",
/// SHA-256(conversation-hash), 12)` (spec §4.F verifier derivation).
pub fn derive_verifier(master_secret: &[u8], label: &str, conversation_hash_digest: &[u8; 32], key_gen_version: u8) -> [u8; 12] {
    let bytes = if key_gen_version == 0 {
        tls_prf(master_secret, label, conversation_hash_digest, 12)
    } else {
        ccm_prf(master_secret, label, conversation_hash_digest, 12)
    };
    let mut out = [0u8; 12];
    out.copy_from_slice(&bytes);
    out
}

/// Derives the session key material: `PRF(master_secret, "session key" |
/// label-version-suffix, local_nonce||remote_nonce, 16 + 12 bytes)`,
/// returning `(aes_key[16], verifier[12])` (spec §4.G step 6).
pub fn derive_session_key(
    master_secret: &[u8],
    local_nonce: &[u8],
    remote_nonce: &[u8],
    key_gen_version: u8,
) -> ([u8; 16], [u8; 12]) {
    let mut seed = Vec::with_capacity(local_nonce.len() + remote_nonce.len());
    seed.extend_from_slice(local_nonce);
    seed.extend_from_slice(remote_nonce);

    // The label-version-suffix distinguishes key-gen schemes without
    // changing the PRF's external interface: "session key" is passed
    // verbatim, only the PRF construction underneath it switches (§9 open
    // question).
    let out = if key_gen_version == 0 {
        tls_prf(master_secret, "session key", &seed, 28)
    } else {
        ccm_prf(master_secret, "session key", &seed, 28)
    };

    let mut aes_key = [0u8; 16];
    let mut verifier = [0u8; 12];
    aes_key.copy_from_slice(&out[0..16]);
    verifier.copy_from_slice(&out[16..28]);
    (aes_key, verifier)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prf_output_length_matches_request() {
        let out = tls_prf(b"secret", "label", b"seed", 100);
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn prf_is_deterministic() {
        let a = tls_prf(b"secret", "label", b"seed", 48);
        let b = tls_prf(b"secret", "label", b"seed", 48);
        assert_eq!(a, b);
    }

    #[test]
    fn tls_and_ccm_prf_diverge() {
        let a = tls_prf(b"secret", "session key", b"seed", 28);
        let b = ccm_prf(b"secret", "session key", b"seed", 28);
        assert_ne!(a, b);
    }

    #[test]
    fn session_key_split_is_16_and_12_bytes() {
        let (aes_key, verifier) = derive_session_key(b"0123456789012345678901234567890123456789012345", b"nonceA", b"nonceB", 0);
        assert_eq!(aes_key.len(), 16);
        assert_eq!(verifier.len(), 12);
    }
}
