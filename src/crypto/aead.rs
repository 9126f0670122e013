//! AES-CCM primitive wrapper. The spec names AES-CCM specifically (§4.C);
//! `ring` (the teacher's AEAD dependency) has no CCM mode, so this crate
//! pulls in `aes` + `ccm` (same RustCrypto family as the `aes-gcm` crate
//! several pack repos already depend on) -- see DESIGN.md for the swap.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, NewAead};
use ccm::consts::{U13, U16, U5, U8};
use ccm::Ccm;

use crate::error::{Error, Result};

type CcmFull = Ccm<Aes128, U16, U13>;
type CcmLegacyMac = Ccm<Aes128, U8, U13>;
type CcmLegacyNonce = Ccm<Aes128, U16, U5>;
type CcmLegacyBoth = Ccm<Aes128, U8, U5>;

/// AES-128 key plus the (mac_len, nonce_len) pair negotiated for this peer
/// (spec §4.C: modern = 16/13, legacy = 8/5).
pub struct CcmParams {
    pub mac_len: usize,
    pub nonce_len: usize,
}

pub fn encrypt_in_place(
    key: &[u8; 16],
    params: &CcmParams,
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut Vec<u8>,
) -> Result<()> {
    let key_ga = GenericArray::from_slice(key);
    match (params.mac_len, params.nonce_len) {
        (16, 13) => {
            let cipher = CcmFull::new(key_ga);
            let n = GenericArray::from_slice(nonce);
            cipher
                .encrypt_in_place(n, aad, buffer)
                .map_err(|_| Error::CryptoError)
        }
        (8, 13) => {
            let cipher = CcmLegacyMac::new(key_ga);
            let n = GenericArray::from_slice(nonce);
            cipher
                .encrypt_in_place(n, aad, buffer)
                .map_err(|_| Error::CryptoError)
        }
        (16, 5) => {
            let cipher = CcmLegacyNonce::new(key_ga);
            let n = GenericArray::from_slice(nonce);
            cipher
                .encrypt_in_place(n, aad, buffer)
                .map_err(|_| Error::CryptoError)
        }
        (8, 5) => {
            let cipher = CcmLegacyBoth::new(key_ga);
            let n = GenericArray::from_slice(nonce);
            cipher
                .encrypt_in_place(n, aad, buffer)
                .map_err(|_| Error::CryptoError)
        }
        _ => Err(Error::KeyBlobOpInvalid),
    }
}

pub fn decrypt_in_place(
    key: &[u8; 16],
    params: &CcmParams,
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut Vec<u8>,
) -> Result<()> {
    let key_ga = GenericArray::from_slice(key);
    // All underlying failures collapse to MessageDecryptionFailed (§4.C)
    // so a caller can't distinguish "bad tag" from "bad padding" etc.
    match (params.mac_len, params.nonce_len) {
        (16, 13) => {
            let cipher = CcmFull::new(key_ga);
            let n = GenericArray::from_slice(nonce);
            cipher
                .decrypt_in_place(n, aad, buffer)
                .map_err(|_| Error::MessageDecryptionFailed)
        }
        (8, 13) => {
            let cipher = CcmLegacyMac::new(key_ga);
            let n = GenericArray::from_slice(nonce);
            cipher
                .decrypt_in_place(n, aad, buffer)
                .map_err(|_| Error::MessageDecryptionFailed)
        }
        (16, 5) => {
            let cipher = CcmLegacyNonce::new(key_ga);
            let n = GenericArray::from_slice(nonce);
            cipher
                .decrypt_in_place(n, aad, buffer)
                .map_err(|_| Error::MessageDecryptionFailed)
        }
        (8, 5) => {
            let cipher = CcmLegacyBoth::new(key_ga);
            let n = GenericArray::from_slice(nonce);
            cipher
                .decrypt_in_place(n, aad, buffer)
                .map_err(|_| Error::MessageDecryptionFailed)
        }
        _ => Err(Error::MessageDecryptionFailed),
    }
}
