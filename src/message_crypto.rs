//! AES-CCM encrypt/decrypt of marshaled messages using a per-peer session
//! key and a structured nonce (spec §4.C).

use byteorder::{BigEndian, ByteOrder};

use crate::config::{
    MAC_LEN_LEGACY, MAC_LEN_MODERN, MIN_AUTH_VERSION_FULLNONCELEN, MIN_AUTH_VERSION_MACLEN16,
    NONCE_LEN_LEGACY, NONCE_LEN_MODERN,
};
use crate::crypto::aead::{self, CcmParams};
use crate::error::{Error, Result};
use crate::key_blob::{KeyBlob, KeyType, Role};

/// Everything `encrypt`/`decrypt` needs to know about the message being
/// processed, standing in for the fields the out-of-scope marshaller would
/// otherwise expose directly on a `Message` object.
#[derive(Debug, Clone, Copy)]
pub struct MessageCryptoMeta {
    pub serial: u32,
    /// True for message types whose nonce includes the 64-bit crypto
    /// random value (spec §4.C: `RequiresCryptoValue()`).
    pub requires_crypto_value: bool,
    pub crypto_random_value: u64,
}

fn mac_and_nonce_len(negotiated_auth_version: u32) -> (usize, usize) {
    let mac_len = if negotiated_auth_version < MIN_AUTH_VERSION_MACLEN16 {
        MAC_LEN_LEGACY
    } else {
        MAC_LEN_MODERN
    };
    let nonce_len = if negotiated_auth_version < MIN_AUTH_VERSION_FULLNONCELEN {
        NONCE_LEN_LEGACY
    } else {
        NONCE_LEN_MODERN
    };
    (mac_len, nonce_len)
}

/// Builds the big-endian nonce: byte 0 = role (sender's role to encrypt,
/// anti-role to decrypt), bytes 1..4 = serial, byte 5 = reserved 0 (legacy
/// nonces stop at byte 4), bytes 5..12 = 64-bit crypto random value when
/// `RequiresCryptoValue()` is true. Legacy senders omit bytes 5-12 (the
/// nonce is simply shorter).
fn build_nonce(role_byte: u8, meta: &MessageCryptoMeta, nonce_len: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; nonce_len];
    nonce[0] = role_byte;
    if nonce_len >= 5 {
        BigEndian::write_u32(&mut nonce[1..5], meta.serial);
    }
    if nonce_len > 5 && meta.requires_crypto_value {
        let mut value_buf = [0u8; 8];
        BigEndian::write_u64(&mut value_buf, meta.crypto_random_value);
        let available = nonce_len - 5;
        let take = available.min(8);
        nonce[5..5 + take].copy_from_slice(&value_buf[0..take]);
    }
    nonce
}

/// Encrypts `buf[header_len..header_len+body_len]` in place, appending the
/// authentication tag, and returns the new body length (including tag).
/// `buf[0..header_len]` is treated as AAD and left untouched.
pub fn encrypt(
    meta: &MessageCryptoMeta,
    key: &KeyBlob,
    sender_role: Role,
    negotiated_auth_version: u32,
    buf: &mut Vec<u8>,
    header_len: usize,
    body_len: usize,
) -> Result<usize> {
    if key.key_type != KeyType::Aes {
        return Err(Error::KeyBlobOpInvalid);
    }
    let aes_key: [u8; 16] = key
        .bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::KeyBlobOpInvalid)?;

    let (mac_len, nonce_len) = mac_and_nonce_len(negotiated_auth_version);
    let nonce = build_nonce(sender_role.wire_byte(), meta, nonce_len);
    let params = CcmParams { mac_len, nonce_len };

    let aad = buf[0..header_len].to_vec();
    let mut body = buf[header_len..header_len + body_len].to_vec();
    aead::encrypt_in_place(&aes_key, &params, &nonce, &aad, &mut body)?;

    buf.truncate(header_len);
    buf.extend_from_slice(&body);
    Ok(body.len())
}

/// Decrypts and authenticates `buf[header_len..header_len+body_len]` in
/// place (body includes the trailing tag). All crypto-level failures
/// collapse to `MessageDecryptionFailed` (spec §4.C) so nothing about
/// *why* decryption failed is observable to the caller.
pub fn decrypt(
    meta: &MessageCryptoMeta,
    key: &KeyBlob,
    sender_role: Role,
    negotiated_auth_version: u32,
    buf: &mut Vec<u8>,
    header_len: usize,
    body_len: usize,
) -> Result<usize> {
    if key.key_type != KeyType::Aes {
        return Err(Error::MessageDecryptionFailed);
    }
    let aes_key: [u8; 16] = key
        .bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::MessageDecryptionFailed)?;

    let (mac_len, nonce_len) = mac_and_nonce_len(negotiated_auth_version);
    // Decrypting the other side's message: use the anti-role.
    let nonce = build_nonce(sender_role.anti_role().wire_byte(), meta, nonce_len);
    let params = CcmParams { mac_len, nonce_len };

    let aad = buf[0..header_len].to_vec();
    let mut body = buf[header_len..header_len + body_len].to_vec();
    aead::decrypt_in_place(&aes_key, &params, &nonce, &aad, &mut body)?;

    buf.truncate(header_len);
    buf.extend_from_slice(&body);
    Ok(body.len())
}
