//! Pluggable authentication-suite engines (spec §4.F): key agreement,
//! verifier exchange, master-secret persistence.
//!
//! `original_source/alljoyn_core/src/KeyExchanger.{h,cc}` only carries the
//! ECDHE family (`KeyExchangerECDHE{,_NULL,_PSK,_ECDSA}`); SASL
//! `Anonymous`/`External` are grounded in the same file's generic
//! `KeyExchanger` base (verifier-only, no key agreement), and
//! `SrpKeyx`/`SrpLogon`/`Gssapi` are not implemented in the retrieved
//! source at all -- see SPEC_FULL.md for why those three are present only
//! as inert `Mechanism` values.

use subtle::ConstantTimeEq;

use crate::config::CONVERSATION_V4_AUTH_VERSION;
use crate::conversation_hash::{ConversationHash, ConversationVersion};
use crate::crypto::ecdhe::EphemeralKeyPair;
use crate::crypto::prf;
use crate::error::{Error, Result};
use crate::key_blob::{AssociationMode, KeyBlob, KeyType, Role};

pub const AUTH_KEYX_ANONYMOUS: u32 = 0x0001_0000;
pub const AUTH_KEYX_EXTERNAL: u32 = 0x0002_0000;
pub const AUTH_KEYX_SRP: u32 = 0x0008_0000;
pub const AUTH_KEYX_SRP_LOGON: u32 = 0x0010_0000;
pub const AUTH_KEYX_ECDHE: u32 = 0x0040_0000;
pub const AUTH_KEYX_GSSAPI: u32 = 0x0080_0000;

pub const AUTH_SUITE_ANONYMOUS: u32 = AUTH_KEYX_ANONYMOUS | 0x0001;
pub const AUTH_SUITE_EXTERNAL: u32 = AUTH_KEYX_EXTERNAL | 0x0002;
pub const AUTH_SUITE_SRP_KEYX: u32 = AUTH_KEYX_SRP | 0x0008;
pub const AUTH_SUITE_SRP_LOGON: u32 = AUTH_KEYX_SRP_LOGON | 0x0010;
pub const AUTH_SUITE_ECDHE_NULL: u32 = AUTH_KEYX_ECDHE | 0x0001;
pub const AUTH_SUITE_ECDHE_PSK: u32 = AUTH_KEYX_ECDHE | 0x0002;
pub const AUTH_SUITE_ECDHE_ECDSA: u32 = AUTH_KEYX_ECDHE | 0x0004;
pub const AUTH_SUITE_GSSAPI: u32 = AUTH_KEYX_GSSAPI | 0x0080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Anonymous,
    External,
    SrpKeyx,
    SrpLogon,
    EcdheNull,
    EcdhePsk,
    EcdheEcdsa,
    Gssapi,
}

impl Mechanism {
    pub fn suite(self) -> u32 {
        match self {
            Mechanism::Anonymous => AUTH_SUITE_ANONYMOUS,
            Mechanism::External => AUTH_SUITE_EXTERNAL,
            Mechanism::SrpKeyx => AUTH_SUITE_SRP_KEYX,
            Mechanism::SrpLogon => AUTH_SUITE_SRP_LOGON,
            Mechanism::EcdheNull => AUTH_SUITE_ECDHE_NULL,
            Mechanism::EcdhePsk => AUTH_SUITE_ECDHE_PSK,
            Mechanism::EcdheEcdsa => AUTH_SUITE_ECDHE_ECDSA,
            Mechanism::Gssapi => AUTH_SUITE_GSSAPI,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mechanism::Anonymous => "ANONYMOUS",
            Mechanism::External => "EXTERNAL",
            Mechanism::SrpKeyx => "ALLJOYN_SRP_KEYX",
            Mechanism::SrpLogon => "ALLJOYN_SRP_LOGON",
            Mechanism::EcdheNull => "ALLJOYN_ECDHE_NULL",
            Mechanism::EcdhePsk => "ALLJOYN_ECDHE_PSK",
            Mechanism::EcdheEcdsa => "ALLJOYN_ECDHE_ECDSA",
            Mechanism::Gssapi => "GSSAPI",
        }
    }

    pub fn uses_ecdhe(self) -> bool {
        self.suite() & AUTH_KEYX_ECDHE != 0
    }

    /// `versions >= 2 with ECDHE bits set use the §4.F ECDHE engines; else
    /// SASL` (spec §4.G step 7).
    pub fn select_for(negotiated_version: u16, suite_mask: u32) -> Option<Mechanism> {
        const CANDIDATES: [Mechanism; 8] = [
            Mechanism::EcdheEcdsa,
            Mechanism::EcdheNull,
            Mechanism::EcdhePsk,
            Mechanism::Anonymous,
            Mechanism::External,
            Mechanism::SrpKeyx,
            Mechanism::SrpLogon,
            Mechanism::Gssapi,
        ];
        for m in CANDIDATES.iter() {
            let bit_set = suite_mask & m.suite() != 0;
            let version_ok = if m.uses_ecdhe() { negotiated_version >= 2 } else { true };
            if bit_set && version_ok {
                return Some(*m);
            }
        }
        None
    }
}

/// Intersects `our_supported` with `remote_mask`, server order (spec §4.G
/// step 8 "Suite negotiation"). `effective_count = max(supported, 1)` even
/// with zero overlap (§9 open question: preserved for interop, returning
/// a single zero suite).
pub fn negotiate_suites(our_supported: &[Mechanism], remote_mask: &[u32]) -> Vec<Mechanism> {
    let matches: Vec<Mechanism> = our_supported
        .iter()
        .copied()
        .filter(|m| remote_mask.contains(&m.suite()))
        .collect();
    if matches.is_empty() && !our_supported.is_empty() {
        // Single zero-suite reply, per the open question.
        return Vec::new();
    }
    matches
}

/// Hash update applicability for a wire message/value exchanged during
/// key exchange: v1 feeds just the suite and public values, v4 feeds the
/// entire wire message (spec §4.F).
pub fn feed_hash_v1(hash: &mut ConversationHash, is_initiator_direction: bool, data: &[u8], negotiated: u32) -> Result<()> {
    let _ = is_initiator_direction;
    hash.update_bytes(data, false, ConversationVersion::V1, negotiated)
}

pub fn feed_hash_v4(hash: &mut ConversationHash, data: &[u8], negotiated: u32) -> Result<()> {
    hash.update_message(data, ConversationVersion::V4, negotiated)
}

/// ECDHE key-agreement + verifier engine, shared by NULL/PSK/ECDSA (spec
/// §4.F "ECDHE variants").
pub struct EcdheEngine {
    pub mechanism: Mechanism,
    keypair: EphemeralKeyPair,
    peer_public_point: Option<Vec<u8>>,
    master_secret: Option<[u8; 48]>,
    pub psk_name: String,
    pub psk_value: String,
    /// Secret expiration, clamped to the leaf certificate's `notAfter` for
    /// the ECDSA variant.
    pub secret_expiration_secs: u32,
}

impl EcdheEngine {
    pub fn new(mechanism: Mechanism) -> Self {
        EcdheEngine {
            mechanism,
            keypair: EphemeralKeyPair::generate(),
            peer_public_point: None,
            master_secret: None,
            psk_name: "<anonymous>".into(),
            psk_value: " ".into(),
            secret_expiration_secs: 3600,
        }
    }

    /// Initiator: the local public value to send with the auth mask.
    /// Legacy peers (auth version 2) use a single-byte curve-type prefix
    /// plus an alternate point encoding; modern peers (>= 4) use the
    /// uncompressed SEC1 point directly (spec §4.F legacy detection).
    pub fn local_public_value(&self, peer_auth_version: u16) -> Vec<u8> {
        let point = self.keypair.public_point();
        if peer_auth_version < 4 {
            const NIST_P256_CURVE_TYPE: u8 = 0;
            let mut out = Vec::with_capacity(1 + point.len());
            out.push(NIST_P256_CURVE_TYPE);
            out.extend_from_slice(&point);
            out
        } else {
            point
        }
    }

    pub fn read_peer_public_value(&mut self, wire: &[u8], peer_auth_version: u16) -> Result<()> {
        let point = if peer_auth_version < 4 {
            if wire.is_empty() {
                return Err(Error::CryptoError);
            }
            wire[1..].to_vec()
        } else {
            wire.to_vec()
        };
        self.peer_public_point = Some(point);
        Ok(())
    }

    pub fn generate_master_secret(&mut self) -> Result<()> {
        let peer_point = self.peer_public_point.as_ref().ok_or(Error::CryptoError)?;
        let shared_hash = self.keypair.agree(peer_point)?;
        self.master_secret = Some(prf::derive_master_secret(&shared_hash));
        Ok(())
    }

    pub fn master_secret(&self) -> Option<&[u8; 48]> {
        self.master_secret.as_ref()
    }

    /// `PRF(master_secret, "client finished"/"server finished",
    /// SHA-256(conversation-hash), 12)`. For ECDHE-PSK in v4, the PSK name
    /// and value are concatenated into the seed directly (not hashed into
    /// the transcript) so a name/PSK mismatch fails authentication cleanly
    /// instead of desynchronizing the hash (spec §4.F).
    pub fn local_verifier(&self, label: &str, conversation_digest: &[u8; 32], key_gen_version: u8, negotiated_auth_version: u32) -> Result<[u8; 12]> {
        let master_secret = self.master_secret.ok_or(Error::CryptoError)?;
        if self.mechanism == Mechanism::EcdhePsk && negotiated_auth_version >= CONVERSATION_V4_AUTH_VERSION {
            let mut seed = self.psk_name.as_bytes().to_vec();
            seed.extend_from_slice(self.psk_value.as_bytes());
            let bytes = if key_gen_version == 0 {
                crate::crypto::prf::tls_prf(&master_secret, label, &seed, 12)
            } else {
                crate::crypto::prf::ccm_prf(&master_secret, label, &seed, 12)
            };
            let mut out = [0u8; 12];
            out.copy_from_slice(&bytes);
            Ok(out)
        } else {
            Ok(prf::derive_verifier(&master_secret, label, conversation_digest, key_gen_version))
        }
    }

    /// Constant-time verifier comparison (spec §4.F).
    pub fn check_verifier(local: &[u8; 12], remote: &[u8; 12]) -> bool {
        local.ct_eq(remote).into()
    }
}

/// Structured persisted record written by `store_master_secret` (spec
/// §4.F): `version=1 | master-secret 48B | ecc-pubkey | manifest-digest
/// 32B | n-issuers u8 | issuer-keys[]`. Non-ECDSA suites persist only the
/// master secret (the older short format).
#[derive(Debug, Clone)]
pub struct MasterSecretRecord {
    pub master_secret: [u8; 48],
    pub ecc_pub_key: Option<Vec<u8>>,
    pub manifest_digest: Option<[u8; 32]>,
    pub issuer_keys: Vec<Vec<u8>>,
}

impl MasterSecretRecord {
    pub fn short(master_secret: [u8; 48]) -> Self {
        MasterSecretRecord {
            master_secret,
            ecc_pub_key: None,
            manifest_digest: None,
            issuer_keys: Vec::new(),
        }
    }

    /// Recovers just the master secret from a previously persisted blob,
    /// skipping the version byte. `None` if `blob` isn't one of our
    /// records (wrong key type or truncated).
    pub fn master_secret_from_blob(blob: &KeyBlob) -> Option<[u8; 48]> {
        if blob.key_type != KeyType::Generic || blob.bytes.len() < 49 {
            return None;
        }
        let mut master_secret = [0u8; 48];
        master_secret.copy_from_slice(&blob.bytes[1..49]);
        Some(master_secret)
    }

    pub fn to_key_blob(&self, tag: &str, role: Role, expiration: Option<std::time::SystemTime>) -> KeyBlob {
        let mut bytes = Vec::new();
        bytes.push(1u8); // version
        bytes.extend_from_slice(&self.master_secret);
        if let Some(pub_key) = &self.ecc_pub_key {
            let mut len_buf = [0u8; 2];
            byteorder::LittleEndian::write_u16(&mut len_buf, pub_key.len() as u16);
            bytes.extend_from_slice(&len_buf);
            bytes.extend_from_slice(pub_key);
            if let Some(digest) = &self.manifest_digest {
                bytes.extend_from_slice(digest);
            }
            bytes.push(self.issuer_keys.len() as u8);
            for key in &self.issuer_keys {
                let mut klen = [0u8; 2];
                byteorder::LittleEndian::write_u16(&mut klen, key.len() as u16);
                bytes.extend_from_slice(&klen);
                bytes.extend_from_slice(key);
            }
        }
        KeyBlob {
            key_type: KeyType::Generic,
            bytes,
            tag: tag.to_string(),
            role,
            expiration,
            association_mode: AssociationMode::None,
            association_guid: None,
        }
    }
}

use byteorder::ByteOrder;

/// SASL account-name verifier exchange with no key agreement (spec §4.F:
/// "Anonymous and External ... skip key agreement and authenticate via
/// account-name verifier exchange only").
pub fn sasl_verifier(account_name: &str, conversation_digest: &[u8; 32]) -> [u8; 12] {
    let out = prf::tls_prf(account_name.as_bytes(), "sasl verifier", conversation_digest, 12);
    let mut verifier = [0u8; 12];
    verifier.copy_from_slice(&out);
    verifier
}
