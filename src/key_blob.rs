//! Key blob type shared by the key store (§4.B) and peer state (§4.E):
//! `(type, bytes, tag, role, expiration, association-mode, association-guid)`.

use std::time::{Duration, SystemTime};

use crate::guid::Guid;

/// Who produced a session key's master secret. Also used to build the
/// AES-CCM nonce's role byte (§4.C): the *anti-role* of a key's role is
/// used on the receive side so both ends construct the same nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
    /// Group keys are always `NoRole` (invariant I4): broadcasts must be
    /// decryptable by their own sender.
    NoRole,
}

impl Role {
    pub fn anti_role(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
            Role::NoRole => Role::NoRole,
        }
    }

    /// Byte value used in nonce construction (spec §4.C byte 0).
    pub fn wire_byte(self) -> u8 {
        match self {
            Role::Initiator => 1,
            Role::Responder => 2,
            Role::NoRole => 0,
        }
    }
}

/// Backing key type. Only `Aes` is accepted by the message-crypto path
/// (spec §4.C); the others exist because the key store's binary format
/// (§3, v>=0x0104) carries a `keytype` byte that must round-trip for any
/// stored key, not only AES session keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Aes,
    EcdsaPrivate,
    EcdsaPublic,
    Hmac,
    Generic,
}

impl KeyType {
    pub fn to_wire_byte(self) -> u8 {
        match self {
            KeyType::Generic => 0,
            KeyType::Aes => 1,
            KeyType::EcdsaPrivate => 2,
            KeyType::EcdsaPublic => 3,
            KeyType::Hmac => 4,
        }
    }

    pub fn from_wire_byte(b: u8) -> Option<KeyType> {
        match b {
            0 => Some(KeyType::Generic),
            1 => Some(KeyType::Aes),
            2 => Some(KeyType::EcdsaPrivate),
            3 => Some(KeyType::EcdsaPublic),
            4 => Some(KeyType::Hmac),
            _ => None,
        }
    }
}

/// How a key relates to other keys (membership certificate chains, group
/// keys associated with a head secret, etc). Deleting a `Head` deletes all
/// keys associated to it, recursively (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationMode {
    None,
    Head,
    Member,
    Both,
}

#[derive(Debug, Clone)]
pub struct KeyBlob {
    pub key_type: KeyType,
    pub bytes: Vec<u8>,
    /// Authentication mechanism name that produced this key's master
    /// secret (invariant I2).
    pub tag: String,
    pub role: Role,
    pub expiration: Option<SystemTime>,
    pub association_mode: AssociationMode,
    pub association_guid: Option<Guid>,
}

impl KeyBlob {
    pub fn is_valid(&self) -> bool {
        match self.expiration {
            Some(exp) => SystemTime::now() < exp,
            None => true,
        }
    }

    pub fn with_expiration_in(mut self, ttl: Duration) -> Self {
        self.expiration = Some(SystemTime::now() + ttl);
        self
    }
}

/// Per-message-type authorization mask, 2 bits: `AllowSecureTx` /
/// `AllowSecureRx` (spec §3 `authorizations[4]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthorizationMask {
    pub allow_secure_tx: bool,
    pub allow_secure_rx: bool,
}

impl AuthorizationMask {
    pub fn to_bits(self) -> u8 {
        (self.allow_secure_tx as u8) | ((self.allow_secure_rx as u8) << 1)
    }

    pub fn from_bits(bits: u8) -> Self {
        AuthorizationMask {
            allow_secure_tx: bits & 0b01 != 0,
            allow_secure_rx: bits & 0b10 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub const ALL: [MessageType; 4] = [
        MessageType::MethodCall,
        MessageType::MethodReturn,
        MessageType::Error,
        MessageType::Signal,
    ];

    pub fn index(self) -> usize {
        match self {
            MessageType::MethodCall => 0,
            MessageType::MethodReturn => 1,
            MessageType::Error => 2,
            MessageType::Signal => 3,
        }
    }
}

/// Access rights accompanying a key-store entry, one bitmask per
/// `MessageType` (spec §3, §4.B `(blob, access-rights)`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessRights([AuthorizationMask; 4]);

impl AccessRights {
    pub fn get(&self, mt: MessageType) -> AuthorizationMask {
        self.0[mt.index()]
    }

    pub fn set(&mut self, mt: MessageType, mask: AuthorizationMask) {
        self.0[mt.index()] = mask;
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        for mt in MessageType::ALL.iter() {
            out[mt.index()] = self.0[mt.index()].to_bits();
        }
        out
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        let mut rights = AccessRights::default();
        for mt in MessageType::ALL.iter() {
            rights.0[mt.index()] = AuthorizationMask::from_bits(bytes[mt.index()]);
        }
        rights
    }
}
