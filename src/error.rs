//! Crate-wide error taxonomy (spec §7).
//!
//! Error kinds are grouped by visibility: transient (retry internally or
//! surface for retry), fatal-for-this-exchange (reported once via
//! `AuthenticationComplete(success=false)`), policy (surfaced as a bus
//! error reply), storage, and decryption (all crypto failures collapse to
//! `MessageDecryptionFailed` so nothing about *why* decryption failed
//! leaks to the caller).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum Error {
    // -- transient --
    #[error("would block: authentication already in progress")]
    WouldBlock,
    #[error("authentication pending")]
    AuthenticationPending,

    // -- fatal for this exchange --
    #[error("authentication failed")]
    AuthFail,
    #[error("user or application rejected the credential")]
    AuthUserReject,
    #[error("auth version mismatch")]
    AuthVersionMismatch,
    #[error("no common authentication mechanism")]
    NoAuthenticationMechanism,
    #[error("requested key is unavailable")]
    KeyUnavailable,
    #[error("incompatible peer auth version")]
    PeerAuthVersionMismatch,

    // -- policy --
    #[error("permission denied")]
    PermissionDenied,
    #[error("policy version is not newer than the installed policy")]
    PolicyNotNewer,
    #[error("management session already started")]
    ManagementAlreadyStarted,
    #[error("management session not started")]
    ManagementNotStarted,
    #[error("digest mismatch")]
    DigestMismatch,
    #[error("duplicate certificate")]
    DuplicateCertificate,
    #[error("certificate not found")]
    CertificateNotFound,
    #[error("invalid certificate")]
    InvalidCertificate,
    #[error("invalid certificate usage")]
    InvalidCertificateUsage,

    // -- storage --
    #[error("key store is not loaded")]
    KeystoreNotLoaded,
    #[error("key has expired")]
    KeyExpired,
    #[error("key store is corrupt")]
    CorruptKeystore,
    #[error("key store version mismatch")]
    KeystoreVersionMismatch,

    // -- decryption (all crypto-level failures collapse here) --
    #[error("message decryption failed")]
    MessageDecryptionFailed,

    // -- misc crate-internal, not part of the §7 taxonomy proper but
    // needed to make illegal states unrepresentable --
    #[error("key blob operation invalid for this key type")]
    KeyBlobOpInvalid,
    #[error("bus is stopping")]
    BusStopping,
    #[error("conversation hash was already finalized")]
    ConversationHashClosed,
    #[error("a cryptographic primitive failed")]
    CryptoError,
    #[error("wire codec error: {0}")]
    WireCodec(String),
}

pub type Result<T> = std::result::Result<T, Error>;
