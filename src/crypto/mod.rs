//! Crypto building blocks consumed by the higher-level components. SHA-256
//! and AES itself remain "commodity primitives" per spec §1; what lives
//! here is the assembly the spec does mandate: PRF construction, AES-CCM
//! dispatch by negotiated MAC/nonce length, and P-256 ECDH/ECDSA.

pub mod aead;
pub mod ecdhe;
pub mod prf;
