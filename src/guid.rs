//! 128-bit peer identity (spec §3 `guid`, `association-guid`, `sg-id`).

use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn zero() -> Self {
        Guid([0u8; 16])
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Guid(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex-string form used as the key-derivation suffix (`password || guid-string`, §3).
    pub fn to_hex_string(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in &self.0 {
            s.push_str(&format!("{:02X}", b));
        }
        s
    }

    pub(crate) fn high_u64(&self) -> u64 {
        BigEndian::read_u64(&self.0[0..8])
    }

    pub(crate) fn low_u64(&self) -> u64 {
        BigEndian::read_u64(&self.0[8..16])
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.to_hex_string())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_string())
    }
}
