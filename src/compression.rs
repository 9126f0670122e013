//! Header-compression token table (spec §4.D), consumed by the external
//! marshaller to abbreviate repeated header fields to a 32-bit token.

use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;

/// The fixed subset of header fields a compression token stands in for.
/// Equality for table lookups is `(member, interface)` only -- spec.md
/// assumes one compression per logical message, so the rest of the fields
/// ride along without being part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompressibleHeaderFields {
    pub interface: String,
    pub member: String,
    pub path: String,
    pub signature: String,
    pub destination: String,
    pub sender: String,
    pub session_id: u32,
    pub ttl: u32,
}

/// Adler-32 of `member || interface`, used as a fast, deliberately weak
/// hash: collisions within one process's member+interface pairs are
/// considered vanishingly rare (spec §4.D). Grounded directly in
/// `original_source/alljoyn_core/src/Adler32.h`.
fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in data {
        a = (a + byte as u32) % MOD_ADLER;
        b = (b + a) % MOD_ADLER;
    }
    (b << 16) | a
}

fn member_interface_key(fields: &CompressibleHeaderFields) -> u32 {
    let mut buf = Vec::with_capacity(fields.member.len() + fields.interface.len());
    buf.extend_from_slice(fields.member.as_bytes());
    buf.extend_from_slice(fields.interface.as_bytes());
    adler32(&buf)
}

#[derive(Default)]
struct Tables {
    forward: HashMap<u32, u32>, // member||interface adler key -> token
    fields_by_token: HashMap<u32, CompressibleHeaderFields>,
}

/// Bidirectional forward (`fields -> token`) / reverse (`token -> fields`)
/// mapping. Mutex-guarded per spec; both maps share one lock so lookups
/// never observe a half-applied insert.
pub struct CompressionRules {
    tables: Mutex<Tables>,
}

impl Default for CompressionRules {
    fn default() -> Self {
        CompressionRules {
            tables: Mutex::new(Tables::default()),
        }
    }
}

impl CompressionRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing token for `fields`, or allocates a fresh
    /// random non-zero 32-bit token not already in use.
    pub fn get_or_allocate_token(&self, fields: CompressibleHeaderFields) -> u32 {
        let key = member_interface_key(&fields);
        let mut tables = self.tables.lock().unwrap();
        if let Some(&token) = tables.forward.get(&key) {
            return token;
        }
        let token = loop {
            let candidate = loop {
                let c = rand::thread_rng().next_u32();
                if c != 0 {
                    break c;
                }
            };
            if !tables.fields_by_token.contains_key(&candidate) {
                break candidate;
            }
        };
        tables.forward.insert(key, token);
        tables.fields_by_token.insert(token, fields);
        token
    }

    pub fn expansion(&self, token: u32) -> Option<CompressibleHeaderFields> {
        self.tables.lock().unwrap().fields_by_token.get(&token).cloned()
    }

    /// Installs a mapping received from a peer. Does nothing if the fields
    /// are already known under a different token -- the table never
    /// overwrites an established mapping.
    pub fn add_expansion(&self, fields: CompressibleHeaderFields, token: u32) {
        let key = member_interface_key(&fields);
        let mut tables = self.tables.lock().unwrap();
        if tables.fields_by_token.contains_key(&token) {
            return;
        }
        tables.forward.entry(key).or_insert(token);
        tables.fields_by_token.insert(token, fields);
    }
}
