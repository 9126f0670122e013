//! Tunables named throughout the spec, collected in one place the way a
//! deployment would override them.

use std::time::Duration;

/// `PREFERRED_AUTH_VERSION` upper 16 bits = protocol version, lower byte =
/// key-generation scheme (§3, §6).
pub const MIN_AUTH_VERSION: u16 = 1;
pub const MAX_AUTH_VERSION: u16 = 2;
pub const PREFERRED_AUTH_VERSION: u32 = ((MAX_AUTH_VERSION as u32) << 16) | 0x01;

/// Conversation-hash v4 transcripts are gated behind this value compared
/// against the full negotiated 32-bit `auth_version`.
pub const CONVERSATION_V4_AUTH_VERSION: u32 = 4 << 16;

/// Key-generation scheme thresholds (§4.C).
pub const MIN_AUTH_VERSION_MACLEN16: u32 = 2 << 16;
pub const MIN_AUTH_VERSION_FULLNONCELEN: u32 = 2 << 16;

pub const MAC_LEN_MODERN: usize = 16;
pub const MAC_LEN_LEGACY: usize = 8;
pub const NONCE_LEN_MODERN: usize = 13;
pub const NONCE_LEN_LEGACY: usize = 5;
pub const MAX_NONCE_LEN: usize = 13;

pub const REPLAY_WINDOW_SIZE: usize = 128;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(120);
pub const EXPANSION_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on messages queued on a peer awaiting completion of its
/// authentication handshake. Not named numerically by the spec; chosen so
/// a hostile or unresponsive peer cannot grow memory unbounded while an
/// authentication is outstanding.
pub const MAX_PENDING_AUTH_MSGS: usize = 32;

/// Work-queue depth for the peer object's single-threaded dispatcher (§4.G, §5).
pub const WORK_QUEUE_DEPTH: usize = 3;

/// Interval at which `clock_offset` is incremented absent a new foreign
/// timestamp (§3).
pub const CLOCK_OFFSET_TICK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub preferred_auth_version: u32,
    pub default_timeout: Duration,
    pub auth_timeout: Duration,
    pub expansion_timeout: Duration,
    pub max_pending_auth_msgs: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            preferred_auth_version: PREFERRED_AUTH_VERSION,
            default_timeout: DEFAULT_TIMEOUT,
            auth_timeout: AUTH_TIMEOUT,
            expansion_timeout: EXPANSION_TIMEOUT,
            max_pending_auth_msgs: MAX_PENDING_AUTH_MSGS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyStoreConfig {
    pub shared: bool,
    pub path: std::path::PathBuf,
}
