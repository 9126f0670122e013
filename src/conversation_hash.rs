//! Running SHA-256 transcript of an authentication exchange (spec §4.A).
//!
//! Two independent directions ("initiator" and "responder") are modeled as
//! two instances of [`ConversationHash`], each owned by its own mutex in
//! [`crate::peer_state::PeerState`] (the hash locks are leaf locks per §5).

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Minimum conversation version at which an `update_*` call is relevant.
/// v1-tagged updates apply only when the negotiated auth version is below
/// `CONVERSATION_V4_AUTH_VERSION`; v4-tagged updates apply only at or above
/// it. This lets legacy and modern transcripts share one code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationVersion {
    V1,
    V4,
}

impl ConversationVersion {
    fn applies(self, negotiated_auth_version: u32) -> bool {
        match self {
            ConversationVersion::V1 => {
                negotiated_auth_version < crate::config::CONVERSATION_V4_AUTH_VERSION
            }
            ConversationVersion::V4 => {
                negotiated_auth_version >= crate::config::CONVERSATION_V4_AUTH_VERSION
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashState {
    Uninitialized,
    Live,
    Closed,
}

/// One direction's running transcript hash.
pub struct ConversationHash {
    hasher: Sha256,
    state: HashState,
    sensitive: bool,
}

impl Default for ConversationHash {
    fn default() -> Self {
        ConversationHash {
            hasher: Sha256::new(),
            state: HashState::Uninitialized,
            sensitive: false,
        }
    }
}

impl ConversationHash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called before any `update_*`/`get_digest` call (invariant I1).
    pub fn init(&mut self) -> Result<()> {
        self.hasher = Sha256::new();
        self.state = HashState::Live;
        Ok(())
    }

    pub fn set_sensitive(&mut self, mode: bool) {
        self.sensitive = mode;
    }

    fn require_live(&self) -> Result<()> {
        match self.state {
            HashState::Live => Ok(()),
            HashState::Uninitialized => Err(Error::CryptoError),
            HashState::Closed => Err(Error::ConversationHashClosed),
        }
    }

    pub fn update_byte(&mut self, byte: u8, min_version: ConversationVersion, negotiated: u32) -> Result<()> {
        self.require_live()?;
        if !min_version.applies(negotiated) {
            return Ok(());
        }
        tracing::trace!(byte, "conversation hash: update_byte");
        self.hasher.update(&[byte]);
        Ok(())
    }

    /// `include_size`: when true a little-endian u32 length precedes the
    /// payload (required so v4 transcripts frame each contribution
    /// unambiguously).
    pub fn update_bytes(
        &mut self,
        buf: &[u8],
        include_size: bool,
        min_version: ConversationVersion,
        negotiated: u32,
    ) -> Result<()> {
        self.require_live()?;
        if !min_version.applies(negotiated) {
            return Ok(());
        }
        if self.sensitive {
            tracing::trace!(len = buf.len(), "conversation hash: update_bytes (sensitive, buffer elided)");
        } else {
            tracing::trace!(len = buf.len(), buf = ?buf, "conversation hash: update_bytes");
        }
        if include_size {
            let mut size_buf = [0u8; 4];
            LittleEndian::write_u32(&mut size_buf, buf.len() as u32);
            self.hasher.update(&size_buf);
        }
        // Sensitive mode only changes what is logged, never what is hashed.
        self.hasher.update(buf);
        Ok(())
    }

    pub fn update_string(&mut self, s: &str, min_version: ConversationVersion, negotiated: u32) -> Result<()> {
        self.update_bytes(s.as_bytes(), true, min_version, negotiated)
    }

    /// Feeds the raw, unmarshaled wire bytes of a message -- headers
    /// included -- into the hash. This is the definition of "the message"
    /// in the transcript (spec §9 open question: preserved exactly).
    pub fn update_message(&mut self, raw_wire_bytes: &[u8], min_version: ConversationVersion, negotiated: u32) -> Result<()> {
        self.update_bytes(raw_wire_bytes, true, min_version, negotiated)
    }

    /// Returns the current digest. If `keep_alive` is false, the hash is
    /// closed and further updates return `ConversationHashClosed`.
    pub fn get_digest(&mut self, keep_alive: bool) -> Result<[u8; 32]> {
        self.require_live()?;
        let digest = self.hasher.clone().finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        if !keep_alive {
            self.state = HashState::Closed;
        }
        Ok(out)
    }

    pub fn free(&mut self) {
        self.hasher = Sha256::new();
        self.state = HashState::Uninitialized;
    }
}
