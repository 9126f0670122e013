//! Per-peer record and the table that owns all of them (spec §4.E):
//! GUID, negotiated auth version, unicast/group keys, per-message-type
//! authorizations, replay window, timestamp offset, conversation hashes,
//! membership chains.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::REPLAY_WINDOW_SIZE;
use crate::conversation_hash::ConversationHash;
use crate::guid::Guid;
use crate::key_blob::{AuthorizationMask, KeyBlob, MessageType};

/// Certificate chain a peer supplied for a given membership, keyed by
/// `(membership-serial, issuer-AKI)` (spec §3 `guild_map`).
#[derive(Debug, Clone)]
pub struct GuildMetadata {
    pub chain_der: Vec<Vec<u8>>,
}

/// 128-slot open-addressed replay window (spec §4.E, §3 invariant I5).
/// Accepts serial `s` iff the slot `s mod 128` differs from `s` and lies
/// outside a half-range window looking forward from the stored value.
pub struct ReplayWindow {
    window: [u32; REPLAY_WINDOW_SIZE],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        ReplayWindow {
            window: [0u32; REPLAY_WINDOW_SIZE],
        }
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// `serial == 0` is never valid (spec §3). A gap of up to half the
    /// 32-bit space forward from the stored slot value is tolerated; a
    /// duplicate or a serial falling in the "old half" of the space is
    /// rejected.
    pub fn is_valid_serial(&mut self, serial: u32) -> bool {
        if serial == 0 {
            return false;
        }
        let slot = (serial as usize) % REPLAY_WINDOW_SIZE;
        let stored = self.window[slot];
        if stored == serial {
            return false;
        }
        // "lies within half the 32-bit range ahead of s" -> reject if the
        // stored value is within (stored, stored + 2^31) of serial when
        // walking forward from serial, i.e. serial is "behind" stored.
        let forward_gap = serial.wrapping_sub(stored);
        if stored != 0 && forward_gap >= (1u32 << 31) {
            // serial is behind stored by more than the accepted half-range.
            return false;
        }
        self.window[slot] = serial;
        true
    }

    pub fn window_size(&self) -> usize {
        REPLAY_WINDOW_SIZE
    }
}

/// Combines a foreign peer timestamp and our local clock into a single
/// estimated sender-local-time offset (spec §3). Clamped down instantly
/// when a lower estimate arrives; incremented by 1 every tick otherwise
/// (approximating real clock drift between ticks).
#[derive(Debug, Clone, Copy)]
pub struct ClockEstimator {
    offset: Option<i32>,
    last_tick: Option<SystemTime>,
}

impl Default for ClockEstimator {
    fn default() -> Self {
        ClockEstimator {
            offset: None,
            last_tick: None,
        }
    }
}

impl ClockEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> i32 {
        self.offset.unwrap_or(0)
    }

    /// Call on receipt of a foreign timestamp.
    pub fn observe_foreign_timestamp(&mut self, candidate_offset: i32, now: SystemTime) {
        match self.offset {
            None => {
                self.offset = Some(candidate_offset);
            }
            Some(current) if candidate_offset < current => {
                self.offset = Some(candidate_offset);
            }
            _ => {}
        }
        self.last_tick = Some(now);
    }

    /// Call periodically (spec: every 10s, see `CLOCK_OFFSET_TICK`).
    pub fn tick(&mut self, now: SystemTime) {
        let due = match self.last_tick {
            None => true,
            Some(last) => now.duration_since(last).unwrap_or_default() >= crate::config::CLOCK_OFFSET_TICK,
        };
        if due {
            if let Some(offset) = self.offset.as_mut() {
                *offset = offset.saturating_add(1);
            }
            self.last_tick = Some(now);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    InProgress,
}

pub struct PeerState {
    pub guid: Guid,
    /// Upper 16 bits = protocol version, lower byte = key-generation scheme.
    pub auth_version: u32,
    pub unicast_key: Option<KeyBlob>,
    pub group_key: Option<KeyBlob>,
    pub authorizations: [AuthorizationMask; 4],
    pub replay_window: ReplayWindow,
    pub clock: ClockEstimator,
    pub initiator_hash: Mutex<ConversationHash>,
    pub responder_hash: Mutex<ConversationHash>,
    pub guild_map: HashMap<(String, String), GuildMetadata>,
    auth_gate: Arc<(Mutex<AuthPhase>, Condvar)>,
    /// Messages queued while authentication to this peer is outstanding
    /// (spec §4.G). Capped; overflow drops the oldest.
    pub pending_auth_messages: Vec<Vec<u8>>,
}

impl Default for PeerState {
    fn default() -> Self {
        PeerState {
            guid: Guid::zero(),
            auth_version: 0,
            unicast_key: None,
            group_key: None,
            authorizations: [AuthorizationMask::default(); 4],
            replay_window: ReplayWindow::new(),
            clock: ClockEstimator::new(),
            initiator_hash: Mutex::new(ConversationHash::new()),
            responder_hash: Mutex::new(ConversationHash::new()),
            guild_map: HashMap::new(),
            auth_gate: Arc::new((Mutex::new(AuthPhase::Idle), Condvar::new())),
            pending_auth_messages: Vec::new(),
        }
    }
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff `unicast_key.is_valid()` (invariant I3).
    pub fn is_secure(&self) -> bool {
        self.unicast_key.as_ref().map(|k| k.is_valid()).unwrap_or(false)
    }

    pub fn authorization(&self, mt: MessageType) -> AuthorizationMask {
        self.authorizations[mt.index()]
    }

    pub fn set_authorization(&mut self, mt: MessageType, mask: AuthorizationMask) {
        self.authorizations[mt.index()] = mask;
    }

    /// Marks authentication in progress for this peer. Returns `Err` if
    /// another thread already holds it and `wait` is false; otherwise
    /// blocks until the in-progress authentication finishes.
    pub fn begin_authentication(&self, wait: bool) -> crate::error::Result<bool> {
        let (lock, cvar) = &*self.auth_gate;
        let mut phase = lock.lock().unwrap();
        if *phase == AuthPhase::InProgress {
            if !wait {
                return Err(crate::error::Error::WouldBlock);
            }
            while *phase == AuthPhase::InProgress {
                phase = cvar.wait(phase).unwrap();
            }
            // The other authentication finished; caller doesn't need to
            // run its own.
            return Ok(false);
        }
        *phase = AuthPhase::InProgress;
        Ok(true)
    }

    /// Releases the authentication gate and wakes all waiters (spec §5:
    /// `auth_event` is "signaled once to release all waiters").
    pub fn end_authentication(&self) {
        let (lock, cvar) = &*self.auth_gate;
        let mut phase = lock.lock().unwrap();
        *phase = AuthPhase::Idle;
        cvar.notify_all();
    }

    pub fn queue_pending_auth_message(&mut self, msg: Vec<u8>, cap: usize) {
        if self.pending_auth_messages.len() >= cap {
            tracing::warn!("dropping oldest pending-auth message: queue at capacity {}", cap);
            self.pending_auth_messages.remove(0);
        }
        self.pending_auth_messages.push(msg);
    }

    pub fn take_pending_auth_messages(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pending_auth_messages)
    }
}

/// Map from bus-name to peer state, protected by one lock (spec §4.E).
/// The null-name peer always exists and holds the local group key.
pub struct PeerStateTable {
    states: Mutex<HashMap<String, Arc<Mutex<PeerState>>>>,
    local_group_key: KeyBlob,
}

pub const NULL_PEER_NAME: &str = "";

impl PeerStateTable {
    pub fn new(local_group_key: KeyBlob) -> Self {
        let table = PeerStateTable {
            states: Mutex::new(HashMap::new()),
            local_group_key,
        };
        let mut null_state = PeerState::new();
        null_state.group_key = Some(table.local_group_key.clone());
        table
            .states
            .lock()
            .unwrap()
            .insert(NULL_PEER_NAME.to_string(), Arc::new(Mutex::new(null_state)));
        table
    }

    pub fn get(&self, bus_name: &str, create: bool) -> Option<Arc<Mutex<PeerState>>> {
        let mut states = self.states.lock().unwrap();
        if let Some(existing) = states.get(bus_name) {
            return Some(existing.clone());
        }
        if !create {
            return None;
        }
        let state = Arc::new(Mutex::new(PeerState::new()));
        states.insert(bus_name.to_string(), state.clone());
        Some(state)
    }

    /// Makes `alias` share `canonical`'s underlying state (used when a
    /// well-known name resolves to a unique name).
    pub fn alias(&self, canonical: &str, alias: &str) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get(canonical).cloned() {
            states.insert(alias.to_string(), state);
        }
    }

    /// Drops `name` from the table without destroying the shared state if
    /// another alias still references it (spec §4.G step 4 re-resolution
    /// support).
    pub fn delete_name(&self, name: &str) {
        let mut states = self.states.lock().unwrap();
        states.remove(name);
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.states.lock().unwrap().contains_key(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replay_accepts_increasing_serials_and_rejects_dupes() {
        let mut window = ReplayWindow::new();
        for s in 1u32..=200 {
            assert!(window.is_valid_serial(s), "serial {} should be accepted", s);
        }
        assert!(!window.is_valid_serial(5));
    }

    #[test]
    fn replay_accepts_large_forward_jump_then_rejects_dup() {
        let mut window = ReplayWindow::new();
        for s in 1u32..=10 {
            assert!(window.is_valid_serial(s));
        }
        // A jump of 2^30 stays inside the accepted half-open range
        // [stored, stored + 2^31) ahead of the slot's last-seen serial (5),
        // and lands back in the same slot (2^30 % REPLAY_WINDOW_SIZE == 0).
        let jumped = 5 + (1u32 << 30);
        assert!(window.is_valid_serial(jumped));
        assert!(!window.is_valid_serial(jumped));
    }

    #[test]
    fn zero_serial_always_rejected() {
        let mut window = ReplayWindow::new();
        assert!(!window.is_valid_serial(0));
    }

    #[test]
    fn null_peer_exists_and_holds_group_key() {
        let group_key = crate::key_blob::KeyBlob {
            key_type: crate::key_blob::KeyType::Aes,
            bytes: vec![1u8; 16],
            tag: "LOCAL".into(),
            role: crate::key_blob::Role::NoRole,
            expiration: None,
            association_mode: crate::key_blob::AssociationMode::None,
            association_guid: None,
        };
        let table = PeerStateTable::new(group_key.clone());
        let state = table.get(NULL_PEER_NAME, false).unwrap();
        assert_eq!(state.lock().unwrap().group_key.as_ref().unwrap().bytes, group_key.bytes);
    }

    #[test]
    fn alias_shares_underlying_state() {
        let table = PeerStateTable::new(crate::key_blob::KeyBlob {
            key_type: crate::key_blob::KeyType::Aes,
            bytes: vec![0u8; 16],
            tag: "x".into(),
            role: crate::key_blob::Role::NoRole,
            expiration: None,
            association_mode: crate::key_blob::AssociationMode::None,
            association_guid: None,
        });
        let canonical = table.get(":1.42", true).unwrap();
        canonical.lock().unwrap().auth_version = 0x0002_0001;
        table.alias(":1.42", "com.example.Service");
        let alias = table.get("com.example.Service", false).unwrap();
        assert_eq!(alias.lock().unwrap().auth_version, 0x0002_0001);
    }

    #[test]
    fn pending_auth_queue_evicts_oldest_past_capacity() {
        let mut state = PeerState::new();
        for i in 0u8..5 {
            state.queue_pending_auth_message(vec![i], 3);
        }
        assert_eq!(state.pending_auth_messages, vec![vec![2], vec![3], vec![4]]);
        assert_eq!(state.take_pending_auth_messages(), vec![vec![2], vec![3], vec![4]]);
        assert!(state.pending_auth_messages.is_empty());
    }

    #[test]
    fn clock_offset_clamps_down_on_lower_estimate() {
        let mut clock = ClockEstimator::new();
        let now = SystemTime::now();
        clock.observe_foreign_timestamp(10, now);
        assert_eq!(clock.offset(), 10);
        clock.observe_foreign_timestamp(20, now);
        assert_eq!(clock.offset(), 10, "higher estimate should not move the offset up");
        clock.observe_foreign_timestamp(3, now);
        assert_eq!(clock.offset(), 3, "lower estimate clamps down instantly");
    }
}
