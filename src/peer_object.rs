//! The per-bus orchestrator: `HeaderCompression`/`Authentication`/
//! `Session` bus-method dispatch, driven off a bounded single-threaded
//! work queue so authentication never blocks the transport read thread
//! (spec §4.G, §5).

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::compression::{CompressibleHeaderFields, CompressionRules};
use crate::config::{PeerConfig, WORK_QUEUE_DEPTH};
use crate::crypto::prf;
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::key_blob::{AccessRights, KeyBlob, KeyType, Role};
use crate::key_exchanger::{self, EcdheEngine, MasterSecretRecord, Mechanism};
use crate::key_store::KeyStore;
use crate::message_crypto::{self, MessageCryptoMeta};
use crate::peer_state::{PeerState, PeerStateTable};
use crate::wire::WireCodec;

/// A suspension-point RPC to a specific peer (spec §5): any call here may
/// block the calling worker thread, which is exactly why callers reach
/// this crate's API through the work queue rather than directly.
pub trait PeerRpc: Send + Sync {
    fn call(&self, peer_name: &str, method: &str, payload: &[u8], timeout: Duration) -> Result<Vec<u8>>;
}

pub trait SecurityViolationListener: Send + Sync {
    fn on_security_violation(&self, peer_name: &str, error: &Error);
}

/// Hands back messages that arrived for a peer while it was mid-handshake
/// once that handshake completes, so the caller can re-route them to the
/// transport (spec §4.G step 10: "flush any messages queued on
/// `msgs_pending_auth` whose destination aliases this peer").
pub trait MessageRedeliveryListener: Send + Sync {
    fn redeliver(&self, peer_name: &str, messages: Vec<Vec<u8>>);
}

/// Work-queue item tags (spec §9: "model as a tagged variant for the
/// work-queue item"). Each variant carries its own one-shot reply
/// channel since the payload/result shapes differ.
enum WorkItem {
    Authenticate {
        peer_name: String,
        wait: bool,
        reply: SyncSender<Result<()>>,
    },
    ExpandHeader {
        peer_name: String,
        token: u32,
        reply: SyncSender<Result<()>>,
    },
}

struct Shared {
    local_guid: Guid,
    config: PeerConfig,
    peer_states: Arc<PeerStateTable>,
    key_store: Arc<Mutex<KeyStore>>,
    compression: Arc<CompressionRules>,
    codec: Arc<dyn WireCodec>,
    rpc: Arc<dyn PeerRpc>,
    security_listener: Option<Arc<dyn SecurityViolationListener>>,
    redelivery_listener: Option<Arc<dyn MessageRedeliveryListener>>,
    mechanisms: Vec<Mechanism>,
    /// Messages queued by compression token awaiting `GetExpansion`
    /// (spec §4.G "Expansion handling").
    pending_expansion: Mutex<HashMap<u32, Vec<Vec<u8>>>>,
}

pub struct PeerObject {
    shared: Arc<Shared>,
    work_tx: Mutex<Option<SyncSender<WorkItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeerObject {
    pub fn new(
        local_guid: Guid,
        config: PeerConfig,
        peer_states: Arc<PeerStateTable>,
        key_store: Arc<Mutex<KeyStore>>,
        compression: Arc<CompressionRules>,
        codec: Arc<dyn WireCodec>,
        rpc: Arc<dyn PeerRpc>,
        security_listener: Option<Arc<dyn SecurityViolationListener>>,
        redelivery_listener: Option<Arc<dyn MessageRedeliveryListener>>,
        mechanisms: Vec<Mechanism>,
    ) -> Self {
        let shared = Arc::new(Shared {
            local_guid,
            config,
            peer_states,
            key_store,
            compression,
            codec,
            rpc,
            security_listener,
            redelivery_listener,
            mechanisms,
            pending_expansion: Mutex::new(HashMap::new()),
        });

        let (tx, rx): (SyncSender<WorkItem>, Receiver<WorkItem>) = mpsc::sync_channel(WORK_QUEUE_DEPTH);
        let worker_shared = shared.clone();
        let handle = std::thread::spawn(move || {
            while let Ok(item) = rx.recv() {
                worker_shared.dispatch(item);
            }
        });

        PeerObject {
            shared,
            work_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        }
    }

    fn enqueue(&self, build: impl FnOnce(SyncSender<Result<()>>) -> WorkItem) -> Result<Result<()>> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let item = build(reply_tx);
        {
            let guard = self.work_tx.lock().unwrap();
            match guard.as_ref() {
                Some(tx) => tx.send(item).map_err(|_| Error::BusStopping)?,
                None => return Err(Error::BusStopping),
            }
        }
        reply_rx.recv().map_err(|_| Error::BusStopping)
    }

    /// Authenticates `peer_name` as the initiator (spec §4.G steps 1-10).
    pub fn authenticate_peer(&self, peer_name: &str, wait: bool) -> Result<()> {
        self.enqueue(|reply| WorkItem::Authenticate {
            peer_name: peer_name.to_string(),
            wait,
            reply,
        })?
    }

    pub fn request_expansion(&self, peer_name: &str, token: u32) -> Result<()> {
        self.enqueue(|reply| WorkItem::ExpandHeader {
            peer_name: peer_name.to_string(),
            token,
            reply,
        })?
    }

    /// Queues `msg` for `peer_name` if no token it carries can be
    /// expanded locally, issuing the `GetExpansion` RPC if this is the
    /// first message waiting on that token. Returns `true` if `msg` was
    /// queued (caller should not deliver it yet).
    pub fn queue_for_unknown_token(&self, peer_name: &str, token: u32, msg: Vec<u8>) -> bool {
        if self.shared.compression.expansion(token).is_some() {
            return false;
        }
        let mut pending = self.shared.pending_expansion.lock().unwrap();
        let is_first = !pending.contains_key(&token);
        pending.entry(token).or_default().push(msg);
        drop(pending);
        if is_first {
            let peer_name = peer_name.to_string();
            let _ = self.request_expansion(&peer_name, token);
        }
        true
    }

    /// Delivers every message that became deliverable when `token` was
    /// expanded (spec §4.G). Messages that cannot be expanded are
    /// silently dropped (timeout path).
    pub fn drain_expanded(&self, token: u32) -> Vec<Vec<u8>> {
        self.shared.pending_expansion.lock().unwrap().remove(&token).unwrap_or_default()
    }

    /// Called by the transport layer when a message addressed to a peer
    /// under authentication arrives; holds it for delivery once that
    /// authentication completes (spec §4.G step 10).
    pub fn queue_message_during_auth(&self, peer_name: &str, msg: Vec<u8>) {
        if let Some(peer_arc) = self.shared.peer_states.get(peer_name, true) {
            peer_arc
                .lock()
                .unwrap()
                .queue_pending_auth_message(msg, self.shared.config.max_pending_auth_msgs);
        }
    }

    /// Surfaces a decrypt-path failure per spec §4.G "Security
    /// violations": if the peer was believed secure, its keys are wiped
    /// (stale); encrypted-broadcast failures are suppressed; everything
    /// else reaches the application listener.
    pub fn report_security_violation(&self, peer_name: &str, was_broadcast: bool, error: Error) {
        if let Some(peer_arc) = self.shared.peer_states.get(peer_name, false) {
            let mut peer = peer_arc.lock().unwrap();
            if peer.is_secure() {
                tracing::warn!(peer_name, "clearing stale session key after decrypt failure");
                peer.unicast_key = None;
            }
        }
        if was_broadcast {
            tracing::debug!(peer_name, "suppressing broadcast decrypt failure (may be spurious)");
            return;
        }
        if let Some(listener) = &self.shared.security_listener {
            listener.on_security_violation(peer_name, &error);
        }
    }

    /// Stops the orchestrator: pending authentications still queued fail
    /// with `BusStopping` (spec §5 cancellation policy) because the
    /// channel is closed before they can be serviced.
    pub fn stop(&self) {
        *self.work_tx.lock().unwrap() = None;
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn negotiate_auth_version(local_preferred: u32, remote: u32) -> Result<u32> {
    // §9 open question: `IsCompatibleVersion` also requires the reserved
    // byte (bits 8..16) to be zero.
    if remote & 0x0000_FF00 != 0 {
        return Err(Error::AuthVersionMismatch);
    }
    let local_proto = local_preferred >> 16;
    let remote_proto = remote >> 16;
    if remote_proto < crate::config::MIN_AUTH_VERSION as u32 {
        return Err(Error::PeerAuthVersionMismatch);
    }
    let proto = local_proto.min(remote_proto);
    let local_keygen = local_preferred & 0xFF;
    let remote_keygen = remote & 0xFF;
    let keygen = local_keygen.min(remote_keygen);
    Ok((proto << 16) | keygen)
}

impl Shared {
    fn dispatch(&self, item: WorkItem) {
        match item {
            WorkItem::Authenticate { peer_name, wait, reply } => {
                let _ = reply.send(self.do_authenticate(&peer_name, wait));
            }
            WorkItem::ExpandHeader { peer_name, token, reply } => {
                let _ = reply.send(self.do_expand_header(&peer_name, token));
            }
        }
    }

    fn do_authenticate(&self, peer_name: &str, wait: bool) -> Result<()> {
        let peer_arc = self.peer_states.get(peer_name, true).expect("create=true always returns Some");

        {
            let peer = peer_arc.lock().unwrap();
            if peer.is_secure() {
                return Ok(());
            }
        }

        let should_run = peer_arc.lock().unwrap().begin_authentication(wait)?;
        if !should_run {
            return Ok(());
        }

        let result = self.run_authentication(peer_name, &peer_arc);
        peer_arc.lock().unwrap().end_authentication();

        if result.is_ok() {
            let pending = peer_arc.lock().unwrap().take_pending_auth_messages();
            if !pending.is_empty() {
                tracing::debug!(peer_name, count = pending.len(), "flushing messages queued during authentication");
                if let Some(listener) = &self.redelivery_listener {
                    listener.redeliver(peer_name, pending);
                } else {
                    tracing::warn!(peer_name, count = pending.len(), "no redelivery listener registered, dropping queued messages");
                }
            }
        } else if let Err(ref e) = result {
            tracing::warn!(peer_name, error = %e, "authentication failed");
        }
        result
    }

    fn run_authentication(&self, peer_name: &str, peer_arc: &Arc<Mutex<PeerState>>) -> Result<()> {
        // Step 3: ExchangeGuids.
        let request = self.codec.encode_exchange_guids(&self.local_guid, self.config.preferred_auth_version);
        let reply = self.rpc.call(peer_name, "ExchangeGuids", &request, self.config.default_timeout)?;
        let (remote_guid, remote_version_raw) = self.codec.decode_exchange_guids_reply(&reply)?;
        let negotiated = negotiate_auth_version(self.config.preferred_auth_version, remote_version_raw)?;

        // Step 4 (re-resolving the peer by its unique sender name once the
        // exchange starts) belongs to bus-name resolution, an external
        // collaborator this crate does not implement (spec §1, §6).

        {
            let mut peer = peer_arc.lock().unwrap();
            peer.guid = remote_guid;
            peer.auth_version = negotiated;
        }

        // Step 5: self-authentication.
        if remote_guid == self.local_guid {
            let mut peer = peer_arc.lock().unwrap();
            let mut key_bytes = vec![0u8; 16];
            rand::thread_rng().fill_bytes(&mut key_bytes);
            peer.unicast_key = Some(KeyBlob {
                key_type: KeyType::Aes,
                bytes: key_bytes,
                tag: "SELF".into(),
                role: Role::Initiator,
                expiration: None,
                association_mode: crate::key_blob::AssociationMode::None,
                association_guid: None,
            });
            peer.group_key = self.peer_states.get(crate::peer_state::NULL_PEER_NAME, false).and_then(|null_peer| null_peer.lock().unwrap().group_key.clone());
            for mt in crate::key_blob::MessageType::ALL.iter() {
                peer.set_authorization(
                    *mt,
                    crate::key_blob::AuthorizationMask {
                        allow_secure_tx: true,
                        allow_secure_rx: true,
                    },
                );
            }
            return Ok(());
        }

        // Step 6: try an existing master secret first.
        if self.try_session_key_pass(peer_name, peer_arc, &remote_guid, negotiated)? {
            return Ok(());
        }

        // Steps 7-8: fresh authentication exchange, starting a new transcript.
        peer_arc.lock().unwrap().initiator_hash.lock().unwrap().init()?;
        let (master_secret, mechanism, key_gen_version) = self.run_key_exchange(peer_name, peer_arc, &remote_guid, negotiated)?;

        self.store_master_secret(&remote_guid, &master_secret, mechanism)?;

        if !self.try_session_key_pass(peer_name, peer_arc, &remote_guid, negotiated)? {
            return Err(Error::AuthFail);
        }
        let _ = key_gen_version;

        // Step 9: group-key exchange, encrypted under the fresh session key.
        self.exchange_group_keys(peer_name, peer_arc, negotiated)
    }

    /// Step 6 / post-fresh-auth session-key derivation: `PRF(master_secret,
    /// "session key", local_nonce||remote_nonce, 28)` split into (AES
    /// key, verifier), verified against the peer's own derivation.
    fn try_session_key_pass(&self, peer_name: &str, peer_arc: &Arc<Mutex<PeerState>>, remote_guid: &Guid, negotiated: u32) -> Result<bool> {
        let (blob, _rights) = {
            let mut store = self.key_store.lock().unwrap();
            match store.get(remote_guid) {
                Ok(found) => found,
                Err(Error::KeyUnavailable) | Err(Error::KeyExpired) => return Ok(false),
                Err(e) => return Err(e),
            }
        };
        let master_secret = match MasterSecretRecord::master_secret_from_blob(&blob) {
            Some(ms) => ms,
            None => return Ok(false),
        };

        let mut local_nonce = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut local_nonce);
        let request = self
            .codec
            .encode_gen_session_key(&self.local_guid, remote_guid, &local_nonce);
        let reply = self.rpc.call(peer_name, "GenSessionKey", &request, self.config.default_timeout)?;
        let (remote_nonce, remote_verifier) = self.codec.decode_gen_session_key_reply(&reply)?;

        let key_gen_version = (negotiated & 0xFF) as u8;
        let (aes_key, expected_verifier) = prf::derive_session_key(&master_secret, &local_nonce, &remote_nonce, key_gen_version);
        if !bool::from(expected_verifier.ct_eq(&remote_verifier)) {
            return Ok(false);
        }

        let mut peer = peer_arc.lock().unwrap();
        peer.unicast_key = Some(KeyBlob {
            key_type: KeyType::Aes,
            bytes: aes_key.to_vec(),
            tag: blob.tag.clone(),
            role: Role::Initiator,
            expiration: blob.expiration,
            association_mode: crate::key_blob::AssociationMode::None,
            association_guid: None,
        });
        for mt in crate::key_blob::MessageType::ALL.iter() {
            peer.set_authorization(
                *mt,
                crate::key_blob::AuthorizationMask {
                    allow_secure_tx: true,
                    allow_secure_rx: true,
                },
            );
        }
        Ok(true)
    }

    /// Steps 7-8: selects an exchanger family and runs it, trying suites
    /// in the negotiated intersection, server order (spec §4.G step 8).
    fn run_key_exchange(
        &self,
        peer_name: &str,
        peer_arc: &Arc<Mutex<PeerState>>,
        remote_guid: &Guid,
        negotiated: u32,
    ) -> Result<([u8; 48], Mechanism, u8)> {
        let proto_version = (negotiated >> 16) as u16;
        let key_gen_version = (negotiated & 0xFF) as u8;

        let candidates: Vec<Mechanism> = if proto_version >= 2 {
            let our_suites: Vec<u32> = self.mechanisms.iter().filter(|m| m.uses_ecdhe()).map(|m| m.suite()).collect();
            let request = self.codec.encode_exchange_suites(&our_suites);
            let reply = self.rpc.call(peer_name, "ExchangeSuites", &request, self.config.default_timeout)?;
            let remote_suites = self.codec.decode_exchange_suites_reply(&reply)?;
            key_exchanger::negotiate_suites(
                &self.mechanisms.iter().copied().filter(|m| m.uses_ecdhe()).collect::<Vec<_>>(),
                &remote_suites,
            )
        } else {
            self.mechanisms.iter().copied().filter(|m| !m.uses_ecdhe()).collect()
        };

        if candidates.is_empty() {
            return Err(Error::NoAuthenticationMechanism);
        }

        let mut last_err = Error::NoAuthenticationMechanism;
        for mechanism in candidates {
            match self.run_one_exchange(peer_name, peer_arc, remote_guid, mechanism, proto_version, negotiated) {
                Ok(master_secret) => return Ok((master_secret, mechanism, key_gen_version)),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn run_one_exchange(
        &self,
        peer_name: &str,
        peer_arc: &Arc<Mutex<PeerState>>,
        _remote_guid: &Guid,
        mechanism: Mechanism,
        proto_version: u16,
        negotiated: u32,
    ) -> Result<[u8; 48]> {
        if matches!(mechanism, Mechanism::SrpKeyx | Mechanism::SrpLogon | Mechanism::Gssapi) {
            return Err(Error::NoAuthenticationMechanism);
        }

        let key_gen_version = (negotiated & 0xFF) as u8;

        if matches!(mechanism, Mechanism::Anonymous | Mechanism::External) {
            // SASL-only: account-name verifier exchange, no key agreement.
            let account_name = mechanism.name();
            let request = self.codec.encode_key_exchange(mechanism.suite(), account_name.as_bytes());
            let reply = self.rpc.call(peer_name, "KeyExchange", &request, self.config.auth_timeout)?;
            let (_remote_mask, _remote_variant) = self.codec.decode_key_exchange_reply(&reply)?;

            let digest = self.fold_hash(peer_arc, &request, negotiated)?;
            let local_verifier = key_exchanger::sasl_verifier(account_name, &digest);
            let auth_request = self.codec.encode_key_authentication(&local_verifier);
            let auth_reply = self.rpc.call(peer_name, "KeyAuthentication", &auth_request, self.config.auth_timeout)?;
            let remote_verifier_bytes = self.codec.decode_key_authentication_reply(&auth_reply)?;
            if remote_verifier_bytes.len() != 12 {
                return Err(Error::AuthFail);
            }
            let mut remote_verifier = [0u8; 12];
            remote_verifier.copy_from_slice(&remote_verifier_bytes);
            if !EcdheEngine::check_verifier(&local_verifier, &remote_verifier) {
                return Err(Error::AuthFail);
            }
            // No key agreement: the "master secret" is the verifier seed
            // itself, expanded to 48 bytes so it fits the same storage
            // path as the ECDHE family.
            let expanded = prf::tls_prf(account_name.as_bytes(), "sasl master secret", &digest, 48);
            let mut master_secret = [0u8; 48];
            master_secret.copy_from_slice(&expanded);
            return Ok(master_secret);
        }

        // ECDHE family.
        let mut engine = EcdheEngine::new(mechanism);
        let local_pub = engine.local_public_value(proto_version);
        let request = self.codec.encode_key_exchange(mechanism.suite(), &local_pub);
        let reply = self.rpc.call(peer_name, "KeyExchange", &request, self.config.auth_timeout)?;
        let (remote_mask, remote_variant) = self.codec.decode_key_exchange_reply(&reply)?;
        if remote_mask & mechanism.suite() == 0 {
            return Err(Error::AuthFail);
        }

        self.fold_key_exchange_hash(peer_arc, &request, &reply, negotiated)?;

        engine.read_peer_public_value(&remote_variant, proto_version)?;
        engine.generate_master_secret()?;

        let digest = self.get_conversation_digest(peer_arc, negotiated)?;
        let local_verifier = engine.local_verifier("client finished", &digest, key_gen_version, negotiated)?;
        let auth_request = self.codec.encode_key_authentication(&local_verifier);
        let auth_reply = self.rpc.call(peer_name, "KeyAuthentication", &auth_request, self.config.auth_timeout)?;
        let remote_verifier_bytes = self.codec.decode_key_authentication_reply(&auth_reply)?;
        if remote_verifier_bytes.len() != 12 {
            return Err(Error::AuthFail);
        }
        let mut remote_verifier = [0u8; 12];
        remote_verifier.copy_from_slice(&remote_verifier_bytes);
        if !EcdheEngine::check_verifier(&local_verifier, &remote_verifier) {
            return Err(Error::AuthFail);
        }

        Ok(*engine.master_secret().expect("generate_master_secret succeeded above"))
    }

    /// SASL exchange: transcript carries only the one outgoing message
    /// (no separate request/reply round in `run_one_exchange`'s SASL
    /// branch beyond this).
    fn fold_hash(&self, peer_arc: &Arc<Mutex<PeerState>>, data: &[u8], negotiated: u32) -> Result<[u8; 32]> {
        let peer = peer_arc.lock().unwrap();
        let mut hash = peer.initiator_hash.lock().unwrap();
        key_exchanger::feed_hash_v1(&mut hash, true, data, negotiated)?;
        hash.get_digest(true)
    }

    fn fold_key_exchange_hash(&self, peer_arc: &Arc<Mutex<PeerState>>, sent: &[u8], received: &[u8], negotiated: u32) -> Result<()> {
        let peer = peer_arc.lock().unwrap();
        let mut hash = peer.initiator_hash.lock().unwrap();
        key_exchanger::feed_hash_v1(&mut hash, true, sent, negotiated)?;
        key_exchanger::feed_hash_v4(&mut hash, sent, negotiated)?;
        key_exchanger::feed_hash_v1(&mut hash, false, received, negotiated)?;
        key_exchanger::feed_hash_v4(&mut hash, received, negotiated)?;
        Ok(())
    }

    fn get_conversation_digest(&self, peer_arc: &Arc<Mutex<PeerState>>, _negotiated: u32) -> Result<[u8; 32]> {
        let peer = peer_arc.lock().unwrap();
        peer.initiator_hash.lock().unwrap().get_digest(true)
    }

    fn store_master_secret(&self, remote_guid: &Guid, master_secret: &[u8; 48], mechanism: Mechanism) -> Result<()> {
        let record = MasterSecretRecord::short(*master_secret);
        let blob = record.to_key_blob(mechanism.name(), Role::Initiator, None);
        let mut store = self.key_store.lock().unwrap();
        store.add(*remote_guid, blob, AccessRights::default())?;
        store.store()
    }

    fn exchange_group_keys(&self, peer_name: &str, peer_arc: &Arc<Mutex<PeerState>>, negotiated: u32) -> Result<()> {
        let local_group_key = self
            .peer_states
            .get(crate::peer_state::NULL_PEER_NAME, false)
            .and_then(|null_peer| null_peer.lock().unwrap().group_key.clone())
            .ok_or(Error::KeyUnavailable)?;

        let unicast_key = peer_arc.lock().unwrap().unicast_key.clone().ok_or(Error::AuthFail)?;

        let mut payload = local_group_key.bytes.clone();
        let header = Vec::new();
        let meta = MessageCryptoMeta {
            serial: 1,
            requires_crypto_value: false,
            crypto_random_value: 0,
        };
        let body_len = payload.len();
        let new_len = message_crypto::encrypt(&meta, &unicast_key, Role::Initiator, negotiated, &mut payload, header.len(), body_len)?;
        let _ = new_len;

        let request = self.codec.encode_exchange_group_keys(&payload);
        let reply = self.rpc.call(peer_name, "ExchangeGroupKeys", &request, self.config.default_timeout)?;
        let mut remote_payload = self.codec.decode_exchange_group_keys_reply(&reply)?;
        let remote_len = remote_payload.len();
        message_crypto::decrypt(&meta, &unicast_key, Role::Initiator, negotiated, &mut remote_payload, 0, remote_len)?;

        peer_arc.lock().unwrap().group_key = Some(KeyBlob {
            key_type: KeyType::Aes,
            bytes: remote_payload,
            tag: "GROUP".into(),
            role: Role::NoRole,
            expiration: None,
            association_mode: crate::key_blob::AssociationMode::None,
            association_guid: None,
        });
        Ok(())
    }

    /// Background `GetExpansion(token)` with a 1-second timeout; installs
    /// the rule on success and drains messages waiting for it, or drops
    /// them silently on timeout (spec §4.G).
    fn do_expand_header(&self, peer_name: &str, token: u32) -> Result<()> {
        let start = Instant::now();
        let request = self.codec.encode_get_expansion(token);
        let outcome = self.rpc.call(peer_name, "GetExpansion", &request, self.config.expansion_timeout);
        if start.elapsed() > self.config.expansion_timeout {
            self.pending_expansion.lock().unwrap().remove(&token);
            return Err(Error::WouldBlock);
        }
        let reply = match outcome {
            Ok(r) => r,
            Err(_) => {
                self.pending_expansion.lock().unwrap().remove(&token);
                return Ok(());
            }
        };
        let fields = self.codec.decode_get_expansion_reply(&reply)?;
        let compressible = fields_from_wire(fields);
        self.compression.add_expansion(compressible, token);
        Ok(())
    }
}

/// Reassembles the `(yv)` wire tuples into the crate's own
/// `CompressibleHeaderFields` shape; a real marshaller would type these
/// precisely, this crate just needs a stable field order.
#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use byteorder::{ByteOrder, LittleEndian};
    use sha2::{Digest, Sha256};

    use crate::key_blob::AssociationMode;
    use crate::key_store::{KeyStore, KeyStoreListener};
    use crate::wire::SimpleWireCodec;

    struct MemoryListener {
        data: StdMutex<Option<Vec<u8>>>,
    }

    impl KeyStoreListener for MemoryListener {
        fn load_request(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.data.lock().unwrap().clone())
        }
        fn store_request(&self, data: &[u8]) -> Result<()> {
            *self.data.lock().unwrap() = Some(data.to_vec());
            Ok(())
        }
    }

    fn new_key_store() -> Arc<Mutex<KeyStore>> {
        Arc::new(Mutex::new(
            KeyStore::open_with_listener(
                Box::new(MemoryListener { data: StdMutex::new(None) }),
                false,
                b"pw".to_vec(),
                Guid::random(),
            )
            .unwrap(),
        ))
    }

    fn local_group_key() -> KeyBlob {
        KeyBlob {
            key_type: KeyType::Aes,
            bytes: vec![0xAAu8; 16],
            tag: "LOCAL".into(),
            role: Role::NoRole,
            expiration: None,
            association_mode: AssociationMode::None,
            association_guid: None,
        }
    }

    fn put_blob(buf: &mut Vec<u8>, bytes: &[u8]) {
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, bytes.len() as u32);
        buf.extend_from_slice(&len);
        buf.extend_from_slice(bytes);
    }

    #[derive(Default)]
    struct ResponderState {
        pending_exchange: Option<(Vec<u8>, Vec<u8>, EcdheEngine)>,
        master_secret: Option<[u8; 48]>,
        unicast_key: Option<[u8; 16]>,
    }

    /// Plays the responder side of an ECDHE-NULL handshake plus group-key
    /// exchange against a real `PeerObject` initiator, independently
    /// deriving each value the way `run_one_exchange`/`try_session_key_pass`
    /// do on the initiator side (matching nonce roles, PRF seed order, and
    /// the v1-only conversation transcript since the negotiated version
    /// here stays below `CONVERSATION_V4_AUTH_VERSION`).
    struct FakeEcdheResponder {
        guid: Guid,
        reply_group_key: Vec<u8>,
        state: StdMutex<ResponderState>,
    }

    impl PeerRpc for FakeEcdheResponder {
        fn call(&self, _peer_name: &str, method: &str, payload: &[u8], _timeout: Duration) -> Result<Vec<u8>> {
            let codec = SimpleWireCodec;
            match method {
                "ExchangeGuids" => {
                    let (_initiator_guid, remote_version) = codec.decode_exchange_guids_reply(payload)?;
                    let _ = remote_version;
                    Ok(codec.encode_exchange_guids(&self.guid, crate::config::PREFERRED_AUTH_VERSION))
                }
                "ExchangeSuites" => {
                    let _remote_suites = codec.decode_exchange_suites_reply(payload)?;
                    Ok(codec.encode_exchange_suites(&[Mechanism::EcdheNull.suite()]))
                }
                "KeyExchange" => {
                    let (_mask, remote_variant) = codec.decode_key_exchange_reply(payload)?;
                    let mut engine = EcdheEngine::new(Mechanism::EcdheNull);
                    let local_pub = engine.local_public_value(2);
                    engine.read_peer_public_value(&remote_variant, 2)?;
                    engine.generate_master_secret()?;
                    let reply = codec.encode_key_exchange(Mechanism::EcdheNull.suite(), &local_pub);
                    self.state.lock().unwrap().pending_exchange = Some((payload.to_vec(), reply.clone(), engine));
                    Ok(reply)
                }
                "KeyAuthentication" => {
                    let mut state = self.state.lock().unwrap();
                    let (sent, received, engine) = state.pending_exchange.take().expect("KeyExchange runs before KeyAuthentication");
                    let mut hasher = Sha256::new();
                    hasher.update(&sent);
                    hasher.update(&received);
                    let mut digest = [0u8; 32];
                    digest.copy_from_slice(&hasher.finalize());

                    let verifier = engine.local_verifier("client finished", &digest, 1, crate::config::PREFERRED_AUTH_VERSION)?;
                    state.master_secret = engine.master_secret().copied();
                    Ok(codec.encode_key_authentication(&verifier))
                }
                "GenSessionKey" => {
                    // request layout: initiator_guid(16) | remote_guid(16) | blob(local_nonce)
                    if payload.len() < 36 {
                        return Err(Error::WireCodec("short GenSessionKey request".into()));
                    }
                    let nonce_len = LittleEndian::read_u32(&payload[32..36]) as usize;
                    if payload.len() < 36 + nonce_len {
                        return Err(Error::WireCodec("truncated GenSessionKey nonce".into()));
                    }
                    let initiator_nonce = payload[36..36 + nonce_len].to_vec();
                    let mut responder_nonce = vec![0u8; 16];
                    rand::thread_rng().fill_bytes(&mut responder_nonce);

                    let master_secret = self.state.lock().unwrap().master_secret.expect("key exchange completed first");
                    let (aes_key, verifier) = prf::derive_session_key(&master_secret, &initiator_nonce, &responder_nonce, 1);
                    self.state.lock().unwrap().unicast_key = Some(aes_key);

                    let mut reply = Vec::new();
                    put_blob(&mut reply, &responder_nonce);
                    put_blob(&mut reply, &verifier);
                    Ok(reply)
                }
                "ExchangeGroupKeys" => {
                    let ciphertext = codec.decode_exchange_group_keys_reply(payload)?;
                    let aes_key = self.state.lock().unwrap().unicast_key.expect("session key established first");
                    let key_blob = KeyBlob {
                        key_type: KeyType::Aes,
                        bytes: aes_key.to_vec(),
                        tag: "ECDHE_NULL".into(),
                        role: Role::Responder,
                        expiration: None,
                        association_mode: AssociationMode::None,
                        association_guid: None,
                    };
                    let meta = MessageCryptoMeta {
                        serial: 1,
                        requires_crypto_value: false,
                        crypto_random_value: 0,
                    };

                    let mut incoming = ciphertext;
                    let in_len = incoming.len();
                    message_crypto::decrypt(&meta, &key_blob, Role::Responder, crate::config::PREFERRED_AUTH_VERSION, &mut incoming, 0, in_len)?;

                    let mut outgoing = self.reply_group_key.clone();
                    let out_len = outgoing.len();
                    message_crypto::encrypt(&meta, &key_blob, Role::Responder, crate::config::PREFERRED_AUTH_VERSION, &mut outgoing, 0, out_len)?;
                    Ok(codec.encode_exchange_group_keys(&outgoing))
                }
                other => panic!("unexpected RPC method in test: {}", other),
            }
        }
    }

    #[test]
    fn full_ecdhe_null_handshake_then_bitflip_wipes_key_on_violation() {
        let peer_states = Arc::new(PeerStateTable::new(local_group_key()));
        let responder: Arc<FakeEcdheResponder> = Arc::new(FakeEcdheResponder {
            guid: Guid::random(),
            reply_group_key: vec![0xBBu8; 16],
            state: StdMutex::new(ResponderState::default()),
        });
        let rpc: Arc<dyn PeerRpc> = responder;

        let po = PeerObject::new(
            Guid::random(),
            PeerConfig::default(),
            peer_states.clone(),
            new_key_store(),
            Arc::new(CompressionRules::new()),
            Arc::new(SimpleWireCodec),
            rpc,
            None,
            None,
            vec![Mechanism::EcdheNull],
        );

        po.authenticate_peer("responder", true).unwrap();

        let peer_arc = peer_states.get("responder", false).unwrap();
        let unicast_key = {
            let peer = peer_arc.lock().unwrap();
            assert!(peer.is_secure(), "peer should be secure after a successful handshake");
            peer.unicast_key.clone().unwrap()
        };

        let meta = MessageCryptoMeta {
            serial: 9,
            requires_crypto_value: false,
            crypto_random_value: 0,
        };
        let mut buf = b"PING".to_vec();
        let len = buf.len();
        let new_len = message_crypto::encrypt(&meta, &unicast_key, Role::Initiator, crate::config::PREFERRED_AUTH_VERSION, &mut buf, 0, len).unwrap();
        let encrypted = buf;

        let mut ok_copy = encrypted.clone();
        let decrypted_len = message_crypto::decrypt(&meta, &unicast_key, Role::Initiator, crate::config::PREFERRED_AUTH_VERSION, &mut ok_copy, 0, new_len).unwrap();
        assert_eq!(&ok_copy[..decrypted_len], b"PING");

        let mut corrupted = encrypted;
        corrupted[0] ^= 0x01;
        let err = message_crypto::decrypt(&meta, &unicast_key, Role::Initiator, crate::config::PREFERRED_AUTH_VERSION, &mut corrupted, 0, new_len).unwrap_err();
        assert_eq!(err, Error::MessageDecryptionFailed);

        po.report_security_violation("responder", false, err);
        assert!(!peer_arc.lock().unwrap().is_secure(), "a decrypt failure on a secure peer must wipe its unicast key");

        po.stop();
    }

    struct RecordingRedeliveryListener {
        delivered: StdMutex<Vec<(String, Vec<Vec<u8>>)>>,
    }

    impl MessageRedeliveryListener for RecordingRedeliveryListener {
        fn redeliver(&self, peer_name: &str, messages: Vec<Vec<u8>>) {
            self.delivered.lock().unwrap().push((peer_name.to_string(), messages));
        }
    }

    #[test]
    fn messages_queued_during_auth_are_handed_to_the_redelivery_listener() {
        let peer_states = Arc::new(PeerStateTable::new(local_group_key()));
        let responder: Arc<FakeEcdheResponder> = Arc::new(FakeEcdheResponder {
            guid: Guid::random(),
            reply_group_key: vec![0xCCu8; 16],
            state: StdMutex::new(ResponderState::default()),
        });
        let rpc: Arc<dyn PeerRpc> = responder;
        let redelivery: Arc<RecordingRedeliveryListener> = Arc::new(RecordingRedeliveryListener {
            delivered: StdMutex::new(Vec::new()),
        });

        let po = PeerObject::new(
            Guid::random(),
            PeerConfig::default(),
            peer_states.clone(),
            new_key_store(),
            Arc::new(CompressionRules::new()),
            Arc::new(SimpleWireCodec),
            rpc,
            None,
            Some(redelivery.clone() as Arc<dyn MessageRedeliveryListener>),
            vec![Mechanism::EcdheNull],
        );

        po.queue_message_during_auth("responder", b"held-while-authenticating".to_vec());
        po.authenticate_peer("responder", true).unwrap();

        let delivered = redelivery.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "responder");
        assert_eq!(delivered[0].1, vec![b"held-while-authenticating".to_vec()]);
        drop(delivered);

        po.stop();
    }

    fn build_expansion_reply(fields: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut count = [0u8; 4];
        LittleEndian::write_u32(&mut count, fields.len() as u32);
        buf.extend_from_slice(&count);
        for (tag, value) in fields {
            buf.push(*tag);
            put_blob(&mut buf, value);
        }
        buf
    }

    struct FixedReplyRpc {
        fields_payload: Vec<u8>,
        delay: Duration,
    }

    impl PeerRpc for FixedReplyRpc {
        fn call(&self, _peer_name: &str, method: &str, _payload: &[u8], _timeout: Duration) -> Result<Vec<u8>> {
            assert_eq!(method, "GetExpansion");
            std::thread::sleep(self.delay);
            Ok(self.fields_payload.clone())
        }
    }

    #[test]
    fn header_compression_installs_rule_and_delivers_within_timeout() {
        let fields_payload = build_expansion_reply(&[(0, b"org.example.Iface".to_vec()), (1, b"Ping".to_vec())]);
        let mut config = PeerConfig::default();
        config.expansion_timeout = Duration::from_millis(50);

        let compression = Arc::new(CompressionRules::new());
        let po = PeerObject::new(
            Guid::random(),
            config,
            Arc::new(PeerStateTable::new(local_group_key())),
            new_key_store(),
            compression.clone(),
            Arc::new(SimpleWireCodec),
            Arc::new(FixedReplyRpc {
                fields_payload,
                delay: Duration::from_millis(0),
            }),
            None,
            None,
            vec![Mechanism::EcdheNull],
        );

        assert!(po.queue_for_unknown_token("responder", 0xABCD, b"message-1".to_vec()));
        assert!(compression.expansion(0xABCD).is_some(), "a timely reply should install the expansion rule");
        assert_eq!(po.drain_expanded(0xABCD), vec![b"message-1".to_vec()]);

        po.stop();
    }

    #[test]
    fn header_compression_drops_queued_message_after_timeout() {
        let fields_payload = build_expansion_reply(&[(0, b"org.example.Iface".to_vec()), (1, b"Ping".to_vec())]);
        let mut config = PeerConfig::default();
        config.expansion_timeout = Duration::from_millis(50);

        let compression = Arc::new(CompressionRules::new());
        let po = PeerObject::new(
            Guid::random(),
            config,
            Arc::new(PeerStateTable::new(local_group_key())),
            new_key_store(),
            compression.clone(),
            Arc::new(SimpleWireCodec),
            Arc::new(FixedReplyRpc {
                fields_payload,
                delay: Duration::from_millis(200),
            }),
            None,
            None,
            vec![Mechanism::EcdheNull],
        );

        assert!(po.queue_for_unknown_token("responder", 0xEF01, b"message-2".to_vec()));
        assert!(compression.expansion(0xEF01).is_none(), "a late reply must not install the expansion rule");
        assert!(po.drain_expanded(0xEF01).is_empty(), "the queued message must be dropped silently on timeout");

        po.stop();
    }
}

fn fields_from_wire(fields: Vec<(u8, Vec<u8>)>) -> CompressibleHeaderFields {
    let mut out = CompressibleHeaderFields {
        interface: String::new(),
        member: String::new(),
        path: String::new(),
        signature: String::new(),
        destination: String::new(),
        sender: String::new(),
        session_id: 0,
        ttl: 0,
    };
    for (tag, value) in fields {
        let s = || String::from_utf8_lossy(&value).into_owned();
        match tag {
            0 => out.interface = s(),
            1 => out.member = s(),
            2 => out.path = s(),
            3 => out.signature = s(),
            4 => out.destination = s(),
            5 => out.sender = s(),
            _ => {}
        }
    }
    out
}
