//! Permission Mgmt Object: the bus-method surface and application state
//! machine that drive claiming, policy installation, and identity/
//! membership certificate management (spec §4.H).

use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::key_store::KeyStore;
use crate::policy::membership::{validate_chain, CertInfo};
use crate::policy::trust_anchor::TrustAnchorUse;
use crate::policy::{KeyInfo, Manifest, PermissionPolicy, TrustAnchorList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    NotClaimable,
    Claimable,
    Claimed,
    NeedUpdate,
}

/// One-shot hook invoked after a reply carrying a policy change has
/// actually been transmitted, so session secrets are wiped only once the
/// application can no longer be confused about which policy authorized
/// the reply it just sent (spec §9 translation note on
/// `MessageEncryptionNotification`).
pub trait PostReplyNotification: Send {
    fn on_reply_sent(self: Box<Self>);
}

struct WipeSessionSecrets {
    key_store: Arc<Mutex<KeyStore>>,
}

impl PostReplyNotification for WipeSessionSecrets {
    fn on_reply_sent(self: Box<Self>) {
        let mut store = self.key_store.lock().unwrap();
        store.clear("*");
        let _ = store.store();
    }
}

pub struct PermissionMgmt {
    state: Mutex<ApplicationState>,
    device_public_key: KeyInfo,
    installed_policy: RwLock<Option<PermissionPolicy>>,
    trust_anchors: TrustAnchorList,
    memberships: Mutex<Vec<CertInfo>>,
    management_started: Mutex<bool>,
    key_store: Arc<Mutex<KeyStore>>,
}

impl PermissionMgmt {
    pub fn new(device_public_key: KeyInfo, key_store: Arc<Mutex<KeyStore>>) -> Self {
        PermissionMgmt {
            state: Mutex::new(ApplicationState::NotClaimable),
            device_public_key,
            installed_policy: RwLock::new(None),
            trust_anchors: TrustAnchorList::new(),
            memberships: Mutex::new(Vec::new()),
            management_started: Mutex::new(false),
            key_store,
        }
    }

    pub fn state(&self) -> ApplicationState {
        *self.state.lock().unwrap()
    }

    pub fn trust_anchors(&self) -> &TrustAnchorList {
        &self.trust_anchors
    }

    /// Installing a manifest template moves `NotClaimable -> Claimable`
    /// unless the application has explicitly overridden that (spec §4.H).
    pub fn set_manifest_template(&self, overridden: bool) {
        let mut state = self.state.lock().unwrap();
        if *state == ApplicationState::NotClaimable && !overridden {
            *state = ApplicationState::Claimable;
        }
    }

    pub fn start_management(&self) -> Result<()> {
        let mut started = self.management_started.lock().unwrap();
        if *started {
            return Err(Error::ManagementAlreadyStarted);
        }
        *started = true;
        Ok(())
    }

    pub fn end_management(&self) -> Result<()> {
        let mut started = self.management_started.lock().unwrap();
        if !*started {
            return Err(Error::ManagementNotStarted);
        }
        *started = false;
        Ok(())
    }

    /// `Claim(caKey, caId, sgId, sgKey, sgId, identityChain, manifest)`
    /// (spec §4.H, scenario 5). `identity_chain` is leaf-first; `identity_leaf_der`
    /// is the leaf certificate's DER encoding, needed only to check the
    /// manifest's thumbprint (the ASN.1 codec itself is out of scope).
    pub fn claim(
        &self,
        ca_key: KeyInfo,
        admin_sg_id: Guid,
        admin_sg_key: KeyInfo,
        identity_chain: &[CertInfo],
        identity_leaf_der: &[u8],
        manifest: &Manifest,
    ) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if *state != ApplicationState::Claimable {
                return Err(Error::PermissionDenied);
            }
        }

        let leaf = identity_chain.first().ok_or(Error::InvalidCertificate)?;
        if leaf.subject_public_key != self.device_public_key {
            return Err(Error::InvalidCertificate);
        }
        if !manifest.thumbprint_matches(identity_leaf_der) {
            return Err(Error::DigestMismatch);
        }

        let presenting_ca = TrustAnchorList::new();
        presenting_ca.repopulate_from_policy(&PermissionPolicy {
            spec_version: 1,
            policy_version: 1,
            acls: vec![crate::policy::Acl {
                peers: vec![crate::policy::PeerSpec::FromCa(ca_key.clone())],
                rules: vec![],
            }],
        });
        validate_chain(identity_chain, &presenting_ca, TrustAnchorUse::Ca)?;

        let default_policy = PermissionPolicy::default_after_claim(
            ca_key,
            admin_sg_id,
            admin_sg_key,
            self.device_public_key.clone(),
        );
        self.trust_anchors.repopulate_from_policy(&default_policy);
        *self.installed_policy.write().unwrap() = Some(default_policy);
        *self.state.lock().unwrap() = ApplicationState::Claimed;
        Ok(())
    }

    /// `InstallPolicy`: strictly monotonic `policy-version`; returns a
    /// post-reply hook the caller must invoke once the reply carrying
    /// this result has actually been sent (spec §4.H).
    pub fn install_policy(&self, policy: PermissionPolicy) -> Result<Box<dyn PostReplyNotification>> {
        {
            let installed = self.installed_policy.read().unwrap();
            if let Some(current) = installed.as_ref() {
                if !policy.is_newer_than(current) {
                    return Err(Error::PolicyNotNewer);
                }
            }
        }
        self.trust_anchors.repopulate_from_policy(&policy);
        *self.installed_policy.write().unwrap() = Some(policy);
        Ok(Box::new(WipeSessionSecrets {
            key_store: self.key_store.clone(),
        }))
    }

    pub fn reset_policy(&self) {
        *self.installed_policy.write().unwrap() = None;
        self.trust_anchors.repopulate_from_policy(&PermissionPolicy {
            spec_version: 1,
            policy_version: 0,
            acls: vec![],
        });
    }

    /// Marks a claimed device as needing an identity update (e.g. a
    /// detected manifest/certificate mismatch); `install_identity` then
    /// returns the device to `Claimed` (spec §4.H).
    pub fn mark_needs_update(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ApplicationState::Claimed {
            *state = ApplicationState::NeedUpdate;
        }
    }

    pub fn install_identity(&self, identity_chain: &[CertInfo], manifest: &Manifest, identity_leaf_der: &[u8]) -> Result<()> {
        let state = self.state.lock().unwrap();
        if *state != ApplicationState::Claimed && *state != ApplicationState::NeedUpdate {
            return Err(Error::PermissionDenied);
        }
        drop(state);

        if !manifest.thumbprint_matches(identity_leaf_der) {
            return Err(Error::DigestMismatch);
        }
        validate_chain(identity_chain, &self.trust_anchors, TrustAnchorUse::Ca)?;

        *self.state.lock().unwrap() = ApplicationState::Claimed;
        Ok(())
    }

    pub fn install_membership(&self, chain: Vec<CertInfo>) -> Result<()> {
        validate_chain(&chain, &self.trust_anchors, TrustAnchorUse::SgAuthority)?;
        let mut memberships = self.memberships.lock().unwrap();
        let leaf_aki = chain[0].authority_key_id.clone();
        if memberships.iter().any(|c| c.authority_key_id == leaf_aki) {
            return Err(Error::DuplicateCertificate);
        }
        memberships.extend(chain);
        Ok(())
    }

    pub fn remove_membership(&self, authority_key_id: &[u8]) -> Result<()> {
        let mut memberships = self.memberships.lock().unwrap();
        let before = memberships.len();
        memberships.retain(|c| c.authority_key_id != authority_key_id);
        if memberships.len() == before {
            return Err(Error::CertificateNotFound);
        }
        Ok(())
    }

    /// Factory reset (`Reset` bus method): wipes policy, trust anchors,
    /// memberships, the key store, and returns the application to
    /// `NotClaimable`.
    pub fn reset(&self) -> Result<()> {
        *self.installed_policy.write().unwrap() = None;
        self.trust_anchors.repopulate_from_policy(&PermissionPolicy {
            spec_version: 1,
            policy_version: 0,
            acls: vec![],
        });
        self.memberships.lock().unwrap().clear();
        self.key_store.lock().unwrap().reset()?;
        *self.state.lock().unwrap() = ApplicationState::NotClaimable;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key_store::KeyStoreListener;
    use crate::policy::membership::LeafCertType;
    use sha2::{Digest, Sha256};
    use std::sync::Mutex as StdMutex;

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

    fn test_key_store() -> Arc<Mutex<KeyStore>> {
        Arc::new(Mutex::new(
            KeyStore::open_with_listener(Box::new(MemoryListener { data: StdMutex::new(None) }), false, b"pw".to_vec(), Guid::random())
                .unwrap(),
        ))
    }

    fn identity_chain(device_key: KeyInfo, ca_key: KeyInfo) -> (Vec<CertInfo>, Vec<u8>) {
        let leaf_der = b"leaf-identity-cert-der".to_vec();
        let leaf = CertInfo {
            subject_dn: "CN=device".into(),
            issuer_dn: "CN=ca".into(),
            subject_public_key: device_key,
            authority_key_id: vec![1],
            is_ca: false,
            leaf_type: Some(LeafCertType::Identity),
        };
        let ca_cert = CertInfo {
            subject_dn: "CN=ca".into(),
            issuer_dn: "CN=ca".into(),
            subject_public_key: ca_key,
            authority_key_id: vec![2],
            is_ca: true,
            leaf_type: None,
        };
        (vec![leaf, ca_cert], leaf_der)
    }

    #[test]
    fn claim_moves_claimable_to_claimed_then_rejects_second_claim() {
        let device_key = KeyInfo(vec![1, 1, 1]);
        let ca_key = KeyInfo(vec![2, 2, 2]);
        let mgmt = PermissionMgmt::new(device_key.clone(), test_key_store());
        mgmt.set_manifest_template(false);
        assert_eq!(mgmt.state(), ApplicationState::Claimable);

        let (chain, leaf_der) = identity_chain(device_key, ca_key.clone());
        let digest = Sha256::digest(&leaf_der);
        let mut thumbprint = [0u8; 32];
        thumbprint.copy_from_slice(&digest);
        let manifest = Manifest {
            version: 1,
            rules: vec![],
            thumbprint_alg_oid: "2.16.840.1.101.3.4.2.1".into(),
            thumbprint,
            sig_alg_oid: "1.2.840.10045.4.3.2".into(),
            signature: vec![],
        };

        let admin_sg = Guid::random();
        mgmt.claim(ca_key.clone(), admin_sg, KeyInfo(vec![3, 3, 3]), &chain, &leaf_der, &manifest)
            .unwrap();
        assert_eq!(mgmt.state(), ApplicationState::Claimed);

        assert_eq!(
            mgmt.claim(ca_key, admin_sg, KeyInfo(vec![3, 3, 3]), &chain, &leaf_der, &manifest),
            Err(Error::PermissionDenied)
        );
    }

    #[test]
    fn install_policy_rejects_non_monotonic_version() {
        let mgmt = PermissionMgmt::new(KeyInfo(vec![1]), test_key_store());
        let p1 = PermissionPolicy {
            spec_version: 1,
            policy_version: 5,
            acls: vec![],
        };
        mgmt.install_policy(p1).unwrap();
        let p2 = PermissionPolicy {
            spec_version: 1,
            policy_version: 5,
            acls: vec![],
        };
        assert_eq!(mgmt.install_policy(p2).err(), Some(Error::PolicyNotNewer));
    }

    #[test]
    fn management_session_guards_are_enforced() {
        let mgmt = PermissionMgmt::new(KeyInfo(vec![1]), test_key_store());
        mgmt.start_management().unwrap();
        assert_eq!(mgmt.start_management().err(), Some(Error::ManagementAlreadyStarted));
        mgmt.end_management().unwrap();
        assert_eq!(mgmt.end_management().err(), Some(Error::ManagementNotStarted));
    }

    #[test]
    fn removing_unknown_membership_is_not_found() {
        let mgmt = PermissionMgmt::new(KeyInfo(vec![1]), test_key_store());
        assert_eq!(mgmt.remove_membership(&[0xFF]), Err(Error::CertificateNotFound));
    }
}
