//! `TrustAnchor { use, key_info, security_group_id? }` (spec §4.I). The
//! list is repopulated from the active policy whenever it changes and is
//! read far more often than it is written (spec §5 `trust_anchors.lock`
//! "list is read-mostly").

use std::sync::RwLock;

use crate::guid::Guid;
use crate::policy::permission_policy::PeerSpec;
use crate::policy::{KeyInfo, PermissionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustAnchorUse {
    Ca,
    SgAuthority,
}

#[derive(Debug, Clone)]
pub struct TrustAnchor {
    pub use_: TrustAnchorUse,
    pub key_info: KeyInfo,
    pub security_group_id: Option<Guid>,
}

#[derive(Default)]
pub struct TrustAnchorList {
    anchors: RwLock<Vec<TrustAnchor>>,
}

impl TrustAnchorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the list from every `FromCa`/`WithMembership` peer
    /// specifier named across the policy's ACLs (spec §4.I: "repopulated
    /// from the active policy whenever it changes").
    pub fn repopulate_from_policy(&self, policy: &PermissionPolicy) {
        let mut anchors = Vec::new();
        for acl in &policy.acls {
            for peer in &acl.peers {
                match peer {
                    PeerSpec::FromCa(key_info) => anchors.push(TrustAnchor {
                        use_: TrustAnchorUse::Ca,
                        key_info: key_info.clone(),
                        security_group_id: None,
                    }),
                    PeerSpec::WithMembership { sg_id, key_info } => anchors.push(TrustAnchor {
                        use_: TrustAnchorUse::SgAuthority,
                        key_info: key_info.clone(),
                        security_group_id: Some(*sg_id),
                    }),
                    PeerSpec::All | PeerSpec::AnyTrusted | PeerSpec::WithPublicKey(_) => {}
                }
            }
        }
        *self.anchors.write().unwrap() = anchors;
    }

    pub fn matches(&self, key_info: &KeyInfo, use_: TrustAnchorUse) -> bool {
        self.anchors
            .read()
            .unwrap()
            .iter()
            .any(|a| a.use_ == use_ && &a.key_info == key_info)
    }

    pub fn len(&self) -> usize {
        self.anchors.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
