//! Permission policy: `(spec-version, policy-version, acls[])` (spec §3).

use crate::guid::Guid;
use crate::policy::KeyInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermissionMask {
    pub provide: bool,
    pub observe: bool,
    pub modify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Signal,
    Property,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub kind: MemberKind,
    pub mask: PermissionMask,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub obj_path: String,
    pub interface_name: String,
    pub members: Vec<Member>,
}

impl Rule {
    /// A rule applies to `(path, interface, member)` iff all three name
    /// components match under `*` wildcard rules (spec §3).
    pub fn matches(&self, obj_path: &str, interface_name: &str, member_name: &str, kind: MemberKind) -> Option<PermissionMask> {
        if !crate::policy::wildcard_match(&self.obj_path, obj_path) {
            return None;
        }
        if !crate::policy::wildcard_match(&self.interface_name, interface_name) {
            return None;
        }
        self.members
            .iter()
            .find(|m| m.kind == kind && crate::policy::wildcard_match(&m.name, member_name))
            .map(|m| m.mask)
    }
}

#[derive(Debug, Clone)]
pub enum PeerSpec {
    All,
    AnyTrusted,
    FromCa(KeyInfo),
    WithPublicKey(KeyInfo),
    WithMembership { sg_id: Guid, key_info: KeyInfo },
}

#[derive(Debug, Clone)]
pub struct Acl {
    pub peers: Vec<PeerSpec>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    pub spec_version: u16,
    pub policy_version: u32,
    pub acls: Vec<Acl>,
}

impl PermissionPolicy {
    /// `InstallPolicy` requires a strictly monotonic `policy-version`
    /// (spec §4.H).
    pub fn is_newer_than(&self, installed: &PermissionPolicy) -> bool {
        self.policy_version > installed.policy_version
    }

    /// The default policy installed on a successful `Claim` (spec §4.H):
    /// the claiming CA may speak for the device, the admin security
    /// group has full rights on `*`/`*`, the device's own public key may
    /// `InstallMembership`, and any trusted peer may call methods and
    /// receive signals.
    pub fn default_after_claim(ca_key: KeyInfo, admin_sg: Guid, admin_sg_key: KeyInfo, device_key: KeyInfo) -> PermissionPolicy {
        let full = PermissionMask {
            provide: true,
            observe: true,
            modify: true,
        };
        let call_and_observe = PermissionMask {
            provide: true,
            observe: true,
            modify: false,
        };
        PermissionPolicy {
            spec_version: 1,
            policy_version: 1,
            acls: vec![
                Acl {
                    peers: vec![PeerSpec::FromCa(ca_key)],
                    rules: vec![Rule {
                        obj_path: "*".into(),
                        interface_name: "*".into(),
                        members: vec![Member {
                            name: "*".into(),
                            kind: MemberKind::Method,
                            mask: full,
                        }],
                    }],
                },
                Acl {
                    peers: vec![PeerSpec::WithMembership {
                        sg_id: admin_sg,
                        key_info: admin_sg_key,
                    }],
                    rules: vec![Rule {
                        obj_path: "*".into(),
                        interface_name: "*".into(),
                        members: vec![Member {
                            name: "*".into(),
                            kind: MemberKind::Method,
                            mask: full,
                        }],
                    }],
                },
                Acl {
                    peers: vec![PeerSpec::WithPublicKey(device_key)],
                    rules: vec![Rule {
                        obj_path: "*".into(),
                        interface_name: "org.alljoyn.Bus.Security.ManagedApplication".into(),
                        members: vec![Member {
                            name: "InstallMembership".into(),
                            kind: MemberKind::Method,
                            mask: full,
                        }],
                    }],
                },
                Acl {
                    peers: vec![PeerSpec::AnyTrusted],
                    rules: vec![Rule {
                        obj_path: "*".into(),
                        interface_name: "*".into(),
                        members: vec![
                            Member {
                                name: "*".into(),
                                kind: MemberKind::Method,
                                mask: call_and_observe,
                            },
                            Member {
                                name: "*".into(),
                                kind: MemberKind::Signal,
                                mask: call_and_observe,
                            },
                        ],
                    }],
                },
            ],
        }
    }
}
