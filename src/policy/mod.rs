//! Permission-policy evaluation, manifests, and trust anchors (spec
//! §3 "Permission policy"/"Manifest", §4.H, §4.I).

pub mod manifest;
pub mod membership;
pub mod permission_policy;
pub mod trust_anchor;

pub use manifest::Manifest;
pub use membership::{validate_chain, CertInfo, LeafCertType};
pub use permission_policy::{Acl, Member, MemberKind, PeerSpec, PermissionMask, PermissionPolicy, Rule};
pub use trust_anchor::{TrustAnchor, TrustAnchorList, TrustAnchorUse};

/// A NIST P-256 public key carried around policy/cert structures as raw
/// SEC1 bytes -- the places that need it to actually verify a signature
/// parse it into a `p256::ecdsa::VerifyingKey` at the point of use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo(pub Vec<u8>);

/// Name matching with `*` wildcards, used for both policy rule names
/// (spec §3: "Names support `*` wildcard") and key-store tag patterns
/// (`KeyStore::clear`, spec §4.B). A `*` matches any run of characters,
/// including none.
pub fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    fn helper(pattern: &[u8], candidate: &[u8]) -> bool {
        match pattern.first() {
            None => candidate.is_empty(),
            Some(b'*') => {
                // Try matching zero chars, then grow.
                for i in 0..=candidate.len() {
                    if helper(&pattern[1..], &candidate[i..]) {
                        return true;
                    }
                }
                false
            }
            Some(&p) => match candidate.first() {
                Some(&c) if c == p => helper(&pattern[1..], &candidate[1..]),
                _ => false,
            },
        }
    }
    helper(pattern.as_bytes(), candidate.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(wildcard_match("ECDHE_NULL", "ECDHE_NULL"));
        assert!(!wildcard_match("ECDHE_NULL", "ECDHE_PSK"));
    }

    #[test]
    fn trailing_star_matches_prefix() {
        assert!(wildcard_match("org.example.*", "org.example.Foo"));
        assert!(wildcard_match("org.example.*", "org.example."));
        assert!(!wildcard_match("org.example.*", "org.other.Foo"));
    }

    #[test]
    fn bare_star_matches_everything() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("*", "anything at all"));
    }

    #[test]
    fn star_in_the_middle() {
        assert!(wildcard_match("a*z", "az"));
        assert!(wildcard_match("a*z", "abcz"));
        assert!(!wildcard_match("a*z", "abcd"));
    }
}
