//! Membership/identity certificate chain validation (spec §4.I).

use crate::error::{Error, Result};
use crate::policy::trust_anchor::{TrustAnchorList, TrustAnchorUse};
use crate::policy::KeyInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCertType {
    Identity,
    Membership,
    /// Pre-manifest certificates that carried no explicit extended-key-usage.
    UnrestrictedLegacy,
}

#[derive(Debug, Clone)]
pub struct CertInfo {
    pub subject_dn: String,
    pub issuer_dn: String,
    pub subject_public_key: KeyInfo,
    pub authority_key_id: Vec<u8>,
    pub is_ca: bool,
    /// `Some` only on the leaf certificate (index 0).
    pub leaf_type: Option<LeafCertType>,
}

/// Validates a certificate chain, ordered leaf-first, against the rules
/// in spec §4.I. `required_use` selects which trust-anchor role the
/// matching certificate must hold (CA for identity chains, SgAuthority
/// for membership chains).
pub fn validate_chain(chain: &[CertInfo], anchors: &TrustAnchorList, required_use: TrustAnchorUse) -> Result<()> {
    let leaf = chain.first().ok_or(Error::InvalidCertificate)?;

    if leaf.leaf_type.is_none() {
        return Err(Error::InvalidCertificateUsage);
    }

    for cert in chain {
        if cert.authority_key_id.is_empty() {
            return Err(Error::InvalidCertificate);
        }
    }

    for window in chain.windows(2) {
        let (lower, higher) = (&window[0], &window[1]);
        if !higher.is_ca {
            return Err(Error::InvalidCertificate);
        }
        if higher.subject_dn != lower.issuer_dn {
            return Err(Error::InvalidCertificate);
        }
    }

    let anchored = chain.iter().any(|cert| anchors.matches(&cert.subject_public_key, required_use));
    if !anchored {
        return Err(Error::InvalidCertificate);
    }

    Ok(())
}
