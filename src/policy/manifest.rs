//! Signed permission-policy rules attached to an identity (spec §3
//! "Manifest"). Canonical signing form is the manifest serialized through
//! the (out-of-scope) wire marshaller in little-endian order, omitting
//! the `signature` field (spec §6).

use byteorder::{ByteOrder, LittleEndian};
use p256::ecdsa::signature::{Signature as SignatureTrait, Verifier};
use p256::ecdsa::{Signature as EcdsaSignature, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::policy::permission_policy::Rule;

#[derive(Debug, Clone)]
pub struct Manifest {
    pub version: u32,
    pub rules: Vec<Rule>,
    pub thumbprint_alg_oid: String,
    pub thumbprint: [u8; 32],
    pub sig_alg_oid: String,
    pub signature: Vec<u8>,
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(bytes);
}

impl Manifest {
    /// The bytes the signature is computed over: `(version, rules,
    /// thumbprint-alg-oid, thumbprint, sig-alg-oid)`, signature omitted.
    pub fn canonical_signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut version_buf = [0u8; 4];
        LittleEndian::write_u32(&mut version_buf, self.version);
        buf.extend_from_slice(&version_buf);

        let mut rules_len = [0u8; 4];
        LittleEndian::write_u32(&mut rules_len, self.rules.len() as u32);
        buf.extend_from_slice(&rules_len);
        for rule in &self.rules {
            write_len_prefixed(&mut buf, rule.obj_path.as_bytes());
            write_len_prefixed(&mut buf, rule.interface_name.as_bytes());
            let mut member_len = [0u8; 4];
            LittleEndian::write_u32(&mut member_len, rule.members.len() as u32);
            buf.extend_from_slice(&member_len);
            for member in &rule.members {
                write_len_prefixed(&mut buf, member.name.as_bytes());
                buf.push(match member.kind {
                    crate::policy::MemberKind::Method => 0,
                    crate::policy::MemberKind::Signal => 1,
                    crate::policy::MemberKind::Property => 2,
                });
                buf.push(
                    (member.mask.provide as u8) | ((member.mask.observe as u8) << 1) | ((member.mask.modify as u8) << 2),
                );
            }
        }

        write_len_prefixed(&mut buf, self.thumbprint_alg_oid.as_bytes());
        buf.extend_from_slice(&self.thumbprint);
        write_len_prefixed(&mut buf, self.sig_alg_oid.as_bytes());
        buf
    }

    /// `thumbprint == SHA-256(leaf_cert_der)` (spec §3: "Thumbprint is
    /// SHA-256 of the leaf identity certificate").
    pub fn thumbprint_matches(&self, leaf_cert_der: &[u8]) -> bool {
        let digest = Sha256::digest(leaf_cert_der);
        digest.as_slice() == self.thumbprint
    }

    /// Verifies `self.signature` over `canonical_signing_bytes()` with
    /// the signer's ECDSA-SHA-256 public key.
    pub fn verify(&self, signer: &VerifyingKey) -> Result<()> {
        let sig = EcdsaSignature::from_bytes(&self.signature).map_err(|_| Error::InvalidCertificate)?;
        signer
            .verify(&self.canonical_signing_bytes(), &sig)
            .map_err(|_| Error::DigestMismatch)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::permission_policy::{Member, MemberKind, PermissionMask, Rule};
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;

    fn sample_manifest(thumbprint: [u8; 32]) -> Manifest {
        Manifest {
            version: 1,
            rules: vec![Rule {
                obj_path: "/app".into(),
                interface_name: "org.example.Thing".into(),
                members: vec![Member {
                    name: "Do".into(),
                    kind: MemberKind::Method,
                    mask: PermissionMask {
                        provide: true,
                        observe: false,
                        modify: false,
                    },
                }],
            }],
            thumbprint_alg_oid: "2.16.840.1.101.3.4.2.1".into(),
            thumbprint,
            sig_alg_oid: "1.2.840.10045.4.3.2".into(),
            signature: Vec::new(),
        }
    }

    #[test]
    fn thumbprint_matches_sha256_of_leaf_cert() {
        let leaf = b"pretend-der-encoded-cert";
        let digest = Sha256::digest(leaf);
        let mut thumbprint = [0u8; 32];
            thumbprint.copy_from_slice(&digest);
        let manifest = sample_manifest(thumbprint);
        assert!(manifest.thumbprint_matches(leaf));
        assert!(!manifest.thumbprint_matches(b"different cert"));
    }

    #[test]
    fn signed_manifest_verifies_and_rejects_tamper() {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let verifying_key = VerifyingKey::from(&signing_key);
        let mut manifest = sample_manifest([0u8; 32]);
        let sig: EcdsaSignature = signing_key.sign(&manifest.canonical_signing_bytes());
        manifest.signature = sig.as_bytes().to_vec();

        assert!(manifest.verify(&verifying_key).is_ok());

        let mut rule_tampered = manifest.clone();
        rule_tampered.rules[0].members[0].name = "Tampered".into();
        assert_eq!(rule_tampered.verify(&verifying_key), Err(Error::DigestMismatch));

        let mut thumbprint_tampered = manifest.clone();
        thumbprint_tampered.thumbprint[0] ^= 0x01;
        assert_eq!(thumbprint_tampered.verify(&verifying_key), Err(Error::DigestMismatch));
    }
}
