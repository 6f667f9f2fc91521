use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::ledger::block::BlockSignature;

/// The three roles whose distinct signatures commit a final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum SignerKind {
    #[serde(rename = "ai-verifier")]
    AiVerifier,
    #[serde(rename = "human-verifier")]
    HumanVerifier,
    #[serde(rename = "admin-controller")]
    AdminController,
}

impl SignerKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SignerKind::AiVerifier => "ai-verifier",
            SignerKind::HumanVerifier => "human-verifier",
            SignerKind::AdminController => "admin-controller",
        }
    }
}

pub(crate) const REQUIRED_FINALIZE_SIGNATURES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub(crate) enum SignatureError {
    #[error("signer kind {0} is not registered")]
    UnknownSigner(&'static str),
    #[error("signer key for {0} does not match the registry")]
    KeyMismatch(&'static str),
    #[error("signature from {0} is malformed")]
    Malformed(&'static str),
    #[error("signature from {0} does not verify")]
    Invalid(&'static str),
    #[error("{provided} signatures with {distinct} distinct kinds, {required} distinct kinds required")]
    Insufficient { provided: usize, distinct: usize, required: usize },
}

/// Signer-kind → ed25519 verifying key registry, read-only after startup.
#[derive(Debug, Clone)]
pub(crate) struct SignerRegistry {
    keys: HashMap<SignerKind, VerifyingKey>,
}

impl SignerRegistry {
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read signer registry {}", path.display()))?;
        let entries: HashMap<SignerKind, String> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse signer registry {}", path.display()))?;

        let mut keys = HashMap::with_capacity(entries.len());
        for (kind, key_hex) in entries {
            keys.insert(kind, parse_verifying_key(&key_hex, kind)?);
        }
        Ok(Self { keys })
    }

    pub(crate) fn from_keys(keys: HashMap<SignerKind, VerifyingKey>) -> Self {
        Self { keys }
    }

    pub(crate) fn key_for(&self, kind: SignerKind) -> Option<&VerifyingKey> {
        self.keys.get(&kind)
    }

    /// Verify one block signature against `message`.
    pub(crate) fn verify(
        &self,
        signature: &BlockSignature,
        message: &[u8],
    ) -> Result<(), SignatureError> {
        let kind = signature.signer_kind;
        let registered =
            self.keys.get(&kind).ok_or(SignatureError::UnknownSigner(kind.as_str()))?;

        let claimed = hex::decode(&signature.signer_key)
            .ok()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .ok_or(SignatureError::Malformed(kind.as_str()))?;
        if claimed != registered.to_bytes() {
            return Err(SignatureError::KeyMismatch(kind.as_str()));
        }

        let sig_bytes = hex::decode(&signature.signature)
            .ok()
            .and_then(|bytes| <[u8; 64]>::try_from(bytes).ok())
            .ok_or(SignatureError::Malformed(kind.as_str()))?;
        let parsed = Signature::from_bytes(&sig_bytes);

        registered
            .verify(message, &parsed)
            .map_err(|_| SignatureError::Invalid(kind.as_str()))
    }

    /// The RESULT_FINALIZED commitment policy: at least three verified
    /// signatures with pairwise-distinct signer kinds.
    pub(crate) fn check_finalize_policy(
        &self,
        signatures: &[BlockSignature],
        message: &[u8],
    ) -> Result<(), SignatureError> {
        let distinct: HashSet<SignerKind> =
            signatures.iter().map(|signature| signature.signer_kind).collect();
        if signatures.len() < REQUIRED_FINALIZE_SIGNATURES
            || distinct.len() < REQUIRED_FINALIZE_SIGNATURES
        {
            return Err(SignatureError::Insufficient {
                provided: signatures.len(),
                distinct: distinct.len(),
                required: REQUIRED_FINALIZE_SIGNATURES,
            });
        }
        for signature in signatures {
            self.verify(signature, message)?;
        }
        Ok(())
    }
}

fn parse_verifying_key(key_hex: &str, kind: SignerKind) -> anyhow::Result<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(key_hex.trim())
        .ok()
        .and_then(|decoded| decoded.try_into().ok())
        .with_context(|| format!("Signer key for {} is not 32 hex-encoded bytes", kind.as_str()))?;
    VerifyingKey::from_bytes(&bytes)
        .with_context(|| format!("Signer key for {} is not a valid ed25519 point", kind.as_str()))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use std::collections::BTreeMap;

    pub(crate) struct TestSigners {
        pub(crate) registry: SignerRegistry,
        keys: HashMap<SignerKind, SigningKey>,
    }

    impl TestSigners {
        pub(crate) fn generate() -> Self {
            let mut keys = HashMap::new();
            let mut verifying = HashMap::new();
            for kind in
                [SignerKind::AiVerifier, SignerKind::HumanVerifier, SignerKind::AdminController]
            {
                let signing = SigningKey::generate(&mut OsRng);
                verifying.insert(kind, signing.verifying_key());
                keys.insert(kind, signing);
            }
            Self { registry: SignerRegistry::from_keys(verifying), keys }
        }

        pub(crate) fn sign(&self, kind: SignerKind, message: &[u8]) -> BlockSignature {
            let signing = &self.keys[&kind];
            BlockSignature {
                signer_kind: kind,
                signer_key: hex::encode(signing.verifying_key().to_bytes()),
                signature: hex::encode(signing.sign(message).to_bytes()),
            }
        }

        pub(crate) fn sign_all(&self, message: &[u8]) -> Vec<BlockSignature> {
            [SignerKind::AiVerifier, SignerKind::HumanVerifier, SignerKind::AdminController]
                .into_iter()
                .map(|kind| self.sign(kind, message))
                .collect()
        }

        pub(crate) fn registry_json(&self) -> String {
            let entries: BTreeMap<&str, String> = self
                .keys
                .iter()
                .map(|(kind, key)| {
                    (kind.as_str(), hex::encode(key.verifying_key().to_bytes()))
                })
                .collect();
            serde_json::to_string_pretty(&entries).expect("registry json")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestSigners;
    use super::*;

    #[test]
    fn verifies_a_well_formed_signature() {
        let signers = TestSigners::generate();
        let message = b"result-hash";
        let signature = signers.sign(SignerKind::AiVerifier, message);
        assert!(signers.registry.verify(&signature, message).is_ok());
    }

    #[test]
    fn rejects_a_signature_over_different_bytes() {
        let signers = TestSigners::generate();
        let signature = signers.sign(SignerKind::HumanVerifier, b"one message");
        let err = signers.registry.verify(&signature, b"another message").unwrap_err();
        assert!(matches!(err, SignatureError::Invalid(_)));
    }

    #[test]
    fn rejects_a_key_not_in_the_registry() {
        let signers = TestSigners::generate();
        let stranger = TestSigners::generate();
        let signature = stranger.sign(SignerKind::AdminController, b"message");
        let err = signers.registry.verify(&signature, b"message").unwrap_err();
        assert!(matches!(err, SignatureError::KeyMismatch(_)));
    }

    #[test]
    fn finalize_policy_requires_three_distinct_kinds() {
        let signers = TestSigners::generate();
        let message = b"result-hash";

        let two = vec![
            signers.sign(SignerKind::AiVerifier, message),
            signers.sign(SignerKind::HumanVerifier, message),
        ];
        let err = signers.registry.check_finalize_policy(&two, message).unwrap_err();
        assert!(matches!(err, SignatureError::Insufficient { provided: 2, distinct: 2, .. }));

        let duplicated = vec![
            signers.sign(SignerKind::AiVerifier, message),
            signers.sign(SignerKind::AiVerifier, message),
            signers.sign(SignerKind::HumanVerifier, message),
        ];
        let err = signers.registry.check_finalize_policy(&duplicated, message).unwrap_err();
        assert!(matches!(err, SignatureError::Insufficient { provided: 3, distinct: 2, .. }));

        let all = signers.sign_all(message);
        assert!(signers.registry.check_finalize_policy(&all, message).is_ok());
    }

    #[test]
    fn registry_round_trips_through_json() {
        let signers = TestSigners::generate();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("signers.json");
        std::fs::write(&path, signers.registry_json()).expect("write registry");

        let loaded = SignerRegistry::load(&path).expect("load registry");
        let message = b"payload";
        let signature = signers.sign(SignerKind::AiVerifier, message);
        assert!(loaded.verify(&signature, message).is_ok());
    }
}
