use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ledger::merkle;
use crate::ledger::signers::SignerKind;

pub(crate) const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum BlockKind {
    QuestionPaperUpload,
    AnswerKeyAiVerified,
    AnswerKeyHumanApproved,
    AnswerKeyLocked,
    SheetIngested,
    QualityAssessed,
    Reconstructed,
    BubblesRead,
    AiSolved,
    ManualEntered,
    Reconciled,
    Scored,
    InterventionOpened,
    InterventionResolved,
    ResultFinalized,
    RecheckRequested,
    RecheckCompleted,
}

impl BlockKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            BlockKind::QuestionPaperUpload => "QUESTION_PAPER_UPLOAD",
            BlockKind::AnswerKeyAiVerified => "ANSWER_KEY_AI_VERIFIED",
            BlockKind::AnswerKeyHumanApproved => "ANSWER_KEY_HUMAN_APPROVED",
            BlockKind::AnswerKeyLocked => "ANSWER_KEY_LOCKED",
            BlockKind::SheetIngested => "SHEET_INGESTED",
            BlockKind::QualityAssessed => "QUALITY_ASSESSED",
            BlockKind::Reconstructed => "RECONSTRUCTED",
            BlockKind::BubblesRead => "BUBBLES_READ",
            BlockKind::AiSolved => "AI_SOLVED",
            BlockKind::ManualEntered => "MANUAL_ENTERED",
            BlockKind::Reconciled => "RECONCILED",
            BlockKind::InterventionOpened => "INTERVENTION_OPENED",
            BlockKind::InterventionResolved => "INTERVENTION_RESOLVED",
            BlockKind::ResultFinalized => "RESULT_FINALIZED",
            BlockKind::Scored => "SCORED",
            BlockKind::RecheckRequested => "RECHECK_REQUESTED",
            BlockKind::RecheckCompleted => "RECHECK_COMPLETED",
        }
    }
}

/// One (key, value-hash) pair of a block payload. The value itself lives in
/// the persistent store; the ledger carries only its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PayloadItem {
    pub(crate) key: String,
    pub(crate) value_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BlockSignature {
    pub(crate) signer_kind: SignerKind,
    pub(crate) signer_key: String,
    pub(crate) signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LedgerBlock {
    pub(crate) index: u64,
    pub(crate) timestamp_nanos: i64,
    pub(crate) kind: BlockKind,
    pub(crate) payload: Vec<PayloadItem>,
    pub(crate) merkle_root: String,
    pub(crate) prev_hash: String,
    pub(crate) signatures: Vec<BlockSignature>,
    pub(crate) nonce: u64,
    pub(crate) self_hash: String,
}

impl LedgerBlock {
    /// Root of the payload Merkle tree, over the raw value hashes in payload
    /// order. The key travels with the leaf so that renaming a payload entry
    /// also moves the root.
    pub(crate) fn payload_merkle_root(payload: &[PayloadItem]) -> String {
        let leaves: Vec<[u8; 32]> = payload
            .iter()
            .map(|item| {
                let mut material = Vec::with_capacity(item.key.len() + 1 + item.value_hash.len());
                material.extend_from_slice(item.key.as_bytes());
                material.push(b':');
                material.extend_from_slice(item.value_hash.as_bytes());
                merkle::hash_leaf(&material)
            })
            .collect();
        hex::encode(merkle::merkle_root(&leaves))
    }

    /// SHA-256 over the canonical preimage
    /// `index ‖ timestamp ‖ kind ‖ merkle_root ‖ prev_hash ‖ signatures ‖ nonce`.
    pub(crate) fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_be_bytes());
        hasher.update(self.timestamp_nanos.to_be_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.merkle_root.as_bytes());
        hasher.update(self.prev_hash.as_bytes());
        for signature in &self.signatures {
            hasher.update(signature.signer_kind.as_str().as_bytes());
            hasher.update(signature.signer_key.as_bytes());
            hasher.update(signature.signature.as_bytes());
        }
        hasher.update(self.nonce.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    pub(crate) fn meets_difficulty(hash: &str, hex_zeros: u8) -> bool {
        hash.bytes().take(hex_zeros as usize).all(|byte| byte == b'0')
    }

    /// Deterministic nonce scan until the difficulty predicate holds. Returns
    /// false when `budget` nonces were tried without success.
    pub(crate) fn mine(&mut self, hex_zeros: u8, budget: u64) -> bool {
        for nonce in 0..=budget {
            self.nonce = nonce;
            let hash = self.compute_hash();
            if Self::meets_difficulty(&hash, hex_zeros) {
                self.self_hash = hash;
                return true;
            }
        }
        false
    }
}

/// Content hash of a domain object: SHA-256 over its canonical JSON
/// serialization. Map-typed fields are `BTreeMap`s, so key order is stable.
pub(crate) fn hash_value<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn payload_item<T: Serialize>(key: &str, value: &T) -> PayloadItem {
    PayloadItem { key: key.to_string(), value_hash: hash_value(value) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> LedgerBlock {
        let payload = vec![payload_item("sheet_id", &"sheet-1"), payload_item("stage", &"ingested")];
        let merkle_root = LedgerBlock::payload_merkle_root(&payload);
        let mut block = LedgerBlock {
            index: 0,
            timestamp_nanos: 1_700_000_000_000_000_000,
            kind: BlockKind::SheetIngested,
            payload,
            merkle_root,
            prev_hash: GENESIS_PREV_HASH.to_string(),
            signatures: Vec::new(),
            nonce: 0,
            self_hash: String::new(),
        };
        block.self_hash = block.compute_hash();
        block
    }

    #[test]
    fn hash_is_deterministic() {
        let block = sample_block();
        assert_eq!(block.compute_hash(), block.compute_hash());
        assert_eq!(block.self_hash.len(), 64);
    }

    #[test]
    fn hash_depends_on_every_header_field() {
        let baseline = sample_block();

        let mut changed = baseline.clone();
        changed.index = 7;
        assert_ne!(changed.compute_hash(), baseline.self_hash);

        let mut changed = baseline.clone();
        changed.timestamp_nanos += 1;
        assert_ne!(changed.compute_hash(), baseline.self_hash);

        let mut changed = baseline.clone();
        changed.kind = BlockKind::Scored;
        assert_ne!(changed.compute_hash(), baseline.self_hash);

        let mut changed = baseline.clone();
        changed.merkle_root = "ff".repeat(32);
        assert_ne!(changed.compute_hash(), baseline.self_hash);

        let mut changed = baseline.clone();
        changed.nonce = 99;
        assert_ne!(changed.compute_hash(), baseline.self_hash);
    }

    #[test]
    fn mining_at_zero_difficulty_accepts_first_nonce() {
        let mut block = sample_block();
        assert!(block.mine(0, 0));
        assert_eq!(block.nonce, 0);
    }

    #[test]
    fn mining_finds_a_leading_zero() {
        let mut block = sample_block();
        assert!(block.mine(1, 1 << 16));
        assert!(block.self_hash.starts_with('0'));
        assert_eq!(block.self_hash, block.compute_hash());
    }

    #[test]
    fn mining_respects_its_budget() {
        let mut block = sample_block();
        // Six leading zeros within two nonces is effectively impossible.
        assert!(!block.mine(6, 1));
    }

    #[test]
    fn payload_merkle_root_tracks_item_order_and_keys() {
        let a = payload_item("sheet_id", &"sheet-1");
        let b = payload_item("stage", &"ingested");
        let forward = LedgerBlock::payload_merkle_root(&[a.clone(), b.clone()]);
        let reversed = LedgerBlock::payload_merkle_root(&[b, a.clone()]);
        assert_ne!(forward, reversed);

        let renamed = PayloadItem { key: "sheet".to_string(), value_hash: a.value_hash.clone() };
        let swapped =
            LedgerBlock::payload_merkle_root(&[renamed, payload_item("stage", &"ingested")]);
        assert_ne!(swapped, forward);
    }

    #[test]
    fn hash_value_is_stable_for_equal_content() {
        use std::collections::BTreeMap;
        let mut first = BTreeMap::new();
        first.insert(2u32, "B".to_string());
        first.insert(1u32, "A".to_string());
        let mut second = BTreeMap::new();
        second.insert(1u32, "A".to_string());
        second.insert(2u32, "B".to_string());
        assert_eq!(hash_value(&first), hash_value(&second));
    }
}
