pub(crate) mod block;
pub(crate) mod merkle;
pub(crate) mod signers;
pub(crate) mod store;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use serde::Serialize;

use crate::core::time::now_unix_nanos;
use crate::ledger::block::{BlockKind, BlockSignature, LedgerBlock, PayloadItem, GENESIS_PREV_HASH};
use crate::ledger::signers::{SignatureError, SignerRegistry};
use crate::ledger::store::LedgerFile;

#[derive(Debug, thiserror::Error)]
pub(crate) enum LedgerError {
    #[error("ledger head moved: expected next index {expected}, found {actual}")]
    ChainStale { expected: u64, actual: u64 },
    #[error("mining budget of {budget} nonces exhausted")]
    MiningBudgetExceeded { budget: u64 },
    #[error("finalization signatures rejected: {0}")]
    Signature(#[from] SignatureError),
    #[error("chain integrity violated at block {index}: {reason}")]
    ChainIntegrity { index: u64, reason: String },
    #[error("ledger is read-only until an operator repairs the chain")]
    ReadOnly,
    #[error("ledger persistence failed: {0}")]
    Persist(String),
}

#[derive(Debug, Serialize)]
pub(crate) struct LedgerStats {
    pub(crate) total_blocks: u64,
    pub(crate) blocks_by_kind: BTreeMap<String, u64>,
    pub(crate) difficulty_hex_zeros: u8,
    pub(crate) head_hash: Option<String>,
    pub(crate) genesis_hash: Option<String>,
    pub(crate) is_valid: bool,
    pub(crate) read_only: bool,
}

/// Single-writer, append-only hash chain. Readers take the chain lock
/// shared and always observe the last fsynced head; the writer holds the
/// file mutex for the whole mine-write-publish sequence.
pub(crate) struct Ledger {
    difficulty: u8,
    mining_budget: u64,
    registry: SignerRegistry,
    chain: RwLock<Vec<LedgerBlock>>,
    writer: Mutex<LedgerFile>,
    read_only: AtomicBool,
}

impl Ledger {
    pub(crate) fn open(
        path: &Path,
        difficulty: u8,
        mining_budget: u64,
        registry: SignerRegistry,
    ) -> anyhow::Result<Self> {
        let (file, blocks) = LedgerFile::open(path)?;

        let mut read_only = false;
        if let Err(err) = verify_blocks(&blocks, difficulty) {
            tracing::error!(error = %err, "Ledger failed startup validation; entering read-only mode");
            read_only = true;
        }

        Ok(Self {
            difficulty,
            mining_budget,
            registry,
            chain: RwLock::new(blocks),
            writer: Mutex::new(file),
            read_only: AtomicBool::new(read_only),
        })
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Append a block. `expected_index` is the index the caller computed its
    /// payload against; a concurrent append in between surfaces as
    /// `ChainStale`. RESULT_FINALIZED additionally requires the
    /// multi-signature policy to hold over `sig_message`.
    pub(crate) fn append(
        &self,
        kind: BlockKind,
        payload: Vec<PayloadItem>,
        signatures: Vec<BlockSignature>,
        expected_index: Option<u64>,
        sig_message: Option<&[u8]>,
    ) -> Result<LedgerBlock, LedgerError> {
        if self.is_read_only() {
            return Err(LedgerError::ReadOnly);
        }

        if kind == BlockKind::ResultFinalized {
            let message = sig_message.ok_or(SignatureError::Insufficient {
                provided: signatures.len(),
                distinct: 0,
                required: signers::REQUIRED_FINALIZE_SIGNATURES,
            })?;
            self.registry.check_finalize_policy(&signatures, message)?;
        }

        let mut writer = self.writer.lock().unwrap_or_else(|err| err.into_inner());

        let (index, prev_hash) = {
            let chain = self.chain.read().unwrap_or_else(|err| err.into_inner());
            let index = chain.len() as u64;
            let prev_hash = chain
                .last()
                .map(|head| head.self_hash.clone())
                .unwrap_or_else(|| GENESIS_PREV_HASH.to_string());
            (index, prev_hash)
        };

        if let Some(expected) = expected_index {
            if expected != index {
                return Err(LedgerError::ChainStale { expected, actual: index });
            }
        }

        let merkle_root = LedgerBlock::payload_merkle_root(&payload);
        let mut block = LedgerBlock {
            index,
            timestamp_nanos: now_unix_nanos(),
            kind,
            payload,
            merkle_root,
            prev_hash,
            signatures,
            nonce: 0,
            self_hash: String::new(),
        };

        if !block.mine(self.difficulty, self.mining_budget) {
            return Err(LedgerError::MiningBudgetExceeded { budget: self.mining_budget });
        }

        writer.append(&block).map_err(|err| LedgerError::Persist(err.to_string()))?;

        let mut chain = self.chain.write().unwrap_or_else(|err| err.into_inner());
        chain.push(block.clone());

        metrics::counter!("ledger_blocks_appended_total", "kind" => block.kind.as_str())
            .increment(1);
        tracing::info!(index = block.index, kind = block.kind.as_str(), hash = %block.self_hash, "Ledger block appended");

        Ok(block)
    }

    pub(crate) fn head(&self) -> Option<LedgerBlock> {
        self.chain.read().unwrap_or_else(|err| err.into_inner()).last().cloned()
    }

    pub(crate) fn len(&self) -> u64 {
        self.chain.read().unwrap_or_else(|err| err.into_inner()).len() as u64
    }

    pub(crate) fn get_by_index(&self, index: u64) -> Option<LedgerBlock> {
        self.chain.read().unwrap_or_else(|err| err.into_inner()).get(index as usize).cloned()
    }

    pub(crate) fn get_by_hash(&self, hash: &str) -> Option<LedgerBlock> {
        self.chain
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .iter()
            .find(|block| block.self_hash == hash)
            .cloned()
    }

    /// Blocks with `index > after`, oldest first, capped at `limit`.
    pub(crate) fn list(&self, after: Option<u64>, limit: usize) -> Vec<LedgerBlock> {
        let chain = self.chain.read().unwrap_or_else(|err| err.into_inner());
        let start = after.map(|index| index as usize + 1).unwrap_or(0);
        chain.iter().skip(start).take(limit).cloned().collect()
    }

    /// All blocks carrying a payload item with this key and value hash;
    /// value hashes are deterministic, so equality on them recovers the
    /// per-entity block trail.
    pub(crate) fn find_by_payload(&self, key: &str, value_hash: &str) -> Vec<LedgerBlock> {
        let chain = self.chain.read().unwrap_or_else(|err| err.into_inner());
        chain
            .iter()
            .filter(|block| {
                block
                    .payload
                    .iter()
                    .any(|item| item.key == key && item.value_hash == value_hash)
            })
            .cloned()
            .collect()
    }

    /// Walk the whole chain without side effects, reporting the first
    /// offending index.
    pub(crate) fn verify_chain(&self) -> Result<(), LedgerError> {
        let chain = self.chain.read().unwrap_or_else(|err| err.into_inner());
        verify_blocks(&chain, self.difficulty)
    }

    /// Full validation; on failure the ledger latches into read-only mode
    /// and refuses further appends until operator intervention.
    pub(crate) fn validate(&self) -> Result<(), LedgerError> {
        match self.verify_chain() {
            Ok(()) => Ok(()),
            Err(err) => {
                if !self.read_only.swap(true, Ordering::SeqCst) {
                    tracing::error!(error = %err, "Ledger validation failed; writes disabled");
                }
                Err(err)
            }
        }
    }

    pub(crate) fn stats(&self) -> LedgerStats {
        let is_valid = self.verify_chain().is_ok();
        let chain = self.chain.read().unwrap_or_else(|err| err.into_inner());
        let mut blocks_by_kind: BTreeMap<String, u64> = BTreeMap::new();
        for block in chain.iter() {
            *blocks_by_kind.entry(block.kind.as_str().to_string()).or_default() += 1;
        }
        LedgerStats {
            total_blocks: chain.len() as u64,
            blocks_by_kind,
            difficulty_hex_zeros: self.difficulty,
            head_hash: chain.last().map(|block| block.self_hash.clone()),
            genesis_hash: chain.first().map(|block| block.self_hash.clone()),
            is_valid,
            read_only: self.is_read_only(),
        }
    }
}

fn verify_blocks(blocks: &[LedgerBlock], difficulty: u8) -> Result<(), LedgerError> {
    let mut prev_hash = GENESIS_PREV_HASH;
    for (position, block) in blocks.iter().enumerate() {
        let index = position as u64;
        let fail = |reason: String| LedgerError::ChainIntegrity { index, reason };

        if block.index != index {
            return Err(fail(format!("index {} out of sequence", block.index)));
        }
        if block.prev_hash != prev_hash {
            return Err(fail("previous-hash linkage broken".to_string()));
        }
        let recomputed_root = LedgerBlock::payload_merkle_root(&block.payload);
        if recomputed_root != block.merkle_root {
            return Err(fail("merkle root does not match payload".to_string()));
        }
        let recomputed_hash = block.compute_hash();
        if recomputed_hash != block.self_hash {
            return Err(fail("self hash does not match block contents".to_string()));
        }
        if !LedgerBlock::meets_difficulty(&block.self_hash, difficulty) {
            return Err(fail(format!("difficulty predicate ({difficulty} hex zeros) not met")));
        }
        prev_hash = &block.self_hash;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::block::payload_item;
    use crate::ledger::signers::testing::TestSigners;
    use crate::ledger::signers::SignerKind;

    fn open_ledger(dir: &tempfile::TempDir, signers: &TestSigners) -> Ledger {
        Ledger::open(
            &dir.path().join("ledger.chain"),
            0,
            1 << 16,
            signers.registry.clone(),
        )
        .expect("open ledger")
    }

    fn ingest_payload(sheet: &str) -> Vec<PayloadItem> {
        vec![payload_item("sheet_id", &sheet)]
    }

    #[test]
    fn appended_blocks_link_and_count_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signers = TestSigners::generate();
        let ledger = open_ledger(&dir, &signers);

        for n in 0..5 {
            let block = ledger
                .append(
                    BlockKind::SheetIngested,
                    ingest_payload(&format!("sheet-{n}")),
                    Vec::new(),
                    None,
                    None,
                )
                .expect("append");
            assert_eq!(block.index, n);
        }

        let blocks = ledger.list(None, 10);
        for pair in blocks.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].self_hash);
            assert_eq!(pair[1].index, pair[0].index + 1);
        }
        assert_eq!(blocks[0].prev_hash, GENESIS_PREV_HASH);

        let third = ledger.get_by_index(2).expect("block 2");
        assert_eq!(third.self_hash, blocks[2].self_hash);
        assert_eq!(ledger.get_by_hash(&third.self_hash).expect("by hash").index, 2);
        assert!(ledger.get_by_index(99).is_none());

        assert!(ledger.validate().is_ok());
    }

    #[test]
    fn chain_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signers = TestSigners::generate();
        {
            let ledger = open_ledger(&dir, &signers);
            ledger
                .append(BlockKind::SheetIngested, ingest_payload("sheet-1"), Vec::new(), None, None)
                .expect("append");
        }

        let reopened = open_ledger(&dir, &signers);
        assert_eq!(reopened.len(), 1);
        assert!(reopened.validate().is_ok());
        assert!(!reopened.is_read_only());
    }

    #[test]
    fn stale_expected_index_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signers = TestSigners::generate();
        let ledger = open_ledger(&dir, &signers);

        ledger
            .append(BlockKind::SheetIngested, ingest_payload("sheet-1"), Vec::new(), Some(0), None)
            .expect("first append");

        let err = ledger
            .append(BlockKind::QualityAssessed, ingest_payload("sheet-1"), Vec::new(), Some(0), None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::ChainStale { expected: 0, actual: 1 }));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn finalize_requires_three_distinct_verified_signatures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signers = TestSigners::generate();
        let ledger = open_ledger(&dir, &signers);

        let message = b"result-hash";
        let two = vec![
            signers.sign(SignerKind::AiVerifier, message),
            signers.sign(SignerKind::HumanVerifier, message),
        ];
        let err = ledger
            .append(
                BlockKind::ResultFinalized,
                ingest_payload("sheet-1"),
                two,
                None,
                Some(message),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Signature(SignatureError::Insufficient { .. })));
        assert_eq!(ledger.len(), 0, "no block may be appended on policy failure");

        let all = signers.sign_all(message);
        let block = ledger
            .append(BlockKind::ResultFinalized, ingest_payload("sheet-1"), all, None, Some(message))
            .expect("finalize");
        assert_eq!(block.signatures.len(), 3);
    }

    #[test]
    fn exhausted_mining_budget_appends_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signers = TestSigners::generate();
        let ledger = Ledger::open(
            &dir.path().join("ledger.chain"),
            6, // six leading hex zeros are unreachable within one nonce
            1,
            signers.registry.clone(),
        )
        .expect("open ledger");

        let err = ledger
            .append(BlockKind::SheetIngested, ingest_payload("sheet-1"), Vec::new(), None, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::MiningBudgetExceeded { budget: 1 }));
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn tampered_merkle_root_on_disk_fails_at_that_index_and_freezes_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signers = TestSigners::generate();
        let path = dir.path().join("ledger.chain");

        let tampered_root;
        {
            let ledger = Ledger::open(&path, 0, 1 << 16, signers.registry.clone()).expect("open");
            let mut roots = Vec::new();
            for n in 0..10 {
                let block = ledger
                    .append(
                        BlockKind::SheetIngested,
                        ingest_payload(&format!("sheet-{n}")),
                        Vec::new(),
                        None,
                        None,
                    )
                    .expect("append");
                roots.push(block.merkle_root);
            }
            tampered_root = roots[5].clone();
        }

        // Flip one hex digit of block 5's merkle root directly on disk.
        let raw = std::fs::read(&path).expect("read ledger file");
        let needle = tampered_root.as_bytes();
        let offset = raw
            .windows(needle.len())
            .position(|window| window == needle)
            .expect("merkle root present in file");
        let mut mutated = raw;
        mutated[offset] = if mutated[offset] == b'0' { b'1' } else { b'0' };
        std::fs::write(&path, mutated).expect("write tampered file");

        let ledger = Ledger::open(&path, 0, 1 << 16, signers.registry.clone()).expect("reopen");
        let err = ledger.validate().unwrap_err();
        match err {
            LedgerError::ChainIntegrity { index, .. } => assert_eq!(index, 5),
            other => panic!("unexpected error: {other}"),
        }

        let refused = ledger
            .append(BlockKind::SheetIngested, ingest_payload("sheet-x"), Vec::new(), None, None)
            .unwrap_err();
        assert!(matches!(refused, LedgerError::ReadOnly));
    }

    #[test]
    fn payload_trail_recovers_blocks_for_one_sheet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signers = TestSigners::generate();
        let ledger = open_ledger(&dir, &signers);

        for kind in [BlockKind::SheetIngested, BlockKind::QualityAssessed, BlockKind::BubblesRead] {
            ledger.append(kind, ingest_payload("sheet-1"), Vec::new(), None, None).expect("append");
        }
        ledger
            .append(BlockKind::SheetIngested, ingest_payload("sheet-2"), Vec::new(), None, None)
            .expect("append other");

        let wanted = payload_item("sheet_id", &"sheet-1");
        let trail = ledger.find_by_payload("sheet_id", &wanted.value_hash);
        assert_eq!(trail.len(), 3);
        assert!(trail.iter().all(|block| block.payload[0].value_hash == wanted.value_hash));
    }

    #[test]
    fn stats_summarize_kind_counts_and_head() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signers = TestSigners::generate();
        let ledger = open_ledger(&dir, &signers);

        ledger
            .append(BlockKind::SheetIngested, ingest_payload("sheet-1"), Vec::new(), None, None)
            .expect("append");
        ledger
            .append(BlockKind::QualityAssessed, ingest_payload("sheet-1"), Vec::new(), None, None)
            .expect("append");

        let stats = ledger.stats();
        assert_eq!(stats.total_blocks, 2);
        assert_eq!(stats.blocks_by_kind.get("SHEET_INGESTED"), Some(&1));
        assert!(stats.is_valid);
        assert_eq!(stats.head_hash, ledger.head().map(|block| block.self_hash));
    }
}
