//! The append-inside-transaction pattern: a stage handler begins a store
//! transaction, mutates entity rows, appends the matching ledger block,
//! stamps the block hash onto the rows, and only then commits. A failed
//! append aborts the transaction, so no transition outruns its block.

use serde::Serialize;

use crate::ledger::block::{payload_item, BlockKind, BlockSignature, LedgerBlock, PayloadItem};
use crate::ledger::{Ledger, LedgerError};

const CHAIN_STALE_RETRIES: u32 = 3;

/// Append a block, retrying the small window where a concurrent writer got
/// in between reading the head and appending.
pub(crate) fn append_block(
    ledger: &Ledger,
    kind: BlockKind,
    payload: Vec<PayloadItem>,
    signatures: Vec<BlockSignature>,
    sig_message: Option<&[u8]>,
) -> Result<LedgerBlock, LedgerError> {
    let mut attempts = 0;
    loop {
        let expected = ledger.len();
        match ledger.append(kind, payload.clone(), signatures.clone(), Some(expected), sig_message)
        {
            Err(LedgerError::ChainStale { .. }) if attempts < CHAIN_STALE_RETRIES => {
                attempts += 1;
                tracing::debug!(kind = kind.as_str(), attempts, "Ledger head moved; retrying append");
            }
            other => return other,
        }
    }
}

/// Payload entry identifying the sheet a block belongs to. The value hash
/// of an id is deterministic, so `Ledger::find_by_payload` can recover a
/// sheet's full block trail from this item.
pub(crate) fn sheet_item(sheet_id: &str) -> PayloadItem {
    payload_item("sheet_id", &sheet_id)
}

pub(crate) fn stage_item(stage: &str) -> PayloadItem {
    payload_item("stage", &stage)
}

pub(crate) fn entity_item<T: Serialize>(key: &str, entity: &T) -> PayloadItem {
    payload_item(key, entity)
}
