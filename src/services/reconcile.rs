use std::collections::BTreeMap;

use crate::db::models::{BubbleCell, KeyEntry, ReconEntry, SolverCell};
use crate::db::types::{InterventionPriority, ReasonKind, ReconcileStatus};

/// A reconciliation row the engine could not decide on its own; the
/// orchestrator turns each flag into an intervention item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReconcileFlag {
    pub(crate) question: u32,
    pub(crate) reason: ReasonKind,
    pub(crate) priority: InterventionPriority,
}

#[derive(Debug)]
pub(crate) struct ReconcileOutcome {
    pub(crate) entries: BTreeMap<u32, ReconEntry>,
    pub(crate) flags: Vec<ReconcileFlag>,
}

pub(crate) struct ReconcileInputs<'a> {
    pub(crate) bubbles: &'a BTreeMap<u32, BubbleCell>,
    pub(crate) ai: Option<&'a BTreeMap<u32, SolverCell>>,
    pub(crate) manual: Option<&'a BTreeMap<u32, String>>,
    pub(crate) key: &'a BTreeMap<u32, KeyEntry>,
    pub(crate) low_confidence_threshold: f64,
}

/// Three-way tally of bubble reading, solver verdict, and manual entry
/// against the locked key. Every key question gets exactly one status;
/// `final` is set only for rows the engine could decide.
///
/// Blank and double-mark detections travel as the sentinels `NONE` and
/// `MULTIPLE`; they compare like ordinary answers (and never equal a key
/// answer), so a blank bubble confirmed by the manual entry still counts
/// as `matched`.
pub(crate) fn reconcile(inputs: ReconcileInputs<'_>) -> ReconcileOutcome {
    let mut entries = BTreeMap::new();
    let mut flags = Vec::new();

    for (&question, key_entry) in inputs.key {
        let bubble = inputs.bubbles.get(&question);
        let ai = inputs.ai.and_then(|entries| entries.get(&question));
        let manual = inputs.manual.and_then(|entries| entries.get(&question));

        let (entry, flag) = reconcile_question(
            bubble,
            ai,
            manual,
            key_entry,
            inputs.low_confidence_threshold,
        );
        if let Some(flag) = flag {
            flags.push(ReconcileFlag { question, ..flag });
        }
        entries.insert(question, entry);
    }

    ReconcileOutcome { entries, flags }
}

fn reconcile_question(
    bubble: Option<&BubbleCell>,
    ai: Option<&SolverCell>,
    manual: Option<&String>,
    key: &KeyEntry,
    low_confidence_threshold: f64,
) -> (ReconEntry, Option<ReconcileFlag>) {
    let template = ReconEntry {
        omr: bubble.map(|cell| cell.answer.clone()),
        ai: ai.map(|cell| cell.answer.clone()),
        manual: manual.cloned(),
        final_answer: None,
        status: ReconcileStatus::NeedsReview,
    };

    // Reconciliation is anchored on the physical sheet; without a bubble
    // reading for the question there is nothing to tally.
    let Some(bubble) = bubble else {
        return (template, Some(review_flag(ReasonKind::LowConfidence)));
    };

    let b = bubble.answer.wire_value().to_string();

    // A shaky detection cannot anchor a decision, however much the other
    // sources agree with it.
    if bubble.confidence < low_confidence_threshold {
        return (template, Some(review_flag(ReasonKind::LowConfidence)));
    }

    match (ai.map(|cell| cell.answer.as_str()), manual.map(String::as_str)) {
        (None, None) => {
            // Single-source row: provisional match when the bubble agrees
            // with the key, otherwise a second source has to weigh in.
            if b == key.answer {
                (decided(template, ReconcileStatus::Matched, &b), None)
            } else {
                (template, Some(review_flag(ReasonKind::LowConfidence)))
            }
        }
        (Some(a), None) => {
            if a == b {
                (decided(template, ReconcileStatus::Matched, &b), None)
            } else {
                (decided(template, ReconcileStatus::DisputedAi, &b), None)
            }
        }
        (None, Some(m)) => {
            if m == b {
                (decided(template, ReconcileStatus::Matched, &b), None)
            } else {
                (decided(template, ReconcileStatus::DisputedManual, &b), Some(manual_flag()))
            }
        }
        (Some(a), Some(m)) => {
            if a == b && m == b {
                (decided(template, ReconcileStatus::Matched, &b), None)
            } else if m == b {
                (decided(template, ReconcileStatus::DisputedAi, &b), None)
            } else if a == b {
                (decided(template, ReconcileStatus::DisputedManual, &b), Some(manual_flag()))
            } else {
                (
                    ReconEntry { status: ReconcileStatus::ThreeWaySplit, ..template },
                    Some(ReconcileFlag {
                        question: 0,
                        reason: ReasonKind::ThreeWaySplit,
                        priority: InterventionPriority::High,
                    }),
                )
            }
        }
    }
}

fn decided(template: ReconEntry, status: ReconcileStatus, final_answer: &str) -> ReconEntry {
    ReconEntry { final_answer: Some(final_answer.to_string()), status, ..template }
}

fn manual_flag() -> ReconcileFlag {
    ReconcileFlag {
        question: 0,
        reason: ReasonKind::DisputedManual,
        priority: InterventionPriority::Normal,
    }
}

fn review_flag(reason: ReasonKind) -> ReconcileFlag {
    ReconcileFlag { question: 0, reason, priority: InterventionPriority::Normal }
}
