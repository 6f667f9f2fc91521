use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum KeyStatus {
    Draft,
    AiVerified,
    Flagged,
    HumanApproved,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum SheetStage {
    Ingested,
    QualityAssessed,
    Reconstructed,
    BubblesRead,
    AiSolved,
    ManualEntered,
    Reconciled,
    Scored,
    Finalized,
    Rejected,
}

impl SheetStage {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SheetStage::Ingested => "ingested",
            SheetStage::QualityAssessed => "quality_assessed",
            SheetStage::Reconstructed => "reconstructed",
            SheetStage::BubblesRead => "bubbles_read",
            SheetStage::AiSolved => "ai_solved",
            SheetStage::ManualEntered => "manual_entered",
            SheetStage::Reconciled => "reconciled",
            SheetStage::Scored => "scored",
            SheetStage::Finalized => "finalized",
            SheetStage::Rejected => "rejected",
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, SheetStage::Finalized | SheetStage::Rejected)
    }

    /// Position along the pipeline; readers must only ever observe this
    /// value increasing for a given sheet. Terminal `Rejected` sorts last.
    pub(crate) fn order(self) -> u8 {
        match self {
            SheetStage::Ingested => 0,
            SheetStage::QualityAssessed => 1,
            SheetStage::Reconstructed => 2,
            SheetStage::BubblesRead => 3,
            SheetStage::AiSolved => 4,
            SheetStage::ManualEntered => 5,
            SheetStage::Reconciled => 6,
            SheetStage::Scored => 7,
            SheetStage::Finalized => 8,
            SheetStage::Rejected => 9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum QualityDecision {
    Proceed,
    Reconstruct,
    Reject,
    HumanReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum DamageSeverity {
    Minor,
    Moderate,
    Severe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum ReconcileStatus {
    Matched,
    DisputedAi,
    DisputedManual,
    ThreeWaySplit,
    NeedsReview,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum InterventionStatus {
    Open,
    Claimed,
    Resolved,
    Cancelled,
}

impl InterventionStatus {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, InterventionStatus::Resolved | InterventionStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum InterventionPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum RecheckStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum EntityKind {
    Sheet,
    AnswerKey,
    Reconciliation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum ReasonKind {
    ThreeWaySplit,
    DisputedManual,
    LowConfidence,
    AdapterFailure,
    QualityReview,
    KeyDisagreement,
    MarksMismatch,
    DeadlineExpired,
    Cancelled,
}

/// One detected bubble value. `None` is a blank row, `Multiple` a
/// double-mark; neither compares equal to any key answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DetectedMark {
    Answer(String),
    Blank,
    Multiple,
}

impl DetectedMark {
    pub(crate) fn wire_value(&self) -> &str {
        match self {
            DetectedMark::Answer(value) => value,
            DetectedMark::Blank => "NONE",
            DetectedMark::Multiple => "MULTIPLE",
        }
    }
}

impl Serialize for DetectedMark {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.wire_value())
    }
}

impl<'de> Deserialize<'de> for DetectedMark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "NONE" => Ok(DetectedMark::Blank),
            "MULTIPLE" => Ok(DetectedMark::Multiple),
            "" => Err(D::Error::custom("detected answer must not be empty")),
            _ => Ok(DetectedMark::Answer(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detected_mark_round_trips_sentinels() {
        for (mark, wire) in [
            (DetectedMark::Answer("A".to_string()), "\"A\""),
            (DetectedMark::Blank, "\"NONE\""),
            (DetectedMark::Multiple, "\"MULTIPLE\""),
        ] {
            assert_eq!(serde_json::to_string(&mark).unwrap(), wire);
            let back: DetectedMark = serde_json::from_str(wire).unwrap();
            assert_eq!(back, mark);
        }
    }

    #[test]
    fn detected_mark_rejects_empty() {
        assert!(serde_json::from_str::<DetectedMark>("\"\"").is_err());
    }

    #[test]
    fn stage_order_is_monotone_along_pipeline() {
        let stages = [
            SheetStage::Ingested,
            SheetStage::QualityAssessed,
            SheetStage::Reconstructed,
            SheetStage::BubblesRead,
            SheetStage::AiSolved,
            SheetStage::ManualEntered,
            SheetStage::Reconciled,
            SheetStage::Scored,
            SheetStage::Finalized,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].order() < pair[1].order());
        }
    }

}
