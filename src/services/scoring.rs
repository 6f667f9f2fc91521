use std::collections::BTreeMap;

use crate::db::models::{BubbleCell, KeyEntry, QuestionScore, ReconEntry};

/// Confidence floor every bubble must clear for a perfect evaluation.
pub(crate) const PERFECT_CONFIDENCE_FLOOR: f64 = 0.85;
/// Quality floor the sheet must clear for a perfect evaluation.
pub(crate) const PERFECT_QUALITY_FLOOR: f64 = 0.85;

#[derive(Debug)]
pub(crate) struct ScoreOutcome {
    pub(crate) automated_marks: f64,
    pub(crate) max_marks: f64,
    pub(crate) percentage: f64,
    pub(crate) grade: &'static str,
    pub(crate) correct_count: i64,
    pub(crate) incorrect_count: i64,
    pub(crate) unanswered_count: i64,
    pub(crate) breakdown: Vec<QuestionScore>,
}

/// Marks are stored with two decimal places.
pub(crate) fn round_marks(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Score the reconciled answers against the key: full marks when the final
/// answer equals the key answer, zero otherwise. Blank rows count as
/// unanswered; everything else that misses the key (including double
/// marks) counts as incorrect.
pub(crate) fn score(
    entries: &BTreeMap<u32, ReconEntry>,
    bubbles: &BTreeMap<u32, BubbleCell>,
    key: &BTreeMap<u32, KeyEntry>,
    low_confidence_threshold: f64,
) -> ScoreOutcome {
    let mut automated_marks = 0.0;
    let mut max_marks = 0.0;
    let mut correct_count = 0;
    let mut incorrect_count = 0;
    let mut unanswered_count = 0;
    let mut breakdown = Vec::with_capacity(key.len());

    for (&question, key_entry) in key {
        max_marks += key_entry.marks;
        let final_answer =
            entries.get(&question).and_then(|entry| entry.final_answer.clone());
        let confidence =
            bubbles.get(&question).map(|cell| cell.confidence).unwrap_or(0.0);

        let is_correct = final_answer.as_deref() == Some(key_entry.answer.as_str());
        let marks_earned = if is_correct { key_entry.marks } else { 0.0 };

        match final_answer.as_deref() {
            Some(answer) if answer == key_entry.answer => correct_count += 1,
            Some("NONE") | None => unanswered_count += 1,
            Some(_) => incorrect_count += 1,
        }

        automated_marks += marks_earned;
        breakdown.push(QuestionScore {
            question,
            correct_answer: key_entry.answer.clone(),
            final_answer,
            marks_earned: round_marks(marks_earned),
            marks_possible: round_marks(key_entry.marks),
            confidence,
            low_confidence: confidence < low_confidence_threshold,
        });
    }

    let automated_marks = round_marks(automated_marks);
    let percentage =
        if max_marks > 0.0 { automated_marks / max_marks * 100.0 } else { 0.0 };

    ScoreOutcome {
        automated_marks,
        max_marks: round_marks(max_marks),
        percentage,
        grade: assign_grade(percentage),
        correct_count,
        incorrect_count,
        unanswered_count,
        breakdown,
    }
}

pub(crate) fn assign_grade(percentage: f64) -> &'static str {
    if percentage >= 90.0 {
        "A+"
    } else if percentage >= 80.0 {
        "A"
    } else if percentage >= 70.0 {
        "B+"
    } else if percentage >= 60.0 {
        "B"
    } else if percentage >= 50.0 {
        "C"
    } else if percentage >= 40.0 {
        "D"
    } else {
        "F"
    }
}

/// Automated and manual totals tally when no manual total was entered, or
/// when they differ by at most `tolerance`.
pub(crate) fn marks_match(automated: f64, manual: Option<f64>, tolerance: f64) -> bool {
    match manual {
        None => true,
        Some(manual) => (manual - automated).abs() <= tolerance,
    }
}

/// The perfect-evaluation law: tallied marks, every bubble read with high
/// confidence, a clean sheet, and nothing waiting on a human.
pub(crate) fn is_perfect_evaluation(
    marks_match: bool,
    bubbles: &BTreeMap<u32, BubbleCell>,
    quality_score: f64,
    open_interventions: usize,
) -> bool {
    marks_match
        && bubbles.values().all(|cell| cell.confidence >= PERFECT_CONFIDENCE_FLOOR)
        && quality_score >= PERFECT_QUALITY_FLOOR
        && open_interventions == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::{DetectedMark, ReconcileStatus};

    fn key_of(entries: &[(u32, &str, f64)]) -> BTreeMap<u32, KeyEntry> {
        entries
            .iter()
            .map(|&(question, answer, marks)| {
                (question, KeyEntry { answer: answer.to_string(), marks })
            })
            .collect()
    }

    fn matched_entry(answer: &str) -> ReconEntry {
        ReconEntry {
            omr: Some(DetectedMark::Answer(answer.to_string())),
            ai: Some(answer.to_string()),
            manual: Some(answer.to_string()),
            final_answer: Some(answer.to_string()),
            status: ReconcileStatus::Matched,
        }
    }

    fn bubbles_at(confidence: f64, answers: &[(u32, &str)]) -> BTreeMap<u32, BubbleCell> {
        answers
            .iter()
            .map(|&(question, answer)| {
                (
                    question,
                    BubbleCell { answer: DetectedMark::Answer(answer.to_string()), confidence },
                )
            })
            .collect()
    }

    #[test]
    fn full_marks_for_a_clean_sheet() {
        let key = key_of(&[(1, "A", 2.0), (2, "B", 2.0), (3, "C", 2.0)]);
        let entries: BTreeMap<u32, ReconEntry> =
            [(1, matched_entry("A")), (2, matched_entry("B")), (3, matched_entry("C"))]
                .into_iter()
                .collect();
        let bubbles = bubbles_at(0.95, &[(1, "A"), (2, "B"), (3, "C")]);

        let outcome = score(&entries, &bubbles, &key, 0.7);
        assert_eq!(outcome.automated_marks, 6.0);
        assert_eq!(outcome.correct_count, 3);
        assert_eq!(outcome.incorrect_count, 0);
        assert_eq!(outcome.unanswered_count, 0);
        assert_eq!(outcome.percentage, 100.0);
        assert_eq!(outcome.grade, "A+");
    }

    #[test]
    fn wrong_and_blank_answers_earn_nothing() {
        let key = key_of(&[(1, "A", 2.0), (2, "B", 2.0), (3, "C", 2.0)]);
        let mut entries: BTreeMap<u32, ReconEntry> = BTreeMap::new();
        entries.insert(1, matched_entry("D"));
        entries.insert(
            2,
            ReconEntry {
                omr: Some(DetectedMark::Blank),
                ai: None,
                manual: Some("NONE".to_string()),
                final_answer: Some("NONE".to_string()),
                status: ReconcileStatus::Matched,
            },
        );
        entries.insert(3, matched_entry("C"));
        let bubbles = bubbles_at(0.9, &[(1, "D"), (2, "NONE"), (3, "C")]);

        let outcome = score(&entries, &bubbles, &key, 0.7);
        assert_eq!(outcome.automated_marks, 2.0);
        assert_eq!(outcome.correct_count, 1);
        assert_eq!(outcome.incorrect_count, 1);
        assert_eq!(outcome.unanswered_count, 1);
    }

    #[test]
    fn grades_follow_the_ladder() {
        for (percentage, grade) in
            [(95.0, "A+"), (85.0, "A"), (75.0, "B+"), (65.0, "B"), (55.0, "C"), (45.0, "D"), (10.0, "F")]
        {
            assert_eq!(assign_grade(percentage), grade, "{percentage}");
        }
    }

    #[test]
    fn tally_tolerates_small_differences() {
        assert!(marks_match(6.0, None, 0.01));
        assert!(marks_match(6.0, Some(6.0), 0.01));
        assert!(marks_match(6.0, Some(6.005), 0.01));
        assert!(!marks_match(6.0, Some(5.0), 0.01));
    }

    #[test]
    fn perfect_evaluation_requires_all_four_conjuncts() {
        let bubbles = bubbles_at(0.9, &[(1, "A")]);
        assert!(is_perfect_evaluation(true, &bubbles, 0.9, 0));
        assert!(!is_perfect_evaluation(false, &bubbles, 0.9, 0));
        assert!(!is_perfect_evaluation(true, &bubbles, 0.8, 0));
        assert!(!is_perfect_evaluation(true, &bubbles, 0.9, 1));

        let shaky = bubbles_at(0.8, &[(1, "A")]);
        assert!(!is_perfect_evaluation(true, &shaky, 0.9, 0));
    }

    #[test]
    fn marks_round_to_two_decimals() {
        assert_eq!(round_marks(1.239), 1.24);
        assert_eq!(round_marks(2.3333), 2.33);
    }
}
