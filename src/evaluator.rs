//! Scoring of classifications against ground truth.
//!
//! The [`Evaluator`] is the only place [`EvaluationRecord`]s are created. It
//! keeps running totals, a confusion structure over misclassifications, and
//! per-label and hit-rank breakdowns. Records are never touched after they
//! are handed out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::classifier::Classification;
use crate::records::ClassificationRequest;
use crate::taxonomy::UNMATCHED_PREFIX;

/// Opinion tag written for rows whose label matched ground truth.
pub const CORRECTLY_CLASSIFIED: &str = "correctly-classified";

/// Label recorded when the provider failed for a row.
pub const PROVIDER_ERROR_LABEL: &str = "provider-error";

/// Label recorded when the row's task failed unexpectedly.
pub const TASK_ERROR_LABEL: &str = "task-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    Classified,
    /// Reply arrived but had no label line.
    Unclassified,
    ProviderError,
    TaskError,
}

impl RecordStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, RecordStatus::ProviderError | RecordStatus::TaskError)
    }
}

/// One scored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub row: usize,
    pub question: String,
    pub ground_truth: Option<String>,
    /// Resolved labels, best first. Unmatched labels keep the `unmatched:` prefix.
    pub labels: Vec<String>,
    pub success: bool,
    /// 1-based rank of the first label equal to ground truth.
    pub hit_rank: Option<usize>,
    pub rationale: String,
    pub opinion_tag: String,
    pub status: RecordStatus,
}

impl EvaluationRecord {
    pub fn top_label(&self) -> Option<&str> {
        self.labels.first().map(String::as_str)
    }

    /// Scored rows have ground truth and a provider reply.
    pub fn is_scored(&self) -> bool {
        self.ground_truth.is_some() && !self.status.is_error()
    }
}

/// Case-insensitive, whitespace-trimmed equality.
pub fn evaluate(label: &str, ground_truth: &str) -> bool {
    label.trim().to_lowercase() == ground_truth.trim().to_lowercase()
}

/// 1-based rank of the first label equal to ground truth.
pub fn hit_rank<S: AsRef<str>>(labels: &[S], ground_truth: &str) -> Option<usize> {
    labels
        .iter()
        .position(|l| evaluate(l.as_ref(), ground_truth))
        .map(|idx| idx + 1)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationStats {
    pub total: usize,
    pub scored: usize,
    pub success: usize,
    pub fail: usize,
    pub errored: usize,
    pub unclassified: usize,
    /// Rows without ground truth.
    pub unscored: usize,
    /// success / scored.
    pub accuracy: f64,
    /// Rows whose first label matched / scored.
    pub top1_accuracy: f64,
    /// Rank -> number of rows first hit at that rank.
    pub hit_at: BTreeMap<usize, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Misclassification {
    pub ground_truth: String,
    pub predicted: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelAccuracy {
    pub label: String,
    pub total: usize,
    pub correct: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct LabelTally {
    total: usize,
    correct: usize,
}

#[derive(Debug, Default)]
pub struct Evaluator {
    total: usize,
    success: usize,
    fail: usize,
    errored: usize,
    unclassified: usize,
    unscored: usize,
    top1: usize,
    hit_at: BTreeMap<usize, usize>,
    /// ground truth -> predicted -> count, misclassifications only.
    confusion: BTreeMap<String, BTreeMap<String, usize>>,
    per_label: BTreeMap<String, LabelTally>,
    unmatched: BTreeMap<String, usize>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score a classification and create its record.
    pub fn record_classification(
        &mut self,
        request: &ClassificationRequest,
        classification: Classification,
    ) -> EvaluationRecord {
        let labels = classification.label_strings();
        let rank = request
            .ground_truth
            .as_deref()
            .and_then(|truth| hit_rank(&labels, truth));
        let success = rank.is_some();

        let opinion_tag = if success {
            CORRECTLY_CLASSIFIED.to_string()
        } else {
            classification.opinion_tag
        };

        let record = EvaluationRecord {
            row: request.row,
            question: request.question.clone(),
            ground_truth: request.ground_truth.clone(),
            labels,
            success,
            hit_rank: rank,
            rationale: classification.rationale,
            opinion_tag,
            status: if classification.unclassified {
                RecordStatus::Unclassified
            } else {
                RecordStatus::Classified
            },
        };
        self.observe(&record);
        record
    }

    /// Create a failed record for a row that produced no reply.
    pub fn record_failure(
        &mut self,
        request: &ClassificationRequest,
        status: RecordStatus,
        message: impl Into<String>,
    ) -> EvaluationRecord {
        let label = match status {
            RecordStatus::ProviderError => PROVIDER_ERROR_LABEL,
            _ => TASK_ERROR_LABEL,
        };
        let record = EvaluationRecord {
            row: request.row,
            question: request.question.clone(),
            ground_truth: request.ground_truth.clone(),
            labels: vec![label.to_string()],
            success: false,
            hit_rank: None,
            rationale: message.into(),
            opinion_tag: crate::parser::DEFAULT_OPINION_TAG.to_string(),
            status,
        };
        self.observe(&record);
        record
    }

    /// Fold an existing record into the totals.
    pub fn observe(&mut self, record: &EvaluationRecord) {
        self.total += 1;

        if record.status.is_error() {
            self.errored += 1;
            return;
        }
        if record.status == RecordStatus::Unclassified {
            self.unclassified += 1;
        } else {
            for label in &record.labels {
                if let Some(text) = label.strip_prefix(UNMATCHED_PREFIX) {
                    *self.unmatched.entry(text.to_string()).or_default() += 1;
                }
            }
        }

        let Some(truth) = record.ground_truth.as_deref() else {
            self.unscored += 1;
            return;
        };

        let tally = self.per_label.entry(truth.trim().to_string()).or_default();
        tally.total += 1;

        if record.success {
            self.success += 1;
            tally.correct += 1;
            if let Some(rank) = record.hit_rank {
                *self.hit_at.entry(rank).or_default() += 1;
                if rank == 1 {
                    self.top1 += 1;
                }
            }
        } else {
            self.fail += 1;
            let predicted = record.top_label().unwrap_or("").to_string();
            *self
                .confusion
                .entry(truth.trim().to_string())
                .or_default()
                .entry(predicted)
                .or_default() += 1;
        }
    }

    pub fn stats(&self) -> EvaluationStats {
        let scored = self.success + self.fail;
        let ratio = |n: usize| {
            if scored == 0 {
                0.0
            } else {
                n as f64 / scored as f64
            }
        };
        EvaluationStats {
            total: self.total,
            scored,
            success: self.success,
            fail: self.fail,
            errored: self.errored,
            unclassified: self.unclassified,
            unscored: self.unscored,
            accuracy: ratio(self.success),
            top1_accuracy: ratio(self.top1),
            hit_at: self.hit_at.clone(),
        }
    }

    /// Most frequent (ground truth, predicted) confusions.
    pub fn top_misclassifications(&self, limit: usize) -> Vec<Misclassification> {
        let mut all: Vec<Misclassification> = self
            .confusion
            .iter()
            .flat_map(|(truth, row)| {
                row.iter().map(move |(predicted, count)| Misclassification {
                    ground_truth: truth.clone(),
                    predicted: predicted.clone(),
                    count: *count,
                })
            })
            .collect();
        // BTreeMap order makes ties deterministic.
        all.sort_by(|a, b| b.count.cmp(&a.count));
        all.truncate(limit);
        all
    }

    /// Most frequent label texts that did not resolve to the taxonomy.
    pub fn top_unmatched(&self, limit: usize) -> Vec<(String, usize)> {
        let mut all: Vec<(String, usize)> =
            self.unmatched.iter().map(|(k, v)| (k.clone(), *v)).collect();
        all.sort_by(|a, b| b.1.cmp(&a.1));
        all.truncate(limit);
        all
    }

    pub fn per_label_accuracy(&self) -> Vec<LabelAccuracy> {
        self.per_label
            .iter()
            .map(|(label, tally)| LabelAccuracy {
                label: label.clone(),
                total: tally.total,
                correct: tally.correct,
                accuracy: if tally.total == 0 {
                    0.0
                } else {
                    tally.correct as f64 / tally.total as f64
                },
            })
            .collect()
    }

    /// Rebuild totals from a set of records.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a EvaluationRecord>) -> Self {
        let mut evaluator = Self::new();
        for record in records {
            evaluator.observe(record);
        }
        evaluator
    }

    pub fn log_summary(&self, misclassified_limit: usize) {
        let stats = self.stats();
        tracing::info!(
            total = stats.total,
            success = stats.success,
            fail = stats.fail,
            errored = stats.errored,
            unclassified = stats.unclassified,
            accuracy = format!("{:.2}%", stats.accuracy * 100.0),
            "classification summary"
        );
        for m in self.top_misclassifications(misclassified_limit) {
            tracing::info!(
                ground_truth = %m.ground_truth,
                predicted = %m.predicted,
                count = m.count,
                "misclassified"
            );
        }
    }
}

// =============================================================================
// Markdown
// =============================================================================

pub fn render_report_markdown(evaluator: &Evaluator, top_n: usize) -> String {
    let stats = evaluator.stats();
    let mut out = String::new();
    out.push_str("# Classification Report\n\n");
    out.push_str(&format!("- Total rows: {}\n", stats.total));
    out.push_str(&format!("- Scored: {}\n", stats.scored));
    out.push_str(&format!("- Success: {}\n", stats.success));
    out.push_str(&format!("- Fail: {}\n", stats.fail));
    out.push_str(&format!("- Provider/task errors: {}\n", stats.errored));
    out.push_str(&format!("- Unclassified replies: {}\n", stats.unclassified));
    if stats.unscored > 0 {
        out.push_str(&format!("- Without ground truth: {}\n", stats.unscored));
    }
    out.push_str(&format!("- Accuracy: {:.2}%\n", stats.accuracy * 100.0));
    out.push_str(&format!(
        "- Top-1 accuracy: {:.2}%\n",
        stats.top1_accuracy * 100.0
    ));

    if !stats.hit_at.is_empty() {
        out.push_str("\n## Hit Rank\n\n| Rank | Rows |\n|---:|---:|\n");
        for (rank, count) in &stats.hit_at {
            out.push_str(&format!("| {rank} | {count} |\n"));
        }
    }

    let per_label = evaluator.per_label_accuracy();
    if !per_label.is_empty() {
        out.push_str("\n## Per-Label Accuracy\n\n| Label | Correct | Total | Accuracy |\n|---|---:|---:|---:|\n");
        for l in per_label {
            out.push_str(&format!(
                "| {} | {} | {} | {:.1}% |\n",
                l.label,
                l.correct,
                l.total,
                l.accuracy * 100.0
            ));
        }
    }

    let confusions = evaluator.top_misclassifications(top_n);
    if !confusions.is_empty() {
        out.push_str("\n## Top Misclassifications\n\n| Ground truth | Predicted | Count |\n|---|---|---:|\n");
        for m in confusions {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                m.ground_truth, m.predicted, m.count
            ));
        }
    }

    let unmatched = evaluator.top_unmatched(top_n);
    if !unmatched.is_empty() {
        out.push_str("\n## Unmatched Labels\n\n| Text | Count |\n|---|---:|\n");
        for (text, count) in unmatched {
            out.push_str(&format!("| {text} | {count} |\n"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::{MatchKind, ResolvedLabel};

    fn request(row: usize, truth: Option<&str>) -> ClassificationRequest {
        ClassificationRequest {
            row,
            question: format!("question {row}"),
            ground_truth: truth.map(str::to_string),
            prior_success: None,
        }
    }

    fn canonical(name: &str) -> ResolvedLabel {
        ResolvedLabel::Canonical {
            name: name.to_string(),
            kind: MatchKind::Exact,
        }
    }

    fn classification(labels: Vec<ResolvedLabel>) -> Classification {
        Classification {
            labels,
            rationale: "because".into(),
            opinion_tag: "ambiguous-question".into(),
            unclassified: false,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    #[test]
    fn equality_ignores_case_and_surrounding_space() {
        assert!(evaluate(" Billing ", "billing"));
        assert!(!evaluate("Billing", "Bill ing"));
        assert_eq!(hit_rank(&["Claims", "billing"], "Billing"), Some(2));
        assert_eq!(hit_rank(&["Claims"], "Billing"), None);
    }

    #[test]
    fn hit_at_any_rank_is_success_and_overrides_opinion() {
        let mut ev = Evaluator::new();
        let rec = ev.record_classification(
            &request(2, Some("Billing")),
            classification(vec![canonical("Claims"), canonical("Billing")]),
        );
        assert!(rec.success);
        assert_eq!(rec.hit_rank, Some(2));
        assert_eq!(rec.opinion_tag, CORRECTLY_CLASSIFIED);

        let stats = ev.stats();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.top1_accuracy, 0.0);
        assert_eq!(stats.hit_at.get(&2), Some(&1));
    }

    #[test]
    fn misses_feed_confusion_and_keep_model_opinion() {
        let mut ev = Evaluator::new();
        for row in 2..5 {
            let rec = ev.record_classification(
                &request(row, Some("Billing")),
                classification(vec![canonical("Claims")]),
            );
            assert_eq!(rec.opinion_tag, "ambiguous-question");
        }
        ev.record_classification(
            &request(5, Some("Claims")),
            classification(vec![ResolvedLabel::Unmatched {
                original: "주소변경".into(),
                best_score: 0.0,
                nearest: None,
            }]),
        );

        assert_eq!(
            ev.top_misclassifications(1),
            vec![Misclassification {
                ground_truth: "Billing".into(),
                predicted: "Claims".into(),
                count: 3
            }]
        );
        assert_eq!(ev.top_unmatched(5), vec![("주소변경".to_string(), 1)]);
        let stats = ev.stats();
        assert_eq!((stats.fail, stats.accuracy), (4, 0.0));
    }

    #[test]
    fn failures_count_as_errors_not_accuracy() {
        let mut ev = Evaluator::new();
        ev.record_classification(
            &request(2, Some("Billing")),
            classification(vec![canonical("Billing")]),
        );
        let failed = ev.record_failure(
            &request(3, Some("Claims")),
            RecordStatus::ProviderError,
            "gave up after 11 attempts",
        );
        assert_eq!(failed.labels, vec![PROVIDER_ERROR_LABEL]);
        assert!(!failed.success);

        let stats = ev.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.accuracy, 1.0);
    }

    #[test]
    fn rows_without_ground_truth_are_unscored() {
        let mut ev = Evaluator::new();
        let rec = ev.record_classification(
            &request(2, None),
            classification(vec![canonical("Billing")]),
        );
        assert!(!rec.success);
        assert!(!rec.is_scored());
        let stats = ev.stats();
        assert_eq!((stats.total, stats.scored, stats.unscored), (1, 0, 1));
    }

    #[test]
    fn rebuilding_from_records_matches_running_totals() {
        let mut ev = Evaluator::new();
        let records = vec![
            ev.record_classification(
                &request(2, Some("Billing")),
                classification(vec![canonical("Billing")]),
            ),
            ev.record_classification(
                &request(3, Some("Claims")),
                classification(vec![canonical("Billing")]),
            ),
            ev.record_failure(&request(4, Some("Claims")), RecordStatus::TaskError, "panic"),
        ];
        let rebuilt = Evaluator::from_records(&records);
        assert_eq!(rebuilt.stats(), ev.stats());
        assert_eq!(rebuilt.per_label_accuracy(), ev.per_label_accuracy());
    }

    #[test]
    fn markdown_contains_sections() {
        let mut ev = Evaluator::new();
        ev.record_classification(
            &request(2, Some("Billing")),
            classification(vec![canonical("Claims")]),
        );
        let md = render_report_markdown(&ev, 20);
        assert!(md.contains("# Classification Report"));
        assert!(md.contains("| Billing | Claims | 1 |"));
        assert!(md.contains("## Per-Label Accuracy"));
        assert!(md.contains("- Accuracy: 0.00%"));
    }
}
