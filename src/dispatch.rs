//! Concurrent batch dispatch with fail-fast escalation.
//!
//! Requests run through a bounded pool (`buffer_unordered`). Each request is
//! classified on its own spawned task, so a panic inside one classification
//! becomes a failed record instead of tearing down the batch.
//!
//! The cancel flag is a one-way latch. It is set by a provider failure under
//! [`FailurePolicy::FailFast`] or from outside (Ctrl-C). Once set, queued
//! requests are skipped without being attempted.
//!
//! What happens to calls already in flight depends on who set the latch. An
//! outside interrupt drains them and records their results. A fail-fast abort
//! stops consuming completions at once; the spawned calls finish detached and
//! are reported as `abandoned_in_flight`, never as not attempted.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::classifier::{Classification, Classify, ClassifyError};
use crate::evaluator::{EvaluationRecord, Evaluator, RecordStatus};
use crate::records::ClassificationRequest;

/// Longest question prefix written to progress logs.
const QUESTION_LOG_CHARS: usize = 50;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("worker pool size must be at least 1")]
    InvalidPoolSize,
}

/// What to do when a request fails at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop the batch on the first provider failure.
    #[default]
    FailFast,
    /// Record the failure and keep going.
    Continue,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailFast => "fail-fast",
            FailurePolicy::Continue => "continue",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" | "fail_fast" => Ok(FailurePolicy::FailFast),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(format!(
                "unknown failure policy '{other}' (expected fail-fast or continue)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Pause after each successful provider call, inside the worker.
    pub pacing: Duration,
    pub policy: FailurePolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            pacing: Duration::from_secs(3),
            policy: FailurePolicy::FailFast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed,
    /// A provider failure stopped the batch.
    Aborted { row: usize, reason: String },
    /// The cancel latch was set from outside before every request started.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Records sorted by row, one per request whose result was consumed.
    pub records: Vec<EvaluationRecord>,
    pub outcome: DispatchOutcome,
    /// Requests never started because the latch was set.
    pub not_attempted: usize,
    /// Requests started before a fail-fast abort whose results were not waited for.
    pub abandoned_in_flight: usize,
}

impl DispatchReport {
    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, DispatchOutcome::Aborted { .. })
    }
}

enum TaskOutcome {
    Skipped,
    Finished(Result<Classification, ClassifyError>),
    Crashed(String),
}

fn log_prefix(question: &str) -> String {
    if question.chars().count() > QUESTION_LOG_CHARS {
        let head: String = question.chars().take(QUESTION_LOG_CHARS).collect();
        format!("{head}...")
    } else {
        question.to_string()
    }
}

/// Classify every request with bounded concurrency and feed results to `evaluator`.
pub async fn dispatch_all(
    classifier: Arc<dyn Classify>,
    requests: Vec<ClassificationRequest>,
    config: &DispatchConfig,
    evaluator: &mut Evaluator,
    cancel: Arc<AtomicBool>,
) -> Result<DispatchReport, DispatchError> {
    if config.workers == 0 {
        return Err(DispatchError::InvalidPoolSize);
    }

    let total = requests.len();
    let pacing = config.pacing;
    let started = Arc::new(AtomicUsize::new(0));
    tracing::info!(
        total,
        workers = config.workers,
        policy = config.policy.as_str(),
        "dispatch started"
    );

    let mut tasks = stream::iter(requests.into_iter().map(|req| {
        let classifier = classifier.clone();
        let cancel = cancel.clone();
        let started = started.clone();
        async move {
            if cancel.load(AtomicOrdering::SeqCst) {
                return (req, TaskOutcome::Skipped);
            }
            started.fetch_add(1, AtomicOrdering::SeqCst);
            let question = req.question.clone();
            let handle = tokio::spawn(async move {
                let result = classifier.classify(&question).await;
                if result.is_ok() && !pacing.is_zero() {
                    sleep(pacing).await;
                }
                result
            });
            let outcome = match handle.await {
                Ok(result) => TaskOutcome::Finished(result),
                Err(err) => TaskOutcome::Crashed(err.to_string()),
            };
            (req, outcome)
        }
    }))
    .buffer_unordered(config.workers);

    let mut records: Vec<EvaluationRecord> = Vec::with_capacity(total);
    let mut outcome = DispatchOutcome::Completed;
    let mut completed = 0usize;
    let mut skipped = 0usize;

    // Once the latch is set, queued requests resolve as Skipped right away,
    // so draining the stream only waits for calls already in flight.
    while let Some((req, task)) = tasks.next().await {
        match task {
            TaskOutcome::Skipped => {
                skipped += 1;
            }
            TaskOutcome::Finished(Ok(classification)) => {
                completed += 1;
                let record = evaluator.record_classification(&req, classification);
                tracing::info!(
                    row = record.row,
                    question = %log_prefix(&record.question),
                    ground_truth = record.ground_truth.as_deref().unwrap_or(""),
                    label = record.top_label().unwrap_or(""),
                    success = record.success,
                    progress = %format!("{completed}/{total}"),
                    "classified"
                );
                records.push(record);
            }
            TaskOutcome::Finished(Err(err)) => {
                completed += 1;
                let reason = err.to_string();
                tracing::error!(
                    row = req.row,
                    question = %log_prefix(&req.question),
                    status = ?err.provider_error().http_status(),
                    error = %reason,
                    "provider call failed"
                );
                records.push(evaluator.record_failure(
                    &req,
                    RecordStatus::ProviderError,
                    reason.clone(),
                ));
                // A failure drained after an interrupt is recorded, not escalated.
                if config.policy == FailurePolicy::FailFast
                    && !cancel.swap(true, AtomicOrdering::SeqCst)
                {
                    tracing::error!(row = req.row, "provider failure, cancelling remaining work");
                    outcome = DispatchOutcome::Aborted {
                        row: req.row,
                        reason,
                    };
                    break;
                }
            }
            TaskOutcome::Crashed(msg) => {
                completed += 1;
                tracing::error!(row = req.row, error = %msg, "classification task crashed");
                records.push(evaluator.record_failure(
                    &req,
                    RecordStatus::TaskError,
                    format!("task failed: {msg}"),
                ));
            }
        }
    }
    // Dropping the stream drops every request that has not started.
    drop(tasks);

    if outcome == DispatchOutcome::Completed && skipped > 0 {
        outcome = DispatchOutcome::Interrupted;
    }

    records.sort_by_key(|r| r.row);
    let started = started.load(AtomicOrdering::SeqCst);
    let not_attempted = total - started;
    let abandoned_in_flight = started - records.len();

    match &outcome {
        DispatchOutcome::Completed => tracing::info!(attempted = records.len(), "dispatch finished"),
        DispatchOutcome::Aborted { row, .. } => tracing::warn!(
            row,
            attempted = records.len(),
            abandoned_in_flight,
            not_attempted,
            "dispatch aborted"
        ),
        DispatchOutcome::Interrupted => tracing::warn!(
            attempted = records.len(),
            not_attempted,
            skipped,
            "dispatch interrupted"
        ),
    }

    Ok(DispatchReport {
        records,
        outcome,
        not_attempted,
        abandoned_in_flight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ProviderError;
    use crate::taxonomy::{MatchKind, ResolvedLabel};

    /// Echoes the question back as the label after a short delay keyed on its length.
    struct EchoClassifier {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Classify for EchoClassifier {
        async fn classify(&self, question: &str) -> Result<Classification, ClassifyError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let delay: u64 = question.len() as u64 % 4;
            sleep(Duration::from_millis(delay * 5)).await;
            if question == "panic" {
                panic!("boom");
            }
            if question == "fail" {
                return Err(ClassifyError::Provider(ProviderError::provider(
                    "openai-compat",
                    "HTTP 503: overloaded",
                    true,
                )));
            }
            Ok(Classification {
                labels: vec![ResolvedLabel::Canonical {
                    name: question.to_string(),
                    kind: MatchKind::Exact,
                }],
                rationale: String::new(),
                opinion_tag: "other".into(),
                unclassified: false,
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    fn requests(questions: &[&str]) -> Vec<ClassificationRequest> {
        questions
            .iter()
            .enumerate()
            .map(|(i, q)| ClassificationRequest {
                row: i + 2,
                question: q.to_string(),
                ground_truth: Some(q.to_string()),
                prior_success: None,
            })
            .collect()
    }

    fn config(workers: usize, policy: FailurePolicy) -> DispatchConfig {
        DispatchConfig {
            workers,
            pacing: Duration::ZERO,
            policy,
        }
    }

    #[tokio::test]
    async fn records_come_back_sorted_by_row() {
        let classifier = Arc::new(EchoClassifier {
            calls: AtomicUsize::new(0),
        });
        let qs = ["aaa", "a", "aa", "aaaa", "b", "bbb", "bb"];
        let mut evaluator = Evaluator::new();
        let report = dispatch_all(
            classifier.clone(),
            requests(&qs),
            &config(4, FailurePolicy::FailFast),
            &mut evaluator,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, DispatchOutcome::Completed);
        let rows: Vec<usize> = report.records.iter().map(|r| r.row).collect();
        assert_eq!(rows, (2..2 + qs.len()).collect::<Vec<_>>());
        assert!(report.records.iter().all(|r| r.success));
        assert_eq!(evaluator.stats().success, qs.len());
        assert_eq!(classifier.calls.load(AtomicOrdering::SeqCst), qs.len());
    }

    #[tokio::test]
    async fn panicking_task_is_recorded_and_batch_continues() {
        let classifier = Arc::new(EchoClassifier {
            calls: AtomicUsize::new(0),
        });
        let mut evaluator = Evaluator::new();
        let report = dispatch_all(
            classifier,
            requests(&["a", "panic", "b"]),
            &config(2, FailurePolicy::FailFast),
            &mut evaluator,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, DispatchOutcome::Completed);
        assert_eq!(report.records.len(), 3);
        assert_eq!(report.records[1].status, RecordStatus::TaskError);
        assert_eq!(evaluator.stats().errored, 1);
    }

    #[tokio::test]
    async fn provider_failure_aborts_and_sets_latch() {
        let classifier = Arc::new(EchoClassifier {
            calls: AtomicUsize::new(0),
        });
        let cancel = Arc::new(AtomicBool::new(false));
        let mut qs = vec!["fail"];
        qs.extend(std::iter::repeat("ok").take(20));
        let mut evaluator = Evaluator::new();

        let report = dispatch_all(
            classifier.clone(),
            requests(&qs),
            &config(1, FailurePolicy::FailFast),
            &mut evaluator,
            cancel.clone(),
        )
        .await
        .unwrap();

        assert!(report.is_aborted());
        assert!(cancel.load(AtomicOrdering::SeqCst));
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].status, RecordStatus::ProviderError);
        assert!(report.records[0].rationale.contains("HTTP 503"));
        assert_eq!(report.not_attempted, 20);
        assert_eq!(report.abandoned_in_flight, 0);
        assert_eq!(classifier.calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn continue_policy_records_failures_and_finishes() {
        let classifier = Arc::new(EchoClassifier {
            calls: AtomicUsize::new(0),
        });
        let mut evaluator = Evaluator::new();
        let report = dispatch_all(
            classifier,
            requests(&["a", "fail", "b", "fail"]),
            &config(2, FailurePolicy::Continue),
            &mut evaluator,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, DispatchOutcome::Completed);
        assert_eq!(report.records.len(), 4);
        assert_eq!(evaluator.stats().errored, 2);
    }

    #[tokio::test]
    async fn preset_latch_attempts_nothing() {
        let classifier = Arc::new(EchoClassifier {
            calls: AtomicUsize::new(0),
        });
        let mut evaluator = Evaluator::new();
        let report = dispatch_all(
            classifier.clone(),
            requests(&["a", "b", "c"]),
            &config(2, FailurePolicy::FailFast),
            &mut evaluator,
            Arc::new(AtomicBool::new(true)),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, DispatchOutcome::Interrupted);
        assert!(report.records.is_empty());
        assert_eq!(report.not_attempted, 3);
        assert_eq!(classifier.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let classifier = Arc::new(EchoClassifier {
            calls: AtomicUsize::new(0),
        });
        let err = dispatch_all(
            classifier,
            requests(&["a"]),
            &config(0, FailurePolicy::FailFast),
            &mut Evaluator::new(),
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap_err();
        assert_eq!(err, DispatchError::InvalidPoolSize);
    }

    #[test]
    fn policy_parses() {
        assert_eq!("fail-fast".parse(), Ok(FailurePolicy::FailFast));
        assert_eq!("Continue".parse(), Ok(FailurePolicy::Continue));
        assert!("retry".parse::<FailurePolicy>().is_err());
    }
}
