use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use intent_harness::classifier::{Classification, Classify, ClassifyError};
use intent_harness::dispatch::{dispatch_all, DispatchConfig, DispatchOutcome, FailurePolicy};
use intent_harness::evaluator::Evaluator;
use intent_harness::gateway::ProviderError;
use intent_harness::records::ClassificationRequest;
use intent_harness::taxonomy::{MatchKind, ResolvedLabel};

/// Takes a while per call and counts calls started and finished.
/// The question "fail" errors at once with a provider failure.
struct SlowClassifier {
    started: AtomicUsize,
    finished: AtomicUsize,
    delay: Duration,
}

impl SlowClassifier {
    fn new(delay: Duration) -> Self {
        Self {
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait::async_trait]
impl Classify for SlowClassifier {
    async fn classify(&self, question: &str) -> Result<Classification, ClassifyError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if question == "fail" {
            self.finished.fetch_add(1, Ordering::SeqCst);
            return Err(ClassifyError::Provider(ProviderError::provider(
                "openai-compat",
                "HTTP 503: overloaded",
                true,
            )));
        }
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(Classification {
            labels: vec![ResolvedLabel::Canonical {
                name: "Billing".into(),
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

fn requests(n: usize) -> Vec<ClassificationRequest> {
    (0..n)
        .map(|i| ClassificationRequest {
            row: i + 2,
            question: format!("q{i}"),
            ground_truth: Some("Billing".into()),
            prior_success: None,
        })
        .collect()
}

#[tokio::test]
async fn external_interrupt_stops_new_work_and_keeps_partial_results() {
    let classifier = Arc::new(SlowClassifier::new(Duration::from_millis(50)));
    let cancel = Arc::new(AtomicBool::new(false));

    let flag = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        flag.store(true, Ordering::SeqCst);
    });

    let mut evaluator = Evaluator::new();
    let report = dispatch_all(
        classifier.clone(),
        requests(40),
        &DispatchConfig {
            workers: 2,
            pacing: Duration::ZERO,
            policy: FailurePolicy::FailFast,
        },
        &mut evaluator,
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, DispatchOutcome::Interrupted);
    assert!(!report.records.is_empty());
    assert!(report.records.len() < 40);
    // Calls in flight at the interrupt are drained and recorded.
    let started = classifier.started.load(Ordering::SeqCst);
    assert_eq!(report.records.len(), started);
    assert_eq!(classifier.finished.load(Ordering::SeqCst), started);
    assert_eq!(report.abandoned_in_flight, 0);
    assert_eq!(report.not_attempted, 40 - started);

    let rows: Vec<usize> = report.records.iter().map(|r| r.row).collect();
    let unique: HashSet<usize> = rows.iter().copied().collect();
    assert_eq!(unique.len(), rows.len());
    assert!(rows.windows(2).all(|w| w[0] < w[1]));

    // Nothing new starts once the latch is observed.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(classifier.started.load(Ordering::SeqCst), started);
    assert_eq!(evaluator.stats().total, report.records.len());
}

#[tokio::test]
async fn pacing_blocks_only_the_issuing_worker() {
    let classifier = Arc::new(SlowClassifier::new(Duration::ZERO));

    let start = tokio::time::Instant::now();
    let mut evaluator = Evaluator::new();
    let report = dispatch_all(
        classifier,
        requests(4),
        &DispatchConfig {
            workers: 4,
            pacing: Duration::from_millis(200),
            policy: FailurePolicy::FailFast,
        },
        &mut evaluator,
        Arc::new(AtomicBool::new(false)),
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, DispatchOutcome::Completed);
    assert_eq!(report.records.len(), 4);
    // Four parallel pauses overlap instead of adding up to 800ms.
    assert!(start.elapsed() < Duration::from_millis(700));
}

#[tokio::test]
async fn fail_fast_counts_in_flight_calls_as_abandoned() {
    let classifier = Arc::new(SlowClassifier::new(Duration::from_millis(300)));
    let mut reqs = requests(10);
    reqs[0].question = "fail".into();

    let mut evaluator = Evaluator::new();
    let report = dispatch_all(
        classifier.clone(),
        reqs,
        &DispatchConfig {
            workers: 4,
            pacing: Duration::ZERO,
            policy: FailurePolicy::FailFast,
        },
        &mut evaluator,
        Arc::new(AtomicBool::new(false)),
    )
    .await
    .unwrap();

    assert!(report.is_aborted());
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.abandoned_in_flight, 3);
    assert_eq!(report.not_attempted, 6);
    assert_eq!(
        report.records.len() + report.abandoned_in_flight + report.not_attempted,
        10
    );

    // The abandoned calls still run to completion in the background.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(classifier.started.load(Ordering::SeqCst), 4);
    assert_eq!(classifier.finished.load(Ordering::SeqCst), 4);
}
