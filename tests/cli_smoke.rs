use std::fs;
use std::process::Command;

use intent_harness::evaluator::{EvaluationRecord, RecordStatus};
use intent_harness::records::write_results_json;
use tempfile::tempdir;

fn record(row: usize, truth: &str, label: &str) -> EvaluationRecord {
    let success = truth == label;
    EvaluationRecord {
        row,
        question: format!("question {row}"),
        ground_truth: Some(truth.to_string()),
        labels: vec![label.to_string()],
        success,
        hit_rank: success.then_some(1),
        rationale: String::new(),
        opinion_tag: if success {
            "correctly-classified".into()
        } else {
            "other".into()
        },
        status: RecordStatus::Classified,
    }
}

#[test]
fn report_renders_markdown_from_json_export() {
    let dir = tempdir().unwrap();
    let results = dir.path().join("result.json");
    let out = dir.path().join("report.md");
    write_results_json(
        &results,
        &[
            record(2, "Billing", "Billing"),
            record(3, "Claims", "Billing"),
            record(4, "Claims", "Claims"),
        ],
    )
    .unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_intent"))
        .args(["report", "--results"])
        .arg(&results)
        .arg("--out")
        .arg(&out)
        .status()
        .expect("run intent report");
    assert!(status.success());

    let markdown = fs::read_to_string(&out).unwrap();
    assert!(markdown.contains("# Classification Report"));
    assert!(markdown.contains("- Total rows: 3"));
    assert!(markdown.contains("| Claims | Billing | 1 |"));
}

#[test]
fn sample_writes_a_stratified_subset() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("questions.csv");
    let mut body = String::from("question,label\n");
    for i in 0..7 {
        body.push_str(&format!("billing question {i},Billing\n"));
    }
    for i in 0..3 {
        body.push_str(&format!("claims question {i},Claims\n"));
    }
    fs::write(&input, body).unwrap();
    let out = dir.path().join("sample.csv");

    let output = Command::new(env!("CARGO_BIN_EXE_intent"))
        .args(["sample", "-n", "5", "--seed", "11", "--input"])
        .arg(&input)
        .arg("--output")
        .arg(&out)
        .output()
        .expect("run intent sample");
    assert!(output.status.success());

    let plan = String::from_utf8_lossy(&output.stdout);
    assert!(plan.contains("Billing\t4/7"), "{plan}");
    assert!(plan.contains("Claims\t1/3"), "{plan}");

    let written = fs::read_to_string(&out).unwrap();
    let rows: Vec<&str> = written.lines().collect();
    assert_eq!(rows[0], "question,label");
    assert_eq!(rows.len(), 6);
    assert_eq!(rows.iter().filter(|l| l.ends_with(",Claims")).count(), 1);
}

#[test]
fn run_rejects_out_of_range_threshold() {
    let status = Command::new(env!("CARGO_BIN_EXE_intent"))
        .args(["run", "--input", "missing.csv", "--threshold", "1.5"])
        .status()
        .expect("run intent run");
    assert!(!status.success());
}
