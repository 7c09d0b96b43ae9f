use std::collections::HashMap;

use intent_harness::records::ClassificationRequest;
use intent_harness::sampler::{allocate, plan, stratified_sample, Stratified};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn labeled(groups: &[(&str, usize)]) -> Vec<ClassificationRequest> {
    let mut row = 2;
    let mut out = Vec::new();
    for &(label, n) in groups {
        for _ in 0..n {
            out.push(ClassificationRequest {
                row,
                question: format!("question {row}"),
                ground_truth: Some(label.to_string()),
                prior_success: None,
            });
            row += 1;
        }
    }
    out
}

fn counts(items: &[ClassificationRequest]) -> HashMap<String, usize> {
    let mut map = HashMap::new();
    for item in items {
        *map.entry(item.stratum().to_string()).or_insert(0) += 1;
    }
    map
}

#[test]
fn seventy_thirty_split_samples_seven_and_three() {
    let items = labeled(&[("A", 70), ("B", 30)]);
    let mut rng = StdRng::seed_from_u64(7);
    let sample = stratified_sample(items, 10, &mut rng);
    let c = counts(&sample);
    assert_eq!(sample.len(), 10);
    assert_eq!(c["A"], 7);
    assert_eq!(c["B"], 3);
}

#[test]
fn quotas_track_exact_shares_within_one() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let n_groups = rng.gen_range(1..=6);
        let names = ["A", "B", "C", "D", "E", "F"];
        let groups: Vec<(&str, usize)> = (0..n_groups)
            .map(|i| (names[i], rng.gen_range(1..=40)))
            .collect();
        let items = labeled(&groups);
        let total = items.len();
        let target = rng.gen_range(0..total);

        let sample = stratified_sample(items.clone(), target, &mut rng);
        assert_eq!(sample.len(), target, "groups {groups:?} target {target}");

        let c = counts(&sample);
        for &(name, size) in &groups {
            let exact = size as f64 * target as f64 / total as f64;
            let got = *c.get(name).unwrap_or(&0) as f64;
            assert!(
                (got - exact).abs() < 1.0 + 1e-9,
                "group {name} size {size}: got {got}, exact {exact}"
            );
            assert!(got as usize <= size);
        }

        let quota: usize = plan(&items, target).iter().map(|a| a.target).sum();
        assert_eq!(quota, target);
    }
}

#[test]
fn covering_target_returns_everything_unchanged() {
    let items = labeled(&[("A", 3), ("B", 2)]);
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(stratified_sample(items.clone(), 5, &mut rng), items);
    assert_eq!(stratified_sample(items.clone(), 50, &mut rng), items);
}

#[test]
fn same_seed_draws_same_sample() {
    let items = labeled(&[("A", 20), ("B", 15), ("C", 5)]);
    let a = stratified_sample(items.clone(), 9, &mut StdRng::seed_from_u64(99));
    let b = stratified_sample(items, 9, &mut StdRng::seed_from_u64(99));
    assert_eq!(a, b);
}

#[test]
fn sampled_rows_are_distinct_source_rows() {
    let items = labeled(&[("A", 12), ("B", 8)]);
    let sample = stratified_sample(items.clone(), 10, &mut StdRng::seed_from_u64(3));
    let mut rows: Vec<usize> = sample.iter().map(|r| r.row).collect();
    rows.sort_unstable();
    rows.dedup();
    assert_eq!(rows.len(), 10);
    for r in &sample {
        assert!(items.contains(r));
    }
}

#[test]
fn allocation_sums_to_target() {
    assert_eq!(allocate(&[70, 30], 10), vec![7, 3]);
    assert_eq!(allocate(&[1, 1, 1], 2).iter().sum::<usize>(), 2);
    assert_eq!(allocate(&[], 3), Vec::<usize>::new());
}
