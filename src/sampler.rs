//! Proportional stratified sampling.
//!
//! Quotas are apportioned with the largest-remainder method: each stratum
//! gets `floor(size * target / total)` and the leftover units go one at a time
//! to the strata with the largest fractional remainders. Every stratum's
//! quota is therefore within one unit of its exact proportional share.
//!
//! Remainders are compared as integer numerators (`size * target % total`),
//! so the allocation is exact and platform independent.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

/// Anything that belongs to a stratum.
pub trait Stratified {
    fn stratum(&self) -> &str;
}

/// Per-stratum quota for one sampling call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleAllocation {
    pub stratum: String,
    pub available: usize,
    pub target: usize,
}

/// Largest-remainder apportionment of `target` units over `group_sizes`.
///
/// Ties on remainder go to the earlier group. If `target` is at least the
/// total, every group gets its full size.
pub fn allocate(group_sizes: &[usize], target: usize) -> Vec<usize> {
    let total: usize = group_sizes.iter().sum();
    if total == 0 {
        return vec![0; group_sizes.len()];
    }
    if target >= total {
        return group_sizes.to_vec();
    }

    let mut counts: Vec<usize> = group_sizes.iter().map(|s| s * target / total).collect();
    let assigned: usize = counts.iter().sum();
    let leftover = target - assigned;

    let mut order: Vec<usize> = (0..group_sizes.len()).collect();
    // Stable sort keeps first-seen order among equal remainders.
    order.sort_by(|&a, &b| {
        let ra = group_sizes[a] * target % total;
        let rb = group_sizes[b] * target % total;
        rb.cmp(&ra)
    });

    for k in 0..leftover {
        counts[order[k % order.len()]] += 1;
    }

    for (count, size) in counts.iter_mut().zip(group_sizes) {
        *count = (*count).min(*size);
    }
    counts
}

/// Group items by stratum, preserving first-seen stratum order.
fn group_by_stratum<T: Stratified>(items: Vec<T>) -> Vec<(String, Vec<T>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<T>)> = Vec::new();

    for item in items {
        let key = item.stratum().to_string();
        match index.get(&key) {
            Some(&idx) => groups[idx].1.push(item),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![item]));
            }
        }
    }
    groups
}

/// Quotas `stratified_sample` would use, without drawing.
pub fn plan<T: Stratified>(items: &[T], target: usize) -> Vec<SampleAllocation> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut strata: Vec<(String, usize)> = Vec::new();
    for item in items {
        match index.get(item.stratum()) {
            Some(&idx) => strata[idx].1 += 1,
            None => {
                index.insert(item.stratum(), strata.len());
                strata.push((item.stratum().to_string(), 1));
            }
        }
    }

    let sizes: Vec<usize> = strata.iter().map(|(_, n)| *n).collect();
    let counts = allocate(&sizes, target);
    strata
        .into_iter()
        .zip(counts)
        .map(|((stratum, available), target)| SampleAllocation {
            stratum,
            available,
            target,
        })
        .collect()
}

/// Draw a stratified sample of `target` items.
///
/// Returns `items` untouched when `target` covers the whole collection.
/// Otherwise draws each stratum's quota without replacement and shuffles the
/// combined result.
pub fn stratified_sample<T, R>(items: Vec<T>, target: usize, rng: &mut R) -> Vec<T>
where
    T: Stratified,
    R: Rng + ?Sized,
{
    if target >= items.len() {
        return items;
    }

    let groups = group_by_stratum(items);
    let sizes: Vec<usize> = groups.iter().map(|(_, g)| g.len()).collect();
    let counts = allocate(&sizes, target);

    let mut sample = Vec::with_capacity(target);
    for ((stratum, mut group), count) in groups.into_iter().zip(counts) {
        tracing::debug!(stratum = %stratum, available = group.len(), drawn = count, "stratum quota");
        group.shuffle(rng);
        group.truncate(count);
        sample.extend(group);
    }

    sample.shuffle(rng);
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: usize,
        label: &'static str,
    }

    impl Stratified for Item {
        fn stratum(&self) -> &str {
            self.label
        }
    }

    fn items(groups: &[(&'static str, usize)]) -> Vec<Item> {
        let mut out = Vec::new();
        for &(label, n) in groups {
            for _ in 0..n {
                out.push(Item {
                    id: out.len(),
                    label,
                });
            }
        }
        out
    }

    fn count(sample: &[Item], label: &str) -> usize {
        sample.iter().filter(|i| i.label == label).count()
    }

    #[test]
    fn seventy_thirty_split_of_ten() {
        let mut rng = StdRng::seed_from_u64(7);
        let sample = stratified_sample(items(&[("A", 70), ("B", 30)]), 10, &mut rng);
        assert_eq!(sample.len(), 10);
        assert_eq!(count(&sample, "A"), 7);
        assert_eq!(count(&sample, "B"), 3);
    }

    #[test]
    fn leftover_goes_to_largest_remainders() {
        // exact shares: 3.33, 3.33, 3.33 -> 4,3,3 with ties going first-seen
        assert_eq!(allocate(&[5, 5, 5], 10), vec![4, 3, 3]);
        // exact shares: 0.5, 2.5, 7.0 -> floors 0,2,7; leftover 1 to first 0.5 remainder
        assert_eq!(allocate(&[1, 5, 14], 10), vec![1, 2, 7]);
        // exact shares 1.8, 0.2 -> 1 + 1 leftover to group 0
        assert_eq!(allocate(&[9, 1], 2), vec![2, 0]);
    }

    #[test]
    fn target_at_or_above_total_returns_everything() {
        let original = items(&[("A", 3), ("B", 2)]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            stratified_sample(original.clone(), 5, &mut rng),
            original
        );
        assert_eq!(
            stratified_sample(original.clone(), 50, &mut rng),
            original
        );
        assert_eq!(allocate(&[3, 2], 9), vec![3, 2]);
    }

    #[test]
    fn zero_target_and_empty_input() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(stratified_sample(items(&[("A", 4)]), 0, &mut rng).is_empty());
        assert!(stratified_sample(Vec::<Item>::new(), 3, &mut rng).is_empty());
        assert!(allocate(&[], 3).is_empty());
    }

    #[test]
    fn same_seed_same_sample() {
        let pool = items(&[("A", 40), ("B", 25), ("C", 10)]);
        let a = stratified_sample(pool.clone(), 12, &mut StdRng::seed_from_u64(99));
        let b = stratified_sample(pool, 12, &mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn sample_has_no_duplicates() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut ids: Vec<usize> = stratified_sample(items(&[("A", 20), ("B", 20)]), 15, &mut rng)
            .into_iter()
            .map(|i| i.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 15);
    }

    #[test]
    fn plan_reports_quotas_in_first_seen_order() {
        let pool = items(&[("B", 30), ("A", 70)]);
        let quotas = plan(&pool, 10);
        assert_eq!(
            quotas,
            vec![
                SampleAllocation {
                    stratum: "B".into(),
                    available: 30,
                    target: 3
                },
                SampleAllocation {
                    stratum: "A".into(),
                    available: 70,
                    target: 7
                },
            ]
        );
    }
}
