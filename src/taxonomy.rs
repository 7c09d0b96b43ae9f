//! Fixed category taxonomy and resolution of free-text labels against it.
//!
//! Models reproduce category names with drift: extra words, bracketed notes,
//! different spacing or punctuation. [`Taxonomy::resolve`] reconciles such a
//! guess with the canonical names in three steps:
//!
//! 1. Normalize both sides to lowercase alphanumerics.
//! 2. Exact normalized equality wins immediately (score 1.0).
//! 3. Otherwise score every canonical name with a Ratcliff/Obershelp
//!    matching-blocks ratio, add a containment bonus when one normalized
//!    string contains the other, and accept the best score at or above the
//!    caller's threshold.
//!
//! Anything below threshold comes back as [`ResolvedLabel::Unmatched`] with
//! the original text intact, so it can be inspected rather than lost.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix used when an unmatched label is rendered as a plain string.
pub const UNMATCHED_PREFIX: &str = "unmatched:";

/// Score added when one normalized string contains the other.
pub const CONTAINMENT_BONUS: f64 = 0.2;

/// Acceptance threshold for multi-candidate ranking.
pub const LOOSE_THRESHOLD: f64 = 0.3;

/// Acceptance threshold for single-answer ground-truth generation.
pub const STRICT_THRESHOLD: f64 = 0.6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaxonomyError {
    #[error("taxonomy must contain at least one label")]
    Empty,
    #[error("taxonomy label names must not be blank (index {0})")]
    BlankName(usize),
    #[error("duplicate taxonomy label: {0}")]
    DuplicateName(String),
}

/// One entry of the fixed taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalLabel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CanonicalLabel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            description: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Named acceptance-threshold presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchProfile {
    /// Threshold 0.3; the model may propose up to three ranked candidates.
    #[default]
    Loose,
    /// Threshold 0.6; the model gives a single answer.
    Strict,
}

impl MatchProfile {
    pub fn threshold(&self) -> f64 {
        match self {
            MatchProfile::Loose => LOOSE_THRESHOLD,
            MatchProfile::Strict => STRICT_THRESHOLD,
        }
    }

    /// How many ranked candidates the prompt asks for.
    pub fn max_candidates(&self) -> usize {
        match self {
            MatchProfile::Loose => 3,
            MatchProfile::Strict => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchProfile::Loose => "loose",
            MatchProfile::Strict => "strict",
        }
    }
}

impl FromStr for MatchProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loose" => Ok(MatchProfile::Loose),
            "strict" => Ok(MatchProfile::Strict),
            other => Err(format!(
                "unknown match profile '{other}' (expected loose or strict)"
            )),
        }
    }
}

/// How a candidate was associated with a canonical name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchKind {
    Exact,
    Fuzzy { score: f64 },
}

impl MatchKind {
    pub fn score(&self) -> f64 {
        match self {
            MatchKind::Exact => 1.0,
            MatchKind::Fuzzy { score } => *score,
        }
    }
}

/// Result of resolving one candidate label.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedLabel {
    Canonical {
        name: String,
        kind: MatchKind,
    },
    Unmatched {
        /// Candidate text exactly as the model produced it.
        original: String,
        /// Highest score seen, for diagnostics.
        best_score: f64,
        /// Canonical name that scored `best_score`, if any was scored.
        nearest: Option<String>,
    },
}

impl ResolvedLabel {
    pub fn is_canonical(&self) -> bool {
        matches!(self, ResolvedLabel::Canonical { .. })
    }

    /// Canonical name, or `None` for an unmatched label.
    pub fn canonical_name(&self) -> Option<&str> {
        match self {
            ResolvedLabel::Canonical { name, .. } => Some(name),
            ResolvedLabel::Unmatched { .. } => None,
        }
    }

    pub fn score(&self) -> f64 {
        match self {
            ResolvedLabel::Canonical { kind, .. } => kind.score(),
            ResolvedLabel::Unmatched { best_score, .. } => *best_score,
        }
    }
}

impl fmt::Display for ResolvedLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedLabel::Canonical { name, .. } => f.write_str(name),
            ResolvedLabel::Unmatched { original, .. } => {
                write!(f, "{UNMATCHED_PREFIX}{original}")
            }
        }
    }
}

/// Immutable, ordered set of canonical labels.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    labels: Vec<CanonicalLabel>,
    normalized: Vec<Vec<char>>,
}

impl Taxonomy {
    pub fn new(labels: Vec<CanonicalLabel>) -> Result<Self, TaxonomyError> {
        if labels.is_empty() {
            return Err(TaxonomyError::Empty);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, label) in labels.iter().enumerate() {
            if label.name.trim().is_empty() {
                return Err(TaxonomyError::BlankName(idx));
            }
            if !seen.insert(label.name.as_str()) {
                return Err(TaxonomyError::DuplicateName(label.name.clone()));
            }
        }

        let normalized = labels
            .iter()
            .map(|l| normalize(&l.name).chars().collect())
            .collect();

        Ok(Self { labels, normalized })
    }

    /// Build from bare names, trimming whitespace.
    pub fn from_names<I, S>(names: I) -> Result<Self, TaxonomyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(
            names
                .into_iter()
                .map(|n| CanonicalLabel::new(n.as_ref().trim()))
                .collect(),
        )
    }

    pub fn labels(&self) -> &[CanonicalLabel] {
        &self.labels
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Resolve one candidate against the taxonomy.
    pub fn resolve(&self, candidate: &str, threshold: f64) -> ResolvedLabel {
        let cand: Vec<char> = normalize(candidate).chars().collect();

        if cand.is_empty() {
            return ResolvedLabel::Unmatched {
                original: candidate.to_string(),
                best_score: 0.0,
                nearest: None,
            };
        }

        if let Some(idx) = self.normalized.iter().position(|n| *n == cand) {
            return ResolvedLabel::Canonical {
                name: self.labels[idx].name.clone(),
                kind: MatchKind::Exact,
            };
        }

        let mut best: Option<(usize, f64)> = None;
        for (idx, canon) in self.normalized.iter().enumerate() {
            let mut score = similarity(&cand, canon);
            if contains_chars(&cand, canon) || contains_chars(canon, &cand) {
                score = (score + CONTAINMENT_BONUS).min(1.0);
            }
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((idx, score)),
            }
        }

        match best {
            Some((idx, score)) if score >= threshold => ResolvedLabel::Canonical {
                name: self.labels[idx].name.clone(),
                kind: MatchKind::Fuzzy { score },
            },
            Some((idx, score)) => ResolvedLabel::Unmatched {
                original: candidate.to_string(),
                best_score: score,
                nearest: Some(self.labels[idx].name.clone()),
            },
            None => ResolvedLabel::Unmatched {
                original: candidate.to_string(),
                best_score: 0.0,
                nearest: None,
            },
        }
    }

    /// Taxonomy rendered for a prompt, one label per line.
    pub fn describe(&self) -> String {
        self.labels
            .iter()
            .map(|l| {
                let mut line = format!("- {}", l.name);
                if let Some(cat) = &l.category {
                    line.push_str(&format!(" [{cat}]"));
                }
                if let Some(desc) = &l.description {
                    line.push_str(&format!(": {desc}"));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Lowercase and keep only alphanumeric characters.
pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn contains_chars(haystack: &[char], needle: &[char]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Ratcliff/Obershelp similarity: `2 * M / (len(a) + len(b))`, where `M` is
/// the number of characters in the recursively found longest common blocks.
pub fn similarity(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matched_chars(a, b) as f64 / total as f64
}

fn matched_chars(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut queue = vec![(0, a.len(), 0, b.len())];

    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let (i, j, k) = longest_match(a, b, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            queue.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            queue.push((i + k, ahi, j + k, bhi));
        }
    }

    matched
}

/// Longest common block in `a[alo..ahi]` x `b[blo..bhi]`; earliest in `a`,
/// then earliest in `b`, on ties.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let width = bhi - blo;
    let mut best = (alo, blo, 0);
    let mut prev = vec![0usize; width + 1];
    let mut cur = vec![0usize; width + 1];

    for i in alo..ahi {
        for j in blo..bhi {
            let col = j - blo + 1;
            if a[i] == b[j] {
                let k = prev[col - 1] + 1;
                cur[col] = k;
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            } else {
                cur[col] = 0;
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }

    best
}
