//! Line-prefix reply parser.
//!
//! The model is asked to answer with lines such as:
//!
//! ```text
//! label-1: Claims
//! label-2: Billing
//! reason: mentions an accident report
//! opinion-tag: ambiguous-question
//! ```
//!
//! Prefixes are matched case-sensitively at line start after trimming. Label,
//! reason and tag values lose leading enumeration markers (`1. `) and
//! bracketed notes (`[...]`).
//! Unrecognized lines are ignored. A missing `reason:` line leaves the whole
//! reply as the rationale. Parsing never fails: a reply with no label line
//! degrades to a single `unclassified` label.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Label emitted when no `label-N:` line is found.
pub const UNCLASSIFIED: &str = "unclassified";

/// Opinion tag used when the reply has no `opinion-tag:` line.
pub const DEFAULT_OPINION_TAG: &str = "other";

const REASON_PREFIX: &str = "reason:";
const OPINION_PREFIX: &str = "opinion-tag:";

static LABEL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^label-\d+:(.*)$").expect("Invalid label line regex"));

static ENUMERATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+[.)]\s*").expect("Invalid enumeration regex"));

static ANNOTATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]").expect("Invalid annotation regex"));

/// Structured content of one model reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedReply {
    /// Candidate labels, best guess first, deduplicated.
    pub labels: Vec<String>,
    pub rationale: String,
    pub opinion_tag: String,
}

impl ParsedReply {
    /// True when no label line was recognized.
    pub fn is_unclassified(&self) -> bool {
        self.labels.len() == 1 && self.labels[0] == UNCLASSIFIED
    }
}

/// Strip enumeration markers and bracketed annotations from a value.
pub fn clean_value(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_enum = ENUMERATION.replace(trimmed, "");
    let without_notes = ANNOTATION.replace_all(&without_enum, "");
    without_notes.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a raw reply.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let mut labels: Vec<String> = Vec::new();
    let mut rationale: Option<String> = None;
    let mut opinion_tag: Option<String> = None;

    for line in raw.lines() {
        let line = line.trim();

        if let Some(caps) = LABEL_LINE.captures(line) {
            let value = clean_value(caps.get(1).map_or("", |m| m.as_str()));
            if !value.is_empty() && !labels.contains(&value) {
                labels.push(value);
            }
        } else if let Some(rest) = line.strip_prefix(REASON_PREFIX) {
            if rationale.is_none() {
                let value = clean_value(rest);
                if !value.is_empty() {
                    rationale = Some(value);
                }
            }
        } else if let Some(rest) = line.strip_prefix(OPINION_PREFIX) {
            if opinion_tag.is_none() {
                let value = clean_value(rest);
                if !value.is_empty() {
                    opinion_tag = Some(value);
                }
            }
        }
    }

    let opinion_tag = opinion_tag.unwrap_or_else(|| DEFAULT_OPINION_TAG.to_string());

    if labels.is_empty() {
        tracing::debug!(reply_chars = raw.len(), "no label line in reply");
        return ParsedReply {
            labels: vec![UNCLASSIFIED.to_string()],
            rationale: raw.trim().to_string(),
            opinion_tag,
        };
    }

    ParsedReply {
        labels,
        rationale: rationale.unwrap_or_else(|| raw.trim().to_string()),
        opinion_tag,
    }
}
