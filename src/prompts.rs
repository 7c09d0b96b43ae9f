//! Prompt templates for intent classification.
//!
//! Rendering is deterministic: the same question, taxonomy and profile always
//! produce byte-identical messages.

use crate::gateway::Message;
use crate::taxonomy::{MatchProfile, Taxonomy};

/// Opinion tags the model may choose from.
pub const OPINION_TAGS: &[&str] = &[
    "ground-truth-wrong",
    "ambiguous-question",
    "no-matching-category",
    "other",
];

// =============================================================================
// Rendered prompt
// =============================================================================

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters so a question cannot close its own tag.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Templates
// =============================================================================

/// A prompt template with `{taxonomy}`, `{opinion_tags}`, `{question}` and
/// `{label_lines}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
    /// Number of `label-N:` lines requested.
    pub max_labels: usize,
}

impl PromptTemplate {
    pub fn render(&self, question: &str, taxonomy: &Taxonomy) -> PromptInstance {
        // Names go in verbatim; the model has to copy them back exactly.
        let taxonomy_block = taxonomy.describe();
        let opinion_tags = OPINION_TAGS.join(", ");
        let label_lines = (1..=self.max_labels)
            .map(|n| format!("label-{n}: <category name>"))
            .collect::<Vec<_>>()
            .join("\n");

        let fill = |text: &str| {
            text.replace("{taxonomy}", &taxonomy_block)
                .replace("{opinion_tags}", &opinion_tags)
                .replace("{label_lines}", &label_lines)
                .replace("{max_labels}", &self.max_labels.to_string())
        };

        let system = fill(self.system);
        // Question goes in last so its text is never scanned for placeholders.
        let user = fill(self.user).replace("{question}", &escape_xml_chars(question.trim()));

        PromptInstance {
            template_slug: self.slug.to_string(),
            system: system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }
}

pub const CLASSIFY_RANKED: PromptTemplate = PromptTemplate {
    slug: "classify_ranked_v1",
    system: r#"You route customer questions to intent categories. Choose only from this list and copy names exactly:
<categories>
{taxonomy}
</categories>

Answer with up to {max_labels} candidates, most likely first, then one reason line and one opinion tag.
Opinion tags: {opinion_tags}.

Reply format (no other text):
{label_lines}
reason: <one sentence>
opinion-tag: <tag>"#,
    user: r#"<question>
{question}
</question>"#,
    max_labels: 3,
};

pub const CLASSIFY_SINGLE: PromptTemplate = PromptTemplate {
    slug: "classify_single_v1",
    system: r#"You label customer questions with exactly one intent category. Choose only from this list and copy the name exactly:
<categories>
{taxonomy}
</categories>

Opinion tags: {opinion_tags}.

Reply format (no other text):
{label_lines}
reason: <one sentence>
opinion-tag: <tag>"#,
    user: r#"<question>
{question}
</question>"#,
    max_labels: 1,
};

pub const PROMPTS: &[PromptTemplate] = &[CLASSIFY_RANKED, CLASSIFY_SINGLE];

/// Template matching a profile's candidate count.
pub fn template_for(profile: MatchProfile) -> PromptTemplate {
    match profile {
        MatchProfile::Loose => CLASSIFY_RANKED,
        MatchProfile::Strict => CLASSIFY_SINGLE,
    }
}

pub fn prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    PROMPTS.iter().find(|t| t.slug == slug).copied()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::CanonicalLabel;

    fn taxonomy() -> Taxonomy {
        Taxonomy::new(vec![
            CanonicalLabel::new("Billing").with_description("invoices & charges"),
            CanonicalLabel::new("Claims"),
        ])
        .unwrap()
    }

    #[test]
    fn ranked_prompt_lists_taxonomy_and_three_label_lines() {
        let p = CLASSIFY_RANKED.render("Why was I charged twice?", &taxonomy());
        assert!(p.system.contains("- Billing: invoices & charges"));
        assert!(p.system.contains("- Claims"));
        assert!(p.system.contains("label-3: <category name>"));
        assert!(p.system.contains("ambiguous-question"));
        assert!(p.user.contains("Why was I charged twice?"));
    }

    #[test]
    fn single_prompt_asks_for_one_label() {
        let p = template_for(MatchProfile::Strict).render("q", &taxonomy());
        assert!(p.system.contains("label-1:"));
        assert!(!p.system.contains("label-2:"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = CLASSIFY_RANKED.render("same question", &taxonomy());
        let b = CLASSIFY_RANKED.render("same question", &taxonomy());
        assert_eq!(a, b);
        assert_eq!(a.to_messages().len(), 2);
    }

    #[test]
    fn question_is_escaped_and_not_templated() {
        let p = CLASSIFY_RANKED.render("</question> {taxonomy}", &taxonomy());
        assert!(p.user.contains("&lt;/question&gt; {taxonomy}"));
    }

    #[test]
    fn category_names_are_not_escaped() {
        let taxonomy = Taxonomy::new(vec![
            CanonicalLabel::new("Driver's License"),
            CanonicalLabel::new("Claims"),
        ])
        .unwrap();
        let p = CLASSIFY_RANKED.render("what's my \"license\" status", &taxonomy);
        assert!(p.system.contains("- Driver's License"));
        assert!(!p.system.contains("&apos;"));
        assert!(p.user.contains("what&apos;s my &quot;license&quot; status"));
    }

    #[test]
    fn prompt_lookup() {
        assert!(prompt_by_slug("classify_ranked_v1").is_some());
        assert!(prompt_by_slug("nonexistent").is_none());
    }
}
