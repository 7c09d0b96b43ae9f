//! Classification client: prompt, call, parse, resolve.
//!
//! Provider failures propagate as [`ClassifyError::Provider`]; the dispatcher
//! treats them as the escalation signal. A reply that arrives but cannot be
//! interpreted never fails: it degrades to an `unclassified` or unmatched
//! label and is recorded like any other outcome.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatRequest, ProviderError, ProviderKind};
use crate::parser::{parse_reply, UNCLASSIFIED};
use crate::prompts::template_for;
use crate::taxonomy::{MatchProfile, ResolvedLabel, Taxonomy};

/// Reply budget for OpenAI-compatible servers.
pub const DEFAULT_MAX_TOKENS: u32 = 500;

/// Reasoning models on Databricks spend most of their budget before answering.
pub const DATABRICKS_MAX_TOKENS: u32 = 5_000;

pub const DEFAULT_TEMPERATURE: f32 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl ClassifyError {
    pub fn provider_error(&self) -> &ProviderError {
        match self {
            ClassifyError::Provider(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub profile: MatchProfile,
    /// Overrides the profile's acceptance threshold.
    pub threshold: Option<f64>,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            profile: MatchProfile::Loose,
            threshold: None,
            timeout: Duration::from_secs(30),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl ClassifierConfig {
    /// Defaults tuned for a provider.
    pub fn for_provider(kind: ProviderKind) -> Self {
        let max_tokens = match kind {
            ProviderKind::OpenAiCompat => DEFAULT_MAX_TOKENS,
            ProviderKind::Databricks => DATABRICKS_MAX_TOKENS,
        };
        Self {
            max_tokens,
            ..Self::default()
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold.unwrap_or_else(|| self.profile.threshold())
    }
}

/// Outcome of one successful provider round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Resolved labels, best guess first.
    pub labels: Vec<ResolvedLabel>,
    pub rationale: String,
    pub opinion_tag: String,
    /// The reply contained no recognizable label line.
    pub unclassified: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Classification {
    pub fn top_label(&self) -> Option<&ResolvedLabel> {
        self.labels.first()
    }

    /// Labels as plain strings (`unmatched:<text>` for unmatched).
    pub fn label_strings(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.to_string()).collect()
    }
}

/// Anything that can classify one question.
#[async_trait::async_trait]
pub trait Classify: Send + Sync {
    async fn classify(&self, question: &str) -> Result<Classification, ClassifyError>;
}

pub struct Classifier {
    gateway: Arc<dyn ChatGateway>,
    taxonomy: Arc<Taxonomy>,
    config: ClassifierConfig,
    job_id: Option<Uuid>,
}

impl Classifier {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        taxonomy: Arc<Taxonomy>,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            gateway,
            taxonomy,
            config,
            job_id: None,
        }
    }

    /// Tag every request with a batch id for usage records.
    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub async fn classify(&self, question: &str) -> Result<Classification, ClassifyError> {
        let prompt = template_for(self.config.profile).render(question, &self.taxonomy);

        let mut attribution = Attribution::new("classifier::classify");
        if let Some(job_id) = self.job_id {
            attribution = attribution.with_job(job_id);
        }

        let request = ChatRequest::new(prompt.to_messages(), attribution)
            .temperature(self.config.temperature)
            .max_tokens(self.config.max_tokens)
            .timeout(self.config.timeout);

        let response = self.gateway.chat(request).await?;
        tracing::debug!(
            model = %response.model,
            latency_ms = response.latency.as_millis() as u64,
            "classification reply received"
        );

        Ok(self.interpret(&response.content, response.input_tokens, response.output_tokens))
    }

    /// Parse and resolve a raw reply.
    pub fn interpret(&self, raw: &str, input_tokens: u32, output_tokens: u32) -> Classification {
        let parsed = parse_reply(raw);
        let threshold = self.config.threshold();
        let unclassified = parsed.is_unclassified();

        let labels = if unclassified {
            vec![ResolvedLabel::Unmatched {
                original: UNCLASSIFIED.to_string(),
                best_score: 0.0,
                nearest: None,
            }]
        } else {
            parsed
                .labels
                .iter()
                .take(self.config.profile.max_candidates())
                .map(|label| self.taxonomy.resolve(label, threshold))
                .collect()
        };

        for label in labels.iter().filter(|l| !l.is_canonical()) {
            tracing::debug!(label = %label, score = label.score(), "label not in taxonomy");
        }

        Classification {
            labels,
            rationale: parsed.rationale,
            opinion_tag: parsed.opinion_tag,
            unclassified,
            input_tokens,
            output_tokens,
        }
    }
}

#[async_trait::async_trait]
impl Classify for Classifier {
    async fn classify(&self, question: &str) -> Result<Classification, ClassifyError> {
        Classifier::classify(self, question).await
    }
}
